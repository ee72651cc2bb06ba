//! Builds a mold whose `threads` keyval gains a new default at version 2.0,
//! then walks a config through the update engine, demonstrating both the
//! no-conflict upgrade path and manual conflict resolution.

use clap::{Parser, ValueEnum};
use moldcfg::context::{Context, Tag};
use moldcfg::mold::{add_keyval_integer, config_begin, config_finalize, mold_begin, mold_finalize};
use moldcfg::query;
use moldcfg::update::{update_config, Resolution};
use moldcfg::version::Version;

#[derive(Clone, Copy, ValueEnum)]
enum Keep {
    Config,
    Mold,
}

/// Demonstrates the update engine's conflict resolution.
#[derive(Parser)]
struct Args {
    /// Starting value for `threads`, customized by the user away from the v1 default of 4.
    #[arg(long, default_value_t = 16)]
    threads: i64,

    /// How to resolve a conflict, if one arises.
    #[arg(long, value_enum, default_value_t = Keep::Config)]
    keep: Keep,
}

fn threads_mold() -> Context {
    let mold = mold_begin().unwrap();
    let keyval = Context::begin(Some(&mold), Tag::Keyval).unwrap();
    keyval.set_name("threads").unwrap();
    keyval.set_value_type(moldcfg::value::ValueType::Integer).unwrap();
    let d1 = Context::begin(Some(&keyval), Tag::Default).unwrap();
    d1.add_introduced(Version::new(1, 0)).unwrap();
    d1.set_value_integer(4).unwrap();
    d1.finalize().unwrap();
    let d2 = Context::begin(Some(&keyval), Tag::Default).unwrap();
    d2.add_introduced(Version::new(2, 0)).unwrap();
    d2.set_value_integer(8).unwrap();
    d2.finalize().unwrap();
    keyval.add_introduced(Version::new(1, 0)).unwrap();
    keyval.finalize().unwrap();
    mold_finalize(&mold).unwrap();
    mold
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mold = threads_mold();
    let config = config_begin(&mold)?;
    add_keyval_integer(&config, "threads", args.threads, "", Version::DEFAULT)?;
    config_finalize(&config)?;

    println!("config at 1.0: threads = {}", query::get_value_string(&config, "threads")?);

    let mut update = update_config(&config, Some(Version::new(2, 0)))?;
    if update.is_finished() {
        println!("no conflicts; upgraded automatically");
    } else {
        let conflict = update.conflict()?;
        println!(
            "conflict on '{}': config has {}, mold default is {}",
            conflict.name, conflict.config_value, conflict.mold_value
        );
        let resolution = match args.keep {
            Keep::Config => Resolution::KeepConfig,
            Keep::Mold => Resolution::TakeMold,
        };
        update.resolve(resolution)?;
        update.continue_update()?;
    }

    println!(
        "config at 2.0: threads = {} (updated {} keyval(s))",
        query::get_value_string(&config, "threads")?,
        update.updated_count()
    );
    Ok(())
}
