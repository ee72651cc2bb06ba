//! Builds a small mold by hand, generates a default-valued config from it,
//! then reads and rewrites a value through the query path API.

use clap::Parser;
use moldcfg::mold::{
    add_keyval_boolean, add_keyval_integer, add_keyval_string, add_section, config_version,
    mold_begin, mold_finalize,
};
use moldcfg::generate::generate_config_from_mold;
use moldcfg::query;
use moldcfg::validation::config_valid;
use moldcfg::version::Version;

/// Exercises mold construction, config generation and query-path access.
#[derive(Parser)]
struct Args {
    /// Target version to generate the config at (defaults to the mold's own version).
    #[arg(long)]
    version: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let target = args
        .version
        .as_deref()
        .map(str::parse::<Version>)
        .transpose()?;

    let mold = mold_begin()?;
    add_keyval_string(&mold, "app_name", "MyApp", "human-readable application name", Version::new(1, 0))?;
    add_keyval_boolean(&mold, "debug", false, "enable verbose logging", Version::new(1, 0))?;
    let net = add_section(&mold, "net", "network-facing settings", Version::new(1, 0))?;
    add_keyval_integer(&net, "port", 8080, "listen port", Version::new(1, 0))?;
    add_keyval_integer(&net, "max_connections", 100, "connection cap", Version::new(1, 0))?;
    mold_finalize(&mold)?;

    let config = generate_config_from_mold(&mold, target)?;
    println!("generated config (version {}):", config_version(&config)?);
    println!("  app_name = {}", query::get_value_string(&config, "app_name")?);
    println!("  debug = {}", query::get_value_string(&config, "debug")?);
    println!("  net.port = {}", query::get_value_string(&config, "net.port")?);

    query::set_keyval_integer(&config, 9090, "net.port")?;
    println!("after update:");
    println!("  net.port = {}", query::get_value_string(&config, "net.port")?);

    let problems = config_valid(&config)?;
    if problems.is_empty() {
        println!("config is valid");
    } else {
        println!("{} invalid context(s) found", problems.len());
    }

    Ok(())
}
