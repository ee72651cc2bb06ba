//! Error taxonomy for the mold/config engine.
//!
//! Every fallible public operation returns [`Error`]. The variant set mirrors
//! the stable status kinds of the source design one-to-one so that
//! [`Error::kind`] and [`status_string`] can hand callers a single stable
//! taxonomy regardless of which variant actually carries the detail.

use std::fmt;

use thiserror::Error;

/// The stable, FFI-shaped status taxonomy. Every [`Error`] maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Ok,
    NoCanDo,
    TooFewArguments,
    InvalidArgument,
    ContextInWrongState,
    WrongContext,
    DestroyedContext,
    FatalContext,
    BadContextObject,
    InvalidContext,
    NoMemory,
    InternalError,
    InsufficientResources,
    Exists,
    ConflictingSemver,
    Conflict,
    Exhausted,
    MoldMissing,
    WrongValueType,
    NotExist,
    RestrictionViolated,
    ElementsInvalid,
    NotSupported,
    PluginError,
    LoadError,
    ConfigInvalid,
    GroupMissing,
    PermissionError,
    FsError,
    DefaultMissing,
}

impl ErrorKind {
    /// A stable human-readable name, analogous to `disir_status_string`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Ok => "OK",
            ErrorKind::NoCanDo => "NO_CAN_DO",
            ErrorKind::TooFewArguments => "TOO_FEW_ARGUMENTS",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::ContextInWrongState => "CONTEXT_IN_WRONG_STATE",
            ErrorKind::WrongContext => "WRONG_CONTEXT",
            ErrorKind::DestroyedContext => "DESTROYED_CONTEXT",
            ErrorKind::FatalContext => "FATAL_CONTEXT",
            ErrorKind::BadContextObject => "BAD_CONTEXT_OBJECT",
            ErrorKind::InvalidContext => "INVALID_CONTEXT",
            ErrorKind::NoMemory => "NO_MEMORY",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::InsufficientResources => "INSUFFICIENT_RESOURCES",
            ErrorKind::Exists => "EXISTS",
            ErrorKind::ConflictingSemver => "CONFLICTING_SEMVER",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Exhausted => "EXHAUSTED",
            ErrorKind::MoldMissing => "MOLD_MISSING",
            ErrorKind::WrongValueType => "WRONG_VALUE_TYPE",
            ErrorKind::NotExist => "NOT_EXIST",
            ErrorKind::RestrictionViolated => "RESTRICTION_VIOLATED",
            ErrorKind::ElementsInvalid => "ELEMENTS_INVALID",
            ErrorKind::NotSupported => "NOT_SUPPORTED",
            ErrorKind::PluginError => "PLUGIN_ERROR",
            ErrorKind::LoadError => "LOAD_ERROR",
            ErrorKind::ConfigInvalid => "CONFIG_INVALID",
            ErrorKind::GroupMissing => "GROUP_MISSING",
            ErrorKind::PermissionError => "PERMISSION_ERROR",
            ErrorKind::FsError => "FS_ERROR",
            ErrorKind::DefaultMissing => "DEFAULT_MISSING",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the stable name for a kind, mirroring `disir_status_string`.
pub fn status_string(kind: ErrorKind) -> &'static str {
    kind.as_str()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no_can_do: {0}")]
    NoCanDo(String),

    #[error("too_few_arguments: {0}")]
    TooFewArguments(String),

    #[error("invalid_argument: {0}")]
    InvalidArgument(String),

    #[error("context_in_wrong_state: {0}")]
    ContextInWrongState(String),

    #[error("wrong_context: {0}")]
    WrongContext(String),

    #[error("destroyed_context: {0}")]
    DestroyedContext(String),

    #[error("fatal_context: {0}")]
    FatalContext(String),

    #[error("bad_context_object: {0}")]
    BadContextObject(String),

    #[error("invalid_context: {0}")]
    InvalidContext(String),

    #[error("internal_error: {0}")]
    InternalError(String),

    #[error("insufficient_resources: {0}")]
    InsufficientResources(String),

    #[error("exists: {0}")]
    Exists(String),

    #[error("conflicting_semver: {0}")]
    ConflictingSemver(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("exhausted")]
    Exhausted,

    #[error("mold_missing: {0}")]
    MoldMissing(String),

    #[error("wrong_value_type: {0}")]
    WrongValueType(String),

    #[error("not_exist: {0}")]
    NotExist(String),

    #[error("restriction_violated: {0}")]
    RestrictionViolated(String),

    #[error("elements_invalid: {0}")]
    ElementsInvalid(String),

    #[error("not_supported: {0}")]
    NotSupported(String),

    #[error("plugin_error: {0}")]
    PluginError(String),

    #[error("load_error: {0}")]
    LoadError(String),

    #[error("config_invalid: {0}")]
    ConfigInvalid(String),

    #[error("group_missing: {0}")]
    GroupMissing(String),

    #[error("permission_error: {0}")]
    PermissionError(String),

    #[error("fs_error: {0}")]
    FsError(String),

    #[error("default_missing: {0}")]
    DefaultMissing(String),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    #[error("TOML serialization: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("value (de)serialization: {0}")]
    Serialization(String),
}

impl Error {
    /// Maps this error to the stable [`ErrorKind`] taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoCanDo(_) => ErrorKind::NoCanDo,
            Error::TooFewArguments(_) => ErrorKind::TooFewArguments,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::ContextInWrongState(_) => ErrorKind::ContextInWrongState,
            Error::WrongContext(_) => ErrorKind::WrongContext,
            Error::DestroyedContext(_) => ErrorKind::DestroyedContext,
            Error::FatalContext(_) => ErrorKind::FatalContext,
            Error::BadContextObject(_) => ErrorKind::BadContextObject,
            Error::InvalidContext(_) => ErrorKind::InvalidContext,
            Error::InternalError(_) => ErrorKind::InternalError,
            Error::InsufficientResources(_) => ErrorKind::InsufficientResources,
            Error::Exists(_) => ErrorKind::Exists,
            Error::ConflictingSemver(_) => ErrorKind::ConflictingSemver,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Exhausted => ErrorKind::Exhausted,
            Error::MoldMissing(_) => ErrorKind::MoldMissing,
            Error::WrongValueType(_) => ErrorKind::WrongValueType,
            Error::NotExist(_) => ErrorKind::NotExist,
            Error::RestrictionViolated(_) => ErrorKind::RestrictionViolated,
            Error::ElementsInvalid(_) => ErrorKind::ElementsInvalid,
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::PluginError(_) => ErrorKind::PluginError,
            Error::LoadError(_) => ErrorKind::LoadError,
            Error::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Error::GroupMissing(_) => ErrorKind::GroupMissing,
            Error::PermissionError(_) => ErrorKind::PermissionError,
            Error::FsError(_) => ErrorKind::FsError,
            Error::DefaultMissing(_) => ErrorKind::DefaultMissing,
            Error::Io(_) => ErrorKind::FsError,
            Error::TomlDeserialization(_) | Error::TomlSerialization(_) => {
                ErrorKind::ConfigInvalid
            }
            Error::Serialization(_) => ErrorKind::ConfigInvalid,
        }
    }
}

/// Alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
