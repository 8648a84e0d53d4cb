//! Error types for Storix

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorixError {
    #[error("Must be run as root")]
    NotRoot,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported device path: {0}")]
    UnsupportedDevice(String),

    /// Device facts resemble `candidate` but violate one of its invariants.
    ///
    /// Only produced inside the classifier, which folds it into
    /// `Layout::NonStandard`.
    #[error("similar to {candidate}, but {reason}")]
    LayoutDetection { candidate: String, reason: String },

    #[error("Operation rejected: {0}")]
    OperationRejected(String),

    #[error("Device has no valid on-disk structure: {0}")]
    Codec(String),

    #[error("Partition error: {0}")]
    PartitionError(String),

    #[error("Filesystem error: {0}")]
    FilesystemError(String),

    #[error("Command failed: {command}\n{stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl StorixError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::OperationRejected(reason.into())
    }

    pub fn codec(reason: impl Into<String>) -> Self {
        Self::Codec(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, StorixError>;
