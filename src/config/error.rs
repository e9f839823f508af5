use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to write file {0}: {1}")]
    FileWrite(PathBuf, std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error(
        "No monday.toml found in the current directory or the user config directory. Run 'monday init' first."
    )]
    NotFound,

    #[error("No project named '{0}'. Configured projects: {list}", list = .1.join(", "))]
    ProjectNotFound(String, Vec<String>),

    #[error("Several projects are configured ({}); pass one as 'monday run <project>'", .0.join(", "))]
    ProjectAmbiguous(Vec<String>),

    #[error("Invalid port mapping '{0}': expected 'LOCAL:REMOTE'")]
    InvalidPortMapping(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
