//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("This package is designed to run on Linux/Raspberry Pi only (detected: {0})")]
    UnsupportedPlatform(String),

    #[error("Command `{program}` failed: {message}")]
    Command { program: String, message: String },

    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a command error for `program`
    pub fn command(program: &str, message: impl Into<String>) -> Self {
        Error::Command {
            program: program.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
