/*!
 * Error types for Bulwark
 */

use bulwark_core_policy::{ConfigError, RegistryError};
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BulwarkError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_INVALID: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum BulwarkError {
    /// Reading or writing a file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration file is not valid TOML for the expected schema
    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration is well formed but semantically wrong
    #[error("configuration error: {0}")]
    Config(String),

    /// A configured policy layer has invalid parameters
    #[error("policy '{policy}' is invalid: {source}")]
    Policy {
        policy: String,
        #[source]
        source: ConfigError,
    },

    /// Registering or looking up a policy failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The tracing subscriber could not be installed
    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl BulwarkError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BulwarkError::ConfigParse(_)
            | BulwarkError::Config(_)
            | BulwarkError::Policy { .. }
            | BulwarkError::Registry(_) => EXIT_INVALID,
            BulwarkError::Io(_) | BulwarkError::Logging(_) => EXIT_FATAL,
        }
    }

    /// True if the error points at the configuration rather than the environment
    pub fn is_config_error(&self) -> bool {
        self.exit_code() == EXIT_INVALID
    }
}
