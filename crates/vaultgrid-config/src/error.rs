//! Configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A section or resource definition breaks a configuration rule.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The platform reports no home directory for the user config file.
    #[error("no user config directory for {app}")]
    NoUserConfigDir { app: &'static str },
}
