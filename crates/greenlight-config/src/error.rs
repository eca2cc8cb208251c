//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("reserved name: '{0}' cannot be used as a resource name")]
    ReservedName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for greenlight_core::Error {
    fn from(err: ConfigError) -> Self {
        greenlight_core::Error::Configuration(err.to_string())
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
