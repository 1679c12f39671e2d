use thiserror::Error;

/// Stream relay bootstrap error types
///
/// Request handling has its own taxonomy in [`crate::proxy::ProxyError`];
/// these are the failures that can stop the service from starting.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidSetting { field: String, message: String },
}

impl Error {
    pub fn invalid_setting(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_setting_message() {
        let error = Error::invalid_setting("destination.allowed_cidrs", "bad prefix length");
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for destination.allowed_cidrs: bad prefix length"
        );
    }
}
