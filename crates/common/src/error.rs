//! Configuration errors

use thiserror::Error;

/// Errors raised while loading the crawler's TOML configuration.
#[derive(Error, Debug)]
pub enum Error {
    /// A setting failed validation. `field` is its dotted TOML path.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config file: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// The offending setting, for validation failures.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Error::Invalid { field, .. } => Some(field),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_names_the_setting() {
        let err = Error::invalid("dispatcher.parallelism", "must be at least 1");
        assert_eq!(
            err.to_string(),
            "invalid dispatcher.parallelism: must be at least 1"
        );
        assert_eq!(err.field(), Some("dispatcher.parallelism"));
    }

    #[test]
    fn read_and_parse_failures_have_no_field() {
        let io_err: Error =
            std::io::Error::new(std::io::ErrorKind::NotFound, "quota-crawler.toml").into();
        assert!(io_err.to_string().starts_with("reading config file:"));
        assert_eq!(io_err.field(), None);

        let parse: std::result::Result<toml::Value, _> = toml::from_str("costs = {{{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Toml(_)), "got: {err:?}");
        assert_eq!(err.field(), None);
    }
}
