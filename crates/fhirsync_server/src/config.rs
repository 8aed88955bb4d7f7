//! Server configuration.

use fhirsync_protocol::Record;
use std::fmt;
use std::sync::Arc;

/// Domain validation applied to every write before it is stored.
///
/// Returning `Err(reason)` rejects the write with that reason.
pub type ValidateFn = dyn Fn(&Record) -> Result<(), String> + Send + Sync;

/// Configuration for the sync server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Largest page the change feed returns, whatever the client asks for.
    pub max_page_size: u32,
    /// Largest batch write accepted.
    pub max_batch_size: usize,
    /// Optional write validator.
    pub validator: Option<Arc<ValidateFn>>,
}

impl ServerConfig {
    /// Creates a configuration with default limits and no validator.
    pub fn new() -> Self {
        Self {
            max_page_size: 100,
            max_batch_size: 100,
            validator: None,
        }
    }

    /// Sets the page size cap. Zero is raised to one.
    pub fn with_max_page_size(mut self, size: u32) -> Self {
        self.max_page_size = size.max(1);
        self
    }

    /// Sets the batch size cap.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Installs a write validator.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Record) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Runs the validator, if any.
    pub(crate) fn validate(&self, record: &Record) -> Result<(), String> {
        match &self.validator {
            Some(validator) => validator(record),
            None => Ok(()),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("max_page_size", &self.max_page_size)
            .field("max_batch_size", &self.max_batch_size)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_protocol::Timestamp;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_page_size, 100);
        assert_eq!(config.max_batch_size, 100);
        assert!(config.validator.is_none());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_page_size(0)
            .with_max_batch_size(5)
            .with_validator(|record| {
                if record.id.starts_with("tmp") {
                    Err("temporary ids are not accepted".into())
                } else {
                    Ok(())
                }
            });

        assert_eq!(config.max_page_size, 1);
        assert_eq!(config.max_batch_size, 5);

        let good = Record::new("Patient", "p1", Timestamp::ZERO, b"x".to_vec());
        let bad = Record::new("Patient", "tmp-1", Timestamp::ZERO, b"x".to_vec());
        assert!(config.validate(&good).is_ok());
        assert_eq!(
            config.validate(&bad).unwrap_err(),
            "temporary ids are not accepted"
        );
        assert!(format!("{config:?}").contains("validator: true"));
    }
}
