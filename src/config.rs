//! Configuration types.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A local database file. Parent directories are created on open.
    File(PathBuf),
    /// A private in-memory database, gone when the store is closed.
    Memory,
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database location.
    pub location: StoreLocation,
}

impl StoreConfig {
    /// Configuration for a database file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
        }
    }

    /// Configuration for an in-memory database.
    pub fn memory() -> Self {
        Self {
            location: StoreLocation::Memory,
        }
    }

    /// Check the configuration before opening anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.location {
            StoreLocation::File(path) if path.as_os_str().is_empty() => {
                Err(ConfigError::InvalidValue {
                    key: "location".to_string(),
                    message: "database path is empty".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::file("./data/justcai.db")
    }
}
