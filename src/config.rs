use crate::compression::CompressionCodec;
use crate::error::{Result, TransferError};
use crate::export::ExportOptions;
use crate::logging::LoggingConfig;
use crate::metadata::StoreIdentity;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for a transfer service instance.
///
/// ```toml
/// database_name = "vtt"
/// schema_version = 5
/// channel_capacity = 32
///
/// [export]
/// compression = { zstd = 3 }
/// pretty = true
///
/// [logging]
/// level = "info"
/// json = false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Name of the live database.
    pub database_name: String,
    /// Schema version the live database is opened at.
    pub schema_version: u32,
    /// Requests that may queue before callers wait.
    pub channel_capacity: usize,
    pub export: ExportOptions,
    pub logging: LoggingConfig,
}

impl TransferConfig {
    pub fn new(database_name: impl Into<String>, schema_version: u32) -> Self {
        Self {
            database_name: database_name.into(),
            schema_version,
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| TransferError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TransferError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_export(mut self, export: ExportOptions) -> Self {
        self.export = export;
        self
    }

    pub fn with_compression(mut self, codec: CompressionCodec) -> Self {
        self.export.compression = codec;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    pub fn identity(&self) -> StoreIdentity {
        StoreIdentity::new(self.database_name.clone(), self.schema_version)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_name.is_empty() {
            return Err(TransferError::Config("database_name must not be empty".to_string()));
        }

        if self.schema_version == 0 {
            return Err(TransferError::Config("schema_version must be at least 1".to_string()));
        }

        if self.channel_capacity == 0 {
            return Err(TransferError::Config("channel_capacity must be at least 1".to_string()));
        }

        Ok(())
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            database_name: "vtt".to_string(),
            schema_version: 1,
            channel_capacity: 32,
            export: ExportOptions::default(),
            logging: LoggingConfig::default(),
        }
    }
}
