//! Configuration types for rbdio
//!
//! Object naming and tuning knobs for the block layer. Every field has a
//! default, so an empty TOML document is a valid configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Smallest block order accepted at image creation (4 KiB blocks)
pub const MIN_ORDER: u8 = 12;

/// Largest block order accepted at image creation (32 MiB blocks)
pub const MAX_ORDER: u8 = 25;

/// Block layer configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Block order applied when the caller requests order 0
    pub default_order: u8,
    /// Suffix appended to an image name to form its header object name
    pub header_suffix: String,
    /// Pool-wide directory object
    pub directory_object: String,
    /// Pool-wide object holding the block-name id counter
    pub info_object: String,
    /// Read size used when loading a header object
    pub header_read_chunk: u64,
    /// Maximum in-flight per-block requests during trim, rollback and copy
    pub bulk_concurrency: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            default_order: 22, // 4 MiB blocks
            header_suffix: ".rbd".to_string(),
            directory_object: "rbd_directory".to_string(),
            info_object: "rbd_info".to_string(),
            header_read_chunk: 4096,
            bulk_concurrency: 1,
        }
    }
}

impl BlockConfig {
    /// Parse a TOML document, filling absent fields with defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::Configuration(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the block layer cannot operate with
    pub fn validate(&self) -> Result<()> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&self.default_order) {
            return Err(Error::Configuration(format!(
                "default_order {} outside {MIN_ORDER}..={MAX_ORDER}",
                self.default_order
            )));
        }
        if self.header_read_chunk == 0 {
            return Err(Error::Configuration(
                "header_read_chunk must be positive".into(),
            ));
        }
        if self.bulk_concurrency == 0 {
            return Err(Error::Configuration(
                "bulk_concurrency must be positive".into(),
            ));
        }
        if self.header_suffix.is_empty()
            || self.directory_object.is_empty()
            || self.info_object.is_empty()
        {
            return Err(Error::Configuration("object names must be non-empty".into()));
        }
        Ok(())
    }

    /// Header object name for an image
    #[must_use]
    pub fn header_oid(&self, image_name: &str) -> String {
        format!("{image_name}{}", self.header_suffix)
    }
}
