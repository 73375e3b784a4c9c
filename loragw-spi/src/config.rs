//! Configuration for the USB-to-SPI bridge.
//!
//! The bus itself runs one fixed configuration (SPI mode 0, 10 MHz, MSB
//! first). What varies between gateways is which adapter to pick and how
//! the USB side behaves, so that is what lives here. Gateway configuration
//! files are JSON, and so is this.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::spi::BURST_CHUNK;
use crate::transport::mpsse::MAX_TRANSFER;

/// Adapter selection and USB tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SpiConfig {
    /// USB vendor ID; when unset, any known FTDI MPSSE part matches
    pub vendor_id: Option<u16>,

    /// USB product ID
    pub product_id: Option<u16>,

    /// USB serial number, to pick one adapter among several
    pub serial: Option<String>,

    /// FTDI channel (0 = A, 1 = B, ...)
    pub interface: u8,

    /// FTDI latency timer in milliseconds
    pub latency_ms: u8,

    /// Maximum bytes per low-level transfer in a burst
    pub burst_chunk: usize,

    /// Upper bound on collecting a read response, in milliseconds
    pub read_timeout_ms: u64,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            vendor_id: None,
            product_id: None,
            serial: None,
            interface: 0,
            latency_ms: 2,
            burst_chunk: BURST_CHUNK,
            read_timeout_ms: 1000,
        }
    }
}

impl SpiConfig {
    /// Parse and validate a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: SpiConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Check values the adapter cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.burst_chunk == 0 || self.burst_chunk > MAX_TRANSFER {
            return Err(Error::Config(format!(
                "burst_chunk must be between 1 and {}, got {}",
                MAX_TRANSFER, self.burst_chunk
            )));
        }
        if self.latency_ms == 0 {
            return Err(Error::Config("latency_ms must be at least 1".to_string()));
        }
        if self.interface > 3 {
            return Err(Error::Config(format!(
                "interface must be 0..=3 (A..D), got {}",
                self.interface
            )));
        }
        Ok(())
    }
}
