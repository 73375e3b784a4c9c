//! SPI register access to LoRa concentrators through an FTDI MPSSE
//! USB-to-SPI bridge.
//!
//! ```no_run
//! use loragw_spi::{transport, MuxMode, SpiConfig};
//!
//! let mut spi = transport::open(&SpiConfig::default())?;
//! let version = spi.read(MuxMode::None, 0, 0x01)?;
//! spi.write(MuxMode::None, 0, 0x10, 0xAB)?;
//! transport::close(spi)?;
//! # Ok::<(), loragw_spi::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod hw_trait;
pub mod spi;
pub mod tracing;
pub mod transport;

pub use config::SpiConfig;
pub use error::{Error, Result, TransportError};
pub use spi::{mux_target, MuxMode, Spi, BURST_CHUNK};
