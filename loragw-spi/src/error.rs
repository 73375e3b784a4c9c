//! Common error types for loragw-spi.
//!
//! This module provides a centralized Error enum using thiserror. Failures
//! of the USB-to-SPI bridge are collected under [`TransportError`] so callers
//! can tell bad arguments apart from bus trouble.

use thiserror::Error;

/// Main error type for loragw-spi operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected before any bus activity
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Bus adapter failures (open, start, write, read, stop)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for failures reported by the bus adapter.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// Failures of the USB-to-SPI bridge.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No matching adapter on the USB bus
    #[error("no matching USB-to-SPI adapter found")]
    NotFound,

    /// Handle was closed or never finished opening
    #[error("SPI port is not open")]
    NotOpen,

    /// I/O errors from the USB stack
    #[error("USB error: {0}")]
    Usb(#[from] std::io::Error),

    /// USB transfer failures
    #[error("USB transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    /// Adapter did not answer within the read timeout
    #[error("timed out waiting for {expected} bytes, got {received}")]
    Timeout { expected: usize, received: usize },

    /// Transfer longer than one MPSSE command can carry
    #[error("transfer of {0} bytes exceeds the adapter limit")]
    TooLong(usize),

    /// MPSSE engine did not echo the synchronization command
    #[error("MPSSE synchronization failed: {0}")]
    Sync(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(TransportError::Usb(e))
    }
}

impl From<nusb::transfer::TransferError> for Error {
    fn from(e: nusb::transfer::TransferError) -> Self {
        Error::Transport(TransportError::Transfer(e))
    }
}
