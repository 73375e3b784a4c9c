//! Hardware abstraction layer traits.
//!
//! The register engine only needs four bus primitives: open a chip-select
//! bracket, clock bytes out, clock bytes in, close the bracket. [`SpiBus`]
//! captures exactly that so the engine runs unchanged over the MPSSE bridge
//! or a test double.

use crate::error::Result;

#[cfg(test)]
pub(crate) mod mock;

/// A half-duplex SPI master with explicit chip-select bracketing.
pub trait SpiBus {
    /// Whether the underlying adapter is open and usable.
    fn is_open(&self) -> bool;

    /// Assert chip select, beginning a transaction.
    fn start(&mut self) -> Result<()>;

    /// Release chip select, ending a transaction.
    fn stop(&mut self) -> Result<()>;

    /// Clock `data` out in a single transfer.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Clock `buf.len()` bytes in with a single transfer.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Release the adapter. Once invoked this cannot fail; trouble while
    /// parking the hardware is logged and swallowed.
    fn close(&mut self);
}
