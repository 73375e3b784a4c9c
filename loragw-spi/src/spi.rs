//! Register access to a LoRa concentrator over SPI.
//!
//! Every operation is one chip-select bracket on the bus:
//!
//! ```text
//! Start | [mux target] | access byte | payload or response ... | Stop
//! ```
//!
//! The access byte carries the direction in bit 7 (read `0x00`, write
//! `0x80`) and the register address in the low 7 bits. On boards where
//! several chips share the bus ([`MuxMode::Mode1`]), a target-select byte
//! goes first.
//!
//! Bursts keep the whole payload inside one bracket but never hand more
//! than `burst_chunk` bytes to a single bus transfer, since the bridge
//! cannot buffer more than that.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Error, Result, TransportError};
use crate::hw_trait::SpiBus;
use crate::tracing::prelude::*;

/// Direction bit for register reads.
pub const READ_ACCESS: u8 = 0x00;
/// Direction bit for register writes.
pub const WRITE_ACCESS: u8 = 0x80;

/// Default maximum bytes per low-level transfer during a burst.
pub const BURST_CHUNK: usize = 1024;

const ADDRESS_MASK: u8 = 0x7F;

/// Target-select bytes on concentrator boards with a shared bus.
pub mod mux_target {
    pub const SX1301: u8 = 0x00;
    pub const FPGA: u8 = 0x01;
    pub const EEPROM: u8 = 0x02;
    pub const SX127X: u8 = 0x03;
}

/// How the access byte is addressed on the bus.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MuxMode {
    /// One chip on the bus; the access byte goes first
    #[default]
    None,
    /// Shared bus; a target-select byte precedes the access byte
    Mode1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

impl Access {
    fn bit(self) -> u8 {
        match self {
            Access::Read => READ_ACCESS,
            Access::Write => WRITE_ACCESS,
        }
    }
}

/// Command bytes of one transaction. Never longer than target + access +
/// one data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    buf: [u8; 3],
    len: usize,
}

impl Frame {
    fn command(mux_mode: MuxMode, mux_target: u8, access: Access, address: u8) -> Self {
        let mut frame = Frame { buf: [0; 3], len: 0 };
        if mux_mode == MuxMode::Mode1 {
            frame.push(mux_target);
        }
        frame.push(access.bit() | (address & ADDRESS_MASK));
        frame
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.len] = byte;
        self.len += 1;
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

fn check_address(address: u8) {
    if address & !ADDRESS_MASK != 0 {
        warn!("SPI address 0x{:02X} > 127, using 0x{:02X}", address, address & ADDRESS_MASK);
    }
}

/// An open SPI port to the concentrator.
///
/// Owns the bus for as long as it lives. Operations take `&mut self`, so two
/// transactions can never interleave on the same handle.
pub struct Spi<B> {
    bus: B,
    burst_chunk: usize,
}

impl<B: SpiBus> Spi<B> {
    /// Wrap an open bus, splitting bursts at [`BURST_CHUNK`].
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            burst_chunk: BURST_CHUNK,
        }
    }

    /// Wrap an open bus with a custom burst chunk size.
    pub fn with_burst_chunk(bus: B, burst_chunk: usize) -> Result<Self> {
        if burst_chunk == 0 {
            return Err(Error::InvalidArgument("burst chunk of null length"));
        }
        Ok(Self { bus, burst_chunk })
    }

    /// Maximum bytes handed to one bus transfer during a burst.
    pub fn burst_chunk(&self) -> usize {
        self.burst_chunk
    }

    /// Release the port and the adapter behind it.
    pub fn close(mut self) -> Result<()> {
        self.ensure_open()?;
        self.bus.close();
        debug!("Note: SPI port closed");
        Ok(())
    }

    /// Write one register.
    pub fn write(&mut self, mux_mode: MuxMode, mux_target: u8, address: u8, data: u8) -> Result<()> {
        self.ensure_open()?;
        check_address(address);

        let mut frame = Frame::command(mux_mode, mux_target, Access::Write, address);
        frame.push(data);

        self.transaction(address, |bus| bus.write(frame.as_bytes()))?;

        debug!("Note: SPI write success (0x{:02X}) < 0x{:02X}", address, data);
        Ok(())
    }

    /// Read one register.
    pub fn read(&mut self, mux_mode: MuxMode, mux_target: u8, address: u8) -> Result<u8> {
        self.ensure_open()?;
        check_address(address);

        let frame = Frame::command(mux_mode, mux_target, Access::Read, address);

        let data = self.transaction(address, |bus| {
            bus.write(frame.as_bytes())?;
            let mut response = [0u8; 1];
            bus.read(&mut response)?;
            Ok(response[0])
        })?;

        debug!("Note: SPI read success (0x{:02X}) > 0x{:02X}", address, data);
        Ok(data)
    }

    /// Write `data` to consecutive accesses of one register address.
    ///
    /// The payload is split into chunks of at most [`Spi::burst_chunk`]
    /// bytes. If a chunk fails, earlier chunks may already have reached the
    /// device.
    pub fn burst_write(
        &mut self,
        mux_mode: MuxMode,
        mux_target: u8,
        address: u8,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        check_address(address);
        if data.is_empty() {
            error!("ERROR: burst of null length");
            return Err(Error::InvalidArgument("burst of null length"));
        }

        let frame = Frame::command(mux_mode, mux_target, Access::Write, address);
        let burst_chunk = self.burst_chunk;

        self.transaction(address, |bus| {
            bus.write(frame.as_bytes())?;
            let mut remaining = data.len();
            for (i, chunk) in data.chunks(burst_chunk).enumerate() {
                let offset = i * burst_chunk;
                bus.write(chunk).inspect_err(|_| {
                    error!("BURST WRITE: (0x{:02X}) chunk at offset {} failed", address, offset)
                })?;
                trace!(
                    "BURST WRITE: (0x{:02X}) < to trans {} # chunk {} (offset {})",
                    address,
                    remaining,
                    chunk.len(),
                    offset
                );
                remaining -= chunk.len();
            }
            Ok(())
        })?;

        debug!("Note: SPI burst write success ({} bytes)", data.len());
        Ok(())
    }

    /// Fill `data` from consecutive accesses of one register address.
    ///
    /// On error the contents of `data` are partial and must not be trusted.
    pub fn burst_read(
        &mut self,
        mux_mode: MuxMode,
        mux_target: u8,
        address: u8,
        data: &mut [u8],
    ) -> Result<()> {
        self.ensure_open()?;
        check_address(address);
        if data.is_empty() {
            error!("ERROR: burst of null length");
            return Err(Error::InvalidArgument("burst of null length"));
        }

        let frame = Frame::command(mux_mode, mux_target, Access::Read, address);
        let burst_chunk = self.burst_chunk;
        let size = data.len();

        self.transaction(address, |bus| {
            bus.write(frame.as_bytes())?;
            let mut remaining = size;
            for (i, chunk) in data.chunks_mut(burst_chunk).enumerate() {
                let offset = i * burst_chunk;
                let chunk_size = chunk.len();
                bus.read(chunk).inspect_err(|_| {
                    error!("BURST READ: (0x{:02X}) chunk at offset {} failed", address, offset)
                })?;
                trace!(
                    "BURST READ: (0x{:02X}) > to trans {} # chunk {} (offset {})",
                    address,
                    remaining,
                    chunk_size,
                    offset
                );
                remaining -= chunk_size;
            }
            Ok(())
        })?;

        debug!("Note: SPI burst read success ({} bytes)", size);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.bus.is_open() {
            Ok(())
        } else {
            Err(TransportError::NotOpen.into())
        }
    }

    // One Start..Stop bracket. A failure anywhere returns at once, leaving
    // chip select wherever it was; recovering the bus is the adapter's job.
    fn transaction<T>(&mut self, address: u8, body: impl FnOnce(&mut B) -> Result<T>) -> Result<T> {
        self.bus
            .start()
            .inspect_err(|e| error!("ERROR: SPI start failed (0x{:02X}): {}", address, e))?;
        let value = body(&mut self.bus)
            .inspect_err(|e| error!("ERROR: SPI transfer failed (0x{:02X}): {}", address, e))?;
        self.bus
            .stop()
            .inspect_err(|e| error!("ERROR: SPI stop failed (0x{:02X}): {}", address, e))?;
        Ok(value)
    }

    #[cfg(test)]
    fn bus(&self) -> &B {
        &self.bus
    }
}
