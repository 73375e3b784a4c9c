//! Physical transport to the concentrator.
//!
//! Opening the port fixes the one bus configuration the concentrator
//! speaks: SPI mode 0 at 10 MHz, MSB first, chip select idle high, receive
//! buffer flushed after every read. The returned [`Spi`] handle owns the
//! adapter until [`close`].

pub mod ftdi;
pub mod mpsse;

use crate::config::SpiConfig;
use crate::error::{Result, TransportError};
use crate::hw_trait::SpiBus;
use crate::spi::Spi;
use crate::tracing::prelude::*;

use mpsse::{Level, Mpsse};

/// SPI clock rate.
pub const SPI_CLOCK_HZ: u32 = 10_000_000;

/// Open and configure the USB-to-SPI bridge.
pub fn open(config: &SpiConfig) -> Result<Spi<Mpsse>> {
    config.validate()?;

    let mut bus = Mpsse::open(config, SPI_CLOCK_HZ)
        .inspect_err(|e| error!("ERROR: failed to open SPI device: {}", e))?;
    if !bus.is_open() {
        error!("ERROR: failed to open SPI device");
        return Err(TransportError::NotOpen.into());
    }

    bus.set_cs_idle(Level::High)?;
    bus.set_flush_after_read(true);

    debug!(
        "Note: SPI port opened and configured ok: {} initialized at {}Hz",
        bus.description(),
        bus.clock()
    );
    Spi::with_burst_chunk(bus, config.burst_chunk)
}

/// Release the bridge. Consumes the handle, so it cannot be used again.
pub fn close(spi: Spi<Mpsse>) -> Result<()> {
    spi.close()
}
