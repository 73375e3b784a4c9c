//! SPI master on an FTDI MPSSE engine.
//!
//! The MPSSE (Multi-Protocol Synchronous Serial Engine) executes a small
//! command language sent over the bulk OUT endpoint. Only SPI mode 0 is
//! used here: clock idles low, data goes out on the falling edge and is
//! sampled on the rising edge, most significant bit first.
//!
//! Pin assignment on the low byte (ADBUS):
//!
//! | bit | pin | use         |
//! |-----|-----|-------------|
//! | 0   | SK  | SPI clock   |
//! | 1   | DO  | MOSI        |
//! | 2   | DI  | MISO        |
//! | 3   | CS  | chip select |
//! | 4-7 | GPIO| unused, out |
//!
//! Reference: FTDI AN_108, "Command Processor for MPSSE and MCU Host Bus
//! Emulation Modes".

use crate::config::SpiConfig;
use crate::error::{Result, TransportError};
use crate::hw_trait::SpiBus;
use crate::tracing::prelude::*;

use super::ftdi::{bitmode, FtdiDevice};

/// Largest transfer one MPSSE data command can carry.
pub const MAX_TRANSFER: usize = 65536;

/// Base clock of the Hi-Speed parts with divide-by-5 disabled.
const BASE_CLOCK_HZ: u32 = 60_000_000;

/// MPSSE opcodes
pub mod opcode {
    /// Clock bytes out, MSB first, on the falling edge
    pub const WRITE_BYTES_NVE_MSB: u8 = 0x11;
    /// Clock bytes in, MSB first, on the rising edge
    pub const READ_BYTES_PVE_MSB: u8 = 0x20;
    pub const SET_BITS_LOW: u8 = 0x80;
    pub const LOOPBACK_OFF: u8 = 0x85;
    pub const SET_CLOCK_DIVISOR: u8 = 0x86;
    pub const SEND_IMMEDIATE: u8 = 0x87;
    pub const DISABLE_CLOCK_DIVIDE_BY_5: u8 = 0x8A;
    pub const DISABLE_3_PHASE_CLOCKING: u8 = 0x8D;
    pub const DISABLE_ADAPTIVE_CLOCKING: u8 = 0x97;
    /// Engine's reply to an unknown opcode, followed by the opcode
    pub const BAD_COMMAND: u8 = 0xFA;
}

/// Low-byte pin masks
pub mod pins {
    pub const SK: u8 = 0x01;
    pub const DO: u8 = 0x02;
    pub const DI: u8 = 0x04;
    pub const CS: u8 = 0x08;
    pub const GPIO: u8 = 0xF0;
}

/// Everything but DI drives.
const DIRECTION: u8 = pins::SK | pins::DO | pins::CS | pins::GPIO;

/// Deliberately invalid opcode used to synchronize with the engine.
const SYNC_OPCODE: u8 = 0xAA;

/// Electrical level of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Divisor for the requested SCK frequency, and the frequency it gives.
///
/// SCK = 60 MHz / ((1 + divisor) * 2). Requests above 30 MHz are clamped,
/// and the result never exceeds the request otherwise.
pub fn clock_divisor(freq_hz: u32) -> (u16, u32) {
    let twice = 2 * u64::from(freq_hz.max(1));
    let raw = u64::from(BASE_CLOCK_HZ).div_ceil(twice).saturating_sub(1);
    let divisor = raw.min(u64::from(u16::MAX)) as u16;
    let actual = BASE_CLOCK_HZ / ((1 + divisor as u32) * 2);
    (divisor, actual)
}

/// Drive the low pin byte.
pub fn set_bits_low(value: u8) -> [u8; 3] {
    [opcode::SET_BITS_LOW, value, DIRECTION]
}

/// Length field of data commands: byte count minus one, little endian.
fn length_field(len: usize) -> Result<[u8; 2]> {
    if len == 0 || len > MAX_TRANSFER {
        return Err(TransportError::TooLong(len).into());
    }
    Ok(((len - 1) as u16).to_le_bytes())
}

/// Clock `data` out.
pub fn write_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let [lo, hi] = length_field(data.len())?;
    let mut cmd = Vec::with_capacity(data.len() + 3);
    cmd.extend_from_slice(&[opcode::WRITE_BYTES_NVE_MSB, lo, hi]);
    cmd.extend_from_slice(data);
    Ok(cmd)
}

/// Clock `len` bytes in and flush them back to the host at once.
pub fn read_bytes(len: usize) -> Result<[u8; 4]> {
    let [lo, hi] = length_field(len)?;
    Ok([opcode::READ_BYTES_PVE_MSB, lo, hi, opcode::SEND_IMMEDIATE])
}

/// Put the engine in SPI mode 0 at the given divisor with pins idle.
pub fn spi_setup(divisor: u16, idle: u8) -> Vec<u8> {
    let [lo, hi] = divisor.to_le_bytes();
    let mut cmd = vec![
        opcode::DISABLE_CLOCK_DIVIDE_BY_5,
        opcode::DISABLE_ADAPTIVE_CLOCKING,
        opcode::DISABLE_3_PHASE_CLOCKING,
        opcode::LOOPBACK_OFF,
        opcode::SET_CLOCK_DIVISOR,
        lo,
        hi,
    ];
    cmd.extend_from_slice(&set_bits_low(idle));
    cmd
}

/// Pin state that opens a transaction from the given idle state.
fn active_pins(idle: u8) -> u8 {
    idle ^ pins::CS
}

/// SPI master on one FTDI channel.
pub struct Mpsse {
    device: Option<FtdiDevice>,
    clock_hz: u32,
    /// Pin state between transactions; SK low for mode 0
    idle: u8,
    flush_after_read: bool,
}

impl Mpsse {
    /// Open the configured adapter as an SPI mode 0, MSB-first master.
    ///
    /// Chip select starts out idle high and flush-after-read off.
    pub fn open(config: &SpiConfig, clock_hz: u32) -> Result<Self> {
        let device = FtdiDevice::open(config)?;

        device.reset()?;
        device.purge_rx()?;
        device.purge_tx()?;
        device.set_latency_timer(config.latency_ms)?;
        device.set_bitmode(bitmode::RESET, 0)?;
        device.set_bitmode(bitmode::MPSSE, 0)?;

        synchronize(&device)?;

        let (divisor, actual) = clock_divisor(clock_hz);
        if actual != clock_hz {
            warn!("SPI clock {}Hz not reachable, using {}Hz", clock_hz, actual);
        }
        let idle = pins::CS;
        device.write_all(&spi_setup(divisor, idle))?;

        Ok(Self {
            device: Some(device),
            clock_hz: actual,
            idle,
            flush_after_read: false,
        })
    }

    /// Human-readable name of the adapter.
    pub fn description(&self) -> &str {
        self.device
            .as_ref()
            .map(FtdiDevice::description)
            .unwrap_or("closed")
    }

    /// Actual SCK frequency.
    pub fn clock(&self) -> u32 {
        self.clock_hz
    }

    /// Choose the chip-select level between transactions.
    pub fn set_cs_idle(&mut self, level: Level) -> Result<()> {
        match level {
            Level::High => self.idle |= pins::CS,
            Level::Low => self.idle &= !pins::CS,
        }
        let idle = self.idle;
        self.device()?.write_all(&set_bits_low(idle))
    }

    /// Purge the adapter's receive buffer after every read, so a late byte
    /// from one transaction can never show up in the next.
    pub fn set_flush_after_read(&mut self, flush: bool) {
        self.flush_after_read = flush;
    }

    fn device(&self) -> Result<&FtdiDevice> {
        self.device.as_ref().ok_or_else(|| TransportError::NotOpen.into())
    }
}

// Send a bogus opcode and wait for the engine to reject it. Anything
// else in the reply means leftovers from a previous session.
fn synchronize(device: &FtdiDevice) -> Result<()> {
    device.write_all(&[SYNC_OPCODE, opcode::SEND_IMMEDIATE])?;
    let mut reply = [0u8; 2];
    device.read_exact(&mut reply)?;
    if reply != [opcode::BAD_COMMAND, SYNC_OPCODE] {
        return Err(TransportError::Sync(format!(
            "expected [FA, AA], got {}",
            hex::encode_upper(reply)
        ))
        .into());
    }
    Ok(())
}

impl SpiBus for Mpsse {
    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn start(&mut self) -> Result<()> {
        let pins = active_pins(self.idle);
        self.device()?.write_all(&set_bits_low(pins))
    }

    fn stop(&mut self) -> Result<()> {
        let idle = self.idle;
        self.device()?.write_all(&set_bits_low(idle))
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let cmd = write_bytes(data)?;
        self.device()?.write_all(&cmd)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let cmd = read_bytes(buf.len())?;
        let device = self.device()?;
        device.write_all(&cmd)?;
        device.read_exact(buf)?;
        if self.flush_after_read {
            device.purge_rx()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        if let Err(e) = device.write_all(&set_bits_low(self.idle)) {
            warn!("Failed to idle SPI pins on {}: {}", device.description(), e);
        }
        if let Err(e) = device.set_bitmode(bitmode::RESET, 0) {
            warn!("Failed to leave MPSSE mode on {}: {}", device.description(), e);
        }
        debug!("Released {}", device.description());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use test_case::test_case;

    #[test_case(10_000_000, 2, 10_000_000 ; "ten megahertz")]
    #[test_case(30_000_000, 0, 30_000_000 ; "fastest")]
    #[test_case(50_000_000, 0, 30_000_000 ; "clamped above thirty")]
    #[test_case(1_000_000, 29, 1_000_000 ; "one megahertz")]
    #[test_case(7_000_000, 4, 6_000_000 ; "uneven rounds slower")]
    #[test_case(100, 0xFFFF, 457 ; "slowest")]
    fn test_clock_divisor(freq: u32, divisor: u16, actual: u32) {
        assert_eq!(clock_divisor(freq), (divisor, actual));
    }

    #[test]
    fn test_write_command() {
        assert_eq!(
            write_bytes(&[0x90, 0xAB]).unwrap(),
            vec![0x11, 0x01, 0x00, 0x90, 0xAB]
        );
    }

    #[test]
    fn test_write_command_max_length() {
        let data = vec![0x5A; MAX_TRANSFER];
        let cmd = write_bytes(&data).unwrap();
        assert_eq!(&cmd[..3], &[0x11, 0xFF, 0xFF]);
        assert_eq!(cmd.len(), MAX_TRANSFER + 3);
    }

    #[test_case(1, [0x20, 0x00, 0x00, 0x87])]
    #[test_case(1024, [0x20, 0xFF, 0x03, 0x87])]
    #[test_case(MAX_TRANSFER, [0x20, 0xFF, 0xFF, 0x87])]
    fn test_read_command(len: usize, expect: [u8; 4]) {
        assert_eq!(read_bytes(len).unwrap(), expect);
    }

    #[test]
    fn test_length_limits() {
        assert!(matches!(
            read_bytes(MAX_TRANSFER + 1),
            Err(Error::Transport(TransportError::TooLong(65537)))
        ));
        assert!(matches!(
            write_bytes(&[]),
            Err(Error::Transport(TransportError::TooLong(0)))
        ));
    }

    #[test]
    fn test_setup_sequence() {
        let (divisor, _) = clock_divisor(10_000_000);
        assert_eq!(
            spi_setup(divisor, pins::CS),
            vec![0x8A, 0x97, 0x8D, 0x85, 0x86, 0x02, 0x00, 0x80, 0x08, 0xFB]
        );
    }

    #[test]
    fn test_chip_select_levels() {
        // Idle high: select pulls CS low
        assert_eq!(active_pins(pins::CS), 0x00);
        // Idle low: select drives CS high
        assert_eq!(active_pins(0x00), pins::CS);
        // Clock stays low in both states
        assert_eq!(active_pins(pins::CS) & pins::SK, 0);
    }

    #[test]
    fn test_miso_is_input() {
        assert_eq!(set_bits_low(0x00)[2] & pins::DI, 0);
    }
}
