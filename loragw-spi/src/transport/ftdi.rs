//! FTDI USB plumbing.
//!
//! Talks to FTDI Hi-Speed parts (FT232H, FT2232H, FT4232H) directly over
//! USB with `nusb`: vendor control requests for reset, purge, latency and
//! bit mode, plus bulk transfers on the channel's endpoint pair. Nothing
//! here knows about SPI.

use futures::executor::block_on;
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer};
use std::time::{Duration, Instant};

use crate::config::SpiConfig;
use crate::error::{Result, TransportError};
use crate::tracing::prelude::*;

/// FTDI parts with an MPSSE engine and a 60 MHz base clock.
pub const KNOWN_DEVICES: &[(u16, u16, &str)] = &[
    (0x0403, 0x6014, "FT232H"),
    (0x0403, 0x6010, "FT2232H"),
    (0x0403, 0x6011, "FT4232H"),
];

/// Vendor request codes
mod request {
    pub const RESET: u8 = 0x00;
    pub const SET_LATENCY_TIMER: u8 = 0x09;
    pub const SET_BITMODE: u8 = 0x0B;
}

/// Values for the RESET request
mod reset {
    pub const SIO: u16 = 0;
    pub const PURGE_RX: u16 = 1;
    pub const PURGE_TX: u16 = 2;
}

/// Bit modes for SET_BITMODE
pub mod bitmode {
    pub const RESET: u8 = 0x00;
    pub const MPSSE: u8 = 0x02;
}

/// Every IN packet starts with two modem status bytes.
const MODEM_STATUS_LEN: usize = 2;

/// Bulk packet size of Hi-Speed parts.
const PACKET_SIZE: usize = 512;

const READ_REQUEST_SIZE: usize = 8 * PACKET_SIZE;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// Does a USB device match the configured filters?
pub(crate) fn matches(config: &SpiConfig, vendor_id: u16, product_id: u16, serial: Option<&str>) -> bool {
    let ids_match = match (config.vendor_id, config.product_id) {
        (None, None) => KNOWN_DEVICES
            .iter()
            .any(|(vid, pid, _)| *vid == vendor_id && *pid == product_id),
        (vid, pid) => {
            vid.map_or(true, |v| v == vendor_id) && pid.map_or(true, |p| p == product_id)
        }
    };
    let serial_match = match config.serial.as_deref() {
        Some(wanted) => serial == Some(wanted),
        None => true,
    };
    ids_match && serial_match
}

/// Append the payload of a bulk IN transfer to `out`, dropping the status
/// bytes at the head of each packet.
pub(crate) fn strip_modem_status(raw: &[u8], packet_size: usize, out: &mut Vec<u8>) {
    for packet in raw.chunks(packet_size) {
        if packet.len() > MODEM_STATUS_LEN {
            out.extend_from_slice(&packet[MODEM_STATUS_LEN..]);
        }
    }
}

fn part_name(vendor_id: u16, product_id: u16) -> &'static str {
    KNOWN_DEVICES
        .iter()
        .find(|(vid, pid, _)| *vid == vendor_id && *pid == product_id)
        .map(|(_, _, name)| *name)
        .unwrap_or("FTDI device")
}

/// One claimed channel of an FTDI chip.
pub struct FtdiDevice {
    interface: nusb::Interface,
    /// wIndex for vendor requests (channel A is 1)
    index: u16,
    ep_in: u8,
    ep_out: u8,
    description: String,
    read_timeout: Duration,
}

impl FtdiDevice {
    /// Find, open, and claim the configured adapter channel.
    pub fn open(config: &SpiConfig) -> Result<Self> {
        let info = nusb::list_devices()
            .map_err(TransportError::Usb)?
            .find(|d| matches(config, d.vendor_id(), d.product_id(), d.serial_number()))
            .ok_or(TransportError::NotFound)?;

        let description = format!(
            "{} ({:04x}:{:04x}, serial {}, bus {} addr {})",
            info.product_string()
                .unwrap_or_else(|| part_name(info.vendor_id(), info.product_id())),
            info.vendor_id(),
            info.product_id(),
            info.serial_number().unwrap_or("none"),
            info.bus_number(),
            info.device_address(),
        );
        debug!("Opening {}", description);

        let device = info.open().map_err(TransportError::Usb)?;
        let interface = device
            .detach_and_claim_interface(config.interface)
            .map_err(TransportError::Usb)?;

        Ok(Self {
            interface,
            index: config.interface as u16 + 1,
            ep_in: 0x81 + 2 * config.interface,
            ep_out: 0x02 + 2 * config.interface,
            description,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn reset(&self) -> Result<()> {
        self.vendor_request(request::RESET, reset::SIO)
    }

    pub fn purge_rx(&self) -> Result<()> {
        self.vendor_request(request::RESET, reset::PURGE_RX)
    }

    pub fn purge_tx(&self) -> Result<()> {
        self.vendor_request(request::RESET, reset::PURGE_TX)
    }

    pub fn set_latency_timer(&self, ms: u8) -> Result<()> {
        self.vendor_request(request::SET_LATENCY_TIMER, ms as u16)
    }

    /// Select a bit mode; `mask` sets pin directions for the bit-bang modes.
    pub fn set_bitmode(&self, mode: u8, mask: u8) -> Result<()> {
        self.vendor_request(request::SET_BITMODE, ((mode as u16) << 8) | mask as u16)
    }

    /// Send bytes to the channel's OUT endpoint.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        block_on(self.interface.bulk_out(self.ep_out, data.to_vec()))
            .into_result()
            .map_err(TransportError::Transfer)?;
        Ok(())
    }

    /// Collect exactly `buf.len()` payload bytes from the IN endpoint.
    pub fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let deadline = Instant::now() + self.read_timeout;
        let mut received = Vec::with_capacity(buf.len());

        while received.len() < buf.len() {
            if Instant::now() > deadline {
                return Err(TransportError::Timeout {
                    expected: buf.len(),
                    received: received.len(),
                }
                .into());
            }
            let raw = block_on(
                self.interface
                    .bulk_in(self.ep_in, RequestBuffer::new(READ_REQUEST_SIZE)),
            )
            .into_result()
            .map_err(TransportError::Transfer)?;
            strip_modem_status(&raw, PACKET_SIZE, &mut received);
        }

        if received.len() > buf.len() {
            warn!(
                "Discarding {} unexpected bytes from {}",
                received.len() - buf.len(),
                self.description
            );
        }
        buf.copy_from_slice(&received[..buf.len()]);
        Ok(())
    }

    fn vendor_request(&self, request: u8, value: u16) -> Result<()> {
        self.interface
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: self.index,
                },
                &[],
                CONTROL_TIMEOUT,
            )
            .map_err(TransportError::Transfer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0x0403, 0x6014, true ; "ft232h")]
    #[test_case(0x0403, 0x6010, true ; "ft2232h")]
    #[test_case(0x0403, 0x6011, true ; "ft4232h")]
    #[test_case(0x0403, 0x6001, false ; "ft232r has no mpsse")]
    #[test_case(0x1d6b, 0x0002, false ; "root hub")]
    fn test_default_filter(vid: u16, pid: u16, expected: bool) {
        assert_eq!(matches(&SpiConfig::default(), vid, pid, None), expected);
    }

    #[test]
    fn test_explicit_ids() {
        let config = SpiConfig {
            vendor_id: Some(0x1234),
            product_id: Some(0x5678),
            ..SpiConfig::default()
        };
        assert!(matches(&config, 0x1234, 0x5678, None));
        assert!(!matches(&config, 0x0403, 0x6014, None));
    }

    #[test]
    fn test_serial_filter() {
        let config = SpiConfig {
            serial: Some("FT12AB".to_string()),
            ..SpiConfig::default()
        };
        assert!(matches(&config, 0x0403, 0x6014, Some("FT12AB")));
        assert!(!matches(&config, 0x0403, 0x6014, Some("FT99ZZ")));
        assert!(!matches(&config, 0x0403, 0x6014, None));
    }

    #[test]
    fn test_strip_status_only_packet() {
        let mut out = Vec::new();
        strip_modem_status(&[0x32, 0x60], PACKET_SIZE, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_strip_across_packets() {
        // Two packets of four: status, status, data, data
        let raw = [0x32, 0x60, 0xA1, 0xA2, 0x32, 0x60, 0xB1, 0xB2];
        let mut out = vec![0x00];
        strip_modem_status(&raw, 4, &mut out);
        assert_eq!(out, vec![0x00, 0xA1, 0xA2, 0xB1, 0xB2]);
    }

    #[test]
    fn test_strip_short_tail_packet() {
        let raw = [0x32, 0x60, 0xA1, 0xA2, 0x32, 0x60, 0xB1];
        let mut out = Vec::new();
        strip_modem_status(&raw, 4, &mut out);
        assert_eq!(out, vec![0xA1, 0xA2, 0xB1]);
    }

    #[test]
    fn test_part_names() {
        assert_eq!(part_name(0x0403, 0x6014), "FT232H");
        assert_eq!(part_name(0x0403, 0x6001), "FTDI device");
    }
}
