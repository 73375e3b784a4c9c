//! Diagnostic tool for the concentrator SPI link.
//!
//! Opens the USB-to-SPI bridge and runs one register operation against the
//! concentrator, to check wiring and adapter setup before starting a
//! gateway.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

use loragw_spi::tracing::{self, prelude::*};
use loragw_spi::hw_trait::SpiBus;
use loragw_spi::{mux_target, transport, MuxMode, Spi, SpiConfig};

/// SX1301 chip version register and the value it should hold.
const VERSION_REGISTER: u8 = 0x01;
const SX1301_VERSION: u8 = 103;

#[derive(Parser, Debug)]
#[command(name = "loragw-spi-probe", version, about)]
struct Cli {
    /// JSON adapter configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bus addressing: none or mode1
    #[arg(long, default_value_t = MuxMode::None)]
    mux_mode: MuxMode,

    /// Target-select byte used with mode1
    #[arg(long, value_parser = parse_byte, default_value = "0x00")]
    mux_target: u8,

    /// Log every transaction
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read and check the SX1301 version register
    Version,
    /// Read one register
    Read {
        #[arg(value_parser = parse_byte)]
        address: u8,
    },
    /// Write one register
    Write {
        #[arg(value_parser = parse_byte)]
        address: u8,
        #[arg(value_parser = parse_byte)]
        value: u8,
    },
    /// Burst read and print as hex
    Dump {
        #[arg(value_parser = parse_byte)]
        address: u8,
        length: usize,
    },
    /// Burst write a pattern, burst read it back, and compare
    BurstTest {
        #[arg(value_parser = parse_byte)]
        write_address: u8,
        #[arg(value_parser = parse_byte)]
        read_address: u8,
        #[arg(default_value_t = 2500)]
        length: usize,
    },
}

fn parse_byte(s: &str) -> std::result::Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("'{}' is not a byte: {}", s, e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    tracing::init_journald_or_stdout(level);

    let config = match &cli.config {
        Some(path) => SpiConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SpiConfig::default(),
    };

    let mut spi = transport::open(&config).context("opening SPI port")?;
    let outcome = run(&mut spi, cli.command, cli.mux_mode, cli.mux_target);
    transport::close(spi).context("closing SPI port")?;
    outcome
}

fn run<B: SpiBus>(spi: &mut Spi<B>, command: Command, mode: MuxMode, target: u8) -> Result<()> {
    match command {
        Command::Version => {
            // The version register lives in the SX1301 even behind a mux
            let target = if mode == MuxMode::Mode1 {
                mux_target::SX1301
            } else {
                target
            };
            let version = spi.read(mode, target, VERSION_REGISTER)?;
            if version != SX1301_VERSION {
                bail!(
                    "unexpected chip version {} (expected {})",
                    version,
                    SX1301_VERSION
                );
            }
            info!("SX1301 version {} detected", version);
        }
        Command::Read { address } => {
            let value = spi.read(mode, target, address)?;
            println!("0x{:02X}: 0x{:02X}", address, value);
        }
        Command::Write { address, value } => {
            spi.write(mode, target, address, value)?;
            info!("Wrote 0x{:02X} to 0x{:02X}", value, address);
        }
        Command::Dump { address, length } => {
            let mut data = vec![0u8; length];
            spi.burst_read(mode, target, address, &mut data)?;
            for (i, line) in data.chunks(16).enumerate() {
                println!("{:06x}: {}", i * 16, hex::encode(line));
            }
        }
        Command::BurstTest {
            write_address,
            read_address,
            length,
        } => burst_test(spi, mode, target, write_address, read_address, length)?,
    }
    Ok(())
}

fn burst_test<B: SpiBus>(
    spi: &mut Spi<B>,
    mode: MuxMode,
    target: u8,
    write_address: u8,
    read_address: u8,
    length: usize,
) -> Result<()> {
    let pattern: Vec<u8> = (0..length).map(|i| (i % 256) as u8).collect();
    spi.burst_write(mode, target, write_address, &pattern)?;

    let mut readback = vec![0u8; length];
    spi.burst_read(mode, target, read_address, &mut readback)?;

    let mismatches: Vec<usize> = pattern
        .iter()
        .zip(&readback)
        .enumerate()
        .filter(|(_, (sent, got))| sent != got)
        .map(|(i, _)| i)
        .collect();

    if mismatches.is_empty() {
        info!("Burst test passed: {} bytes", length);
        return Ok(());
    }
    for &i in mismatches.iter().take(8) {
        warn!(
            "offset {}: wrote 0x{:02X}, read 0x{:02X}",
            i, pattern[i], readback[i]
        );
    }
    bail!("{} of {} bytes differ", mismatches.len(), length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loragw_spi::Error;
    use std::collections::VecDeque;
    use test_case::test_case;

    /// Reads hand back whatever was burst-written, minus the header byte.
    #[derive(Default)]
    struct LoopbackBus {
        memory: VecDeque<u8>,
        header_pending: bool,
        flip_byte: Option<usize>,
    }

    impl SpiBus for LoopbackBus {
        fn is_open(&self) -> bool {
            true
        }

        fn start(&mut self) -> loragw_spi::Result<()> {
            self.header_pending = true;
            Ok(())
        }

        fn stop(&mut self) -> loragw_spi::Result<()> {
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> loragw_spi::Result<()> {
            if self.header_pending {
                self.header_pending = false;
            } else {
                self.memory.extend(data);
                if let Some(i) = self.flip_byte.take() {
                    if let Some(byte) = self.memory.get_mut(i) {
                        *byte ^= 0xFF;
                    } else {
                        self.flip_byte = Some(i);
                    }
                }
            }
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> loragw_spi::Result<()> {
            for byte in buf.iter_mut() {
                *byte = self.memory.pop_front().unwrap_or(0);
            }
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_burst_test_passes_on_loopback() {
        let mut spi = Spi::new(LoopbackBus::default());
        burst_test(&mut spi, MuxMode::None, 0, 0x55, 0x56, 2500).unwrap();
    }

    #[test]
    fn test_burst_test_reports_mismatch() {
        let bus = LoopbackBus {
            flip_byte: Some(1500),
            ..LoopbackBus::default()
        };
        let mut spi = Spi::new(bus);
        let err = burst_test(&mut spi, MuxMode::None, 0, 0x55, 0x56, 2500).unwrap_err();
        assert_eq!(err.to_string(), "1 of 2500 bytes differ");
    }

    #[test]
    fn test_dump_of_nothing_is_rejected() {
        let mut spi = Spi::new(LoopbackBus::default());
        let command = Command::Dump {
            address: 0x10,
            length: 0,
        };
        let err = run(&mut spi, command, MuxMode::None, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidArgument(_))
        ));
    }

    #[test_case("0x7F", Ok(0x7F))]
    #[test_case("0XaB", Ok(0xAB))]
    #[test_case("16", Ok(16))]
    #[test_case("256", Err(()))]
    #[test_case("0xGG", Err(()))]
    fn test_parse_byte(input: &str, expected: std::result::Result<u8, ()>) {
        assert_eq!(parse_byte(input).map_err(|_| ()), expected);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "loragw-spi-probe",
            "--mux-mode",
            "mode1",
            "--mux-target",
            "0x01",
            "write",
            "0x10",
            "0xAB",
        ])
        .unwrap();
        assert_eq!(cli.mux_mode, MuxMode::Mode1);
        assert_eq!(cli.mux_target, 0x01);
        assert!(matches!(
            cli.command,
            Command::Write {
                address: 0x10,
                value: 0xAB
            }
        ));
    }

    #[test]
    fn test_cli_rejects_unknown_mux_mode() {
        assert!(Cli::try_parse_from(["loragw-spi-probe", "--mux-mode", "mode2", "version"]).is_err());
    }
}
