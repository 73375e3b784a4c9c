//! Recording bus for exercising the register engine without hardware.

use std::collections::VecDeque;

use super::SpiBus;
use crate::error::{Result, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Start,
    Stop,
    Write(Vec<u8>),
    Read(usize),
}

pub(crate) struct MockBus {
    pub ops: Vec<Op>,
    pub open: bool,
    /// Served first, byte by byte, to reads
    pub responses: VecDeque<u8>,
    /// Returned once `responses` runs dry
    pub fill: u8,
    /// Index of the bus call that fails
    pub fail_at: Option<usize>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            open: true,
            responses: VecDeque::new(),
            fill: 0,
            fail_at: None,
        }
    }

    pub fn with_fill(fill: u8) -> Self {
        Self { fill, ..Self::new() }
    }

    pub fn failing_at(call: usize) -> Self {
        Self { fail_at: Some(call), ..Self::new() }
    }

    pub fn closed() -> Self {
        Self { open: false, ..Self::new() }
    }

    /// Payload of every write, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Write(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&mut self, op: Op) -> Result<()> {
        if self.fail_at == Some(self.ops.len()) {
            return Err(TransportError::Usb(std::io::Error::other("mock bus failure")).into());
        }
        self.ops.push(op);
        Ok(())
    }
}

impl SpiBus for MockBus {
    fn is_open(&self) -> bool {
        self.open
    }

    fn start(&mut self) -> Result<()> {
        self.record(Op::Start)
    }

    fn stop(&mut self) -> Result<()> {
        self.record(Op::Stop)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.record(Op::Write(data.to_vec()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.record(Op::Read(buf.len()))?;
        for byte in buf.iter_mut() {
            *byte = self.responses.pop_front().unwrap_or(self.fill);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}
