//! Bootloader RAM download of an Intel HEX image.

use std::thread;

use tracing::{debug, trace};

use super::FirmwareError;
use super::hex::{HexRecord, RecordType};
use crate::config::TimingConfig;
use crate::error::Result;
use crate::protocol::constants::REG_BL_CMD_STAT;
use crate::protocol::{BlPacket, BlStatus};
use crate::transport::SensorTransport;

/// What a completed download pushed to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub records: usize,
    pub bytes: usize,
}

pub(crate) struct Uploader<'a, T: SensorTransport> {
    bus: &'a mut T,
    timing: &'a TimingConfig,
    base: u32,
    next_addr: Option<u32>,
    summary: UploadSummary,
}

impl<'a, T: SensorTransport> Uploader<'a, T> {
    pub(crate) fn new(bus: &'a mut T, timing: &'a TimingConfig) -> Self {
        Self {
            bus,
            timing,
            base: 0,
            next_addr: None,
            summary: UploadSummary::default(),
        }
    }

    /// Send one packet and wait for the bootloader to accept it.
    fn command(&mut self, packet: BlPacket) -> Result<()> {
        let command = packet.command();
        self.bus.write(REG_BL_CMD_STAT, &packet.to_bytes())?;

        for _ in 0..self.timing.bootloader_poll_retries.max(1) {
            match BlStatus::from_reg(self.bus.read_u8(REG_BL_CMD_STAT)?) {
                BlStatus::Ready => return Ok(()),
                BlStatus::Error(status) => {
                    return Err(FirmwareError::BootloaderStatus { command, status }.into());
                }
                BlStatus::Busy => thread::sleep(self.timing.bootloader_poll_delay()),
            }
        }
        Err(FirmwareError::BootloaderBusy { command }.into())
    }

    /// Unlock RAM download.
    pub(crate) fn init(&mut self, salt: u8) -> Result<()> {
        debug!(salt = %format!("{salt:#04x}"), "Bootloader download init");
        self.command(BlPacket::download_init(salt))
    }

    /// Feed the image line by line; stops at the first bad record.
    pub(crate) fn run(mut self, image: &[u8]) -> Result<UploadSummary> {
        for (idx, raw) in image.split(|b| *b == b'\n').enumerate() {
            let line = std::str::from_utf8(raw)
                .map_err(|_| FirmwareError::InvalidRecord {
                    line: idx + 1,
                    reason: "not ASCII".into(),
                })?
                .trim();
            if line.is_empty() {
                continue;
            }
            let record = HexRecord::parse(line)
                .map_err(|reason| FirmwareError::InvalidRecord { line: idx + 1, reason })?;
            if self.record(&record)? {
                debug!(
                    records = self.summary.records,
                    bytes = self.summary.bytes,
                    "Image transferred, remapping RAM"
                );
                return Ok(self.summary);
            }
        }
        Err(FirmwareError::MissingEof.into())
    }

    /// Returns `true` once the end-of-file record has been handled.
    fn record(&mut self, record: &HexRecord) -> Result<bool> {
        self.summary.records += 1;
        match record.kind {
            RecordType::Data => {
                let addr = self.base.wrapping_add(u32::from(record.address));
                if self.next_addr != Some(addr) {
                    trace!(addr = %format!("{addr:#010x}"), "ADDR_RAM");
                    self.command(BlPacket::addr_ram(addr as u16))?;
                }
                for chunk in record.data.chunks(crate::protocol::BL_MAX_DATA) {
                    if let Some(packet) = BlPacket::write_ram(chunk) {
                        self.command(packet)?;
                    }
                }
                self.summary.bytes += record.data.len();
                self.next_addr = Some(addr.wrapping_add(record.data.len() as u32));
                Ok(false)
            }
            RecordType::ExtendedLinearAddress | RecordType::ExtendedSegmentAddress => {
                self.base = record.extended_base().ok_or_else(|| FirmwareError::InvalidRecord {
                    line: self.summary.records,
                    reason: "malformed extended address".into(),
                })?;
                self.next_addr = None;
                Ok(false)
            }
            RecordType::StartSegmentAddress | RecordType::StartLinearAddress => Ok(false),
            RecordType::EndOfFile => {
                // the device restarts into the image; no status to poll
                self.bus
                    .write(REG_BL_CMD_STAT, &BlPacket::ram_remap_reset().to_bytes())?;
                Ok(true)
            }
        }
    }
}
