//! Firmware images and their download through the bootloader.

pub mod hex;
pub mod source;
pub(crate) mod upload;

pub use hex::{HexRecord, RecordType, encode_image};
pub use source::{DirectorySource, FirmwareSource, MemorySource, NoFirmware};
pub use upload::UploadSummary;

use thiserror::Error;

use crate::protocol::BlCommand;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Invalid hex record at line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },

    #[error("Bootloader rejected {command} with status {status:#04x}")]
    BootloaderStatus { command: BlCommand, status: u8 },

    #[error("Bootloader still busy after {command}")]
    BootloaderBusy { command: BlCommand },

    #[error("Firmware image ended without an end-of-file record")]
    MissingEof,

    #[error("No usable firmware among {tried} candidates")]
    NoUsableCandidate { tried: usize },
}
