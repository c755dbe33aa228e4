//! Bootloader packet framing.
//!
//! Every bootloader command is written as a single burst starting at
//! [`REG_BL_CMD_STAT`]: `[cmd, size, data.., checksum]`, where the checksum
//! is the one's complement of the byte sum of everything before it. The
//! same register reads back the command status.

use std::fmt;

use super::constants::*;

/// Bootloader command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlCommand {
    RamRemapReset,
    DownloadInit,
    WriteRam,
    AddrRam,
}

impl BlCommand {
    pub fn code(self) -> u8 {
        match self {
            BlCommand::RamRemapReset => BL_CMD_RAMREMAP_RESET,
            BlCommand::DownloadInit => BL_CMD_DOWNLOAD_INIT,
            BlCommand::WriteRam => BL_CMD_W_RAM,
            BlCommand::AddrRam => BL_CMD_ADDR_RAM,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            BL_CMD_RAMREMAP_RESET => Some(BlCommand::RamRemapReset),
            BL_CMD_DOWNLOAD_INIT => Some(BlCommand::DownloadInit),
            BL_CMD_W_RAM => Some(BlCommand::WriteRam),
            BL_CMD_ADDR_RAM => Some(BlCommand::AddrRam),
            _ => None,
        }
    }
}

impl fmt::Display for BlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlCommand::RamRemapReset => write!(f, "RAMREMAP_RESET"),
            BlCommand::DownloadInit => write!(f, "DOWNLOAD_INIT"),
            BlCommand::WriteRam => write!(f, "W_RAM"),
            BlCommand::AddrRam => write!(f, "ADDR_RAM"),
        }
    }
}

/// One framed bootloader command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlPacket {
    command: BlCommand,
    data: Vec<u8>,
}

impl BlPacket {
    pub fn download_init(salt: u8) -> Self {
        Self {
            command: BlCommand::DownloadInit,
            data: vec![salt],
        }
    }

    pub fn addr_ram(address: u16) -> Self {
        Self {
            command: BlCommand::AddrRam,
            data: address.to_le_bytes().to_vec(),
        }
    }

    /// `None` when `data` does not fit in one packet.
    pub fn write_ram(data: &[u8]) -> Option<Self> {
        if data.is_empty() || data.len() > BL_MAX_DATA {
            return None;
        }
        Some(Self {
            command: BlCommand::WriteRam,
            data: data.to_vec(),
        })
    }

    pub fn ram_remap_reset() -> Self {
        Self {
            command: BlCommand::RamRemapReset,
            data: Vec::new(),
        }
    }

    pub fn command(&self) -> BlCommand {
        self.command
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Wire form, starting at [`REG_BL_CMD_STAT`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 3);
        out.push(self.command.code());
        out.push(self.data.len() as u8);
        out.extend_from_slice(&self.data);
        out.push(checksum(&out));
        out
    }

    /// Validate framing and checksum of a burst written to the command
    /// register. Returns the command code and its payload.
    pub fn verify(bytes: &[u8]) -> Result<(u8, &[u8]), u8> {
        if bytes.len() < 3 {
            return Err(BL_STAT_ERR_SIZE);
        }
        let size = bytes[1] as usize;
        if size > BL_MAX_DATA {
            return Err(BL_STAT_ERR_RANGE);
        }
        if bytes.len() < size + 3 {
            return Err(BL_STAT_ERR_MORE);
        }
        let body = &bytes[..size + 2];
        if checksum(body) != bytes[size + 2] {
            return Err(BL_STAT_ERR_CSUM);
        }
        Ok((bytes[0], &bytes[2..size + 2]))
    }
}

/// One's complement of the byte sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Decoded bootloader status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlStatus {
    Ready,
    Busy,
    Error(u8),
}

impl BlStatus {
    pub fn from_reg(value: u8) -> Self {
        match value {
            BL_STAT_READY => BlStatus::Ready,
            v if v <= BL_STAT_ERR_LAST => BlStatus::Error(v),
            _ => BlStatus::Busy,
        }
    }
}
