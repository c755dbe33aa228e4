//! Application identity, info record and CPU status decoding.

use std::fmt;

use super::constants::*;

/// Firmware personality running on the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppId {
    Bootloader,
    /// App0, the ranging application.
    Measurement,
    /// App1. Recognised but never targeted.
    Reserved,
    Unknown(u8),
}

impl AppId {
    pub fn raw(self) -> u8 {
        match self {
            AppId::Bootloader => APP_ID_BOOTLOADER,
            AppId::Measurement => APP_ID_APP0,
            AppId::Reserved => APP_ID_APP1,
            AppId::Unknown(id) => id,
        }
    }
}

impl From<u8> for AppId {
    fn from(id: u8) -> Self {
        match id {
            APP_ID_BOOTLOADER => AppId::Bootloader,
            APP_ID_APP0 => AppId::Measurement,
            APP_ID_APP1 => AppId::Reserved,
            other => AppId::Unknown(other),
        }
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppId::Bootloader => write!(f, "bootloader"),
            AppId::Measurement => write!(f, "app0"),
            AppId::Reserved => write!(f, "app1"),
            AppId::Unknown(id) => write!(f, "unknown({id:#04x})"),
        }
    }
}

/// Self-reported identity of the running application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoRecord {
    pub app_id: AppId,
    /// Major revision of the running application.
    pub app_version: u8,
    /// Last value written to the application request register.
    pub requested: u8,
}

impl Default for InfoRecord {
    fn default() -> Self {
        Self {
            app_id: AppId::Unknown(0),
            app_version: 0,
            requested: 0,
        }
    }
}

impl InfoRecord {
    pub const SIZE: usize = INFO_RECORD_SIZE;

    /// Parse the record read from [`REG_APP_ID`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            app_id: AppId::from(bytes[0]),
            app_version: bytes[1],
            requested: bytes[2],
        })
    }

    /// App0 revisions 2 and up carry the algorithm/gpio/clock-trim features.
    pub fn supports_v2(&self) -> bool {
        self.app_id == AppId::Measurement && self.app_version >= APP0_V2_MAJOR
    }
}

/// Decoded [`REG_STAT`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStatus {
    Ready,
    Standby,
    Busy,
}

impl CpuStatus {
    pub fn from_reg(status: u8) -> Self {
        if status & STAT_CPU_READY != 0 {
            CpuStatus::Ready
        } else if status & STAT_PON == 0 {
            CpuStatus::Standby
        } else {
            CpuStatus::Busy
        }
    }
}

/// Full App0 revision, read from the major/minor/patch registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
