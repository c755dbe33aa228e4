//! Raw register access, register dumps and version reporting.

use std::fmt::Write as _;

use tracing::debug;

use super::DeviceSession;
use crate::error::Result;
use crate::protocol::constants::*;
use crate::protocol::{AppId, AppVersion};
use crate::transport::SensorTransport;

/// Render registers as a hex dump, 16 per line, each line prefixed with
/// the address of its first register.
pub fn format_register_dump(regs: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in regs.chunks(16).enumerate() {
        let _ = write!(out, "{:02x}:", line * 16);
        for byte in chunk {
            let _ = write!(out, " {byte:02x}");
        }
        out.push('\n');
    }
    out
}

impl<T: SensorTransport> DeviceSession<T> {
    pub fn read_register(&self, reg: u8) -> Result<u8> {
        self.with_state(|st| {
            let value = st.transport.read_u8(reg)?;
            st.shadow[reg as usize] = value;
            Ok(value)
        })
    }

    /// Write a register. With a mask only the masked bits change
    /// (read-modify-write).
    pub fn write_register(&self, reg: u8, value: u8, mask: Option<u8>) -> Result<()> {
        self.with_state(|st| {
            let value = match mask {
                Some(mask) => {
                    let current = st.transport.read_u8(reg)?;
                    (current & !mask) | (value & mask)
                }
                None => value,
            };
            debug!(reg = %format!("{reg:#04x}"), value = %format!("{value:#04x}"), "Register write");
            st.transport.write_u8(reg, value)?;
            st.shadow[reg as usize] = value;
            Ok(())
        })
    }

    /// Read every addressable register into the shadow copy and return it.
    pub fn dump_registers(&self) -> Result<Vec<u8>> {
        self.with_state(|st| {
            let mut regs = [0u8; MAX_REGS];
            st.transport.read(0, &mut regs)?;
            st.shadow = regs;
            Ok(regs.to_vec())
        })
    }

    /// App0 header block: ids, command block and state registers.
    pub fn control_registers(&self) -> Result<Vec<u8>> {
        self.with_state(|st| {
            st.require_app0()?;
            let mut regs = [0u8; CTRL_FRAME_SIZE];
            st.transport.read(0, &mut regs)?;
            st.shadow[..CTRL_FRAME_SIZE].copy_from_slice(&regs);
            Ok(regs.to_vec())
        })
    }

    /// Running App0 version; `None` outside App0.
    pub fn app_version(&self) -> Result<Option<AppVersion>> {
        self.with_state(|st| {
            if st.info.app_id != AppId::Measurement {
                return Ok(None);
            }
            let mut minor_patch = [0u8; 2];
            st.transport.read(REG_APP_REV_MINOR, &mut minor_patch)?;
            Ok(Some(AppVersion {
                major: st.info.app_version,
                minor: minor_patch[0],
                patch: minor_patch[1],
            }))
        })
    }

    /// `major.minor.patch` in App0, `app_id-version-0-0` elsewhere.
    pub fn version_string(&self) -> Result<String> {
        let info = self.info();
        match self.app_version()? {
            Some(version) => Ok(version.to_string()),
            None => Ok(format!("{:#x}-{}-0-0", info.app_id.raw(), info.app_version)),
        }
    }
}
