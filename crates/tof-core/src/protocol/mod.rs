//! Protocol module - register map and wire formats.

pub mod bootloader;
pub mod capture;
pub mod constants;
pub mod frame;
pub mod info;

pub use bootloader::{BlCommand, BlPacket, BlStatus};
pub use capture::{CaptureMode, CaptureSettings};
pub use constants::*;
pub use frame::{ErrorCode, ErrorReport, Frame, FrameKind, ResultRecord};
pub use info::{AppId, AppVersion, CpuStatus, InfoRecord};
