//! Error types shared across the crate.

use thiserror::Error;

use crate::firmware::FirmwareError;
use crate::protocol::AppId;
use crate::transport::BusError;

/// Errors surfaced by session operations.
#[derive(Error, Debug)]
pub enum TofError {
    #[error("communication failure: {0}")]
    Communication(#[from] BusError),

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("wrong application: expected {expected}, running {actual}")]
    WrongApplication { expected: AppId, actual: AppId },

    #[error("{feature} requires a newer application revision (running major {revision})")]
    UnsupportedRevision { feature: &'static str, revision: u8 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("timed out after {elapsed_ms}ms waiting for {what}")]
    Timeout { what: &'static str, elapsed_ms: u64 },

    #[error("frame queue overflow")]
    Overflow,

    #[error("device unhealthy (crosstalk baseline {crosstalk})")]
    Unhealthy { crosstalk: u32 },

    #[error("session is shut down")]
    Closed,

    #[error("no chip-enable line is wired")]
    NoChipEnable,

    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl TofError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        TofError::InvalidRequest(msg.into())
    }
}

pub type Result<T, E = TofError> = std::result::Result<T, E>;
