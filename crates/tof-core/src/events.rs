//! Event system for host decoupling.
//!
//! Lets a CLI or service subscribe to session events without
//! tight coupling to the core logic.

use crate::protocol::{AppId, ErrorCode, FrameKind};

/// Events emitted by the device session.
#[derive(Debug, Clone)]
pub enum TofEvent {
    /// Running application changed.
    AppChanged { from: AppId, to: AppId },
    /// A firmware candidate is being tried.
    FirmwareAttempt { name: String, index: usize },
    /// Candidate could not be fetched.
    FirmwareUnavailable { name: String },
    /// Candidate downloaded and App0 is running.
    FirmwareLoaded { name: String, elapsed_ms: u64 },
    CaptureStarted { command: u8 },
    CaptureStopped,
    /// Frame queued for consumers.
    FrameQueued { kind: FrameKind, pending: usize },
    CalibrationComplete { size: usize, crosstalk: u32 },
    HealthChanged { healthy: bool, crosstalk: u32 },
    RecoveryScheduled { delay_ms: u64 },
    /// Error reported through the frame queue.
    Error { code: ErrorCode, message: String },
}

/// Observer trait for receiving session events.
///
/// Called with the session lock held; implementations must not call back
/// into the session.
pub trait TofObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &TofEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl TofObserver for NullObserver {
    fn on_event(&self, _event: &TofEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl TofObserver for TracingObserver {
    fn on_event(&self, event: &TofEvent) {
        match event {
            TofEvent::AppChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Application changed");
            }
            TofEvent::FirmwareAttempt { name, index } => {
                tracing::info!(candidate = %name, index = index, "Trying firmware");
            }
            TofEvent::FirmwareUnavailable { name } => {
                tracing::warn!(candidate = %name, "Firmware not available");
            }
            TofEvent::FirmwareLoaded { name, elapsed_ms } => {
                tracing::info!(candidate = %name, elapsed_ms = elapsed_ms, "Firmware loaded");
            }
            TofEvent::CaptureStarted { command } => {
                tracing::debug!(command = %format!("{command:#04x}"), "Capture started");
            }
            TofEvent::CaptureStopped => {
                tracing::debug!("Capture stopped");
            }
            TofEvent::FrameQueued { kind, pending } => {
                tracing::trace!(kind = %kind, pending = pending, "Frame queued");
            }
            TofEvent::CalibrationComplete { size, crosstalk } => {
                tracing::info!(size = size, crosstalk = crosstalk, "Factory calibration complete");
            }
            TofEvent::HealthChanged { healthy, crosstalk } => {
                if *healthy {
                    tracing::info!(crosstalk = crosstalk, "Device healthy");
                } else {
                    tracing::warn!(crosstalk = crosstalk, "Device marked unhealthy");
                }
            }
            TofEvent::RecoveryScheduled { delay_ms } => {
                tracing::warn!(delay_ms = delay_ms, "Recovery scheduled");
            }
            TofEvent::Error { code, message } => {
                tracing::error!(code = %code, "Error: {}", message);
            }
        }
    }
}

/// Observer that keeps every event, for tests and diagnostics.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<TofEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TofEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl TofObserver for RecordingObserver {
    fn on_event(&self, event: &TofEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
    }
}
