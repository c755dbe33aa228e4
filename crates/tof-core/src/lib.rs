//! tof-core: session and protocol controller for TMF8801-class
//! time-of-flight sensors.
//!
//! The sensor runs one of two applications: a bootloader that accepts
//! firmware downloads, or the measurement application (App0) that ranges
//! and raises result interrupts. A [`DeviceSession`] owns one sensor and
//! drives it between the two.
//!
//! # Architecture
//!
//! - **Protocol**: register map, info record, bootloader packets, capture
//!   command block, frames
//! - **Transport**: register bus abstraction (embedded-hal adapter,
//!   simulated sensor)
//! - **Firmware**: Intel HEX images, firmware sources, bootloader upload
//! - **Queue / Sched**: bounded frame FIFO and one-shot deferred work
//! - **Events**: observer pattern for host decoupling
//! - **Session**: application switching, provisioning, capture,
//!   calibration, interrupt dispatch and recovery
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tof_core::{DeviceSession, DirectorySource, SessionConfig, SimulatedSensor};
//! use tof_core::protocol::CaptureMode;
//!
//! let session = DeviceSession::new(
//!     SimulatedSensor::default(),
//!     SessionConfig::default(),
//!     Arc::new(DirectorySource::new("/lib/firmware")),
//! );
//! session.request_firmware()?;
//! session.start(CaptureMode::MEASURE)?;
//! if let Some(frame) = session.wait_frame(Duration::from_millis(500)) {
//!     println!("{:?}", frame.result());
//! }
//! # Ok::<(), tof_core::TofError>(())
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod firmware;
pub mod protocol;
pub mod queue;
pub mod sched;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{IoMode, SessionConfig, TimingConfig};
pub use error::{Result, TofError};
pub use events::{NullObserver, RecordingObserver, TofEvent, TofObserver, TracingObserver};
pub use firmware::{DirectorySource, FirmwareError, FirmwareSource, MemorySource, NoFirmware};
pub use protocol::{AppId, CaptureMode, CaptureSettings, Frame, FrameKind, ResultRecord};
pub use queue::FrameQueue;
pub use session::{CalibrationResult, CaptureState, DeviceSession, Poller, ServiceOutcome};
pub use transport::{BusError, HalTransport, SensorTransport, SimConfig, SimulatedSensor};
