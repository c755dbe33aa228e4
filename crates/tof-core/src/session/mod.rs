//! Device session - the single owner of a sensor.
//!
//! Every operation runs under one session lock. Operations that wait on
//! the device for long (firmware download, calibration progress) release
//! the lock while waiting so the interrupt path and readers keep running,
//! and re-check whatever they depend on after reacquiring it.

mod app;
mod calibration;
mod capture;
mod dispatch;
mod provision;
mod recovery;
mod registers;

pub use calibration::CalibrationResult;
pub use dispatch::{Poller, ServiceOutcome};
pub use registers::format_register_dump;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use crate::config::{SessionConfig, TimingConfig};
use crate::error::{Result, TofError};
use crate::events::{TofEvent, TofObserver, TracingObserver};
use crate::firmware::FirmwareSource;
use crate::protocol::constants::*;
use crate::protocol::{AppId, CaptureMode, CaptureSettings, InfoRecord, ResultRecord};
use crate::queue::FrameQueue;
use crate::sched::ScheduledTask;
use crate::transport::SensorTransport;

pub(crate) type Guard<'a, T> = MutexGuard<'a, SessionState<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing { mode: CaptureMode },
}

impl CaptureState {
    pub fn is_active(&self) -> bool {
        matches!(self, CaptureState::Capturing { .. })
    }
}

/// Calibration blobs to hand to the device on the next capture start.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CalUpdate {
    pub(crate) factory: bool,
    pub(crate) alg_state: bool,
    pub(crate) config: bool,
}

/// Factory calibration record.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FactoryCalibration {
    data: [u8; FACTORY_CALIB_SIZE],
    size: usize,
}

impl FactoryCalibration {
    pub(crate) fn store(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(FACTORY_CALIB_SIZE);
        self.data = [0; FACTORY_CALIB_SIZE];
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.size = n;
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Crosstalk baseline packed in the first three bytes.
    pub(crate) fn crosstalk(&self) -> u32 {
        if self.size < 3 {
            return 0;
        }
        let [b0, b1, b2] = [self.data[0], self.data[1], self.data[2]].map(u32::from);
        (b2 << 12) + (b1 << 4) + (b0 >> 4)
    }
}

/// Completion slot for the current firmware candidate.
#[derive(Debug, Default)]
pub(crate) struct UploadSlot {
    pub(crate) generation: u64,
    pub(crate) done: bool,
}

/// Everything guarded by the session lock.
pub(crate) struct SessionState<T> {
    pub(crate) transport: T,
    pub(crate) timing: TimingConfig,
    pub(crate) observer: Arc<dyn TofObserver>,
    pub(crate) info: InfoRecord,
    pub(crate) capture: CaptureState,
    pub(crate) settings: CaptureSettings,
    pub(crate) factory_calib: FactoryCalibration,
    pub(crate) alg_state: Option<[u8; ALG_STATE_SIZE]>,
    pub(crate) config_calib: Vec<u8>,
    pub(crate) cal_update: CalUpdate,
    pub(crate) saved_clock_trim: Option<u16>,
    pub(crate) healthy: bool,
    pub(crate) firmware_loaded: bool,
    pub(crate) suspended: bool,
    /// Set by shutdown; pollers exit and interrupts are ignored.
    pub(crate) closed: bool,
    /// Long operation holding the device between lock-released waits.
    pub(crate) claim: Option<&'static str>,
    pub(crate) queue: FrameQueue,
    pub(crate) last_result: Option<ResultRecord>,
    pub(crate) diag_state_mask: u8,
    pub(crate) device_error: u8,
    pub(crate) shadow: [u8; MAX_REGS],
    pub(crate) upload: UploadSlot,
}

impl<T: SensorTransport> SessionState<T> {
    fn new(transport: T, config: &SessionConfig, observer: Arc<dyn TofObserver>) -> Self {
        Self {
            transport,
            timing: config.timing.clone(),
            observer,
            info: InfoRecord::default(),
            capture: CaptureState::Idle,
            settings: CaptureSettings::default(),
            factory_calib: FactoryCalibration::default(),
            alg_state: None,
            config_calib: Vec::new(),
            cal_update: CalUpdate::default(),
            saved_clock_trim: None,
            healthy: true,
            firmware_loaded: false,
            suspended: false,
            closed: false,
            claim: None,
            queue: FrameQueue::new(config.queue_capacity),
            last_result: None,
            diag_state_mask: 0,
            device_error: 0,
            shadow: [0; MAX_REGS],
            upload: UploadSlot::default(),
        }
    }

    pub(crate) fn emit(&self, event: TofEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn require_app0(&self) -> Result<()> {
        match self.info.app_id {
            AppId::Measurement => Ok(()),
            actual => Err(TofError::WrongApplication {
                expected: AppId::Measurement,
                actual,
            }),
        }
    }

    /// Fail with `Busy` while a calibration or firmware download owns the
    /// device.
    pub(crate) fn require_unclaimed(&self) -> Result<()> {
        match self.claim {
            Some(what) => Err(TofError::Busy(what)),
            None => Ok(()),
        }
    }

    pub(crate) fn require_v2(&self, feature: &'static str) -> Result<()> {
        if self.info.supports_v2() {
            Ok(())
        } else {
            Err(TofError::UnsupportedRevision {
                feature,
                revision: self.info.app_version,
            })
        }
    }

    pub(crate) fn set_health(&mut self, healthy: bool) {
        if self.healthy != healthy {
            self.healthy = healthy;
            self.emit(TofEvent::HealthChanged {
                healthy,
                crosstalk: self.factory_calib.crosstalk(),
            });
        }
    }

    /// Re-derive health from the stored crosstalk baseline.
    pub(crate) fn evaluate_health(&mut self) {
        let crosstalk = self.factory_calib.crosstalk();
        self.set_health(crosstalk != 0 && crosstalk <= CROSSTALK_IMPLAUSIBLE);
    }

    pub(crate) fn unhealthy(&self) -> TofError {
        TofError::Unhealthy {
            crosstalk: self.factory_calib.crosstalk(),
        }
    }
}

pub(crate) struct Shared<T> {
    state: Mutex<SessionState<T>>,
    /// Firmware upload completion; also paces lock-released waits.
    signal: Condvar,
    /// Consumers blocked in `wait_frame`.
    frames: Condvar,
    config: SessionConfig,
    firmware: Arc<dyn FirmwareSource>,
    deferred: Mutex<Option<ScheduledTask>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> Guard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the device as owned by `what` until the returned claim drops.
    /// The claim takes the lock on drop, so the guard must be released
    /// before it.
    fn claim<'a>(&'a self, st: &mut SessionState<T>, what: &'static str) -> Claim<'a, T> {
        st.claim = Some(what);
        Claim { shared: self }
    }

    /// Sleep for `duration` with the session lock released.
    fn pause<'a>(&'a self, mut guard: Guard<'a, T>, duration: Duration) -> Guard<'a, T> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return guard;
            }
            let (g, _) = self
                .signal
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = g;
        }
    }
}

/// Ownership of the device by one long operation.
pub(crate) struct Claim<'a, T> {
    shared: &'a Shared<T>,
}

impl<T> Drop for Claim<'_, T> {
    fn drop(&mut self) {
        self.shared.lock().claim = None;
    }
}

/// Session for one sensor. Cloning yields another handle to the same
/// session; every handle may be used from any thread.
pub struct DeviceSession<T: SensorTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: SensorTransport> Clone for DeviceSession<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: SensorTransport> DeviceSession<T> {
    /// Create a session with the default tracing observer. Does not touch
    /// the device.
    pub fn new(transport: T, config: SessionConfig, firmware: Arc<dyn FirmwareSource>) -> Self {
        Self::with_observer(transport, config, firmware, Arc::new(TracingObserver))
    }

    /// Create a session with a custom observer.
    pub fn with_observer(
        transport: T,
        config: SessionConfig,
        firmware: Arc<dyn FirmwareSource>,
        observer: Arc<dyn TofObserver>,
    ) -> Self {
        let state = SessionState::new(transport, &config, observer);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                signal: Condvar::new(),
                frames: Condvar::new(),
                config,
                firmware,
                deferred: Mutex::new(None),
            }),
        }
    }

    /// Power the chip, wait for its CPU, read the running application,
    /// enable interrupts and arm deferred provisioning.
    #[instrument(skip_all)]
    pub fn bring_up(
        transport: T,
        config: SessionConfig,
        firmware: Arc<dyn FirmwareSource>,
        observer: Arc<dyn TofObserver>,
    ) -> Result<Self> {
        let session = Self::with_observer(transport, config, firmware, observer);
        {
            let mut st = session.shared.lock();
            if st.transport.has_chip_enable() {
                st.transport.set_chip_enable(true)?;
            }
            st.wait_for_cpu_startup()?;
            let info = st.read_info_record()?;
            info!(app = %info.app_id, version = info.app_version, "Sensor up");
            if let Err(e) = st.enable_interrupts(IRQ_STANDARD) {
                warn!(error = %e, "Failed to enable interrupts");
            }
        }
        if session.shared.config.provision_on_boot {
            session.schedule_boot_provisioning()?;
        }
        Ok(session)
    }

    /// Stop capturing, cancel deferred work and power the chip down.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<()> {
        self.cancel_deferred();
        let mut st = self.shared.lock();
        st.closed = true;
        if st.info.app_id == AppId::Measurement {
            if let Err(e) = st.stop_capture() {
                warn!(error = %e, "Failed to stop capture during shutdown");
            }
            match st.transport.read_u8(REG_INT_STAT) {
                Ok(0) => {}
                Ok(pending) => st.transport.write_u8(REG_INT_STAT, pending)?,
                Err(e) => warn!(error = %e, "Failed to clear interrupt status"),
            }
        }
        if st.transport.has_chip_enable() {
            st.transport.set_chip_enable(false)?;
        }
        st.capture = CaptureState::Idle;
        drop(st);
        self.shared.frames.notify_all();
        info!("Session shut down");
        Ok(())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Run `f` under the session lock.
    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState<T>) -> R) -> R {
        let mut st = self.shared.lock();
        f(&mut st)
    }

    pub fn info(&self) -> InfoRecord {
        self.with_state(|st| st.info)
    }

    pub fn app_id(&self) -> AppId {
        self.with_state(|st| st.info.app_id)
    }

    pub fn is_healthy(&self) -> bool {
        self.with_state(|st| st.healthy)
    }

    /// Whether the last provisioning attempt left App0 running.
    pub fn firmware_loaded(&self) -> bool {
        self.with_state(|st| st.firmware_loaded)
    }

    /// Run `f` with direct access to the transport, under the session lock.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.with_state(|st| f(&mut st.transport))
    }
}
