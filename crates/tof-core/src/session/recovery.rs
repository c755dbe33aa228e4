//! Deferred provisioning, recovery and power management.

use std::sync::PoisonError;

use tracing::{error, info, instrument, warn};

use super::capture::HealthGate;
use super::DeviceSession;
use crate::error::{Result, TofError};
use crate::events::TofEvent;
use crate::protocol::constants::IRQ_STANDARD;
use crate::protocol::{AppId, CaptureMode};
use crate::sched::{self, ScheduledTask};
use crate::transport::SensorTransport;

impl<T: SensorTransport> DeviceSession<T> {
    /// Arm firmware provisioning after the boot delay. Interrupts are
    /// enabled afterwards whatever the outcome.
    pub(crate) fn schedule_boot_provisioning(&self) -> Result<()> {
        let session = self.clone();
        let delay = self.shared.config.timing.boot_delay();
        let task = sched::schedule("tof-boot-provision", delay, move || {
            let st = session.shared.lock();
            if st.closed {
                return;
            }
            let (mut st, res) = session.provision_locked(st);
            if let Err(e) = res {
                warn!(error = %e, "Boot provisioning failed");
            }
            if let Err(e) = st.enable_interrupts(IRQ_STANDARD) {
                warn!(error = %e, "Failed to enable interrupts after boot provisioning");
            }
        })?;
        self.replace_deferred(task);
        Ok(())
    }

    /// Arm deferred recovery, replacing any recovery not yet started.
    #[instrument(skip(self))]
    pub fn schedule_recovery(&self) -> Result<()> {
        let timing = &self.shared.config.timing;
        let session = self.clone();
        let task = sched::schedule("tof-recovery", timing.recovery_delay(), move || {
            session.recovery_work()
        })?;
        self.replace_deferred(task);
        self.with_state(|st| {
            st.emit(TofEvent::RecoveryScheduled {
                delay_ms: timing.recovery_delay_ms,
            })
        });
        Ok(())
    }

    fn replace_deferred(&self, task: ScheduledTask) {
        let mut slot = self
            .shared
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.cancel();
        }
    }

    /// Cancel pending deferred work and wait for it if it already started.
    pub(crate) fn cancel_deferred(&self) {
        let task = self
            .shared
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel();
            task.join();
        }
    }

    /// Whether deferred provisioning or recovery is armed or running.
    pub fn recovery_pending(&self) -> bool {
        self.shared
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn recovery_work(&self) {
        let mut st = self.shared.lock();
        if st.closed {
            return;
        }
        if let Err(e) = st.enable_interrupts(IRQ_STANDARD) {
            warn!(error = %e, "Failed to enable interrupts");
        }

        let (mut st, provisioned) = self.provision_locked(st);
        if let Err(e) = provisioned {
            error!(error = %e, "Recovery could not provision firmware");
            return;
        }

        if let Some(trim) = st.saved_clock_trim {
            let rewritten = match st.require_v2("clock trim") {
                Ok(()) => st.write_clock_trim(trim),
                Err(e) => Err(e),
            };
            if let Err(e) = rewritten {
                error!(trim = trim, error = %e, "Failed to restore clock trim");
                return;
            }
        }

        if !st.factory_calib.is_empty() {
            st.cal_update.factory = true;
        }
        if !st.healthy {
            warn!(crosstalk = st.factory_calib.crosstalk(), "Device unhealthy, capture not restarted");
            return;
        }
        let v2 = st.info.supports_v2();
        st.settings.apply_calibration_grade(v2);
        match st.start_capture(CaptureMode::MEASURE, HealthGate::Enforce) {
            Ok(()) => info!("Capture restarted after recovery"),
            Err(e) => warn!(error = %e, "Failed to restart capture after recovery"),
        }
    }

    /// Quiesce for a power transition. A second call is a no-op.
    #[instrument(skip(self))]
    pub fn suspend(&self) -> Result<()> {
        self.with_state(|st| {
            if st.suspended {
                return Ok(());
            }
            st.require_unclaimed()?;
            st.last_result = None;
            if st.healthy && st.capture.is_active() {
                st.stop_capture()?;
            }
            st.suspended = true;
            info!("Suspended");
            Ok(())
        })
    }

    /// Bring the session back after [`Self::suspend`].
    ///
    /// When the device lost App0 while suspended, recovery is re-armed in
    /// the background and `WrongApplication` returned. Otherwise capture
    /// restarts with calibration-grade settings if the device is healthy.
    #[instrument(skip(self))]
    pub fn resume(&self) -> Result<()> {
        let mut st = self.shared.lock();
        if !st.suspended {
            return Ok(());
        }
        st.require_unclaimed()?;
        st.suspended = false;

        let info = st.read_info_record()?;
        if info.app_id != AppId::Measurement {
            drop(st);
            warn!(app = %info.app_id, "Application lost while suspended, scheduling recovery");
            self.schedule_recovery()?;
            return Err(TofError::WrongApplication {
                expected: AppId::Measurement,
                actual: info.app_id,
            });
        }

        if st.factory_calib.crosstalk() == 0 {
            st.set_health(false);
        }
        if !st.healthy {
            warn!(crosstalk = st.factory_calib.crosstalk(), "Device unhealthy, capture not restarted");
            return Ok(());
        }
        if st.capture.is_active() {
            return Ok(());
        }
        let v2 = st.info.supports_v2();
        st.settings.apply_calibration_grade(v2);
        st.start_capture(CaptureMode::MEASURE, HealthGate::Enforce)?;
        info!("Resumed");
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.with_state(|st| st.suspended)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::super::tests::{firmware_image, sim_config};
    use super::*;
    use crate::events::RecordingObserver;
    use crate::firmware::MemorySource;
    use crate::protocol::constants::*;
    use crate::transport::{SimConfig, SimulatedSensor};

    fn calibrated_session() -> (SimulatedSensor, DeviceSession<SimulatedSensor>, Arc<RecordingObserver>) {
        let sim = SimulatedSensor::running_app0(SimConfig::default());
        let source = MemorySource::new().with_blob("tof8801_firmware.bin", firmware_image());
        let observer = Arc::new(RecordingObserver::new());
        let session =
            DeviceSession::with_observer(sim.clone(), sim_config(), Arc::new(source), observer.clone());
        session.with_state(|st| st.read_info_record().unwrap());
        session.run_factory_calibration().unwrap();
        (sim, session, observer)
    }

    fn power_cycle(session: &DeviceSession<SimulatedSensor>) {
        session.with_transport(|t| {
            t.set_chip_enable(false).unwrap();
            t.set_chip_enable(true).unwrap();
        });
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_suspend_resume_restarts_capture() {
        let (sim, session, _observer) = calibrated_session();
        session.start(CaptureMode::MEASURE).unwrap();
        session.suspend().unwrap();
        assert!(session.is_suspended());
        assert!(!session.is_capturing());

        sim.clear_log();
        session.suspend().unwrap();
        assert_eq!(sim.bus_ops(), 0);

        session.resume().unwrap();
        assert!(session.is_capturing());
        assert_eq!(sim.peek(REG_CMD_ALG), CALIB_ALG);
        assert_eq!(sim.peek(REG_CMD_PERIOD), CALIB_PERIOD_MS);

        sim.clear_log();
        session.resume().unwrap();
        assert_eq!(sim.bus_ops(), 0);
    }

    #[test]
    fn test_resume_without_baseline_stays_idle() {
        let sim = SimulatedSensor::running_app0(SimConfig::default());
        let session = DeviceSession::new(sim.clone(), sim_config(), Arc::new(MemorySource::new()));
        session.with_state(|st| st.read_info_record().unwrap());

        session.suspend().unwrap();
        session.resume().unwrap();
        assert!(!session.is_healthy());
        assert!(!session.is_capturing());
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn test_resume_in_wrong_application_schedules_recovery() {
        let (sim, session, observer) = calibrated_session();
        session.rewrite_clock_trim(0x123).unwrap();
        session.suspend().unwrap();
        power_cycle(&session);

        assert!(matches!(
            session.resume(),
            Err(TofError::WrongApplication {
                actual: AppId::Bootloader,
                ..
            })
        ));
        assert!(observer
            .events()
            .iter()
            .any(|e| matches!(e, TofEvent::RecoveryScheduled { .. })));

        assert!(wait_until(|| session.is_capturing()));
        assert_eq!(session.app_id(), AppId::Measurement);
        assert_eq!(sim.peek(REG_OSC_TRIM), 0x23);
        assert_eq!(sim.peek(REG_OSC_TRIM + 1) & 0x01, 0x01);
        assert_eq!(sim.peek(REG_INT_EN), IRQ_STANDARD);
        assert_eq!(
            sim.applied_factory_calibration(),
            Some(session.factory_calibration())
        );
    }

    #[test]
    fn test_cancelled_recovery_does_not_run() {
        let sim = SimulatedSensor::default();
        let mut config = sim_config();
        config.timing.recovery_delay_ms = 200;
        let source = MemorySource::new().with_blob("tof8801_firmware.bin", firmware_image());
        let session = DeviceSession::new(sim.clone(), config, Arc::new(source));
        session.with_state(|st| st.read_info_record().unwrap());

        session.schedule_recovery().unwrap();
        assert!(session.recovery_pending());
        session.cancel_deferred();
        thread::sleep(Duration::from_millis(250));

        assert_eq!(sim.app_id(), AppId::Bootloader);
        assert_eq!(sim.downloads(), 0);
        assert!(!session.recovery_pending());
    }

    #[test]
    fn test_recovery_without_firmware_leaves_bootloader() {
        let sim = SimulatedSensor::default();
        sim.set_rom_app0(false);
        let session = DeviceSession::new(sim.clone(), sim_config(), Arc::new(MemorySource::new()));
        session.with_state(|st| st.read_info_record().unwrap());

        session.schedule_recovery().unwrap();
        assert!(wait_until(|| !session.recovery_pending()));
        assert_eq!(session.app_id(), AppId::Bootloader);
        assert!(!session.firmware_loaded());
    }
}
