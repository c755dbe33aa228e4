//! Factory calibration, calibration data and oscillator trim.

use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use super::capture::HealthGate;
use super::{DeviceSession, SessionState};
use crate::error::{Result, TofError};
use crate::events::TofEvent;
use crate::protocol::CaptureMode;
use crate::protocol::constants::*;
use crate::transport::SensorTransport;

/// Outcome of a factory calibration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationResult {
    /// Calibration blob, empty when the baseline was implausible.
    pub data: Vec<u8>,
    pub crosstalk: u32,
}

impl<T: SensorTransport> SessionState<T> {
    /// Pick up a calibration record from the result area.
    pub(crate) fn read_factory_calibration(&mut self) -> Result<()> {
        let mut blob = [0u8; FACTORY_CALIB_SIZE];
        self.transport.read(REG_FACTORY_CALIB, &mut blob)?;
        self.factory_calib.store(&blob);
        self.cal_update.factory = true;
        self.evaluate_health();
        Ok(())
    }

    /// Re-checked after every lock-released wait of a calibration run.
    fn check_calibration_owner(&self) -> Result<()> {
        if self.closed {
            return Err(TofError::Closed);
        }
        self.require_app0()
    }

    pub(crate) fn read_clock_trim(&mut self) -> Result<u16> {
        let mut trim = [0u8; 2];
        self.transport.read(REG_OSC_TRIM, &mut trim)?;
        Ok((u16::from(trim[1] & 0x01) << 8) | u16::from(trim[0]))
    }

    /// Nine-bit read-modify-write; the other bits of the second register
    /// are preserved.
    pub(crate) fn write_clock_trim(&mut self, value: u16) -> Result<()> {
        let mut trim = [0u8; 2];
        self.transport.read(REG_OSC_TRIM, &mut trim)?;
        trim[0] = (value & 0xFF) as u8;
        trim[1] = (trim[1] & !0x01) | ((value >> 8) as u8 & 0x01);
        self.transport.write(REG_OSC_TRIM, &trim)?;
        Ok(())
    }
}

impl<T: SensorTransport> DeviceSession<T> {
    /// Run the device's factory calibration.
    ///
    /// Any capture is stopped, a short warm-up capture runs with forced
    /// parameters, then the calibration command is issued and its progress
    /// polled until done or the configured budget runs out. The lock is
    /// released during every wait; meanwhile starts, settings changes and
    /// application switches from other handles fail with `Busy`.
    #[instrument(skip(self))]
    pub fn run_factory_calibration(&self) -> Result<CalibrationResult> {
        let shared = &self.shared;
        let timing = &shared.config.timing;
        let mut st = shared.lock();

        st.require_app0()?;
        st.require_unclaimed()?;
        st.stop_capture()?;
        let v2 = st.info.supports_v2();
        st.settings.apply_calibration_grade(v2);
        st.start_capture(CaptureMode::MEASURE, HealthGate::Bypass)?;

        // Bound before the re-bound guard so the claim is released after it.
        let _claim = shared.claim(&mut st, "factory calibration");
        let mut st = shared.pause(st, timing.calibration_warmup());
        st.check_calibration_owner()?;
        st.stop_capture()?;

        st.transport.write_u8(REG_COMMAND, CMD_FACTORY_CALIBRATION)?;
        let started = Instant::now();
        let budget = timing.calibration_budget();
        loop {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(budget_ms = timing.calibration_budget_ms, "Factory calibration did not finish");
                return Err(TofError::Timeout {
                    what: "factory calibration",
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            st = shared.pause(st, timing.calibration_poll().min(remaining));
            st.check_calibration_owner()?;
            if !st.measurement_in_progress()? {
                break;
            }
        }
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Calibration reported done");

        st = shared.pause(st, timing.calibration_settle());
        st.check_calibration_owner()?;

        if st.transport.read_u8(REG_REGISTER_CONTENTS)? != CONTENT_CALIBRATION {
            return Err(TofError::Timeout {
                what: "factory calibration data",
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
        st.read_factory_calibration()?;

        let crosstalk = st.factory_calib.crosstalk();
        let data = if crosstalk > CROSSTALK_IMPLAUSIBLE {
            warn!(crosstalk = crosstalk, "Implausible crosstalk baseline");
            Vec::new()
        } else {
            st.factory_calib.as_bytes().to_vec()
        };
        st.emit(TofEvent::CalibrationComplete {
            size: data.len(),
            crosstalk,
        });
        info!(crosstalk = crosstalk, size = data.len(), "Factory calibration finished");
        Ok(CalibrationResult { data, crosstalk })
    }

    /// Stored factory calibration blob.
    pub fn factory_calibration(&self) -> Vec<u8> {
        self.with_state(|st| st.factory_calib.as_bytes().to_vec())
    }

    /// Crosstalk baseline of the stored factory calibration.
    pub fn crosstalk(&self) -> u32 {
        self.with_state(|st| st.factory_calib.crosstalk())
    }

    /// Install a factory calibration blob obtained earlier and re-evaluate
    /// device health from it.
    pub fn load_factory_calibration(&self, blob: &[u8]) -> Result<()> {
        if blob.len() != FACTORY_CALIB_SIZE {
            return Err(TofError::invalid(format!(
                "factory calibration must be {FACTORY_CALIB_SIZE} bytes, got {}",
                blob.len()
            )));
        }
        self.with_state(|st| {
            st.factory_calib.store(blob);
            st.cal_update.factory = true;
            st.evaluate_health();
            Ok(())
        })
    }

    /// Hand the stored factory calibration to the device on the next start.
    pub fn apply_factory_calibration(&self) -> Result<()> {
        self.with_state(|st| {
            st.require_app0()?;
            if st.factory_calib.is_empty() {
                return Err(TofError::invalid("no factory calibration stored"));
            }
            st.cal_update.factory = true;
            Ok(())
        })
    }

    /// Algorithm state to restore on the next start.
    pub fn apply_algorithm_state(&self, state: &[u8]) -> Result<()> {
        let state: [u8; ALG_STATE_SIZE] = state.try_into().map_err(|_| {
            TofError::invalid(format!(
                "algorithm state must be {ALG_STATE_SIZE} bytes, got {}",
                state.len()
            ))
        })?;
        self.with_state(|st| {
            st.require_app0()?;
            st.alg_state = Some(state);
            st.cal_update.alg_state = true;
            Ok(())
        })
    }

    /// Fetch the configuration calibration blob and queue it for the next
    /// start. Returns its size; a missing blob yields 0.
    pub fn apply_config_calibration(&self) -> Result<usize> {
        self.with_state(|st| st.require_app0())?;
        let name = &self.shared.config.config_calib_name;
        let Some(blob) = self.shared.firmware.fetch(name) else {
            warn!(name = %name, "Configuration calibration not available");
            return Ok(0);
        };
        if blob.len() > CONFIG_CALIB_MAX {
            return Err(TofError::invalid(format!(
                "configuration calibration too large: {} bytes",
                blob.len()
            )));
        }
        self.with_state(|st| {
            st.require_app0()?;
            st.config_calib = blob;
            st.cal_update.config = true;
            Ok(st.config_calib.len())
        })
    }

    pub fn config_calibration(&self) -> Vec<u8> {
        self.with_state(|st| st.config_calib.clone())
    }

    /// Rewrite the oscillator trim. The value is remembered even when the
    /// device cannot take it now, and re-applied by recovery.
    #[instrument(skip(self))]
    pub fn rewrite_clock_trim(&self, value: i32) -> Result<()> {
        if !(0..=CLOCK_TRIM_MAX).contains(&value) {
            return Err(TofError::invalid(format!(
                "clock trim {value} outside 0..={CLOCK_TRIM_MAX}"
            )));
        }
        let value = value as u16;
        self.with_state(|st| {
            st.saved_clock_trim = Some(value);
            st.require_app0()?;
            st.require_v2("clock trim")?;
            st.write_clock_trim(value)
        })
    }

    /// Current oscillator trim as read from the device.
    pub fn clock_trim(&self) -> Result<u16> {
        self.with_state(|st| {
            st.require_app0()?;
            st.require_v2("clock trim")?;
            st.read_clock_trim()
        })
    }

    /// Last trim value requested through [`Self::rewrite_clock_trim`].
    pub fn saved_clock_trim(&self) -> Option<u16> {
        self.with_state(|st| st.saved_clock_trim)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::tests::{app0_session, sim_config};
    use super::*;
    use crate::firmware::MemorySource;
    use crate::protocol::AppId;
    use crate::transport::SimulatedSensor;

    #[test]
    fn test_calibration_completes_within_polls() {
        let (sim, session) = app0_session();
        let timing = session.config().timing.clone();
        let start = Instant::now();

        let result = session.run_factory_calibration().unwrap();
        let elapsed = start.elapsed();

        assert_eq!(result.crosstalk, 1000);
        assert_eq!(result.data.len(), FACTORY_CALIB_SIZE);
        assert!(session.is_healthy());
        assert!(!sim.measuring());

        let bound = timing.calibration_warmup()
            + timing.calibration_poll() * 2
            + timing.calibration_settle()
            + Duration::from_millis(100);
        assert!(elapsed <= bound, "took {elapsed:?}, bound {bound:?}");

        // forced parameters were used for the warm-up capture
        assert_eq!(sim.peek(REG_CMD_ALG), CALIB_ALG);
        assert_eq!(sim.peek(REG_CMD_PERIOD), CALIB_PERIOD_MS);
        assert_eq!(
            sim.commands(),
            vec![CMD_MEASURE, CMD_STOP, CMD_FACTORY_CALIBRATION]
        );
    }

    #[test]
    fn test_shutdown_aborts_calibration() {
        let (sim, session) = app0_session();
        sim.set_calibration_reads(None);
        let calibrating = session.clone();
        let worker = std::thread::spawn(move || calibrating.run_factory_calibration());

        let deadline = Instant::now() + Duration::from_secs(1);
        while !sim.commands().contains(&CMD_FACTORY_CALIBRATION) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        session.shutdown().unwrap();

        assert!(matches!(worker.join().unwrap(), Err(TofError::Closed)));
        assert!(session.with_state(|st| st.claim.is_none()));
    }

    #[test]
    fn test_calibration_times_out_within_budget() {
        let (sim, session) = app0_session();
        sim.set_calibration_reads(None);
        let budget = session.config().timing.calibration_budget();
        let warmup = session.config().timing.calibration_warmup();
        let start = Instant::now();

        let err = session.run_factory_calibration().unwrap_err();
        assert!(matches!(err, TofError::Timeout { what: "factory calibration", .. }));
        assert!(start.elapsed() <= warmup + budget + Duration::from_millis(100));
    }

    #[test]
    fn test_implausible_crosstalk_marks_unhealthy() {
        let (sim, session) = app0_session();
        sim.set_calibration_blob([0xF0, 0xFF, 0x0F, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        let result = session.run_factory_calibration().unwrap();
        assert!(result.data.is_empty());
        assert!(result.crosstalk > CROSSTALK_IMPLAUSIBLE);
        assert!(!session.is_healthy());
        assert!(matches!(
            session.start(CaptureMode::MEASURE),
            Err(TofError::Unhealthy { .. })
        ));
    }

    #[test]
    fn test_zero_crosstalk_marks_unhealthy() {
        let (sim, session) = app0_session();
        sim.set_calibration_blob([0; FACTORY_CALIB_SIZE]);
        let result = session.run_factory_calibration().unwrap();
        assert_eq!(result.crosstalk, 0);
        assert!(matches!(
            session.start(CaptureMode::MEASURE),
            Err(TofError::Unhealthy { crosstalk: 0 })
        ));
    }

    #[test]
    fn test_calibration_lock_released_while_waiting() {
        let (sim, session) = app0_session();
        sim.set_calibration_reads(Some(5));
        let reader = session.clone();
        let worker = std::thread::spawn(move || session.run_factory_calibration());

        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        let _ = reader.app_id();
        assert!(start.elapsed() < Duration::from_millis(20));

        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_loaded_calibration_applied_on_start() {
        let (sim, session) = app0_session();
        let blob = [0x80, 0x3E, 0, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9];
        session.load_factory_calibration(&blob).unwrap();
        assert_eq!(session.crosstalk(), 1000);
        assert!(session.load_factory_calibration(&blob[..4]).is_err());

        session.start(CaptureMode::MEASURE).unwrap();
        assert_eq!(sim.applied_factory_calibration(), Some(blob.to_vec()));
        assert_eq!(sim.peek(REG_CMD_CAL_FLAGS) & CAL_FLAG_FACTORY, CAL_FLAG_FACTORY);
    }

    #[test]
    fn test_config_calibration_from_source() {
        let sim = SimulatedSensor::running_app0(Default::default());
        let source = MemorySource::new().with_blob("tof8801_config_calib.bin", vec![7u8; 12]);
        let session = DeviceSession::new(sim.clone(), sim_config(), Arc::new(source));
        session.with_state(|st| st.read_info_record().unwrap());

        assert_eq!(session.apply_config_calibration().unwrap(), 12);
        session.start(CaptureMode::MEASURE).unwrap();
        assert_eq!(sim.peek(REG_CMD_CAL_FLAGS) & CAL_FLAG_CONFIG, CAL_FLAG_CONFIG);
        assert_eq!(sim.peek(REG_CONFIG_CALIB), 7);
    }

    #[test]
    fn test_algorithm_state_length_checked() {
        let (_sim, session) = app0_session();
        assert!(session.apply_algorithm_state(&[0; 5]).is_err());
        session.apply_algorithm_state(&[1; ALG_STATE_SIZE]).unwrap();
    }

    #[test]
    fn test_clock_trim() {
        let (sim, session) = app0_session();
        assert!(matches!(session.rewrite_clock_trim(512), Err(TofError::InvalidRequest(_))));
        assert!(matches!(session.rewrite_clock_trim(-1), Err(TofError::InvalidRequest(_))));
        assert_eq!(session.saved_clock_trim(), None);

        session.rewrite_clock_trim(0x1A5).unwrap();
        assert_eq!(sim.peek(REG_OSC_TRIM), 0xA5);
        assert_eq!(sim.peek(REG_OSC_TRIM + 1) & 0x01, 0x01);
        assert_eq!(session.clock_trim().unwrap(), 0x1A5);
    }

    #[test]
    fn test_clock_trim_cached_outside_app0() {
        let sim = SimulatedSensor::default();
        let session = DeviceSession::new(sim, sim_config(), Arc::new(MemorySource::new()));
        session.with_state(|st| st.read_info_record().unwrap());

        assert!(matches!(
            session.rewrite_clock_trim(42),
            Err(TofError::WrongApplication {
                actual: AppId::Bootloader,
                ..
            })
        ));
        assert_eq!(session.saved_clock_trim(), Some(42));
    }
}
