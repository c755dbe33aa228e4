//! Application identity, CPU readiness and application switching.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::{CaptureState, DeviceSession, Guard, SessionState};
use crate::error::{Result, TofError};
use crate::events::TofEvent;
use crate::protocol::constants::*;
use crate::protocol::{AppId, CpuStatus, InfoRecord};
use crate::transport::{BusError, SensorTransport};

impl<T: SensorTransport> SessionState<T> {
    /// Refresh the cached info record from the device.
    pub(crate) fn read_info_record(&mut self) -> Result<InfoRecord> {
        let mut buf = [0u8; InfoRecord::SIZE];
        self.transport.read(REG_APP_ID, &mut buf)?;
        let info = InfoRecord::from_bytes(&buf).ok_or(BusError::ShortTransfer {
            reg: REG_APP_ID,
            expected: InfoRecord::SIZE,
            actual: buf.len(),
        })?;
        self.shadow[..InfoRecord::SIZE].copy_from_slice(&buf);

        let previous = self.info.app_id;
        self.info = info;
        if previous != info.app_id {
            // a fresh application knows nothing of our capture
            self.capture = CaptureState::Idle;
            self.emit(TofEvent::AppChanged {
                from: previous,
                to: info.app_id,
            });
        }
        Ok(info)
    }

    fn wake_cpu(&mut self) -> Result<(), BusError> {
        debug!("CPU in standby, waking");
        self.transport.write_u8(REG_STAT, STAT_WAKEUP)
    }

    /// Poll the CPU status until ready, waking it from standby as needed.
    pub(crate) fn wait_for_cpu_ready(&mut self) -> Result<()> {
        let retries = self.timing.cpu_ready_retries.max(1);
        let settle = self.timing.i2c_settle();
        let start = Instant::now();
        let mut bus_err = None;

        thread::sleep(settle);
        for attempt in 1..=retries {
            let status = match self.transport.read_u8(REG_STAT) {
                Ok(status) => {
                    bus_err = None;
                    status
                }
                Err(e) => {
                    bus_err = Some(e);
                    thread::sleep(settle);
                    continue;
                }
            };
            match CpuStatus::from_reg(status) {
                CpuStatus::Ready => return Ok(()),
                CpuStatus::Standby => {
                    if let Err(e) = self.wake_cpu() {
                        bus_err = Some(e);
                    }
                    thread::sleep(settle);
                }
                CpuStatus::Busy if attempt == retries => break,
                CpuStatus::Busy => thread::sleep(self.timing.cpu_ready_delay()),
            }
        }

        Err(match bus_err {
            Some(e) => e.into(),
            None => TofError::Timeout {
                what: "CPU ready",
                elapsed_ms: start.elapsed().as_millis() as u64,
            },
        })
    }

    /// Repeat [`Self::wait_for_cpu_ready`] until it succeeds or `limit` runs out.
    pub(crate) fn wait_for_cpu_ready_timeout(&mut self, limit: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            match self.wait_for_cpu_ready() {
                Ok(()) => return Ok(()),
                Err(e) if start.elapsed() >= limit => {
                    error!(error = %e, limit_ms = limit.as_millis() as u64, "CPU not ready");
                    return Err(TofError::Timeout {
                        what: "CPU ready",
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(_) => {}
            }
        }
    }

    /// Wait for the CPU after power-up. A CPU stuck busy gets its chip
    /// enable toggled, a bounded number of times.
    pub(crate) fn wait_for_cpu_startup(&mut self) -> Result<()> {
        let retries = self.timing.cpu_ready_retries.max(1);
        let settle = self.timing.i2c_settle();
        let start = Instant::now();
        let mut attempt = 0;
        let mut ce_attempt = 0;
        let mut bus_err = None;

        while attempt < retries {
            attempt += 1;
            thread::sleep(settle);
            let status = match self.transport.read_u8(REG_STAT) {
                Ok(status) => {
                    bus_err = None;
                    status
                }
                Err(e) => {
                    bus_err = Some(e);
                    continue;
                }
            };
            match CpuStatus::from_reg(status) {
                CpuStatus::Ready => {
                    debug!(attempts = attempt, ce_toggles = ce_attempt, "CPU started");
                    return Ok(());
                }
                CpuStatus::Standby => {
                    if let Err(e) = self.wake_cpu() {
                        bus_err = Some(e);
                    }
                }
                CpuStatus::Busy
                    if attempt >= retries
                        && ce_attempt < self.timing.startup_ce_retries
                        && self.transport.has_chip_enable() =>
                {
                    warn!(ce_attempt = ce_attempt + 1, "CPU stuck busy, toggling chip enable");
                    self.toggle_chip_enable()?;
                    attempt = 0;
                    ce_attempt += 1;
                }
                CpuStatus::Busy => thread::sleep(self.timing.cpu_ready_delay()),
            }
        }

        Err(match bus_err {
            Some(e) => e.into(),
            None => TofError::Timeout {
                what: "CPU startup",
                elapsed_ms: start.elapsed().as_millis() as u64,
            },
        })
    }

    pub(crate) fn toggle_chip_enable(&mut self) -> Result<()> {
        if !self.transport.has_chip_enable() {
            return Err(TofError::NoChipEnable);
        }
        self.transport.set_chip_enable(false)?;
        thread::sleep(self.timing.i2c_settle());
        self.transport.set_chip_enable(true)?;
        self.capture = CaptureState::Idle;
        Ok(())
    }

    /// OR `bits` into the interrupt enable register.
    pub(crate) fn enable_interrupts(&mut self, bits: u8) -> Result<()> {
        let current = self.transport.read_u8(REG_INT_EN)?;
        let value = (current & INT_MASK) | (bits & INT_MASK);
        self.transport.write_u8(REG_INT_EN, value)?;
        self.shadow[REG_INT_EN as usize] = value;
        Ok(())
    }

    /// Ask the running application to start `target` and refresh the
    /// info record once the CPU answers again.
    pub(crate) fn request_app(&mut self, target: AppId) -> Result<()> {
        self.transport.write_u8(REG_REQ_APP_ID, target.raw())?;
        self.wait_for_cpu_ready_timeout(self.timing.app_switch_timeout())?;
        self.read_info_record()?;
        Ok(())
    }

    pub(crate) fn switch_to_bootloader(&mut self) -> Result<()> {
        if self.capture.is_active() {
            if let Err(e) = self.stop_capture() {
                warn!(error = %e, "Failed to stop capture before leaving app0");
            }
        }
        self.request_app(AppId::Bootloader)?;
        match self.info.app_id {
            AppId::Bootloader => Ok(()),
            actual => Err(TofError::WrongApplication {
                expected: AppId::Bootloader,
                actual,
            }),
        }
    }

    /// Power-cycle into the bootloader.
    pub(crate) fn reset_to_bootloader(&mut self) -> Result<()> {
        self.toggle_chip_enable()?;
        self.wait_for_cpu_startup()?;
        self.read_info_record()?;
        Ok(())
    }
}

impl<T: SensorTransport> DeviceSession<T> {
    /// Switch the running application. Switching to the application
    /// already running touches nothing.
    #[instrument(skip(self))]
    pub fn switch_app(&self, target: AppId) -> Result<()> {
        let st = self.shared.lock();
        let (_st, res) = self.switch_app_locked(st, target);
        res
    }

    pub(crate) fn switch_app_locked<'a>(
        &'a self,
        mut st: Guard<'a, T>,
        target: AppId,
    ) -> (Guard<'a, T>, Result<()>) {
        let current = st.info.app_id;
        if target == current {
            return (st, Ok(()));
        }
        if !matches!(target, AppId::Bootloader | AppId::Measurement) {
            return (
                st,
                Err(TofError::invalid(format!("cannot switch to {target}"))),
            );
        }
        if let Err(e) = st.require_unclaimed() {
            return (st, Err(e));
        }

        match current {
            AppId::Bootloader => {
                let (guard, res) = self.switch_from_bootloader(st, target);
                st = guard;
                if let Err(e) = res {
                    error!(target = %target, error = %e, "Application switch failed, resetting");
                    return match st.reset_to_bootloader() {
                        Ok(()) => (st, Err(e)),
                        Err(TofError::NoChipEnable) => {
                            warn!("No chip-enable line, device left as the failed switch found it");
                            (st, Err(e))
                        }
                        Err(reset_err) => {
                            error!(switch_error = %e, error = %reset_err, "Reset after failed switch failed");
                            (st, Err(reset_err))
                        }
                    };
                }
                (st, Ok(()))
            }
            AppId::Measurement => {
                let res = st.switch_to_bootloader();
                (st, res)
            }
            actual => (
                st,
                Err(TofError::WrongApplication {
                    expected: target,
                    actual,
                }),
            ),
        }
    }

    /// Leave the bootloader: download firmware, falling back to a plain
    /// application request when no candidate works.
    fn switch_from_bootloader<'a>(
        &'a self,
        st: Guard<'a, T>,
        target: AppId,
    ) -> (Guard<'a, T>, Result<()>) {
        let (mut st, provisioned) = self.provision_locked(st);
        if let Err(e) = provisioned {
            debug!(error = %e, "Firmware download unavailable, requesting application");
            if let Err(e) = st.request_app(target) {
                return (st, Err(e));
            }
        }

        let running = st.info.app_id;
        match running {
            AppId::Measurement => {
                if let Err(e) = st.enable_interrupts(IRQ_STANDARD) {
                    return (st, Err(e));
                }
            }
            AppId::Unknown(id) => {
                return (
                    st,
                    Err(TofError::invalid(format!("unrecognized application {id:#04x}"))),
                );
            }
            AppId::Bootloader | AppId::Reserved => {}
        }

        if running == target {
            info!(app = %running, "Application switched");
            (st, Ok(()))
        } else {
            (
                st,
                Err(TofError::WrongApplication {
                    expected: target,
                    actual: running,
                }),
            )
        }
    }

    /// Power-cycle the chip and restore App0 if it was running.
    #[instrument(skip(self))]
    pub fn hard_reset(&self) -> Result<()> {
        let st = self.shared.lock();
        let (_st, res) = self.hard_reset_locked(st);
        res
    }

    pub(crate) fn hard_reset_locked<'a>(&'a self, mut st: Guard<'a, T>) -> (Guard<'a, T>, Result<()>) {
        if !st.transport.has_chip_enable() {
            return (st, Err(TofError::NoChipEnable));
        }
        if let Err(e) = st.require_unclaimed() {
            return (st, Err(e));
        }
        let was_app0 = st.info.app_id == AppId::Measurement;
        if was_app0 && st.transport.chip_enable() == Some(true) {
            if let Err(e) = st.stop_capture() {
                warn!(error = %e, "Failed to stop capture before reset");
            }
        }
        if let Err(e) = st.reset_to_bootloader() {
            return (st, Err(e));
        }
        if was_app0 {
            return self.switch_app_locked(st, AppId::Measurement);
        }
        (st, Ok(()))
    }

    /// Drive the chip-enable line. Enabling waits for the CPU and refreshes
    /// the running application.
    #[instrument(skip(self))]
    pub fn set_chip_enabled(&self, enabled: bool) -> Result<()> {
        self.with_state(|st| {
            if !st.transport.has_chip_enable() {
                return Err(TofError::NoChipEnable);
            }
            if st.transport.chip_enable() == Some(enabled) {
                return Ok(());
            }
            st.require_unclaimed()?;
            if enabled {
                st.transport.set_chip_enable(true)?;
                st.wait_for_cpu_startup()?;
                st.read_info_record()?;
            } else {
                if st.capture.is_active() {
                    if let Err(e) = st.stop_capture() {
                        warn!(error = %e, "Failed to stop capture before power-down");
                    }
                }
                st.transport.set_chip_enable(false)?;
                st.capture = CaptureState::Idle;
            }
            Ok(())
        })
    }

    /// Chip-enable level, `None` when no line is wired.
    pub fn chip_enabled(&self) -> Option<bool> {
        self.with_state(|st| st.transport.chip_enable())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::tests::{app0_session, firmware_image, sim_config};
    use super::*;
    use crate::firmware::{FirmwareError, MemorySource};
    use crate::transport::{SimConfig, SimulatedSensor};

    fn bootloader_session(
        source: MemorySource,
    ) -> (SimulatedSensor, DeviceSession<SimulatedSensor>) {
        let sim = SimulatedSensor::default();
        let session = DeviceSession::new(sim.clone(), sim_config(), Arc::new(source));
        session.with_state(|st| st.read_info_record().unwrap());
        (sim, session)
    }

    #[test]
    fn test_switch_to_current_app_is_noop() {
        let (sim, session) = app0_session();
        sim.clear_log();
        session.switch_app(AppId::Measurement).unwrap();
        assert_eq!(sim.bus_ops(), 0);

        let (sim, session) = bootloader_session(MemorySource::new());
        sim.clear_log();
        session.switch_app(AppId::Bootloader).unwrap();
        assert_eq!(sim.bus_ops(), 0);
    }

    #[test]
    fn test_switch_rejects_reserved_target() {
        let (_sim, session) = app0_session();
        assert!(matches!(
            session.switch_app(AppId::Reserved),
            Err(TofError::InvalidRequest(_))
        ));
        assert!(matches!(
            session.switch_app(AppId::Unknown(0x33)),
            Err(TofError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_switch_from_bootloader_downloads_firmware() {
        let source = MemorySource::new().with_blob("tof8801_firmware.bin", firmware_image());
        let (sim, session) = bootloader_session(source);
        session.switch_app(AppId::Measurement).unwrap();
        assert_eq!(session.app_id(), AppId::Measurement);
        assert_eq!(sim.downloads(), 1);
        assert_eq!(sim.peek(REG_INT_EN), IRQ_STANDARD);
    }

    #[test]
    fn test_switch_falls_back_to_rom_application() {
        let (sim, session) = bootloader_session(MemorySource::new());
        session.switch_app(AppId::Measurement).unwrap();
        assert_eq!(session.app_id(), AppId::Measurement);
        assert_eq!(sim.downloads(), 0);
    }

    #[test]
    fn test_failed_switch_resets_to_bootloader() {
        let (sim, session) = bootloader_session(MemorySource::new());
        sim.set_rom_app0(false);
        let err = session.switch_app(AppId::Measurement).unwrap_err();
        assert!(matches!(
            err,
            TofError::WrongApplication {
                expected: AppId::Measurement,
                actual: AppId::Bootloader
            }
        ));
        assert_eq!(session.app_id(), AppId::Bootloader);
    }

    #[test]
    fn test_failed_switch_without_enable_line_keeps_cause() {
        let sim = SimulatedSensor::new(SimConfig {
            has_chip_enable: false,
            rom_app0: false,
            ..SimConfig::default()
        });
        let session = DeviceSession::new(sim, sim_config(), Arc::new(MemorySource::new()));
        session.with_state(|st| st.read_info_record().unwrap());

        let err = session.switch_app(AppId::Measurement).unwrap_err();
        assert!(matches!(
            err,
            TofError::WrongApplication {
                expected: AppId::Measurement,
                actual: AppId::Bootloader
            }
        ));
    }

    #[test]
    fn test_switch_app0_to_bootloader() {
        let (sim, session) = app0_session();
        session.switch_app(AppId::Bootloader).unwrap();
        assert_eq!(sim.app_id(), AppId::Bootloader);
        assert_eq!(session.app_id(), AppId::Bootloader);
    }

    #[test]
    fn test_hard_reset_restores_app0() {
        let source = MemorySource::new().with_blob("tof8801_firmware.bin", firmware_image());
        let sim = SimulatedSensor::running_app0(SimConfig::default());
        let session = DeviceSession::new(sim.clone(), sim_config(), Arc::new(source));
        session.with_state(|st| st.read_info_record().unwrap());

        session.hard_reset().unwrap();
        assert_eq!(session.app_id(), AppId::Measurement);
        assert_eq!(sim.downloads(), 1);
    }

    #[test]
    fn test_hard_reset_without_enable_line() {
        let sim = SimulatedSensor::running_app0(SimConfig {
            has_chip_enable: false,
            ..SimConfig::default()
        });
        let session = DeviceSession::new(sim, sim_config(), Arc::new(MemorySource::new()));
        assert!(matches!(session.hard_reset(), Err(TofError::NoChipEnable)));
        assert!(matches!(
            session.set_chip_enabled(false),
            Err(TofError::NoChipEnable)
        ));
        assert_eq!(session.chip_enabled(), None);
    }

    #[test]
    fn test_cpu_wakes_from_standby() {
        let (sim, session) = app0_session();
        sim.set_standby();
        session.with_state(|st| st.wait_for_cpu_ready()).unwrap();
        assert!(sim.writes().contains(&(REG_STAT, vec![STAT_WAKEUP])));
    }

    #[test]
    fn test_cpu_startup_times_out_when_stuck() {
        let sim = SimulatedSensor::new(SimConfig {
            startup_busy_reads: 10_000,
            ..SimConfig::default()
        });
        let session = DeviceSession::new(sim, sim_config(), Arc::new(MemorySource::new()));
        let err = session.with_state(|st| st.wait_for_cpu_startup()).unwrap_err();
        assert!(matches!(err, TofError::Timeout { what: "CPU startup", .. }));
    }

    #[test]
    fn test_no_candidate_error_surfaces_from_request() {
        let (_sim, session) = bootloader_session(MemorySource::new());
        assert!(matches!(
            session.request_firmware(),
            Err(TofError::Firmware(FirmwareError::NoUsableCandidate { tried: 3 }))
        ));
    }

    #[test]
    fn test_chip_enable_cycle() {
        let (sim, session) = app0_session();
        session.set_chip_enabled(false).unwrap();
        assert_eq!(session.chip_enabled(), Some(false));
        session.set_chip_enabled(true).unwrap();
        assert_eq!(sim.app_id(), AppId::Bootloader);
        assert_eq!(session.app_id(), AppId::Bootloader);
    }
}
