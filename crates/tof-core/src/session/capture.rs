//! Capture start/stop and settings.

use std::thread;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, instrument, warn};

use super::{CalUpdate, CaptureState, DeviceSession, SessionState};
use crate::error::{Result, TofError};
use crate::events::TofEvent;
use crate::protocol::constants::*;
use crate::protocol::{CaptureMode, CaptureSettings};
use crate::transport::SensorTransport;

/// Whether a capture start honours the health flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HealthGate {
    Enforce,
    Bypass,
}

impl<T: SensorTransport> SessionState<T> {
    pub(crate) fn measurement_in_progress(&mut self) -> Result<bool> {
        let state = self.transport.read_u8(REG_APP0_STATE)?;
        Ok(state & APP0_STATE_BUSY != 0)
    }

    /// Write pending calibration data, then the command block with the
    /// command byte last.
    pub(crate) fn start_capture(&mut self, mode: CaptureMode, gate: HealthGate) -> Result<()> {
        self.require_app0()?;
        self.require_unclaimed()?;
        if self.capture.is_active() {
            return Err(TofError::Busy("capture already running"));
        }
        if gate == HealthGate::Enforce && !self.healthy {
            return Err(self.unhealthy());
        }

        let v2 = self.info.supports_v2();
        let mut cal_flags = 0;
        if self.cal_update.factory && !self.factory_calib.is_empty() {
            let blob = self.factory_calib;
            self.transport.write(REG_FACTORY_CALIB, blob.as_bytes())?;
            cal_flags |= CAL_FLAG_FACTORY;
        }
        if self.cal_update.alg_state {
            if let Some(state) = self.alg_state {
                self.transport.write(REG_ALG_STATE, &state)?;
                cal_flags |= CAL_FLAG_ALG_STATE;
            }
        }
        if self.cal_update.config && !self.config_calib.is_empty() {
            self.transport.write(REG_CONFIG_CALIB, &self.config_calib)?;
            cal_flags |= CAL_FLAG_CONFIG;
        }
        if v2 {
            let mut clk = [0u8; 2];
            LittleEndian::write_u16(&mut clk, self.settings.clock_iterations);
            self.transport.write(REG_CLK_ITERATIONS, &clk)?;
        }

        let (reg, block) = self.settings.command_block(mode.command(), cal_flags, v2);
        self.transport.write(reg, &block)?;
        self.shadow[reg as usize..reg as usize + block.len()].copy_from_slice(&block);

        self.cal_update = CalUpdate::default();
        self.capture = CaptureState::Capturing { mode };
        self.emit(TofEvent::CaptureStarted {
            command: mode.command(),
        });
        Ok(())
    }

    /// Stop and wait for the in-flight measurement to drain. The session
    /// stays capturing until the stop command reaches the device, so a
    /// failed stop can be retried.
    pub(crate) fn stop_capture(&mut self) -> Result<()> {
        if !self.capture.is_active() {
            return Ok(());
        }
        self.transport.write_u8(REG_COMMAND, CMD_STOP)?;
        self.capture = CaptureState::Idle;

        let mut drained = false;
        for _ in 0..self.timing.stop_poll_retries.max(1) {
            if !self.measurement_in_progress()? {
                drained = true;
                break;
            }
            thread::sleep(self.timing.stop_poll_delay());
        }

        let pending = self.transport.read_u8(REG_INT_STAT)?;
        if pending != 0 {
            self.transport.write_u8(REG_INT_STAT, pending)?;
        }
        self.emit(TofEvent::CaptureStopped);

        if drained {
            Ok(())
        } else {
            warn!("Measurement still in progress after stop");
            Err(TofError::Timeout {
                what: "capture stop",
                elapsed_ms: self.timing.stop_poll_delay_ms * u64::from(self.timing.stop_poll_retries),
            })
        }
    }

    /// Re-issue the running capture so new settings take effect.
    pub(crate) fn restart_if_capturing(&mut self) -> Result<()> {
        if let CaptureState::Capturing { mode } = self.capture {
            debug!("Restarting capture with new settings");
            self.stop_capture()?;
            self.start_capture(mode, HealthGate::Bypass)?;
        }
        Ok(())
    }

    /// Apply a settings change. When the restart fails the previous
    /// settings come back and, if the capture was stopped, it is restarted
    /// with them.
    fn update_settings(
        &mut self,
        v2_feature: Option<&'static str>,
        apply: impl FnOnce(&mut CaptureSettings) -> Result<()>,
    ) -> Result<()> {
        self.require_app0()?;
        self.require_unclaimed()?;
        if let Some(feature) = v2_feature {
            self.require_v2(feature)?;
        }
        let previous = self.settings;
        let mut settings = previous;
        apply(&mut settings)?;
        let running = self.capture;
        self.settings = settings;

        let Err(e) = self.restart_if_capturing() else {
            return Ok(());
        };
        warn!(error = %e, "Settings change failed, restoring previous settings");
        self.settings = previous;
        if let CaptureState::Capturing { mode } = running {
            if !self.capture.is_active() {
                if let Err(restart) = self.start_capture(mode, HealthGate::Bypass) {
                    warn!(error = %restart, "Failed to restart capture with previous settings");
                }
            }
        }
        Err(e)
    }
}

impl<T: SensorTransport> DeviceSession<T> {
    /// Start capturing. Fails while a capture runs or the device is
    /// marked unhealthy.
    #[instrument(skip(self))]
    pub fn start(&self, mode: CaptureMode) -> Result<()> {
        self.with_state(|st| st.start_capture(mode, HealthGate::Enforce))
    }

    /// Stop capturing. Does nothing when idle.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<()> {
        self.with_state(|st| st.stop_capture())
    }

    pub fn capture_state(&self) -> CaptureState {
        self.with_state(|st| st.capture)
    }

    pub fn is_capturing(&self) -> bool {
        self.with_state(|st| st.capture.is_active())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        self.with_state(|st| st.settings)
    }

    /// Capture period in ms, 0..=255.
    pub fn set_period(&self, period_ms: u32) -> Result<()> {
        self.with_state(|st| {
            st.update_settings(None, |s| {
                s.period_ms = CaptureSettings::parse_period(period_ms)?;
                Ok(())
            })
        })
    }

    /// Iteration count, a multiple of 1000.
    pub fn set_iterations(&self, iterations: u32) -> Result<()> {
        self.with_state(|st| {
            st.update_settings(None, |s| {
                s.iterations_k = CaptureSettings::encode_iterations(iterations)?;
                Ok(())
            })
        })
    }

    pub fn set_noise_threshold(&self, threshold: i32) -> Result<()> {
        self.with_state(|st| {
            st.update_settings(None, |s| {
                s.noise_threshold = CaptureSettings::parse_noise_threshold(threshold)?;
                Ok(())
            })
        })
    }

    /// Delay between captures, in periods.
    pub fn set_capture_delay(&self, delay: u32) -> Result<()> {
        self.with_state(|st| {
            st.update_settings(None, |s| {
                s.delay = CaptureSettings::parse_delay(delay)?;
                Ok(())
            })
        })
    }

    pub fn set_algorithm(&self, alg: u8) -> Result<()> {
        self.with_state(|st| {
            st.update_settings(Some("algorithm setting"), |s| {
                s.alg = alg;
                Ok(())
            })
        })
    }

    pub fn set_gpio(&self, gpio: u8) -> Result<()> {
        self.with_state(|st| {
            st.update_settings(Some("gpio setting"), |s| {
                s.gpio = gpio;
                Ok(())
            })
        })
    }

    pub fn set_clock_iterations(&self, iterations: u16) -> Result<()> {
        self.with_state(|st| {
            st.update_settings(Some("clock iterations"), |s| {
                s.clock_iterations = iterations;
                Ok(())
            })
        })
    }
}
