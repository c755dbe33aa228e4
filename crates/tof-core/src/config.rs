//! Session configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::BL_DEFAULT_SALT;

/// How device interrupts reach the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IoMode {
    #[default]
    /// The board delivers the interrupt line; the host calls
    /// `DeviceSession::handle_interrupt` from its handler.
    Interrupt,
    /// A background poller services the device while capturing.
    /// `period_us` is in multiples of 100 µs.
    Polled { period_us: u64 },
}

/// Delays, retry counts and timeouts. All durations in milliseconds unless
/// the field name says otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Settle delay before each CPU status poll.
    pub i2c_settle_ms: u64,
    /// Delay between busy CPU status polls.
    pub cpu_ready_delay_ms: u64,
    pub cpu_ready_retries: u32,
    /// Overall bound for the CPU to come back after an application request.
    pub app_switch_timeout_ms: u64,
    /// Chip-enable toggles attempted while the CPU stays busy at startup.
    pub startup_ce_retries: u32,
    /// Time allowed for one firmware candidate.
    pub firmware_timeout_ms: u64,
    pub bootloader_poll_retries: u32,
    pub bootloader_poll_delay_us: u64,
    /// Polls of the measure-in-progress bit after a stop command.
    pub stop_poll_retries: u32,
    pub stop_poll_delay_ms: u64,
    /// Deferred provisioning after bring-up.
    pub boot_delay_ms: u64,
    /// Deferred recovery after a resume finds the wrong application.
    pub recovery_delay_ms: u64,
    /// Capture warm-up before a factory calibration.
    pub calibration_warmup_ms: u64,
    pub calibration_poll_ms: u64,
    /// Delay after the device reports calibration done.
    pub calibration_settle_ms: u64,
    /// Upper bound on polling for calibration completion.
    pub calibration_budget_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            i2c_settle_ms: 5,
            cpu_ready_delay_ms: 1,
            cpu_ready_retries: 10,
            app_switch_timeout_ms: 100,
            startup_ce_retries: 3,
            firmware_timeout_ms: 5000,
            bootloader_poll_retries: 100,
            bootloader_poll_delay_us: 100,
            stop_poll_retries: 10,
            stop_poll_delay_ms: 5,
            boot_delay_ms: 8000,
            recovery_delay_ms: 500,
            calibration_warmup_ms: 100,
            calibration_poll_ms: 100,
            calibration_settle_ms: 500,
            calibration_budget_ms: 4000,
        }
    }
}

impl TimingConfig {
    /// Short delays for simulated devices.
    pub fn for_simulation() -> Self {
        Self {
            i2c_settle_ms: 0,
            cpu_ready_delay_ms: 0,
            app_switch_timeout_ms: 20,
            firmware_timeout_ms: 1000,
            bootloader_poll_delay_us: 0,
            stop_poll_delay_ms: 0,
            boot_delay_ms: 0,
            recovery_delay_ms: 10,
            calibration_warmup_ms: 10,
            calibration_poll_ms: 10,
            calibration_settle_ms: 10,
            calibration_budget_ms: 200,
            ..Self::default()
        }
    }

    pub fn i2c_settle(&self) -> Duration {
        Duration::from_millis(self.i2c_settle_ms)
    }

    pub fn cpu_ready_delay(&self) -> Duration {
        Duration::from_millis(self.cpu_ready_delay_ms)
    }

    pub fn app_switch_timeout(&self) -> Duration {
        Duration::from_millis(self.app_switch_timeout_ms)
    }

    pub fn firmware_timeout(&self) -> Duration {
        Duration::from_millis(self.firmware_timeout_ms)
    }

    pub fn bootloader_poll_delay(&self) -> Duration {
        Duration::from_micros(self.bootloader_poll_delay_us)
    }

    pub fn stop_poll_delay(&self) -> Duration {
        Duration::from_millis(self.stop_poll_delay_ms)
    }

    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn calibration_warmup(&self) -> Duration {
        Duration::from_millis(self.calibration_warmup_ms)
    }

    pub fn calibration_poll(&self) -> Duration {
        Duration::from_millis(self.calibration_poll_ms)
    }

    pub fn calibration_settle(&self) -> Duration {
        Duration::from_millis(self.calibration_settle_ms)
    }

    pub fn calibration_budget(&self) -> Duration {
        Duration::from_millis(self.calibration_budget_ms)
    }
}

/// Configuration for a device session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Firmware images tried in order until App0 comes up.
    pub firmware_candidates: Vec<String>,
    /// Configuration calibration blob name.
    pub config_calib_name: String,
    /// Frame queue capacity, in frames.
    pub queue_capacity: usize,
    /// Salt for the bootloader download handshake.
    pub upload_salt: u8,
    /// Arm deferred provisioning on bring-up.
    pub provision_on_boot: bool,
    pub io_mode: IoMode,
    pub timing: TimingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            firmware_candidates: vec![
                "tof8801_firmware.bin".to_string(),
                "tof8801_firmware-1.bin".to_string(),
                "tof8801_firmware-2.bin".to_string(),
            ],
            config_calib_name: "tof8801_config_calib.bin".to_string(),
            queue_capacity: 64,
            upload_salt: BL_DEFAULT_SALT,
            provision_on_boot: true,
            io_mode: IoMode::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Poll period for [`IoMode::Polled`], rounded down to 100 µs steps.
    pub fn poll_period(&self) -> Option<Duration> {
        match self.io_mode {
            IoMode::Interrupt => None,
            IoMode::Polled { period_us } => {
                let steps = (period_us / 100).max(1);
                Some(Duration::from_micros(steps * 100))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_candidates() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.firmware_candidates.len(), 3);
        assert_eq!(cfg.firmware_candidates[0], "tof8801_firmware.bin");
        assert_eq!(cfg.upload_salt, BL_DEFAULT_SALT);
        assert_eq!(cfg.poll_period(), None);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut cfg = SessionConfig::default();
        cfg.io_mode = IoMode::Polled { period_us: 1000 };
        cfg.queue_capacity = 8;

        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.io_mode, IoMode::Polled { period_us: 1000 });
        assert_eq!(back.queue_capacity, 8);
        assert_eq!(back.timing.boot_delay_ms, 8000);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let cfg: SessionConfig = toml::from_str("queue_capacity = 4\n[timing]\nboot_delay_ms = 10\n").unwrap();
        assert_eq!(cfg.queue_capacity, 4);
        assert_eq!(cfg.timing.boot_delay_ms, 10);
        assert_eq!(cfg.timing.recovery_delay_ms, 500);
        assert_eq!(cfg.firmware_candidates.len(), 3);
    }

    #[test]
    fn test_poll_period_rounding() {
        let mut cfg = SessionConfig::default();
        cfg.io_mode = IoMode::Polled { period_us: 250 };
        assert_eq!(cfg.poll_period(), Some(Duration::from_micros(200)));
        cfg.io_mode = IoMode::Polled { period_us: 10 };
        assert_eq!(cfg.poll_period(), Some(Duration::from_micros(100)));
    }
}
