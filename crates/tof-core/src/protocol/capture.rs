//! Capture settings and the App0 command block.

use std::num::NonZeroU8;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use crate::error::{Result, TofError};

/// Non-zero capture command written to [`REG_COMMAND`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureMode(NonZeroU8);

impl CaptureMode {
    /// Continuous ranging.
    pub const MEASURE: CaptureMode = match NonZeroU8::new(CMD_MEASURE) {
        Some(v) => CaptureMode(v),
        None => unreachable!(),
    };

    pub fn new(command: u8) -> Option<Self> {
        NonZeroU8::new(command).map(CaptureMode)
    }

    pub fn command(self) -> u8 {
        self.0.get()
    }
}

impl Default for CaptureMode {
    fn default() -> Self {
        CaptureMode::MEASURE
    }
}

/// Capture parameters mirrored into the command block on every start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Repetition period in ms, 0 for single-shot.
    pub period_ms: u8,
    /// Iterations in thousands.
    pub iterations_k: u16,
    pub noise_threshold: i8,
    /// Delay between captures, in periods.
    pub delay: u8,
    /// Algorithm flags (v2).
    pub alg: u8,
    /// GPIO control (v2).
    pub gpio: u8,
    /// Clock-correction iterations (v2).
    pub clock_iterations: u16,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            period_ms: 33,
            iterations_k: 400,
            noise_threshold: 6,
            delay: 0,
            alg: 0x23,
            gpio: 0,
            clock_iterations: 150,
        }
    }
}

impl CaptureSettings {
    pub fn iterations(&self) -> u32 {
        u32::from(self.iterations_k) * ITERATION_UNIT
    }

    /// Convert an iteration count to the on-wire unit. Counts must be exact
    /// multiples of [`ITERATION_UNIT`] and fit the 16-bit field.
    pub fn encode_iterations(iterations: u32) -> Result<u16> {
        if iterations % ITERATION_UNIT != 0 {
            return Err(TofError::invalid(format!(
                "iterations {iterations} is not a multiple of {ITERATION_UNIT}"
            )));
        }
        u16::try_from(iterations / ITERATION_UNIT)
            .map_err(|_| TofError::invalid(format!("iterations {iterations} out of range")))
    }

    pub fn parse_period(ms: u32) -> Result<u8> {
        u8::try_from(ms).map_err(|_| TofError::invalid(format!("period {ms}ms out of range")))
    }

    pub fn parse_delay(delay: u32) -> Result<u8> {
        u8::try_from(delay).map_err(|_| TofError::invalid(format!("delay {delay} out of range")))
    }

    pub fn parse_noise_threshold(threshold: i32) -> Result<i8> {
        i8::try_from(threshold)
            .map_err(|_| TofError::invalid(format!("noise threshold {threshold} out of range")))
    }

    /// Force the parameters used for factory calibration and for the
    /// capture restarted after resume or recovery.
    pub fn apply_calibration_grade(&mut self, v2: bool) {
        if v2 {
            self.alg = CALIB_ALG;
        }
        self.period_ms = CALIB_PERIOD_MS;
        self.iterations_k = (CALIB_ITERATIONS / ITERATION_UNIT) as u16;
    }

    /// Build the command block ending in `command`. Returns the first
    /// register to write and the bytes; the command byte is always last.
    /// v1 firmware has no algorithm/gpio registers, so its block starts at
    /// the calibration flags.
    pub fn command_block(&self, command: u8, cal_flags: u8, v2: bool) -> (u8, Vec<u8>) {
        let mut iter = [0u8; 2];
        LittleEndian::write_u16(&mut iter, self.iterations_k);

        let mut block = Vec::with_capacity(9);
        if v2 {
            block.push(self.alg);
            block.push(self.gpio);
        }
        block.push(cal_flags);
        block.push(self.noise_threshold as u8);
        block.push(self.delay);
        block.push(self.period_ms);
        block.extend_from_slice(&iter);
        block.push(command);

        let start = if v2 { REG_CMD_ALG } else { REG_CMD_CAL_FLAGS };
        (start, block)
    }
}
