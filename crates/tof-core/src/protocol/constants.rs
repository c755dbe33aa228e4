//! Register map and protocol constants for TMF8801-class ToF sensors.
//!
//! Offsets in the common block are valid in every application. The App0 and
//! bootloader blocks overlap: what lives at `0x08..` depends on which
//! application is running.

// ============================================================================
// Common registers
// ============================================================================

/// Running application id (read-only). Start of the info record.
pub const REG_APP_ID: u8 = 0x00;
/// Major revision of the running application.
pub const REG_APP_REV_MAJOR: u8 = 0x01;
/// Requested application id (write to switch applications).
pub const REG_REQ_APP_ID: u8 = 0x02;

/// CPU status / enable register.
pub const REG_STAT: u8 = 0xE0;
/// Interrupt status, cleared by writing back the bits read.
pub const REG_INT_STAT: u8 = 0xE1;
/// Interrupt enable mask.
pub const REG_INT_EN: u8 = 0xE2;
/// Silicon id.
pub const REG_CHIP_ID: u8 = 0xE3;
/// Silicon revision.
pub const REG_CHIP_REV: u8 = 0xE4;

/// Size of the info record read from [`REG_APP_ID`].
pub const INFO_RECORD_SIZE: usize = 4;

/// Number of addressable registers mirrored in the shadow copy.
pub const MAX_REGS: usize = 256;

// ============================================================================
// Application ids
// ============================================================================

pub const APP_ID_BOOTLOADER: u8 = 0x80;
pub const APP_ID_APP0: u8 = 0xC0;
pub const APP_ID_APP1: u8 = 0xC1;

/// First App0 major revision carrying the algorithm/gpio/clock-trim block.
pub const APP0_V2_MAJOR: u8 = 2;

// ============================================================================
// STAT register bits
// ============================================================================

/// Power-on bit. Cleared while the CPU is in standby.
pub const STAT_PON: u8 = 0x01;
/// CPU is ready to accept commands.
pub const STAT_CPU_READY: u8 = 0x40;
/// Value written to [`REG_STAT`] to wake a sleeping CPU.
pub const STAT_WAKEUP: u8 = STAT_PON;

// ============================================================================
// Interrupts
// ============================================================================

pub const IRQ_RESULTS: u8 = 0x01;
pub const IRQ_DIAG: u8 = 0x02;
pub const IRQ_ERROR: u8 = 0x04;
/// Interrupt-enable bits preserved on read-modify-write.
pub const INT_MASK: u8 = 0x07;
/// Standard interrupt set enabled whenever App0 comes up.
pub const IRQ_STANDARD: u8 = IRQ_RESULTS | IRQ_DIAG | IRQ_ERROR;

// ============================================================================
// Bootloader
// ============================================================================

/// Bootloader command / status register.
pub const REG_BL_CMD_STAT: u8 = 0x08;

pub const BL_CMD_RAMREMAP_RESET: u8 = 0x11;
pub const BL_CMD_DOWNLOAD_INIT: u8 = 0x14;
pub const BL_CMD_W_RAM: u8 = 0x41;
pub const BL_CMD_ADDR_RAM: u8 = 0x43;

pub const BL_STAT_READY: u8 = 0x00;
pub const BL_STAT_ERR_SIZE: u8 = 0x01;
pub const BL_STAT_ERR_CSUM: u8 = 0x02;
pub const BL_STAT_ERR_RANGE: u8 = 0x07;
pub const BL_STAT_ERR_MORE: u8 = 0x08;
/// Highest status value that is an error; anything above is "busy".
pub const BL_STAT_ERR_LAST: u8 = 0x0F;

/// Largest data payload of one bootloader packet.
pub const BL_MAX_DATA: usize = 128;
/// Salt handed to DOWNLOAD_INIT.
pub const BL_DEFAULT_SALT: u8 = 0x29;

// ============================================================================
// App0 command block
// ============================================================================

pub const REG_CMD_ALG: u8 = 0x08;
pub const REG_CMD_GPIO: u8 = 0x09;
pub const REG_CMD_CAL_FLAGS: u8 = 0x0A;
pub const REG_CMD_THRESHOLD: u8 = 0x0B;
pub const REG_CMD_DELAY: u8 = 0x0C;
pub const REG_CMD_PERIOD: u8 = 0x0D;
pub const REG_CMD_ITER_LSB: u8 = 0x0E;
pub const REG_CMD_ITER_MSB: u8 = 0x0F;
/// Command register. Written last; the device latches the block on it.
pub const REG_COMMAND: u8 = 0x10;
pub const REG_PREV_COMMAND: u8 = 0x11;
pub const REG_APP_REV_MINOR: u8 = 0x12;
pub const REG_APP_REV_PATCH: u8 = 0x13;

/// App0 state. [`APP0_STATE_BUSY`] is set while a measurement or
/// calibration is running.
pub const REG_APP0_STATE: u8 = 0x1C;
/// Last device-side error code.
pub const REG_APP0_STATUS: u8 = 0x1D;
/// What the result area at [`REG_RESULTS`] currently holds.
pub const REG_REGISTER_CONTENTS: u8 = 0x1E;
pub const REG_TID: u8 = 0x1F;

pub const APP0_STATE_BUSY: u8 = 0x01;

pub const CMD_STOP: u8 = 0x00;
pub const CMD_MEASURE: u8 = 0x02;
pub const CMD_FACTORY_CALIBRATION: u8 = 0x0A;

pub const CONTENT_CALIBRATION: u8 = 0x0A;
pub const CONTENT_RESULTS: u8 = 0x55;

/// Calibration-data-present flags written to [`REG_CMD_CAL_FLAGS`].
pub const CAL_FLAG_FACTORY: u8 = 0x01;
pub const CAL_FLAG_ALG_STATE: u8 = 0x02;
pub const CAL_FLAG_CONFIG: u8 = 0x04;

/// Result area; also holds factory calibration output.
pub const REG_RESULTS: u8 = 0x20;
pub const RESULT_RECORD_SIZE: usize = 28;

pub const REG_FACTORY_CALIB: u8 = 0x20;
pub const FACTORY_CALIB_SIZE: usize = 14;
pub const REG_ALG_STATE: u8 = 0x2E;
pub const ALG_STATE_SIZE: usize = 11;

pub const REG_DIAG_STATE: u8 = 0x3C;
/// Oscillator trim, bits 7:0 in the first byte, bit 8 in bit 0 of the second.
pub const REG_OSC_TRIM: u8 = 0x3D;
/// Clock-correction iteration count (v2), little-endian.
pub const REG_CLK_ITERATIONS: u8 = 0x3F;
pub const REG_CONFIG_CALIB: u8 = 0x40;
pub const CONFIG_CALIB_MAX: usize = 32;

/// Size of the App0 header block (status, last command, TID...).
pub const CTRL_FRAME_SIZE: usize = 0x20;

// ============================================================================
// Calibration and health
// ============================================================================

/// Crosstalk baselines above this are physically implausible.
pub const CROSSTALK_IMPLAUSIBLE: u32 = 50_000;

pub const CLOCK_TRIM_MAX: i32 = 511;

/// Settings forced while calibrating and when restarting after recovery.
pub const CALIB_ALG: u8 = 0xA7;
pub const CALIB_PERIOD_MS: u8 = 66;
pub const CALIB_ITERATIONS: u32 = 900_000;

/// Capture iterations are carried in thousands.
pub const ITERATION_UNIT: u32 = 1000;
