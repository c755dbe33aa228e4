//! Register bus abstraction.
//!
//! Defines the `SensorTransport` trait for register access,
//! allowing different implementations (embedded-hal, simulated, etc.).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("No acknowledge at register {reg:#04x}")]
    Nack { reg: u8 },

    #[error("Short transfer at register {reg:#04x}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        reg: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Chip is disabled")]
    Disabled,

    #[error("No chip-enable line")]
    NoChipEnable,

    #[error("Bus fault: {0}")]
    Fault(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract register-level access to the sensor.
///
/// Registers are 8-bit addressed; multi-byte transfers auto-increment.
/// The chip-enable and interrupt lines are optional: boards without them
/// report `None` / `false` and the session falls back accordingly.
pub trait SensorTransport: Send + 'static {
    /// Burst-read `buf.len()` bytes starting at `reg`.
    fn read(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), BusError>;

    /// Burst-write `data` starting at `reg`.
    fn write(&mut self, reg: u8, data: &[u8]) -> Result<(), BusError>;

    fn read_u8(&mut self, reg: u8) -> Result<u8, BusError> {
        let mut buf = [0u8; 1];
        self.read(reg, &mut buf)?;
        Ok(buf[0])
    }

    fn write_u8(&mut self, reg: u8, value: u8) -> Result<(), BusError> {
        self.write(reg, &[value])
    }

    /// Whether a chip-enable line is wired.
    fn has_chip_enable(&self) -> bool;

    /// Drive the chip-enable line.
    fn set_chip_enable(&mut self, high: bool) -> Result<(), BusError>;

    /// Last driven chip-enable level, `None` without a line.
    fn chip_enable(&self) -> Option<bool>;

    /// Whether the interrupt line is currently asserted, `None` when the
    /// board has no interrupt line.
    fn interrupt_asserted(&mut self) -> Option<bool>;
}
