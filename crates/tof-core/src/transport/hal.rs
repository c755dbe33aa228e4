//! embedded-hal transport.
//!
//! Wraps any `embedded_hal::i2c::I2c` bus plus optional chip-enable and
//! interrupt pins.

use embedded_hal::digital::{ErrorType as PinErrorType, InputPin, OutputPin};
use embedded_hal::i2c::{Error as _, ErrorKind, I2c, Operation, SevenBitAddress};
use std::convert::Infallible;
use tracing::trace;

use super::traits::{BusError, SensorTransport};

/// Factory default 7-bit address.
pub const DEFAULT_I2C_ADDRESS: SevenBitAddress = 0x41;

/// Placeholder for boards without a chip-enable or interrupt line.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPin;

impl PinErrorType for NoPin {
    type Error = Infallible;
}

impl OutputPin for NoPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl InputPin for NoPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

pub struct HalTransport<I, EN = NoPin, INT = NoPin> {
    i2c: I,
    address: SevenBitAddress,
    enable: Option<EN>,
    enable_level: Option<bool>,
    interrupt: Option<INT>,
}

impl<I: I2c> HalTransport<I> {
    /// Bus-only transport at the default address.
    pub fn new(i2c: I) -> Self {
        Self {
            i2c,
            address: DEFAULT_I2C_ADDRESS,
            enable: None,
            enable_level: None,
            interrupt: None,
        }
    }
}

impl<I: I2c, EN: OutputPin, INT: InputPin> HalTransport<I, EN, INT> {
    /// Transport with chip-enable and (active-low) interrupt pins.
    pub fn with_pins(i2c: I, enable: EN, interrupt: Option<INT>) -> Self {
        Self {
            i2c,
            address: DEFAULT_I2C_ADDRESS,
            enable: Some(enable),
            enable_level: None,
            interrupt,
        }
    }

    pub fn with_address(mut self, address: SevenBitAddress) -> Self {
        self.address = address;
        self
    }

    pub fn release(self) -> (I, Option<EN>, Option<INT>) {
        (self.i2c, self.enable, self.interrupt)
    }
}

fn map_i2c_error(reg: u8, kind: ErrorKind) -> BusError {
    match kind {
        ErrorKind::NoAcknowledge(_) => BusError::Nack { reg },
        other => BusError::Fault(format!("{other:?} at register {reg:#04x}")),
    }
}

impl<I, EN, INT> SensorTransport for HalTransport<I, EN, INT>
where
    I: I2c + Send + 'static,
    EN: OutputPin + Send + 'static,
    INT: InputPin + Send + 'static,
{
    fn read(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), BusError> {
        trace!(reg = format_args!("{reg:#04x}"), len = buf.len(), "i2c read");
        self.i2c
            .write_read(self.address, &[reg], buf)
            .map_err(|e| map_i2c_error(reg, e.kind()))
    }

    fn write(&mut self, reg: u8, data: &[u8]) -> Result<(), BusError> {
        trace!(reg = format_args!("{reg:#04x}"), len = data.len(), "i2c write");
        let addr = [reg];
        let mut ops = [Operation::Write(&addr), Operation::Write(data)];
        self.i2c
            .transaction(self.address, &mut ops)
            .map_err(|e| map_i2c_error(reg, e.kind()))
    }

    fn has_chip_enable(&self) -> bool {
        self.enable.is_some()
    }

    fn set_chip_enable(&mut self, high: bool) -> Result<(), BusError> {
        let pin = self.enable.as_mut().ok_or(BusError::NoChipEnable)?;
        let res = if high { pin.set_high() } else { pin.set_low() };
        res.map_err(|e| BusError::Fault(format!("chip-enable pin: {e:?}")))?;
        self.enable_level = Some(high);
        Ok(())
    }

    fn chip_enable(&self) -> Option<bool> {
        self.enable.as_ref().map(|_| self.enable_level.unwrap_or(false))
    }

    fn interrupt_asserted(&mut self) -> Option<bool> {
        let pin = self.interrupt.as_mut()?;
        pin.is_low().ok()
    }
}
