//! Transport layer module.

pub mod hal;
pub mod sim;
pub mod traits;

pub use hal::{HalTransport, NoPin};
pub use sim::{SimConfig, SimulatedSensor};
pub use traits::{BusError, SensorTransport};
