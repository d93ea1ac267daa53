//! In-memory model of a CN0503 board.
//!
//! The model only changes in response to replies received from the device. Sending a
//! command never updates it speculatively.

pub mod channel;
pub mod device;
pub mod stream;

pub use channel::{Channel, MeasurementType};
pub use device::{DeviceModel, DeviceState, Mode, MAX_COLUMNS, NUM_RATIOS};
pub use stream::{Sample, StreamBuffers, StreamSnapshot};
