//! Device capability interfaces and mock implementations.

pub mod capabilities;
pub mod mock;

pub use capabilities::{with_timeout, Actuator, Detector, DetectorReading, PowerMeter, Shutter};
