//! Calibration data model and workflows.
//!
//! Workflows turn noisy, nonlinear device responses into reusable
//! calibration models: lookup tables ([`table`]) and fitted curves
//! (see [`crate::fitting`]). Each workflow takes an immutable config struct
//! and borrowed device capabilities, and returns its results as values;
//! nothing is mutated in shared state.

pub mod attenuator;
pub mod polarization;
pub mod power;
pub mod table;

pub use attenuator::{calibrate_attenuator, AttenuatorCalConfig, AttenuatorCalibration};
pub use polarization::{
    calibrate_polarization, CouplingCorrection, CouplingModel, PolarizationCalConfig,
    PolarizationCalDevices, PolarizationCalibration,
};
pub use power::{calibrate_power, PowerCalConfig, PowerCalDevices, PowerCalibration};
pub use table::{AxisSpec, BuildOptions, CalibrationTable, Extrapolation};
