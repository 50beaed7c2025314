//! # SHG DAQ Core Library
//!
//! Calibration and measurement orchestration for polarimetric
//! second-harmonic-generation instruments. The crate turns a rack of
//! nonlinear, wavelength-dependent devices (EOM power control, polarization
//! rotators, variable attenuator) into calibrated, scriptable axes and runs
//! deterministic three-axis sweeps over them.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: The three narrow capability traits the core consumes
//!   (`Actuator`, `PowerMeter`, `Detector`, plus `Shutter`) and mock
//!   implementations for closed-loop simulation in tests.
//! - **`calibration`**: The immutable interpolating `CalibrationTable` and
//!   the workflows that build tables: EOM/power (PID-converged), rotator
//!   phase, and variable attenuator.
//! - **`fitting`**: Malus-law and power-law least-squares fits with quality
//!   gating and outlier rejection.
//! - **`control`**: PID controller with anti-windup and a debounced
//!   `converge` loop for wavelength-dependent power setpoints.
//! - **`experiment`**: Run lifecycle state machine, sweep enumeration,
//!   dataset accumulation, and the worker-per-run execution engine.
//! - **`storage`**: `DataSink` persistence boundary with a JSON
//!   implementation.
//! - **`config`**: TOML loading for workflow and sweep configuration.
//! - **`error`**: The typed error taxonomy shared by all of the above.

pub mod calibration;
pub mod config;
pub mod control;
pub mod error;
pub mod experiment;
pub mod fitting;
pub mod hardware;
pub mod storage;

pub use error::{ShgError, ShgResult};
