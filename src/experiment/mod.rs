//! Experiment runtime: sweep planning, execution, and data accumulation.
//!
//! A run is a single worker task walking a [`sweep::SweepSpec`] coordinate
//! grid under calibration-table control, accumulating a
//! [`dataset::Dataset`] and reporting progress through a watch channel.

pub mod dataset;
pub mod run_engine;
pub mod state;
pub mod sweep;

pub use dataset::{Dataset, DatasetMeta};
pub use run_engine::{
    NoopObserver, RunCalibrations, RunConfig, RunDevices, RunEngine, RunHandle, RunObserver,
    RunStatus,
};
pub use state::{RunCheckpoint, RunState};
pub use sweep::{CommandedValues, SweepCoord, SweepPoint, SweepSpec};
