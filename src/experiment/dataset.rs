//! Sweep dataset: a dense 3D signal array plus provenance metadata.

use crate::error::ShgError;
use crate::experiment::sweep::{SweepPoint, SweepSpec};
use chrono::{DateTime, Utc};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Provenance record stored alongside the signal array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMeta {
    /// Run identifier.
    pub run_id: Uuid,
    /// Run start time.
    pub started: DateTime<Utc>,
    /// Completion time, set when the dataset is sealed.
    pub finished: Option<DateTime<Utc>>,
    /// Identifiers of the calibration tables the run used.
    pub calibration_ids: Vec<Uuid>,
    /// Free-form device settings snapshot (names, units, ranges).
    pub device_snapshot: HashMap<String, String>,
    /// Wavelength axis values, nm; kept with the data so the array is
    /// self-describing.
    pub wavelengths_nm: Vec<f64>,
    /// Power axis values, mW.
    pub powers_mw: Vec<f64>,
    /// Angle axis values, degrees.
    pub angles_deg: Vec<f64>,
}

/// Accumulated sweep data.
///
/// Append-only while the run is active; [`seal`](Dataset::seal) makes it
/// immutable once the run reaches a terminal state. Cells not yet visited
/// hold `NaN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Provenance metadata.
    pub meta: DatasetMeta,
    /// Signal indexed `[wavelength][power][angle]`.
    #[serde(with = "nan_as_null")]
    values: Array3<f64>,
    /// Per-point records in acquisition order.
    points: Vec<SweepPoint>,
    sealed: bool,
}

impl Dataset {
    /// Allocate an empty dataset shaped for `spec`.
    pub fn new(spec: &SweepSpec, meta: DatasetMeta) -> Self {
        let shape = (
            spec.wavelengths_nm.len(),
            spec.powers_mw.len(),
            spec.angles_deg.len(),
        );
        Self {
            meta,
            values: Array3::from_elem(shape, f64::NAN),
            points: Vec::new(),
            sealed: false,
        }
    }

    /// Record one sweep point.
    pub fn record(&mut self, point: SweepPoint) -> Result<(), ShgError> {
        if self.sealed {
            return Err(ShgError::Config("dataset is sealed".into()));
        }
        let c = point.coord;
        self.values[[c.wavelength_index, c.power_index, c.angle_index]] = point.measured;
        self.points.push(point);
        Ok(())
    }

    /// Freeze the dataset; no further points can be recorded.
    pub fn seal(&mut self) {
        if !self.sealed {
            self.sealed = true;
            self.meta.finished = Some(Utc::now());
        }
    }

    /// True once the dataset has been frozen.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Number of points recorded so far.
    pub fn points_recorded(&self) -> usize {
        self.points.len()
    }

    /// Recorded points in acquisition order.
    pub fn points(&self) -> &[SweepPoint] {
        &self.points
    }

    /// Signal at a grid cell; `NaN` until the point is visited.
    pub fn value(&self, wavelength: usize, power: usize, angle: usize) -> f64 {
        self.values[[wavelength, power, angle]]
    }

    /// Full signal array.
    pub fn values(&self) -> &Array3<f64> {
        &self.values
    }

    /// Signals at one wavelength/angle across the powers visited so far,
    /// paired with the power axis. Feeds the live power-law fit.
    pub fn signal_vs_power(&self, wavelength: usize, angle: usize) -> (Vec<f64>, Vec<f64>) {
        let mut powers = Vec::new();
        let mut signal = Vec::new();
        for (j, &p) in self.meta.powers_mw.iter().enumerate() {
            let v = self.values[[wavelength, j, angle]];
            if v.is_finite() {
                powers.push(p);
                signal.push(v);
            }
        }
        (powers, signal)
    }
}

/// JSON represents `NaN` as `null`, which does not round-trip through a
/// plain `f64`. Unvisited cells are stored as `null` explicitly.
mod nan_as_null {
    use ndarray::Array3;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Repr {
        shape: [usize; 3],
        data: Vec<Option<f64>>,
    }

    pub fn serialize<S: Serializer>(values: &Array3<f64>, s: S) -> Result<S::Ok, S::Error> {
        let dim = values.dim();
        let repr = Repr {
            shape: [dim.0, dim.1, dim.2],
            data: values
                .iter()
                .map(|v| v.is_finite().then_some(*v))
                .collect(),
        };
        repr.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Array3<f64>, D::Error> {
        let repr = Repr::deserialize(d)?;
        let data: Vec<f64> = repr
            .data
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        Array3::from_shape_vec((repr.shape[0], repr.shape[1], repr.shape[2]), data)
            .map_err(serde::de::Error::custom)
    }
}
