//! Queryable calibration lookup tables.
//!
//! A [`CalibrationTable`] is built once by a calibration workflow from
//! discrete `(coordinates, value)` samples and then consulted any number of
//! times by downstream sweeps. Tables are immutable after construction and
//! read-only at lookup time, so they can be shared across concurrent runs
//! behind an `Arc` with no synchronization.

use crate::error::CalibrationError;
use chrono::{DateTime, Utc};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One table axis: a name, a unit, and a strictly increasing sample grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisSpec {
    /// Axis name ("wavelength", "power", "attenuation", ...).
    pub name: String,
    /// Physical unit of the grid values.
    pub unit: String,
    /// Strictly increasing sample grid.
    pub grid: Vec<f64>,
}

impl AxisSpec {
    /// Create an axis, validating that the grid is strictly increasing.
    pub fn new(name: &str, unit: &str, grid: Vec<f64>) -> Result<Self, CalibrationError> {
        if grid.is_empty() || grid.windows(2).any(|w| w[1] <= w[0]) {
            return Err(CalibrationError::InvalidAxis {
                name: name.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            unit: unit.to_string(),
            grid,
        })
    }

    /// Evenly spaced axis from `start` to `stop` inclusive.
    pub fn linspace(
        name: &str,
        unit: &str,
        start: f64,
        stop: f64,
        points: usize,
    ) -> Result<Self, CalibrationError> {
        let n = points.max(2);
        let step = (stop - start) / (n - 1) as f64;
        let grid = (0..n).map(|i| start + step * i as f64).collect();
        Self::new(name, unit, grid)
    }

    /// Number of grid points.
    pub fn len(&self) -> usize {
        self.grid.len()
    }

    /// True when the grid is empty (never the case for a validated axis).
    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    /// First grid value.
    pub fn min(&self) -> f64 {
        self.grid[0]
    }

    /// Last grid value.
    pub fn max(&self) -> f64 {
        self.grid[self.grid.len() - 1]
    }

    /// Index of the grid point nearest to `x` (linear binning).
    pub fn nearest(&self, x: f64) -> usize {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (i, g) in self.grid.iter().enumerate() {
            let d = (x - g).abs();
            if d < best_dist {
                best_dist = d;
                best = i;
            }
        }
        best
    }

    /// Bracketing indices and interpolation fraction for an in-range `x`.
    ///
    /// Returns `(lower, upper, t)` with `t` in `[0, 1]`.
    fn bracket(&self, x: f64) -> (usize, usize, f64) {
        let n = self.grid.len();
        if n == 1 || x <= self.grid[0] {
            return (0, 0, 0.0);
        }
        if x >= self.grid[n - 1] {
            return (n - 1, n - 1, 0.0);
        }
        let upper = self.grid.partition_point(|g| *g <= x).min(n - 1);
        let lower = upper - 1;
        let span = self.grid[upper] - self.grid[lower];
        let t = if span > 0.0 {
            (x - self.grid[lower]) / span
        } else {
            0.0
        };
        (lower, upper, t)
    }
}

/// Behavior for lookups outside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extrapolation {
    /// Pin to the nearest edge value.
    Clamp,
    /// Raise `CalibrationError::OutOfRange`.
    Error,
}

/// Options for [`CalibrationTable::build`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Maximum fraction of grid cells allowed to have no sample before the
    /// build fails with `IncompleteGrid`.
    pub max_missing_fraction: f64,
    /// Extrapolation policy of the resulting table.
    pub extrapolation: Extrapolation,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_missing_fraction: 0.2,
            extrapolation: Extrapolation::Clamp,
        }
    }
}

/// Immutable N-dimensional lookup table with interpolation.
///
/// Supports 1D (linear interpolation) and 2D (bilinear) tables, which cover
/// every calibration in this engine: `wavelength × power → drive voltage`,
/// `wavelength → phase`, `attenuation → angle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationTable {
    /// Stable identity for dataset provenance.
    pub id: Uuid,
    /// Construction timestamp.
    pub created: DateTime<Utc>,
    axes: Vec<AxisSpec>,
    values: ArrayD<f64>,
    extrapolation: Extrapolation,
}

impl CalibrationTable {
    /// Build a table from irregular samples, binning each sample onto the
    /// nearest grid cell and averaging duplicates.
    ///
    /// Cells left without data are filled from their nearest populated
    /// neighbour along the last axis, unless more than
    /// `opts.max_missing_fraction` of cells are empty, in which case the
    /// build fails with [`CalibrationError::IncompleteGrid`].
    pub fn build(
        samples: &[(Vec<f64>, f64)],
        axes: Vec<AxisSpec>,
        opts: &BuildOptions,
    ) -> Result<Self, CalibrationError> {
        let dims_n = axes.len();
        if dims_n == 0 || dims_n > 2 {
            return Err(CalibrationError::UnsupportedDimensions { dims: dims_n });
        }
        let shape: Vec<usize> = axes.iter().map(AxisSpec::len).collect();
        let mut sums = ArrayD::<f64>::zeros(IxDyn(&shape));
        let mut counts = ArrayD::<f64>::zeros(IxDyn(&shape));

        for (coords, value) in samples {
            if coords.len() != dims_n {
                return Err(CalibrationError::DimensionMismatch {
                    expected: dims_n,
                    got: coords.len(),
                });
            }
            let idx: Vec<usize> = coords
                .iter()
                .zip(&axes)
                .map(|(c, axis)| axis.nearest(*c))
                .collect();
            sums[IxDyn(&idx)] += value;
            counts[IxDyn(&idx)] += 1.0;
        }

        let total: usize = shape.iter().product();
        let missing = counts.iter().filter(|c| **c == 0.0).count();
        if missing as f64 > opts.max_missing_fraction * total as f64 {
            return Err(CalibrationError::IncompleteGrid {
                missing,
                total,
                max_fraction: opts.max_missing_fraction,
            });
        }

        let mut values = ArrayD::<f64>::from_elem(IxDyn(&shape), f64::NAN);
        for (v, (s, c)) in values.iter_mut().zip(sums.iter().zip(counts.iter())) {
            if *c > 0.0 {
                *v = s / c;
            }
        }
        if missing > 0 {
            fill_holes_last_axis(&mut values);
        }

        Self::from_grid(axes, values, opts.extrapolation)
    }

    /// Construct a table directly from a dense value grid.
    ///
    /// The value array shape must match the axis lengths exactly.
    pub fn from_grid(
        axes: Vec<AxisSpec>,
        values: ArrayD<f64>,
        extrapolation: Extrapolation,
    ) -> Result<Self, CalibrationError> {
        let dims_n = axes.len();
        if dims_n == 0 || dims_n > 2 {
            return Err(CalibrationError::UnsupportedDimensions { dims: dims_n });
        }
        let expected: Vec<usize> = axes.iter().map(AxisSpec::len).collect();
        if values.shape() != expected.as_slice() {
            return Err(CalibrationError::ShapeMismatch {
                expected,
                actual: values.shape().to_vec(),
            });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            created: Utc::now(),
            axes,
            values,
            extrapolation,
        })
    }

    /// Axis definitions.
    pub fn axes(&self) -> &[AxisSpec] {
        &self.axes
    }

    /// Interpolated lookup at the given coordinates.
    ///
    /// Linear for 1D, bilinear for 2D. Out-of-grid coordinates follow the
    /// configured extrapolation policy. Lookups are pure and thread-safe.
    pub fn lookup(&self, coords: &[f64]) -> Result<f64, CalibrationError> {
        if coords.len() != self.axes.len() {
            return Err(CalibrationError::DimensionMismatch {
                expected: self.axes.len(),
                got: coords.len(),
            });
        }

        let mut clamped = Vec::with_capacity(coords.len());
        for (c, axis) in coords.iter().zip(&self.axes) {
            if *c < axis.min() || *c > axis.max() {
                match self.extrapolation {
                    Extrapolation::Error => {
                        return Err(CalibrationError::OutOfRange {
                            axis: axis.name.clone(),
                            coordinate: *c,
                            min: axis.min(),
                            max: axis.max(),
                        });
                    }
                    Extrapolation::Clamp => clamped.push(c.clamp(axis.min(), axis.max())),
                }
            } else {
                clamped.push(*c);
            }
        }

        match self.axes.len() {
            1 => {
                let (i0, i1, t) = self.axes[0].bracket(clamped[0]);
                let v0 = self.values[IxDyn(&[i0])];
                let v1 = self.values[IxDyn(&[i1])];
                Ok(v0 + t * (v1 - v0))
            }
            2 => {
                let (i0, i1, ti) = self.axes[0].bracket(clamped[0]);
                let (j0, j1, tj) = self.axes[1].bracket(clamped[1]);
                let v00 = self.values[IxDyn(&[i0, j0])];
                let v01 = self.values[IxDyn(&[i0, j1])];
                let v10 = self.values[IxDyn(&[i1, j0])];
                let v11 = self.values[IxDyn(&[i1, j1])];
                let top = v00 + tj * (v01 - v00);
                let bottom = v10 + tj * (v11 - v10);
                Ok(top + ti * (bottom - top))
            }
            dims => Err(CalibrationError::UnsupportedDimensions { dims }),
        }
    }

    /// Whether a coordinate tuple lies inside the grid on every axis.
    pub fn covers(&self, coords: &[f64]) -> bool {
        coords.len() == self.axes.len()
            && coords
                .iter()
                .zip(&self.axes)
                .all(|(c, a)| *c >= a.min() && *c <= a.max())
    }
}

/// Replace NaN cells with the nearest valid value along the last axis.
///
/// Lanes that are entirely empty are filled from the preceding lane, which
/// keeps the table usable as long as the overall missing fraction gate has
/// already passed.
fn fill_holes_last_axis(values: &mut ArrayD<f64>) {
    let shape = values.shape().to_vec();
    let lane_len = *shape.last().unwrap_or(&0);
    if lane_len == 0 {
        return;
    }
    let lanes: usize = shape[..shape.len() - 1].iter().product::<usize>().max(1);

    // Work on a flat copy; the array is in standard (row-major) layout.
    let mut flat: Vec<f64> = values.iter().copied().collect();
    let mut last_full_lane: Option<Vec<f64>> = None;
    for lane in 0..lanes {
        let offset = lane * lane_len;
        let slice = &mut flat[offset..offset + lane_len];
        // Forward fill, then backward fill.
        let mut last_valid = f64::NAN;
        for v in slice.iter_mut() {
            if v.is_nan() {
                *v = last_valid;
            } else {
                last_valid = *v;
            }
        }
        let mut next_valid = f64::NAN;
        for v in slice.iter_mut().rev() {
            if v.is_nan() {
                *v = next_valid;
            } else {
                next_valid = *v;
            }
        }
        if slice.iter().all(|v| v.is_nan()) {
            if let Some(prev) = &last_full_lane {
                slice.copy_from_slice(prev);
            }
        } else {
            last_full_lane = Some(slice.to_vec());
        }
    }
    for (dst, src) in values.iter_mut().zip(flat.iter()) {
        *dst = *src;
    }
}
