//! Custom error types for the engine.
//!
//! Every failure path in this crate surfaces a typed error carrying the
//! offending coordinate or context, so a caller (GUI or script) can report
//! precisely which calibration point or sweep step failed. Errors are split
//! by origin:
//!
//! - [`DeviceError`]: raised by device capability implementations and
//!   propagated unchanged through the engine.
//! - [`CalibrationError`]: table construction/lookup and workflow-level
//!   validation failures.
//! - [`FitError`]: curve-fitting failures (too few points, poor quality).
//! - [`ConvergenceError`]: the PID controller could not reach its setpoint.
//!
//! [`ShgError`] consolidates all of the above for functions that cross
//! subsystem boundaries (workflows, the run engine). `#[from]` conversions
//! keep `?` propagation seamless.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ShgResult<T> = std::result::Result<T, ShgError>;

/// Errors raised by device capability implementations.
///
/// The engine never inspects wire protocols; whatever the driver reports is
/// carried through verbatim in `message`.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    /// The driver reported a transport or protocol failure.
    #[error("communication failure with '{device}': {message}")]
    Communication {
        /// Device name.
        device: String,
        /// Driver-reported detail.
        message: String,
    },

    /// A device operation did not complete within its allowed time.
    #[error("'{device}' did not respond within {timeout:?}")]
    Timeout {
        /// Device name.
        device: String,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// A commanded value fell outside the device's accepted range.
    #[error("'{device}': commanded value {value} outside range [{min}, {max}]")]
    ValueOutOfRange {
        /// Device name.
        device: String,
        /// Commanded value.
        value: f64,
        /// Range lower bound.
        min: f64,
        /// Range upper bound.
        max: f64,
    },
}

/// Errors from calibration table construction, lookup, and workflows.
#[derive(Error, Debug, Clone)]
pub enum CalibrationError {
    /// Too many grid cells ended up without data.
    #[error(
        "calibration grid incomplete: {missing} of {total} cells have no data \
         (limit {max_fraction:.0}%)",
        max_fraction = max_fraction * 100.0
    )]
    IncompleteGrid {
        /// Cells without data.
        missing: usize,
        /// Cells in the grid.
        total: usize,
        /// Allowed missing fraction.
        max_fraction: f64,
    },

    /// A lookup coordinate fell outside an axis under the `Error`
    /// extrapolation policy.
    #[error("coordinate {coordinate} outside axis '{axis}' range [{min}, {max}]")]
    OutOfRange {
        /// Axis name.
        axis: String,
        /// Requested coordinate.
        coordinate: f64,
        /// Axis lower bound.
        min: f64,
        /// Axis upper bound.
        max: f64,
    },

    /// A power seed curve dipped where it should rise.
    #[error("non-monotonic power response at {wavelength_nm} nm near {voltage:.3} V")]
    NonMonotonicResponse {
        /// Wavelength of the offending seed curve.
        wavelength_nm: f64,
        /// Drive voltage near the dip.
        voltage: f64,
    },

    /// Up and down sweeps disagreed by more than the mechanical backlash
    /// bound.
    #[error("hysteresis {measured_deg:.4} deg exceeds limit {limit_deg:.4} deg")]
    ExcessiveHysteresis {
        /// Phase difference between the sweep directions.
        measured_deg: f64,
        /// Configured limit.
        limit_deg: f64,
    },

    /// An axis grid was empty or not strictly increasing.
    #[error("axis '{name}' grid must be strictly increasing and non-empty")]
    InvalidAxis {
        /// Axis name.
        name: String,
    },

    /// A value array did not match the axis grid shape.
    #[error("value array shape {actual:?} does not match axis lengths {expected:?}")]
    ShapeMismatch {
        /// Shape implied by the axes.
        expected: Vec<usize>,
        /// Shape of the supplied array.
        actual: Vec<usize>,
    },

    /// A lookup supplied the wrong number of coordinates.
    #[error("expected {expected} coordinates, got {got}")]
    DimensionMismatch {
        /// Table dimensionality.
        expected: usize,
        /// Coordinates supplied.
        got: usize,
    },

    /// Table dimensionality outside the supported range.
    #[error("tables with {dims} axes are not supported (1D and 2D only)")]
    UnsupportedDimensions {
        /// Requested axis count.
        dims: usize,
    },
}

/// Errors from nonlinear curve fitting.
#[derive(Error, Debug, Clone)]
pub enum FitError {
    /// Fewer data points than the model has degrees of freedom.
    #[error("insufficient data: need at least {expected} points, got {got}")]
    InsufficientData {
        /// Minimum points required.
        expected: usize,
        /// Points supplied.
        got: usize,
    },

    /// The fit converged but explains too little of the variance.
    #[error("fit quality too low: R²={r_squared:.4}, threshold={threshold:.4}")]
    FitQuality {
        /// Achieved coefficient of determination.
        r_squared: f64,
        /// Configured acceptance threshold.
        threshold: f64,
    },

    /// Residuals exceed the configured noise bound.
    #[error("fit residual {rms:.4e} exceeds noise limit {limit:.4e}")]
    ResidualTooLarge {
        /// RMS residual of the fit.
        rms: f64,
        /// Configured limit.
        limit: f64,
    },

    /// Mismatched x/y input lengths.
    #[error("input length mismatch: {xs} x-values vs {ys} y-values")]
    LengthMismatch {
        /// Number of x values.
        xs: usize,
        /// Number of y values.
        ys: usize,
    },

    /// The data carries no signal to fit.
    #[error("data has zero variance")]
    ZeroVariance,
}

/// Errors from the closed-loop power controller.
#[derive(Error, Debug, Clone)]
pub enum ConvergenceError {
    /// The loop ran out of iterations or wall time before the debounced
    /// tolerance check passed. The best value achieved is reported rather
    /// than silently returning a poor result.
    #[error(
        "failed to converge to setpoint {setpoint} after {iterations} iterations \
         ({elapsed:?}): best |error| = {best_error:.4e} at drive {best_drive:.4}"
    )]
    Timeout {
        /// Requested setpoint.
        setpoint: f64,
        /// Closest measurement achieved.
        best_measurement: f64,
        /// Drive at the closest measurement.
        best_drive: f64,
        /// Smallest |setpoint − measurement| seen.
        best_error: f64,
        /// Iterations actually executed.
        iterations: usize,
        /// Wall time consumed.
        elapsed: Duration,
    },

    /// A device failed mid-episode.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Consolidated crate-level error.
#[derive(Error, Debug)]
pub enum ShgError {
    /// Calibration table or workflow failure.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// Curve-fitting failure.
    #[error(transparent)]
    Fit(#[from] FitError),

    /// Closed-loop convergence failure.
    #[error(transparent)]
    Convergence(#[from] ConvergenceError),

    /// Device interface failure.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A sweep run stopped at a specific point.
    #[error("run {run_id} failed at sweep point {index}: {message}")]
    Run {
        /// Identifier of the failed run.
        run_id: String,
        /// Sweep index the run stopped at.
        index: usize,
        /// Underlying failure.
        message: String,
    },

    /// The run was cancelled cooperatively.
    #[error("run cancelled")]
    Cancelled,

    /// Invalid configuration or request.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ShgError {
    /// True if the error originated from a device interface and a single
    /// immediate retry is worth attempting.
    pub fn is_device(&self) -> bool {
        matches!(
            self,
            ShgError::Device(_) | ShgError::Convergence(ConvergenceError::Device(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_carries_context() {
        let err = DeviceError::Communication {
            device: "eom".into(),
            message: "port closed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("eom"));
        assert!(msg.contains("port closed"));
    }

    #[test]
    fn calibration_out_of_range_names_axis() {
        let err = CalibrationError::OutOfRange {
            axis: "wavelength".into(),
            coordinate: 1100.0,
            min: 700.0,
            max: 1000.0,
        };
        assert!(err.to_string().contains("wavelength"));
        assert!(err.to_string().contains("1100"));
    }

    #[test]
    fn convergence_timeout_reports_best_value() {
        let err = ConvergenceError::Timeout {
            setpoint: 10.0,
            best_measurement: 9.4,
            best_drive: 2.1,
            best_error: 0.6,
            iterations: 200,
            elapsed: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("200 iterations"));
        assert!(err.to_string().contains("2.1"));
    }

    #[test]
    fn device_errors_are_retryable() {
        let err: ShgError = DeviceError::Communication {
            device: "meter".into(),
            message: "nak".into(),
        }
        .into();
        assert!(err.is_device());
        assert!(!ShgError::Cancelled.is_device());
    }
}
