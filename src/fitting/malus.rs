//! Malus-law fitting.
//!
//! Fits `I(θ) = A·cos²(θ − φ) + C` to measured intensities. The cos²
//! periodicity gives the nonlinear solver a half-period of local minima, so
//! the phase is initialized from a coarse grid search (amplitude and offset
//! are linear in the model and solved exactly at each trial phase) before
//! Gauss–Newton refinement of all three parameters.

use super::r_squared;
use crate::error::FitError;
use ndarray::Array1;
use std::f64::consts::PI;
use tracing::debug;

/// Options controlling [`fit_malus`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MalusFitOptions {
    /// Minimum number of points required (after outlier rejection).
    pub min_points: usize,
    /// Reject the fit when R² falls below this threshold.
    pub r_squared_threshold: f64,
    /// Known measurement noise sigma; when set, the RMS residual must stay
    /// within `residual_noise_multiple` times this value.
    pub noise_sigma: Option<f64>,
    /// Allowed multiple of `noise_sigma` for the RMS residual.
    pub residual_noise_multiple: f64,
    /// Fit the extinction-ratio-aware variant (constrains the transmission
    /// floor positive and reports the extinction ratio).
    pub extinction_aware: bool,
    /// Number of trial phases for the coarse grid search.
    pub phase_grid_points: usize,
    /// Gauss–Newton iteration cap.
    pub max_iterations: usize,
}

impl Default for MalusFitOptions {
    fn default() -> Self {
        Self {
            min_points: 8,
            r_squared_threshold: 0.95,
            noise_sigma: None,
            residual_noise_multiple: 3.0,
            extinction_aware: false,
            phase_grid_points: 36,
            max_iterations: 40,
        }
    }
}

/// Result of a Malus-law fit.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MalusFit {
    /// Modulation amplitude `A` (always non-negative).
    pub amplitude: f64,
    /// Phase offset `φ` in radians, wrapped to `[0, π)`.
    pub phase_rad: f64,
    /// Vertical offset `C`.
    pub offset: f64,
    /// Max/min transmission ratio, reported by the extinction-aware variant.
    pub extinction_ratio: Option<f64>,
    /// RMS of the fit residuals.
    pub rms_residual: f64,
    /// Coefficient of determination.
    pub r_squared: f64,
    /// Number of points used after outlier rejection.
    pub points_used: usize,
}

impl MalusFit {
    /// Evaluate the fitted model at an angle (radians).
    pub fn eval(&self, theta_rad: f64) -> f64 {
        self.amplitude * (theta_rad - self.phase_rad).cos().powi(2) + self.offset
    }

    /// Angle of maximum transmission, radians in `[0, π)`.
    pub fn peak_angle(&self) -> f64 {
        self.phase_rad
    }
}

/// Fit the Malus-law model to `(angle, intensity)` samples.
///
/// Angles are in radians. Outliers beyond three standard deviations of the
/// residual are dropped once and the fit rerun; if fewer than
/// `options.min_points` remain, fitting fails with
/// [`FitError::InsufficientData`]. Fits below the configured R² threshold
/// (or above the noise-based residual limit) are rejected.
pub fn fit_malus(
    angles_rad: &[f64],
    intensities: &[f64],
    options: &MalusFitOptions,
) -> Result<MalusFit, FitError> {
    if angles_rad.len() != intensities.len() {
        return Err(FitError::LengthMismatch {
            xs: angles_rad.len(),
            ys: intensities.len(),
        });
    }
    if angles_rad.len() < options.min_points {
        return Err(FitError::InsufficientData {
            expected: options.min_points,
            got: angles_rad.len(),
        });
    }

    let first = fit_once(angles_rad, intensities, options)?;

    // One pass of 3-sigma outlier rejection, then refit.
    let residuals: Vec<f64> = angles_rad
        .iter()
        .zip(intensities)
        .map(|(t, y)| y - first.eval(*t))
        .collect();
    let sigma = std(&residuals);
    let keep: Vec<usize> = residuals
        .iter()
        .enumerate()
        .filter(|(_, r)| sigma <= f64::EPSILON || r.abs() <= 3.0 * sigma)
        .map(|(i, _)| i)
        .collect();

    let fit = if keep.len() < angles_rad.len() {
        debug!(
            dropped = angles_rad.len() - keep.len(),
            "dropping residual outliers and refitting"
        );
        if keep.len() < options.min_points {
            return Err(FitError::InsufficientData {
                expected: options.min_points,
                got: keep.len(),
            });
        }
        let kept_angles: Vec<f64> = keep.iter().map(|&i| angles_rad[i]).collect();
        let kept_vals: Vec<f64> = keep.iter().map(|&i| intensities[i]).collect();
        fit_once(&kept_angles, &kept_vals, options)?
    } else {
        first
    };

    if fit.r_squared < options.r_squared_threshold {
        return Err(FitError::FitQuality {
            r_squared: fit.r_squared,
            threshold: options.r_squared_threshold,
        });
    }
    if let Some(sigma) = options.noise_sigma {
        let limit = options.residual_noise_multiple * sigma;
        if fit.rms_residual > limit {
            return Err(FitError::ResidualTooLarge {
                rms: fit.rms_residual,
                limit,
            });
        }
    }

    Ok(fit)
}

/// Single fit pass: coarse phase grid search plus Gauss–Newton refinement.
fn fit_once(
    angles: &[f64],
    values: &[f64],
    options: &MalusFitOptions,
) -> Result<MalusFit, FitError> {
    let theta = Array1::from_vec(angles.to_vec());
    let y = Array1::from_vec(values.to_vec());

    let spread = y.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
        - y.iter().cloned().fold(f64::INFINITY, f64::min);
    if spread < f64::EPSILON {
        return Err(FitError::ZeroVariance);
    }

    // Grid search: at each trial phase, (A, C) are linear and solved exactly.
    let grid = options.phase_grid_points.max(4);
    let mut best = (f64::INFINITY, 0.0, 0.0, 0.0); // (sse, a, phi, c)
    for k in 0..grid {
        let phi = PI * k as f64 / grid as f64;
        if let Some((a, c, sse)) = solve_linear_given_phase(&theta, &y, phi) {
            if sse < best.0 {
                best = (sse, a, phi, c);
            }
        }
    }
    let (_, mut a, mut phi, mut c) = best;

    // Gauss–Newton refinement with simple step halving.
    let mut sse = sse_of(&theta, &y, a, phi, c);
    for _ in 0..options.max_iterations {
        // Normal equations J^T J delta = -J^T r for params (A, phi, C).
        let mut jtj = [[0.0f64; 3]; 3];
        let mut jtr = [0.0f64; 3];
        for (t, yv) in theta.iter().zip(y.iter()) {
            let d = t - phi;
            let model = a * d.cos().powi(2) + c;
            let r = model - yv;
            let j = [d.cos().powi(2), a * (2.0 * d).sin(), 1.0];
            for (row, jr) in j.iter().enumerate() {
                jtr[row] += jr * r;
                for (col, jc) in j.iter().enumerate() {
                    jtj[row][col] += jr * jc;
                }
            }
        }
        let Some(delta) = solve3(jtj, [-jtr[0], -jtr[1], -jtr[2]]) else {
            break;
        };

        let mut scale = 1.0;
        let mut improved = false;
        for _ in 0..8 {
            let trial = (
                a + scale * delta[0],
                phi + scale * delta[1],
                c + scale * delta[2],
            );
            let trial_sse = sse_of(&theta, &y, trial.0, trial.1, trial.2);
            if trial_sse < sse {
                a = trial.0;
                phi = trial.1;
                c = trial.2;
                sse = trial_sse;
                improved = true;
                break;
            }
            scale *= 0.5;
        }
        if !improved || delta.iter().map(|d| d.abs()).sum::<f64>() < 1e-12 {
            break;
        }
        if options.extinction_aware {
            // A physical attenuator leaks; keep the transmission floor positive.
            c = c.max(a.abs() * 1e-6);
        }
    }

    // Canonical form: A >= 0, phi in [0, pi).
    if a < 0.0 {
        // -A cos^2(x) + C == A cos^2(x - pi/2) + (C - A)
        c += a;
        a = -a;
        phi += PI / 2.0;
    }
    phi = phi.rem_euclid(PI);

    let fitted: Vec<f64> = angles
        .iter()
        .map(|t| a * (t - phi).cos().powi(2) + c)
        .collect();
    let r2 = r_squared(values, &fitted).ok_or(FitError::ZeroVariance)?;
    let rms = (sse_of(&theta, &y, a, phi, c) / angles.len() as f64).sqrt();

    let extinction_ratio = if options.extinction_aware {
        let floor = c.max(a * 1e-6);
        Some((a + c) / floor)
    } else {
        None
    };

    Ok(MalusFit {
        amplitude: a,
        phase_rad: phi,
        offset: c,
        extinction_ratio,
        rms_residual: rms,
        r_squared: r2,
        points_used: angles.len(),
    })
}

/// Exact least squares for (A, C) given a fixed phase.
fn solve_linear_given_phase(
    theta: &Array1<f64>,
    y: &Array1<f64>,
    phi: f64,
) -> Option<(f64, f64, f64)> {
    let basis = theta.mapv(|t| (t - phi).cos().powi(2));
    let n = theta.len() as f64;
    let sx = basis.sum();
    let sxx = basis.mapv(|x| x * x).sum();
    let sy = y.sum();
    let sxy = (&basis * y).sum();
    let det = sxx * n - sx * sx;
    if det.abs() < 1e-12 {
        return None;
    }
    let a = (sxy * n - sx * sy) / det;
    let c = (sxx * sy - sx * sxy) / det;
    let sse = basis
        .iter()
        .zip(y.iter())
        .map(|(x, yv)| (a * x + c - yv).powi(2))
        .sum();
    Some((a, c, sse))
}

fn sse_of(theta: &Array1<f64>, y: &Array1<f64>, a: f64, phi: f64, c: f64) -> f64 {
    theta
        .iter()
        .zip(y.iter())
        .map(|(t, yv)| (a * (t - phi).cos().powi(2) + c - yv).powi(2))
        .sum()
}

fn std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Solve a 3x3 linear system by Gaussian elimination with partial pivoting.
fn solve3(mut m: [[f64; 3]; 3], mut b: [f64; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let pivot = (col..3).max_by(|&i, &j| {
            m[i][col]
                .abs()
                .partial_cmp(&m[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if m[pivot][col].abs() < 1e-14 {
            return None;
        }
        m.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..3 {
            let f = m[row][col] / m[col][col];
            for k in col..3 {
                m[row][k] -= f * m[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = [0.0; 3];
    for row in (0..3).rev() {
        let mut sum = b[row];
        for k in (row + 1)..3 {
            sum -= m[row][k] * x[k];
        }
        x[row] = sum / m[row][row];
    }
    Some(x)
}
