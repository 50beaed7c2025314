//! SHG power-law fitting.
//!
//! Fits `signal = c·power^n` via log-log linear regression. Second-harmonic
//! signals are quadratic in excitation power (`n ≈ 2`); the fitted exponent
//! is the standard sanity check that a measured signal is really SHG.
//!
//! Near-zero or negative signal entries (background-subtracted noise) break
//! the log transform, so a direct Gauss–Newton fit on the linear model is
//! used as a fallback in that case.

use super::r_squared;
use crate::error::FitError;
use ndarray::Array1;

/// Minimum number of points for a power-law fit.
const MIN_POINTS: usize = 3;

/// Result of a power-law fit.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PowerLawFit {
    /// Fitted exponent `n`.
    pub exponent: f64,
    /// Fitted coefficient `c`.
    pub coefficient: f64,
    /// Coefficient of determination, computed in linear space.
    pub r_squared: f64,
}

impl PowerLawFit {
    /// Evaluate the fitted model.
    pub fn eval(&self, power: f64) -> f64 {
        self.coefficient * power.powf(self.exponent)
    }
}

/// Fit `signal = c·power^n` to the given samples.
pub fn fit_power_law(powers: &[f64], signal: &[f64]) -> Result<PowerLawFit, FitError> {
    if powers.len() != signal.len() {
        return Err(FitError::LengthMismatch {
            xs: powers.len(),
            ys: signal.len(),
        });
    }
    if powers.len() < MIN_POINTS {
        return Err(FitError::InsufficientData {
            expected: MIN_POINTS,
            got: powers.len(),
        });
    }
    let spread = signal.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
        - signal.iter().cloned().fold(f64::INFINITY, f64::min);
    if spread < f64::EPSILON {
        return Err(FitError::ZeroVariance);
    }

    let log_ok = powers.iter().all(|p| *p > 0.0) && signal.iter().all(|s| *s > 0.0);
    let (exponent, coefficient) = if log_ok {
        log_log_regression(powers, signal)?
    } else {
        gauss_newton(powers, signal)?
    };

    let fitted: Vec<f64> = powers
        .iter()
        .map(|p| coefficient * p.powf(exponent))
        .collect();
    let r2 = r_squared(signal, &fitted).ok_or(FitError::ZeroVariance)?;

    Ok(PowerLawFit {
        exponent,
        coefficient,
        r_squared: r2,
    })
}

/// Linear regression of `ln s` on `ln p`.
fn log_log_regression(powers: &[f64], signal: &[f64]) -> Result<(f64, f64), FitError> {
    let x = Array1::from_iter(powers.iter().map(|p| p.ln()));
    let y = Array1::from_iter(signal.iter().map(|s| s.ln()));
    let n = x.len() as f64;
    let sx = x.sum();
    let sy = y.sum();
    let sxx = x.mapv(|v| v * v).sum();
    let sxy = (&x * &y).sum();
    let det = n * sxx - sx * sx;
    if det.abs() < 1e-12 {
        return Err(FitError::ZeroVariance);
    }
    let slope = (n * sxy - sx * sy) / det;
    let intercept = (sy - slope * sx) / n;
    Ok((slope, intercept.exp()))
}

/// Direct nonlinear fit of `(n, c)` for data the log transform cannot handle.
fn gauss_newton(powers: &[f64], signal: &[f64]) -> Result<(f64, f64), FitError> {
    // Initialize from positive entries; default to quadratic SHG response.
    let mut n = 2.0;
    let positive: Vec<(f64, f64)> = powers
        .iter()
        .zip(signal)
        .filter(|(p, s)| **p > 0.0 && **s > 0.0)
        .map(|(p, s)| (*p, *s))
        .collect();
    let mut c = if positive.is_empty() {
        1.0
    } else {
        positive.iter().map(|(p, s)| s / p.powf(n)).sum::<f64>() / positive.len() as f64
    };

    let sse = |n: f64, c: f64| -> f64 {
        powers
            .iter()
            .zip(signal)
            .map(|(p, s)| (c * p.powf(n) - s).powi(2))
            .sum()
    };

    let mut current = sse(n, c);
    for _ in 0..60 {
        let mut jtj = [[0.0f64; 2]; 2];
        let mut jtr = [0.0f64; 2];
        for (p, s) in powers.iter().zip(signal) {
            let pn = p.powf(n);
            let r = c * pn - s;
            let dn = if *p > 0.0 { c * pn * p.ln() } else { 0.0 };
            let dc = pn;
            jtj[0][0] += dn * dn;
            jtj[0][1] += dn * dc;
            jtj[1][0] += dn * dc;
            jtj[1][1] += dc * dc;
            jtr[0] += dn * r;
            jtr[1] += dc * r;
        }
        let det = jtj[0][0] * jtj[1][1] - jtj[0][1] * jtj[1][0];
        if det.abs() < 1e-14 {
            break;
        }
        let dn = (-jtr[0] * jtj[1][1] + jtr[1] * jtj[0][1]) / det;
        let dc = (-jtr[1] * jtj[0][0] + jtr[0] * jtj[1][0]) / det;

        let mut scale = 1.0;
        let mut improved = false;
        for _ in 0..8 {
            let trial = sse(n + scale * dn, c + scale * dc);
            if trial < current {
                n += scale * dn;
                c += scale * dc;
                current = trial;
                improved = true;
                break;
            }
            scale *= 0.5;
        }
        if !improved || dn.abs() + dc.abs() < 1e-12 {
            break;
        }
    }
    Ok((n, c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_quadratic_law_from_clean_data() {
        let powers: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        let signal: Vec<f64> = powers.iter().map(|p| 0.5 * p.powi(2)).collect();
        let fit = fit_power_law(&powers, &signal).unwrap();
        assert!((fit.exponent - 2.0).abs() < 1e-9);
        assert!((fit.coefficient - 0.5).abs() < 1e-9);
        assert!(fit.r_squared > 0.9999);
    }

    #[test]
    fn falls_back_to_nonlinear_with_negative_entries() {
        let powers: Vec<f64> = (0..12).map(|i| i as f64 * 0.5).collect();
        let mut signal: Vec<f64> = powers.iter().map(|p| 1.2 * p.powf(2.0)).collect();
        signal[0] = -0.001; // background-subtracted noise at zero power
        let fit = fit_power_law(&powers, &signal).unwrap();
        assert!((fit.exponent - 2.0).abs() < 0.05, "n = {}", fit.exponent);
        assert!((fit.coefficient - 1.2).abs() < 0.1);
    }

    #[test]
    fn rejects_too_few_points() {
        assert!(matches!(
            fit_power_law(&[1.0, 2.0], &[1.0, 4.0]),
            Err(FitError::InsufficientData { .. })
        ));
    }

    #[test]
    fn rejects_constant_signal() {
        let powers = vec![1.0, 2.0, 3.0, 4.0];
        let signal = vec![2.0, 2.0, 2.0, 2.0];
        assert!(matches!(
            fit_power_law(&powers, &signal),
            Err(FitError::ZeroVariance)
        ));
    }
}
