//! Curve fitting utilities.
//!
//! Nonlinear least-squares fitting of the two empirical models this
//! instrument lives on: the Malus-law cos² transmission curve of a rotating
//! polarization element, and the SHG power law `signal = c·power^n`.

pub mod malus;
pub mod power_law;

pub use malus::{fit_malus, MalusFit, MalusFitOptions};
pub use power_law::{fit_power_law, PowerLawFit};

/// Coefficient of determination (R²) for fitted vs measured values.
///
/// Returns `None` when the data has no variance.
pub(crate) fn r_squared(measured: &[f64], fitted: &[f64]) -> Option<f64> {
    let n = measured.len() as f64;
    let mean = measured.iter().sum::<f64>() / n;
    let ss_tot: f64 = measured.iter().map(|y| (y - mean).powi(2)).sum();
    if ss_tot < f64::EPSILON {
        return None;
    }
    let ss_res: f64 = measured
        .iter()
        .zip(fitted)
        .map(|(y, f)| (y - f).powi(2))
        .sum();
    Some(1.0 - ss_res / ss_tot)
}
