//! Polarization (rotator) calibration.
//!
//! Sweeps a rotator through a configured angle range, records power-meter
//! readings, and fits the Malus law to locate the transmission axis. Two
//! refinements on top of the plain sweep:
//!
//! - extra samples are taken near the predicted extrema after the coarse
//!   fit, which is where the phase information lives;
//! - an optional cross-calibration repeats the sweep with a second rotator
//!   held at several fixed offsets to quantify coupling between the
//!   rotators, stored as a correction applied at lookup time.
//!
//! Wavelength-dependent phase drift is captured by repeating the fit at
//! multiple wavelengths and storing `φ(wavelength)` as a 1D table.

use crate::calibration::table::{AxisSpec, BuildOptions, CalibrationTable, Extrapolation};
use crate::error::{FitError, ShgError};
use crate::fitting::malus::{fit_malus, MalusFit, MalusFitOptions};
use crate::hardware::capabilities::{with_timeout, Actuator, PowerMeter};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Form of the cross-rotator coupling correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingModel {
    /// Additive phase offset proportional to the other rotator's angle.
    PhaseOffset,
    /// Multiplicative amplitude scaling proportional to the other
    /// rotator's angle.
    AmplitudeScale,
}

/// Fitted cross-rotator coupling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CouplingCorrection {
    /// Which correction form the coefficient belongs to.
    pub model: CouplingModel,
    /// Slope of the coupling fit (deg/deg for phase, 1/deg for amplitude).
    pub coefficient: f64,
}

impl CouplingCorrection {
    /// Phase correction in degrees for a given companion-rotator angle.
    pub fn phase_correction_deg(&self, other_deg: f64) -> f64 {
        match self.model {
            CouplingModel::PhaseOffset => self.coefficient * other_deg,
            CouplingModel::AmplitudeScale => 0.0,
        }
    }

    /// Amplitude scale factor for a given companion-rotator angle.
    pub fn amplitude_scale(&self, other_deg: f64) -> f64 {
        match self.model {
            CouplingModel::PhaseOffset => 1.0,
            CouplingModel::AmplitudeScale => 1.0 + self.coefficient * other_deg,
        }
    }
}

/// Configuration for [`calibrate_polarization`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolarizationCalConfig {
    /// Sweep start angle, degrees.
    #[serde(default = "default_start_deg")]
    pub start_deg: f64,
    /// Sweep stop angle, degrees.
    #[serde(default = "default_stop_deg")]
    pub stop_deg: f64,
    /// Coarse sweep point count.
    #[serde(default = "default_coarse_points")]
    pub coarse_points: usize,
    /// Take finer samples near the predicted extrema after the coarse fit.
    #[serde(default = "default_refine")]
    pub refine: bool,
    /// Extra points per extremum during refinement.
    #[serde(default = "default_refine_points")]
    pub refine_points: usize,
    /// Half-width of the refinement window around each extremum, degrees.
    #[serde(default = "default_refine_span_deg")]
    pub refine_span_deg: f64,
    /// Wavelengths to repeat the fit at for the φ(λ) table. Empty: single
    /// fit at the current wavelength, no table.
    #[serde(default)]
    pub wavelengths_nm: Vec<f64>,
    /// Fixed companion-rotator offsets for cross-calibration, degrees.
    /// Empty: no coupling fit.
    #[serde(default)]
    pub cross_offsets_deg: Vec<f64>,
    /// Coupling correction form to fit.
    #[serde(default = "default_coupling_model")]
    pub coupling_model: CouplingModel,
    /// Malus fit options (quality gates, outlier handling).
    #[serde(default)]
    pub fit: MalusFitOptions,
    /// Settle delay after each rotator move.
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
    /// Meter reads averaged per angle.
    #[serde(default = "default_averages")]
    pub averages: usize,
    /// Upper bound on any single device operation; a hung rotator, laser,
    /// or meter surfaces as [`crate::error::DeviceError::Timeout`].
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub device_timeout: Duration,
}

fn default_start_deg() -> f64 {
    0.0
}
fn default_stop_deg() -> f64 {
    180.0
}
fn default_coarse_points() -> usize {
    24
}
fn default_refine() -> bool {
    true
}
fn default_refine_points() -> usize {
    5
}
fn default_refine_span_deg() -> f64 {
    10.0
}
fn default_coupling_model() -> CouplingModel {
    CouplingModel::PhaseOffset
}
fn default_settle() -> Duration {
    Duration::from_millis(50)
}
fn default_averages() -> usize {
    3
}
fn default_device_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for PolarizationCalConfig {
    fn default() -> Self {
        Self {
            start_deg: default_start_deg(),
            stop_deg: default_stop_deg(),
            coarse_points: default_coarse_points(),
            refine: default_refine(),
            refine_points: default_refine_points(),
            refine_span_deg: default_refine_span_deg(),
            wavelengths_nm: Vec::new(),
            cross_offsets_deg: Vec::new(),
            coupling_model: default_coupling_model(),
            fit: MalusFitOptions::default(),
            settle: default_settle(),
            averages: default_averages(),
            device_timeout: default_device_timeout(),
        }
    }
}

/// Devices required by the polarization calibration.
pub struct PolarizationCalDevices<'a> {
    /// Rotator under calibration, degrees.
    pub rotator: &'a dyn Actuator,
    /// Companion rotator for cross-calibration.
    pub cross_rotator: Option<&'a dyn Actuator>,
    /// Laser wavelength frontend, needed for the φ(λ) table.
    pub wavelength: Option<&'a dyn Actuator>,
    /// Power meter observing the transmitted beam.
    pub meter: &'a dyn PowerMeter,
}

/// Result of the polarization calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolarizationCalibration {
    /// Primary Malus fit (first wavelength, companion rotator homed).
    pub fit: MalusFit,
    /// `wavelength → phase (deg)` table, when multiple wavelengths were
    /// calibrated.
    pub phase_table: Option<CalibrationTable>,
    /// Fitted cross-rotator coupling, when cross-calibration ran.
    pub coupling: Option<CouplingCorrection>,
    /// Per-wavelength fits kept for diagnostics.
    pub wavelength_fits: Vec<(f64, MalusFit)>,
}

impl PolarizationCalibration {
    /// Phase offset in degrees at a wavelength (table lookup, else the
    /// primary fit).
    pub fn phase_deg(&self, wavelength_nm: f64) -> f64 {
        if let Some(table) = &self.phase_table {
            if let Ok(phase) = table.lookup(&[wavelength_nm]) {
                return phase;
            }
        }
        self.fit.phase_rad.to_degrees()
    }

    /// Rotator angle to command for a requested polarization angle,
    /// applying phase calibration and the coupling correction.
    pub fn commanded_angle(
        &self,
        requested_deg: f64,
        wavelength_nm: f64,
        companion_deg: f64,
    ) -> f64 {
        let mut angle = requested_deg + self.phase_deg(wavelength_nm);
        if let Some(coupling) = &self.coupling {
            angle += coupling.phase_correction_deg(companion_deg);
        }
        angle
    }
}

/// Run the polarization calibration.
///
/// Per-wavelength fit failures are warnings (the wavelength is skipped);
/// the calibration fails only when the primary fit fails or every
/// wavelength is lost.
pub async fn calibrate_polarization(
    devices: PolarizationCalDevices<'_>,
    config: &PolarizationCalConfig,
) -> Result<PolarizationCalibration, ShgError> {
    let bound = config.device_timeout;
    if let Some(cross) = devices.cross_rotator {
        with_timeout("cross_rotator", bound, cross.home()).await?;
    }

    // Primary fit, at the first configured wavelength if any.
    if let (Some(laser), Some(first)) = (devices.wavelength, config.wavelengths_nm.first()) {
        with_timeout("wavelength", bound, laser.move_abs(*first)).await?;
    }
    let primary = sweep_and_fit(devices.rotator, devices.meter, config).await?;
    info!(
        phase_deg = primary.phase_rad.to_degrees(),
        r_squared = primary.r_squared,
        "polarization calibration: primary fit"
    );

    // Phase vs wavelength.
    let mut wavelength_fits = Vec::new();
    let mut phase_table = None;
    if let (Some(laser), true) = (devices.wavelength, config.wavelengths_nm.len() > 1) {
        let mut samples: Vec<(Vec<f64>, f64)> = Vec::new();
        for &wavelength in &config.wavelengths_nm {
            with_timeout("wavelength", bound, laser.move_abs(wavelength)).await?;
            match sweep_and_fit(devices.rotator, devices.meter, config).await {
                Ok(fit) => {
                    samples.push((vec![wavelength], fit.phase_rad.to_degrees()));
                    wavelength_fits.push((wavelength, fit));
                }
                Err(ShgError::Fit(err)) => {
                    warn!(wavelength, %err, "phase fit failed; skipping wavelength");
                }
                Err(other) => return Err(other),
            }
        }
        if samples.is_empty() {
            return Err(FitError::InsufficientData {
                expected: 1,
                got: 0,
            }
            .into());
        }
        let axis = AxisSpec::new("wavelength", "nm", config.wavelengths_nm.clone())?;
        let opts = BuildOptions {
            max_missing_fraction: 0.5,
            extrapolation: Extrapolation::Clamp,
        };
        phase_table = Some(CalibrationTable::build(&samples, vec![axis], &opts)?);
    }

    // Cross-rotator coupling.
    let coupling = match (devices.cross_rotator, config.cross_offsets_deg.is_empty()) {
        (Some(cross), false) => {
            let mut offsets = Vec::new();
            let mut responses = Vec::new();
            for &offset in &config.cross_offsets_deg {
                with_timeout("cross_rotator", bound, cross.move_abs(offset)).await?;
                let fit = sweep_and_fit(devices.rotator, devices.meter, config).await?;
                let response = match config.coupling_model {
                    CouplingModel::PhaseOffset => {
                        fit.phase_rad.to_degrees() - primary.phase_rad.to_degrees()
                    }
                    CouplingModel::AmplitudeScale => fit.amplitude / primary.amplitude - 1.0,
                };
                offsets.push(offset);
                responses.push(response);
            }
            with_timeout("cross_rotator", bound, cross.home()).await?;
            let coefficient = slope(&offsets, &responses);
            info!(
                model = ?config.coupling_model,
                coefficient, "cross-rotator coupling fitted"
            );
            Some(CouplingCorrection {
                model: config.coupling_model,
                coefficient,
            })
        }
        _ => None,
    };

    Ok(PolarizationCalibration {
        fit: primary,
        phase_table,
        coupling,
        wavelength_fits,
    })
}

/// One angle sweep plus Malus fit, with extrema refinement.
async fn sweep_and_fit(
    rotator: &dyn Actuator,
    meter: &dyn PowerMeter,
    config: &PolarizationCalConfig,
) -> Result<MalusFit, ShgError> {
    let n = config.coarse_points.max(4);
    let step = (config.stop_deg - config.start_deg) / (n - 1) as f64;
    let mut angles_deg: Vec<f64> = (0..n).map(|i| config.start_deg + step * i as f64).collect();

    let mut readings = Vec::with_capacity(angles_deg.len());
    for &angle in &angles_deg {
        readings.push(measure_at(rotator, meter, angle, config).await?);
    }

    let angles_rad: Vec<f64> = angles_deg.iter().map(|a| a.to_radians()).collect();
    let coarse = fit_malus(&angles_rad, &readings, &config.fit)?;
    if !config.refine {
        return Ok(coarse);
    }

    // Finer sampling near the predicted maximum and minimum improves phase
    // precision; the extrema are where dI/dθ crosses zero.
    let peak_deg = coarse.phase_rad.to_degrees();
    for extremum in [peak_deg, peak_deg + 90.0] {
        for k in 0..config.refine_points {
            let t = k as f64 / (config.refine_points.max(2) - 1) as f64;
            let angle = extremum - config.refine_span_deg + 2.0 * config.refine_span_deg * t;
            if angle < config.start_deg || angle > config.stop_deg {
                continue;
            }
            readings.push(measure_at(rotator, meter, angle, config).await?);
            angles_deg.push(angle);
        }
    }
    let angles_rad: Vec<f64> = angles_deg.iter().map(|a| a.to_radians()).collect();
    Ok(fit_malus(&angles_rad, &readings, &config.fit)?)
}

/// Move, settle, and read an averaged power at one angle.
async fn measure_at(
    rotator: &dyn Actuator,
    meter: &dyn PowerMeter,
    angle_deg: f64,
    config: &PolarizationCalConfig,
) -> Result<f64, ShgError> {
    let bound = config.device_timeout;
    with_timeout("rotator", bound, rotator.move_abs(angle_deg)).await?;
    sleep(config.settle).await;
    let mut total = 0.0;
    let reads = config.averages.max(1);
    for _ in 0..reads {
        sleep(meter.settle_time()).await;
        total += with_timeout("power_meter", bound, meter.read_power()).await?;
    }
    Ok(total / reads as f64)
}

/// Least-squares slope of `y` against `x` through the data mean.
fn slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    if x.len() < 2 {
        return 0.0;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|v| (v - mx).powi(2)).sum();
    if sxx < f64::EPSILON {
        return 0.0;
    }
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    sxy / sxx
}
