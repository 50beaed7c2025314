//! EOM / power calibration.
//!
//! Builds the `wavelength × target power → EOM drive voltage` table the
//! sweep engine consumes. For each wavelength an open-loop voltage sweep is
//! taken first; it is not the calibration itself, only a way to seed good
//! PID initial conditions and to detect monotonicity violations early. The
//! actual table cells come from closed-loop PID convergence against the
//! power meter.

use crate::calibration::table::{AxisSpec, BuildOptions, CalibrationTable, Extrapolation};
use crate::control::pid::{ConvergenceConfig, PidConfig, PidController, PidGains};
use crate::error::{CalibrationError, ConvergenceError, ShgError};
use crate::hardware::capabilities::{with_timeout, Actuator, PowerMeter};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

/// Gain override for a wavelength band; laser response is
/// wavelength-dependent, so one gain set rarely covers the whole range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WavelengthGains {
    /// Band lower edge, inclusive.
    pub min_nm: f64,
    /// Band upper edge, inclusive.
    pub max_nm: f64,
    /// Gains to use inside the band.
    pub gains: PidGains,
}

/// Configuration for [`calibrate_power`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerCalConfig {
    /// Wavelength grid, nm, strictly increasing.
    pub wavelengths_nm: Vec<f64>,
    /// Target power grid, mW, strictly increasing.
    pub target_powers_mw: Vec<f64>,
    /// Open-loop seed sweep start voltage.
    #[serde(default = "default_seed_start")]
    pub seed_start_v: f64,
    /// Open-loop seed sweep stop voltage.
    #[serde(default = "default_seed_stop")]
    pub seed_stop_v: f64,
    /// Open-loop seed sweep point count.
    #[serde(default = "default_seed_points")]
    pub seed_points: usize,
    /// Allowed dip in the seed curve, as a fraction of its full range,
    /// before the response is declared non-monotonic.
    #[serde(default = "default_monotonic_tolerance")]
    pub monotonic_tolerance: f64,
    /// Abort the calibration when more than this fraction of points fail.
    #[serde(default = "default_max_failed_fraction")]
    pub max_failed_fraction: f64,
    /// Base PID configuration.
    #[serde(default)]
    pub pid: PidConfig,
    /// Per-wavelength-band gain overrides.
    #[serde(default)]
    pub gain_overrides: Vec<WavelengthGains>,
    /// Convergence episode parameters.
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    /// Extrapolation policy of the resulting table.
    #[serde(default = "default_extrapolation")]
    pub extrapolation: Extrapolation,
}

fn default_seed_start() -> f64 {
    0.0
}
fn default_seed_stop() -> f64 {
    10.0
}
fn default_seed_points() -> usize {
    21
}
fn default_monotonic_tolerance() -> f64 {
    0.05
}
fn default_max_failed_fraction() -> f64 {
    0.2
}
fn default_extrapolation() -> Extrapolation {
    Extrapolation::Clamp
}

impl PowerCalConfig {
    /// Gains for a wavelength: first matching band override, else the base.
    pub fn gains_for(&self, wavelength_nm: f64) -> PidGains {
        self.gain_overrides
            .iter()
            .find(|band| wavelength_nm >= band.min_nm && wavelength_nm <= band.max_nm)
            .map(|band| band.gains)
            .unwrap_or(self.pid.gains)
    }
}

/// Devices required by the power calibration.
pub struct PowerCalDevices<'a> {
    /// Laser wavelength frontend.
    pub wavelength: &'a dyn Actuator,
    /// EOM drive voltage.
    pub eom: &'a dyn Actuator,
    /// Reference power meter.
    pub meter: &'a dyn PowerMeter,
}

/// One open-loop seed curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedCurve {
    /// Wavelength the curve was taken at.
    pub wavelength_nm: f64,
    /// Swept voltages.
    pub voltages: Vec<f64>,
    /// Measured powers, mW.
    pub powers_mw: Vec<f64>,
}

impl SeedCurve {
    /// Invert the curve: voltage expected to produce `target_mw`.
    ///
    /// Linear interpolation between the bracketing samples; clamps to the
    /// sweep ends for targets outside the measured range.
    pub fn voltage_for(&self, target_mw: f64) -> f64 {
        let n = self.powers_mw.len();
        if target_mw <= self.powers_mw[0] {
            return self.voltages[0];
        }
        if target_mw >= self.powers_mw[n - 1] {
            return self.voltages[n - 1];
        }
        for i in 1..n {
            if self.powers_mw[i] >= target_mw {
                let span = self.powers_mw[i] - self.powers_mw[i - 1];
                let t = if span > 0.0 {
                    (target_mw - self.powers_mw[i - 1]) / span
                } else {
                    0.0
                };
                return self.voltages[i - 1] + t * (self.voltages[i] - self.voltages[i - 1]);
            }
        }
        self.voltages[n - 1]
    }
}

/// A per-point convergence failure, surfaced as a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedPoint {
    /// Wavelength of the failed cell.
    pub wavelength_nm: f64,
    /// Target power of the failed cell.
    pub power_mw: f64,
    /// Best |error| the controller achieved before giving up.
    pub best_error: f64,
}

/// Result of the power calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerCalibration {
    /// `wavelength × power → drive voltage` lookup table.
    pub table: CalibrationTable,
    /// Seed curves taken per wavelength, kept for diagnostics.
    pub seed_curves: Vec<SeedCurve>,
    /// Points attempted.
    pub attempted: usize,
    /// Points converged.
    pub converged: usize,
    /// Per-point failures (warnings; the table cell was filled from
    /// neighbours).
    pub failed: Vec<FailedPoint>,
}

/// Run the EOM power calibration over the configured wavelength and power
/// grids.
///
/// Per-point convergence timeouts are warnings: the point is left as a hole
/// and the sweep continues. The whole calibration aborts with
/// [`CalibrationError::IncompleteGrid`] when more than
/// `config.max_failed_fraction` of points fail, and with
/// [`CalibrationError::NonMonotonicResponse`] when a seed curve dips.
/// Device errors propagate immediately; every device call is bounded by
/// `config.convergence.device_timeout`, so a hung instrument surfaces as
/// [`crate::error::DeviceError::Timeout`] instead of stalling the run.
pub async fn calibrate_power(
    devices: PowerCalDevices<'_>,
    config: &PowerCalConfig,
) -> Result<PowerCalibration, ShgError> {
    let wl_axis = AxisSpec::new("wavelength", "nm", config.wavelengths_nm.clone())?;
    let power_axis = AxisSpec::new("power", "mW", config.target_powers_mw.clone())?;

    let mut samples: Vec<(Vec<f64>, f64)> = Vec::new();
    let mut seed_curves = Vec::new();
    let mut failed = Vec::new();
    let attempted = config.wavelengths_nm.len() * config.target_powers_mw.len();

    for &wavelength in &config.wavelengths_nm {
        info!(wavelength, "power calibration: tuning laser");
        let bound = config.convergence.device_timeout;
        with_timeout("wavelength", bound, devices.wavelength.move_abs(wavelength)).await?;

        let seed = seed_sweep(&devices, config, wavelength).await?;
        check_monotonic(&seed, config.monotonic_tolerance)?;

        let mut pid = PidController::new(PidConfig {
            gains: config.gains_for(wavelength),
            ..config.pid.clone()
        });

        for &target in &config.target_powers_mw {
            let episode = ConvergenceConfig {
                initial_drive: Some(seed.voltage_for(target)),
                ..config.convergence.clone()
            };
            match pid.converge(devices.eom, devices.meter, target, &episode).await {
                Ok(result) => {
                    samples.push((vec![wavelength, target], result.drive));
                }
                Err(ConvergenceError::Timeout { best_error, .. }) => {
                    warn!(
                        wavelength,
                        target, best_error, "power calibration point did not converge"
                    );
                    failed.push(FailedPoint {
                        wavelength_nm: wavelength,
                        power_mw: target,
                        best_error,
                    });
                }
                Err(ConvergenceError::Device(err)) => return Err(err.into()),
            }
        }
        seed_curves.push(seed);
    }

    let opts = BuildOptions {
        max_missing_fraction: config.max_failed_fraction,
        extrapolation: config.extrapolation,
    };
    let table = CalibrationTable::build(&samples, vec![wl_axis, power_axis], &opts)?;
    let converged = samples.len();
    info!(
        attempted,
        converged,
        failed = failed.len(),
        "power calibration complete"
    );

    Ok(PowerCalibration {
        table,
        seed_curves,
        attempted,
        converged,
        failed,
    })
}

/// Open-loop voltage sweep at a fixed wavelength.
async fn seed_sweep(
    devices: &PowerCalDevices<'_>,
    config: &PowerCalConfig,
    wavelength_nm: f64,
) -> Result<SeedCurve, ShgError> {
    let n = config.seed_points.max(2);
    let step = (config.seed_stop_v - config.seed_start_v) / (n - 1) as f64;
    let mut voltages = Vec::with_capacity(n);
    let mut powers = Vec::with_capacity(n);
    let bound = config.convergence.device_timeout;
    for i in 0..n {
        let v = config.seed_start_v + step * i as f64;
        with_timeout("eom", bound, devices.eom.move_abs(v)).await?;
        sleep(devices.meter.settle_time()).await;
        powers.push(with_timeout("power_meter", bound, devices.meter.read_power()).await?);
        voltages.push(v);
    }
    Ok(SeedCurve {
        wavelength_nm,
        voltages,
        powers_mw: powers,
    })
}

/// Reject seed curves that dip by more than the allowed fraction of their
/// full range.
fn check_monotonic(seed: &SeedCurve, tolerance: f64) -> Result<(), CalibrationError> {
    let max = seed.powers_mw.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = seed.powers_mw.iter().cloned().fold(f64::INFINITY, f64::min);
    let allowed_dip = tolerance * (max - min).max(f64::EPSILON);
    let mut running_max = f64::NEG_INFINITY;
    for (v, p) in seed.voltages.iter().zip(&seed.powers_mw) {
        if running_max - p > allowed_dip {
            return Err(CalibrationError::NonMonotonicResponse {
                wavelength_nm: seed.wavelength_nm,
                voltage: *v,
            });
        }
        running_max = running_max.max(*p);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockActuator, MockPowerMeter};
    use std::time::Duration;

    fn fast_convergence() -> ConvergenceConfig {
        ConvergenceConfig {
            tolerance: 0.05,
            max_iterations: 200,
            settle_counts: 2,
            sample_interval: Duration::from_millis(2),
            timeout: Duration::from_secs(10),
            device_timeout: Duration::from_secs(1),
            initial_drive: None,
        }
    }

    fn test_config() -> PowerCalConfig {
        PowerCalConfig {
            wavelengths_nm: vec![800.0, 900.0],
            target_powers_mw: vec![2.0, 5.0, 8.0],
            seed_start_v: 0.0,
            seed_stop_v: 10.0,
            seed_points: 11,
            monotonic_tolerance: 0.05,
            max_failed_fraction: 0.2,
            pid: PidConfig {
                gains: PidGains {
                    kp: 0.1,
                    ki: 5.0,
                    kd: 0.0,
                },
                ..PidConfig::default()
            },
            gain_overrides: vec![],
            convergence: fast_convergence(),
            extrapolation: Extrapolation::Clamp,
        }
    }

    /// Linear bench: power = gain(wavelength) * voltage.
    fn linear_bench() -> (MockActuator, MockActuator, MockPowerMeter) {
        let laser = MockActuator::new("laser", "nm", 700.0, 1000.0);
        let eom = MockActuator::new("eom", "V", 0.0, 10.0);
        let wl = laser.value_handle();
        let v = eom.value_handle();
        let meter = MockPowerMeter::from_fn(move || {
            let wavelength = wl.try_read().map(|x| *x).unwrap_or(800.0);
            let voltage = v.try_read().map(|x| *x).unwrap_or(0.0);
            (wavelength / 800.0) * voltage
        });
        (laser, eom, meter)
    }

    #[tokio::test]
    async fn builds_table_on_linear_bench() {
        let (laser, eom, meter) = linear_bench();
        let cal = calibrate_power(
            PowerCalDevices {
                wavelength: &laser,
                eom: &eom,
                meter: &meter,
            },
            &test_config(),
        )
        .await
        .unwrap();

        assert_eq!(cal.attempted, 6);
        assert_eq!(cal.converged, 6);
        assert!(cal.failed.is_empty());

        // gain at 800nm is 1.0: 5 mW needs 5 V.
        let drive = cal.table.lookup(&[800.0, 5.0]).unwrap();
        assert!((drive - 5.0).abs() < 0.1, "drive = {drive}");
        // gain at 900nm is 1.125: 8 mW needs ~7.1 V.
        let drive = cal.table.lookup(&[900.0, 8.0]).unwrap();
        assert!((drive - 8.0 / 1.125).abs() < 0.1, "drive = {drive}");
    }

    #[tokio::test]
    async fn non_monotonic_response_aborts() {
        let laser = MockActuator::new("laser", "nm", 700.0, 1000.0);
        let eom = MockActuator::new("eom", "V", 0.0, 10.0);
        let v = eom.value_handle();
        // Parabola peaking at 5 V: clearly non-monotonic.
        let meter = MockPowerMeter::from_fn(move || {
            let voltage = v.try_read().map(|x| *x).unwrap_or(0.0);
            10.0 - (voltage - 5.0).powi(2)
        });

        let mut config = test_config();
        config.wavelengths_nm = vec![800.0];
        let err = calibrate_power(
            PowerCalDevices {
                wavelength: &laser,
                eom: &eom,
                meter: &meter,
            },
            &config,
        )
        .await
        .unwrap_err();

        match err {
            ShgError::Calibration(CalibrationError::NonMonotonicResponse {
                wavelength_nm,
                ..
            }) => assert_eq!(wavelength_nm, 800.0),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_targets_become_failed_points() {
        let (laser, eom, meter) = linear_bench();
        let mut config = test_config();
        // 20 mW is beyond the 10 V clamp at gain 1.0; let one point fail.
        config.wavelengths_nm = vec![800.0];
        config.target_powers_mw = vec![2.0, 5.0, 20.0];
        config.max_failed_fraction = 0.5;
        config.convergence.max_iterations = 30;
        config.convergence.timeout = Duration::from_secs(2);

        let cal = calibrate_power(
            PowerCalDevices {
                wavelength: &laser,
                eom: &eom,
                meter: &meter,
            },
            &config,
        )
        .await
        .unwrap();

        assert_eq!(cal.failed.len(), 1);
        assert_eq!(cal.failed[0].power_mw, 20.0);
        // The hole was filled from the nearest converged neighbour.
        assert!(cal.table.lookup(&[800.0, 20.0]).is_ok());
    }

    #[test]
    fn gain_overrides_select_by_band() {
        let mut config = test_config();
        config.gain_overrides = vec![WavelengthGains {
            min_nm: 850.0,
            max_nm: 950.0,
            gains: PidGains {
                kp: 1.0,
                ki: 1.0,
                kd: 0.0,
            },
        }];
        assert_eq!(config.gains_for(900.0).kp, 1.0);
        assert_eq!(config.gains_for(800.0).kp, 0.1);
    }

    #[test]
    fn seed_curve_inverts_linearly() {
        let seed = SeedCurve {
            wavelength_nm: 800.0,
            voltages: vec![0.0, 5.0, 10.0],
            powers_mw: vec![0.0, 5.0, 10.0],
        };
        assert!((seed.voltage_for(2.5) - 2.5).abs() < 1e-12);
        assert_eq!(seed.voltage_for(-1.0), 0.0);
        assert_eq!(seed.voltage_for(99.0), 10.0);
    }
}
