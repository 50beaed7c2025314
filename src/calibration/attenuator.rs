//! Attenuator (half-wave plate + polarizer) calibration.
//!
//! Sweeps the waveplate angle, fits the Malus law with the extinction
//! floor retained, and builds the inverse map from requested attenuation
//! in dB to waveplate angle. The sweep runs in both directions so
//! mechanical hysteresis can be measured and bounded.

use crate::calibration::table::{AxisSpec, CalibrationTable, Extrapolation};
use crate::error::{CalibrationError, ShgError};
use crate::fitting::malus::{fit_malus, MalusFit, MalusFitOptions};
use crate::hardware::capabilities::{with_timeout, Actuator, PowerMeter};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for [`calibrate_attenuator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttenuatorCalConfig {
    /// Sweep start angle, degrees.
    #[serde(default = "default_start_deg")]
    pub start_deg: f64,
    /// Sweep stop angle, degrees.
    #[serde(default = "default_stop_deg")]
    pub stop_deg: f64,
    /// Points per sweep direction.
    #[serde(default = "default_points")]
    pub points: usize,
    /// Attenuation grid for the inverse table, dB (increasing).
    #[serde(default = "default_db_grid")]
    pub db_grid: Vec<f64>,
    /// Maximum tolerated phase difference between the up and down sweeps,
    /// degrees.
    #[serde(default = "default_hysteresis_limit_deg")]
    pub hysteresis_limit_deg: f64,
    /// Malus fit options. The extinction floor is always retained here
    /// regardless of the configured flag.
    #[serde(default)]
    pub fit: MalusFitOptions,
    /// Settle delay after each waveplate move.
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
    /// Meter reads averaged per angle.
    #[serde(default = "default_averages")]
    pub averages: usize,
    /// Upper bound on any single device operation; a hung waveplate or
    /// meter surfaces as [`crate::error::DeviceError::Timeout`].
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub device_timeout: Duration,
}

fn default_start_deg() -> f64 {
    0.0
}
fn default_stop_deg() -> f64 {
    90.0
}
fn default_points() -> usize {
    31
}
fn default_db_grid() -> Vec<f64> {
    (0..=30).map(|db| db as f64).collect()
}
fn default_hysteresis_limit_deg() -> f64 {
    0.5
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

impl Default for AttenuatorCalConfig {
    fn default() -> Self {
        Self {
            start_deg: default_start_deg(),
            stop_deg: default_stop_deg(),
            points: default_points(),
            db_grid: default_db_grid(),
            hysteresis_limit_deg: default_hysteresis_limit_deg(),
            fit: MalusFitOptions::default(),
            settle: default_settle(),
            averages: default_averages(),
            device_timeout: default_device_timeout(),
        }
    }
}

/// Result of the attenuator calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttenuatorCalibration {
    /// Malus fit averaged over both sweep directions.
    pub fit: MalusFit,
    /// `attenuation (dB) → waveplate angle (deg)` table.
    pub table: CalibrationTable,
    /// Measured phase difference between the up and down sweeps, degrees.
    pub hysteresis_deg: f64,
    /// Deepest attenuation the fitted extinction ratio supports, dB.
    pub max_attenuation_db: f64,
}

impl AttenuatorCalibration {
    /// Waveplate angle for a requested attenuation.
    ///
    /// Requests beyond [`max_attenuation_db`](Self::max_attenuation_db)
    /// are reported via the table's extrapolation policy.
    pub fn angle_for_db(&self, db: f64) -> Result<f64, CalibrationError> {
        self.table.lookup(&[db])
    }
}

/// Closed-form inverse of the fitted Malus curve.
///
/// `t = 10^(-dB/10)` is the requested transmission relative to the peak
/// `A + C`; solving `A cos²(θ - φ) + C = t (A + C)` for `θ` on the branch
/// descending from the peak. The cos² argument is clamped so requests
/// deeper than the extinction floor saturate at full extinction.
fn angle_for_attenuation(fit: &MalusFit, db: f64) -> f64 {
    let t = 10f64.powf(-db / 10.0);
    let cos_sq = ((t * (fit.amplitude + fit.offset) - fit.offset) / fit.amplitude).clamp(0.0, 1.0);
    (fit.phase_rad + cos_sq.sqrt().acos()).to_degrees()
}

/// Run the attenuator calibration.
pub async fn calibrate_attenuator(
    waveplate: &dyn Actuator,
    meter: &dyn PowerMeter,
    config: &AttenuatorCalConfig,
) -> Result<AttenuatorCalibration, ShgError> {
    let n = config.points.max(4);
    let step = (config.stop_deg - config.start_deg) / (n - 1) as f64;
    let up: Vec<f64> = (0..n).map(|i| config.start_deg + step * i as f64).collect();
    let down: Vec<f64> = up.iter().rev().copied().collect();

    let mut fit_cfg = config.fit.clone();
    fit_cfg.extinction_aware = true;

    let fit_up = sweep_and_fit(waveplate, meter, &up, &fit_cfg, config).await?;
    let fit_down = sweep_and_fit(waveplate, meter, &down, &fit_cfg, config).await?;

    let hysteresis_deg = (fit_up.phase_rad - fit_down.phase_rad).abs().to_degrees();
    if hysteresis_deg > config.hysteresis_limit_deg {
        return Err(CalibrationError::ExcessiveHysteresis {
            measured_deg: hysteresis_deg,
            limit_deg: config.hysteresis_limit_deg,
        }
        .into());
    }

    // The two directions agree within the bound; average them so the
    // inverse map splits the residual backlash.
    let fit = MalusFit {
        amplitude: 0.5 * (fit_up.amplitude + fit_down.amplitude),
        phase_rad: 0.5 * (fit_up.phase_rad + fit_down.phase_rad),
        offset: 0.5 * (fit_up.offset + fit_down.offset),
        extinction_ratio: fit_up
            .extinction_ratio
            .zip(fit_down.extinction_ratio)
            .map(|(a, b)| 0.5 * (a + b)),
        rms_residual: fit_up.rms_residual.max(fit_down.rms_residual),
        r_squared: fit_up.r_squared.min(fit_down.r_squared),
        points_used: fit_up.points_used + fit_down.points_used,
    };

    let max_attenuation_db = fit
        .extinction_ratio
        .map(|er| 10.0 * er.log10())
        .unwrap_or(f64::INFINITY);
    for &db in &config.db_grid {
        if db > max_attenuation_db {
            warn!(
                db,
                max_attenuation_db, "requested attenuation exceeds extinction floor"
            );
        }
    }

    let angles: Vec<f64> = config
        .db_grid
        .iter()
        .map(|&db| angle_for_attenuation(&fit, db))
        .collect();
    let axis = AxisSpec::new("attenuation", "dB", config.db_grid.clone())?;
    let values = ArrayD::from_shape_vec(IxDyn(&[angles.len()]), angles)
        .map_err(|_| CalibrationError::ShapeMismatch {
            expected: vec![config.db_grid.len()],
            actual: Vec::new(),
        })?;
    let table = CalibrationTable::from_grid(vec![axis], values, Extrapolation::Error)?;

    info!(
        hysteresis_deg,
        max_attenuation_db,
        r_squared = fit.r_squared,
        "attenuator calibrated"
    );
    Ok(AttenuatorCalibration {
        fit,
        table,
        hysteresis_deg,
        max_attenuation_db,
    })
}

async fn sweep_and_fit(
    waveplate: &dyn Actuator,
    meter: &dyn PowerMeter,
    angles_deg: &[f64],
    fit_cfg: &MalusFitOptions,
    config: &AttenuatorCalConfig,
) -> Result<MalusFit, ShgError> {
    let mut readings = Vec::with_capacity(angles_deg.len());
    let bound = config.device_timeout;
    for &angle in angles_deg {
        with_timeout("waveplate", bound, waveplate.move_abs(angle)).await?;
        sleep(config.settle).await;
        let mut total = 0.0;
        let reads = config.averages.max(1);
        for _ in 0..reads {
            sleep(meter.settle_time()).await;
            total += with_timeout("power_meter", bound, meter.read_power()).await?;
        }
        readings.push(total / reads as f64);
    }
    let angles_rad: Vec<f64> = angles_deg.iter().map(|a| a.to_radians()).collect();
    Ok(fit_malus(&angles_rad, &readings, fit_cfg)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockActuator, MockPowerMeter};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn fast_config() -> AttenuatorCalConfig {
        AttenuatorCalConfig {
            settle: Duration::from_millis(0),
            averages: 1,
            ..AttenuatorCalConfig::default()
        }
    }

    /// Waveplate bench with a configurable direction-dependent phase lag.
    fn attenuator_bench(
        phase_deg: f64,
        floor: f64,
        backlash_deg: f64,
    ) -> (MockActuator, MockPowerMeter) {
        let waveplate = MockActuator::new("waveplate", "deg", -45.0, 180.0);
        let theta = waveplate.value_handle();
        let last = Arc::new(std::sync::RwLock::new(f64::NEG_INFINITY));
        let going_down = Arc::new(AtomicBool::new(false));
        let dir = going_down.clone();
        let meter = MockPowerMeter::from_fn(move || {
            let t = theta.try_read().map(|x| *x).unwrap_or(0.0);
            if let Ok(mut prev) = last.try_write() {
                if t < *prev {
                    dir.store(true, Ordering::Relaxed);
                } else if t > *prev {
                    dir.store(false, Ordering::Relaxed);
                }
                *prev = t;
            }
            let lag = if dir.load(Ordering::Relaxed) {
                backlash_deg
            } else {
                0.0
            };
            ((t - phase_deg - lag).to_radians()).cos().powi(2) + floor
        });
        (waveplate, meter)
    }

    #[tokio::test]
    async fn inverse_table_reproduces_requested_attenuation() {
        let (waveplate, meter) = attenuator_bench(5.0, 0.002, 0.0);
        let mut config = fast_config();
        config.db_grid = vec![0.0, 3.0, 6.0, 10.0, 20.0];
        let cal = calibrate_attenuator(&waveplate, &meter, &config)
            .await
            .unwrap();

        assert!(cal.hysteresis_deg < 0.2);
        // ER ~ 1.002 / 0.002 ~ 500 → ~27 dB reachable.
        assert!((cal.max_attenuation_db - 27.0).abs() < 1.0);

        for db in [0.0, 3.0, 10.0] {
            let angle = cal.angle_for_db(db).unwrap();
            let transmitted = ((angle - 5.0).to_radians()).cos().powi(2) + 0.002;
            let peak = cal.fit.amplitude + cal.fit.offset;
            let achieved_db = -10.0 * (transmitted / peak).log10();
            assert!(
                (achieved_db - db).abs() < 0.3,
                "requested {db} dB, achieved {achieved_db} dB"
            );
        }
    }

    #[tokio::test]
    async fn unreachable_attenuation_saturates_at_extinction() {
        let (waveplate, meter) = attenuator_bench(0.0, 0.01, 0.0);
        let mut config = fast_config();
        config.db_grid = vec![0.0, 10.0, 40.0];
        let cal = calibrate_attenuator(&waveplate, &meter, &config)
            .await
            .unwrap();
        // ER ~ 100 → 20 dB; 40 dB saturates at the extinction angle (90°
        // past the peak).
        let angle = cal.angle_for_db(40.0).unwrap();
        assert!((angle - 90.0).abs() < 1.0, "angle = {angle}");
    }

    #[tokio::test]
    async fn excessive_backlash_is_rejected() {
        let (waveplate, meter) = attenuator_bench(5.0, 0.002, 2.0);
        let err = calibrate_attenuator(&waveplate, &meter, &fast_config())
            .await
            .unwrap_err();
        match err {
            ShgError::Calibration(CalibrationError::ExcessiveHysteresis {
                measured_deg,
                limit_deg,
            }) => {
                assert!(measured_deg > limit_deg);
                assert!((limit_deg - 0.5).abs() < 1e-12);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn closed_form_inverse_matches_forward_model() {
        let fit = MalusFit {
            amplitude: 1.0,
            phase_rad: 0.0,
            offset: 0.001,
            extinction_ratio: Some(1001.0),
            rms_residual: 0.0,
            r_squared: 1.0,
            points_used: 0,
        };
        let angle = angle_for_attenuation(&fit, 3.0);
        let t = (angle.to_radians().cos().powi(2) + 0.001) / 1.001;
        assert!((-10.0 * t.log10() - 3.0).abs() < 1e-6);
    }
}
