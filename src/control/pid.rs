//! Discrete-time PID power controller.
//!
//! Drives an [`Actuator`] (typically the EOM bias voltage) toward a target
//! reading on a [`PowerMeter`]. Used standalone to hold optical power during
//! a sweep and as the inner loop of the EOM power calibration.
//!
//! The controller is a textbook discrete PID with two field-proven guards:
//! anti-windup (the integrator freezes whenever the output saturates) and a
//! low-pass filter on the derivative term so measurement noise is not
//! amplified into the actuator.

use crate::error::ConvergenceError;
use crate::hardware::capabilities::{with_timeout, Actuator, PowerMeter};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Proportional/integral/derivative gain set.
///
/// The defaults were tuned for one specific laser/EOM pair and are not
/// guaranteed stable for arbitrary actuators; override them per wavelength
/// context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidGains {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Derivative gain.
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 24.0,
            ki: 3.0,
            kd: 0.0125,
        }
    }
}

/// Static controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    /// Gain set.
    #[serde(default)]
    pub gains: PidGains,
    /// Lower output clamp (actuator-safe bound).
    #[serde(default = "default_output_min")]
    pub output_min: f64,
    /// Upper output clamp (actuator-safe bound).
    #[serde(default = "default_output_max")]
    pub output_max: f64,
    /// Clamp on the integrator accumulator magnitude.
    #[serde(default = "default_integrator_limit")]
    pub integrator_limit: f64,
    /// Smoothing factor for the filtered derivative, in `(0, 1]`.
    /// 1.0 disables filtering.
    #[serde(default = "default_derivative_smoothing")]
    pub derivative_smoothing: f64,
}

fn default_output_min() -> f64 {
    0.0
}
fn default_output_max() -> f64 {
    10.0
}
fn default_integrator_limit() -> f64 {
    100.0
}
fn default_derivative_smoothing() -> f64 {
    0.3
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            gains: PidGains::default(),
            output_min: default_output_min(),
            output_max: default_output_max(),
            integrator_limit: default_integrator_limit(),
            derivative_smoothing: default_derivative_smoothing(),
        }
    }
}

/// Parameters for a [`PidController::converge`] episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Absolute error tolerance on the meter reading.
    pub tolerance: f64,
    /// Iteration cap for the control loop.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Consecutive in-tolerance reads required (debounce against noise).
    #[serde(default = "default_settle_counts")]
    pub settle_counts: usize,
    /// Delay between control steps.
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Wall-clock limit for the whole episode.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Wall-clock limit per device operation (one move or one read); a
    /// hung device surfaces as [`DeviceError::Timeout`] instead of
    /// stalling the episode.
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub device_timeout: Duration,
    /// Drive value to seed the loop with (from an open-loop calibration
    /// curve, when available).
    #[serde(default)]
    pub initial_drive: Option<f64>,
}

fn default_max_iterations() -> usize {
    200
}
fn default_settle_counts() -> usize {
    3
}
fn default_sample_interval() -> Duration {
    Duration::from_millis(20)
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_device_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.01,
            max_iterations: default_max_iterations(),
            settle_counts: default_settle_counts(),
            sample_interval: default_sample_interval(),
            timeout: default_timeout(),
            device_timeout: default_device_timeout(),
            initial_drive: None,
        }
    }
}

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    /// No active episode.
    Idle,
    /// Closed loop running.
    Converging,
    /// Last episode reached tolerance.
    Converged,
    /// Last episode ran out of iterations or time.
    TimedOut,
}

/// Successful convergence report.
#[derive(Debug, Clone, Copy)]
pub struct Convergence {
    /// Drive value that produced the converged reading.
    pub drive: f64,
    /// Final meter reading.
    pub measurement: f64,
    /// Final error (setpoint minus measurement).
    pub error: f64,
    /// Iterations consumed.
    pub iterations: usize,
    /// Wall time consumed.
    pub elapsed: Duration,
}

/// Discrete PID controller with anti-windup and derivative filtering.
///
/// State is owned exclusively by one controller instance per active control
/// episode; call [`reset`](Self::reset) at the start of each independent
/// episode (new setpoint or new wavelength context).
#[derive(Debug, Clone)]
pub struct PidController {
    config: PidConfig,
    state: ControllerState,
    integrator: f64,
    prev_error: Option<f64>,
    filtered_derivative: f64,
}

impl PidController {
    /// Create a controller from a config.
    pub fn new(config: PidConfig) -> Self {
        Self {
            config,
            state: ControllerState::Idle,
            integrator: 0.0,
            prev_error: None,
            filtered_derivative: 0.0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Clear all accumulated state for a new control episode.
    pub fn reset(&mut self) {
        self.integrator = 0.0;
        self.prev_error = None;
        self.filtered_derivative = 0.0;
        self.state = ControllerState::Idle;
    }

    /// One control-law update; returns the clamped actuator drive value.
    ///
    /// The integrator only accumulates while the output is inside the clamp
    /// (anti-windup freeze); the derivative acts on a low-pass-filtered
    /// error delta.
    pub fn step(&mut self, setpoint: f64, measurement: f64, dt: f64) -> f64 {
        let g = self.config.gains;
        let error = setpoint - measurement;

        let proposed_integrator = (self.integrator + error * dt)
            .clamp(-self.config.integrator_limit, self.config.integrator_limit);

        let raw_derivative = match self.prev_error {
            Some(prev) if dt > 0.0 => (error - prev) / dt,
            _ => 0.0,
        };
        let alpha = self.config.derivative_smoothing.clamp(f64::EPSILON, 1.0);
        self.filtered_derivative =
            alpha * raw_derivative + (1.0 - alpha) * self.filtered_derivative;

        let unclamped =
            g.kp * error + g.ki * proposed_integrator + g.kd * self.filtered_derivative;
        let output = unclamped.clamp(self.config.output_min, self.config.output_max);

        if unclamped >= self.config.output_min && unclamped <= self.config.output_max {
            self.integrator = proposed_integrator;
        }
        self.prev_error = Some(error);
        output
    }

    /// Run the closed loop until the meter reading holds within `tolerance`
    /// of `setpoint` for `settle_counts` consecutive reads.
    ///
    /// Blocks the calling worker on device reads and moves; never blocks
    /// other runs. On iteration/timeout exhaustion the best value achieved
    /// is reported inside [`ConvergenceError::Timeout`] rather than a poor
    /// result being returned silently.
    pub async fn converge(
        &mut self,
        actuator: &dyn Actuator,
        meter: &dyn PowerMeter,
        setpoint: f64,
        cfg: &ConvergenceConfig,
    ) -> Result<Convergence, ConvergenceError> {
        self.reset();
        self.state = ControllerState::Converging;
        let bound = cfg.device_timeout;

        let mut drive = match cfg.initial_drive {
            Some(seed) => {
                with_timeout("actuator", bound, actuator.move_abs(seed)).await?;
                seed
            }
            None => with_timeout("actuator", bound, actuator.position()).await?,
        };

        let start = Instant::now();
        let dt = cfg.sample_interval.as_secs_f64().max(1e-4);
        let mut consecutive = 0usize;
        let mut iterations_run = 0usize;
        let mut best_error = f64::INFINITY;
        let mut best_measurement = f64::NAN;
        let mut best_drive = drive;

        for iteration in 1..=cfg.max_iterations {
            iterations_run = iteration;
            sleep(meter.settle_time()).await;
            let measurement = with_timeout("power_meter", bound, meter.read_power()).await?;
            let error = setpoint - measurement;

            if error.abs() < best_error {
                best_error = error.abs();
                best_measurement = measurement;
                best_drive = drive;
            }

            if error.abs() < cfg.tolerance {
                consecutive += 1;
                if consecutive >= cfg.settle_counts {
                    self.state = ControllerState::Converged;
                    debug!(setpoint, drive, iteration, "converged");
                    return Ok(Convergence {
                        drive,
                        measurement,
                        error,
                        iterations: iteration,
                        elapsed: start.elapsed(),
                    });
                }
            } else {
                consecutive = 0;
            }

            if start.elapsed() > cfg.timeout {
                break;
            }

            drive = self.step(setpoint, measurement, dt);
            with_timeout("actuator", bound, actuator.move_abs(drive)).await?;
            sleep(cfg.sample_interval).await;
        }

        self.state = ControllerState::TimedOut;
        warn!(setpoint, best_error, "convergence timed out");
        Err(ConvergenceError::Timeout {
            setpoint,
            best_measurement,
            best_drive,
            best_error,
            iterations: iterations_run,
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::hardware::mock::{MockActuator, MockPowerMeter};

    fn gentle_controller() -> PidController {
        PidController::new(PidConfig {
            gains: PidGains {
                kp: 0.2,
                ki: 6.0,
                kd: 0.001,
            },
            output_min: 0.0,
            output_max: 10.0,
            integrator_limit: 50.0,
            derivative_smoothing: 0.5,
        })
    }

    #[test]
    fn default_gains_match_tuned_pair() {
        let g = PidGains::default();
        assert_eq!(g.kp, 24.0);
        assert_eq!(g.ki, 3.0);
        assert_eq!(g.kd, 0.0125);
    }

    #[test]
    fn output_is_clamped_and_integrator_freezes_on_saturation() {
        let mut pid = gentle_controller();
        // Huge error saturates the output immediately.
        let out = pid.step(1000.0, 0.0, 0.1);
        assert_eq!(out, 10.0);
        let frozen = pid.integrator;
        let out2 = pid.step(1000.0, 0.0, 0.1);
        assert_eq!(out2, 10.0);
        // Anti-windup: the accumulator did not keep growing while saturated.
        assert_eq!(pid.integrator, frozen);
    }

    #[test]
    fn reset_clears_episode_state() {
        let mut pid = gentle_controller();
        pid.step(1.0, 0.0, 0.1);
        pid.step(1.0, 0.5, 0.1);
        pid.reset();
        assert_eq!(pid.integrator, 0.0);
        assert!(pid.prev_error.is_none());
        assert_eq!(pid.state(), ControllerState::Idle);
    }

    #[tokio::test]
    async fn converges_on_linear_plant() {
        let eom = MockActuator::new("eom", "V", 0.0, 10.0);
        let voltage = eom.value_handle();
        // 2 mW per volt: setpoint 10 mW lives at 5 V.
        let meter =
            MockPowerMeter::from_fn(move || voltage.try_read().map(|v| *v * 2.0).unwrap_or(0.0));

        let mut pid = gentle_controller();
        let cfg = ConvergenceConfig {
            tolerance: 0.01,
            max_iterations: 400,
            settle_counts: 3,
            sample_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(10),
            device_timeout: Duration::from_secs(1),
            initial_drive: Some(1.0),
        };
        let result = pid.converge(&eom, &meter, 10.0, &cfg).await.unwrap();
        assert!(result.error.abs() < 0.01);
        assert!((result.drive - 5.0).abs() < 0.1);
        assert_eq!(pid.state(), ControllerState::Converged);
    }

    #[tokio::test]
    async fn unreachable_setpoint_times_out_with_best_value() {
        let eom = MockActuator::new("eom", "V", 0.0, 10.0);
        let voltage = eom.value_handle();
        // Max reachable power is 20 mW; ask for 50.
        let meter =
            MockPowerMeter::from_fn(move || voltage.try_read().map(|v| *v * 2.0).unwrap_or(0.0));

        let mut pid = gentle_controller();
        let cfg = ConvergenceConfig {
            tolerance: 0.01,
            max_iterations: 50,
            settle_counts: 3,
            sample_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            device_timeout: Duration::from_secs(1),
            initial_drive: Some(0.0),
        };
        match pid.converge(&eom, &meter, 50.0, &cfg).await {
            Err(ConvergenceError::Timeout {
                best_measurement, ..
            }) => {
                // Best achievable is the clamped output times plant gain.
                assert!(best_measurement <= 20.0 + 1e-9);
                assert!(best_measurement > 15.0);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(pid.state(), ControllerState::TimedOut);
    }

    #[tokio::test]
    async fn wall_clock_timeout_reports_actual_iterations() {
        let eom = MockActuator::new("eom", "V", 0.0, 10.0);
        let voltage = eom.value_handle();
        let meter =
            MockPowerMeter::from_fn(move || voltage.try_read().map(|v| *v * 2.0).unwrap_or(0.0));

        let mut pid = gentle_controller();
        let cfg = ConvergenceConfig {
            tolerance: 0.01,
            max_iterations: 10_000,
            settle_counts: 3,
            sample_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
            device_timeout: Duration::from_secs(1),
            initial_drive: Some(0.0),
        };
        match pid.converge(&eom, &meter, 50.0, &cfg).await {
            Err(ConvergenceError::Timeout { iterations, .. }) => {
                assert!(iterations > 0);
                assert!(
                    iterations < 10_000,
                    "iteration count must reflect the loop, not the cap: {iterations}"
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hung_meter_surfaces_a_device_timeout() {
        struct HungMeter;

        #[async_trait::async_trait]
        impl PowerMeter for HungMeter {
            async fn read_power(&self) -> Result<f64, DeviceError> {
                std::future::pending().await
            }

            fn settle_time(&self) -> Duration {
                Duration::from_millis(0)
            }
        }

        let eom = MockActuator::new("eom", "V", 0.0, 10.0);
        let mut pid = gentle_controller();
        let cfg = ConvergenceConfig {
            tolerance: 0.01,
            device_timeout: Duration::from_millis(20),
            initial_drive: Some(1.0),
            ..ConvergenceConfig::default()
        };
        match pid.converge(&eom, &HungMeter, 5.0, &cfg).await {
            Err(ConvergenceError::Device(DeviceError::Timeout { device, .. })) => {
                assert_eq!(device, "power_meter");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn convergence_config_parses_from_toml() {
        let cfg: ConvergenceConfig = toml::from_str(
            r#"
            tolerance = 0.05
            max_iterations = 64
            sample_interval = "10ms"
            timeout = "5s"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.tolerance, 0.05);
        assert_eq!(cfg.max_iterations, 64);
        assert_eq!(cfg.sample_interval, Duration::from_millis(10));
        assert_eq!(cfg.settle_counts, 3);
    }
}
