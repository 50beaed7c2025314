//! Atomic hardware capabilities.
//!
//! The engine depends on three narrow device roles rather than vendor
//! SDKs: something that moves ([`Actuator`]), something that reads a scalar
//! optical power ([`PowerMeter`]), and something that acquires a signal
//! ([`Detector`]). Concrete drivers (serial rotators, laser frontends,
//! camera SDK bindings) live outside this crate and implement exactly one
//! of these shapes.
//!
//! # Design
//!
//! Each capability trait:
//! - Is async (uses `#[async_trait]`)
//! - Is thread-safe (requires `Send + Sync`, `&self` methods with interior
//!   mutability in implementations)
//! - Returns typed [`DeviceError`]s, propagated unchanged by the engine
//! - Focuses on ONE thing

use crate::error::DeviceError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Capability: positionable device (rotation stage, EOM drive voltage,
/// laser wavelength frontend).
///
/// # Contract
/// - Values are in device-native units (`unit()` tells the caller which)
/// - `move_abs` blocks until the device has settled, or returns an error
/// - No two tasks may command the same actuator concurrently; the engine
///   enforces a single-writer-per-run discipline
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Move to an absolute value and wait until settled.
    async fn move_abs(&self, value: f64) -> Result<(), DeviceError>;

    /// Current value in device-native units.
    async fn position(&self) -> Result<f64, DeviceError>;

    /// Return to the device's reference position.
    async fn home(&self) -> Result<(), DeviceError>;

    /// Device-native unit string ("deg", "V", "nm", ...).
    fn unit(&self) -> &str;
}

/// Capability: scalar optical power readout.
///
/// All readings are in watts. Implementations convert from device-native
/// units (dBm, µW) before returning.
#[async_trait]
pub trait PowerMeter: Send + Sync {
    /// Read the current optical power in watts.
    ///
    /// Blocks until a stable reading is available.
    async fn read_power(&self) -> Result<f64, DeviceError>;

    /// Time the meter needs between a stimulus change and a stable reading.
    fn settle_time(&self) -> Duration {
        Duration::from_millis(10)
    }
}

/// A single detector acquisition: point detectors return a scalar,
/// array detectors a flattened frame.
#[derive(Debug, Clone)]
pub enum DetectorReading {
    /// Single scalar sample (photodiode, PMT).
    Scalar(f64),
    /// Flattened array frame (camera ROI, line sensor).
    Frame(Vec<f64>),
}

impl DetectorReading {
    /// Collapse the reading to one number (mean over a frame).
    pub fn mean(&self) -> f64 {
        match self {
            DetectorReading::Scalar(v) => *v,
            DetectorReading::Frame(values) => {
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            }
        }
    }
}

/// Capability: point or array signal acquisition.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Perform one acquisition with the configured integration time.
    async fn acquire(&self) -> Result<DetectorReading, DeviceError>;

    /// Configured integration time per acquisition.
    fn integration_time(&self) -> Duration {
        Duration::from_millis(10)
    }
}

/// Capability: beam shutter, used to capture detector backgrounds with the
/// beam blocked.
#[async_trait]
pub trait Shutter: Send + Sync {
    /// Open the shutter (beam on).
    async fn open(&self) -> Result<(), DeviceError>;

    /// Close the shutter (beam blocked).
    async fn close(&self) -> Result<(), DeviceError>;
}

/// Bound a device operation to a wall-clock limit.
///
/// Every long-running device await in the engine (moves, meter reads,
/// acquisitions, shutter toggles) goes through this wrapper, so a hung
/// device surfaces as [`DeviceError::Timeout`] instead of blocking its
/// worker indefinitely.
pub async fn with_timeout<T, F>(
    device: &str,
    limit: Duration,
    op: F,
) -> Result<T, DeviceError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout {
            device: device.into(),
            timeout: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_passes_fast_operations_through() {
        let value = with_timeout("meter", Duration::from_secs(1), async { Ok(3.5) })
            .await
            .unwrap();
        assert_eq!(value, 3.5);
    }

    #[tokio::test]
    async fn with_timeout_converts_a_hang_into_a_device_timeout() {
        let result: Result<f64, DeviceError> = with_timeout(
            "stuck_rotator",
            Duration::from_millis(10),
            std::future::pending(),
        )
        .await;
        match result {
            Err(DeviceError::Timeout { device, timeout }) => {
                assert_eq!(device, "stuck_rotator");
                assert_eq!(timeout, Duration::from_millis(10));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn frame_reading_collapses_to_mean() {
        let frame = DetectorReading::Frame(vec![1.0, 2.0, 3.0]);
        assert!((frame.mean() - 2.0).abs() < 1e-12);

        let scalar = DetectorReading::Scalar(0.5);
        assert!((scalar.mean() - 0.5).abs() < 1e-12);

        let empty = DetectorReading::Frame(vec![]);
        assert_eq!(empty.mean(), 0.0);
    }
}
