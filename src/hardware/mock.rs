//! Mock hardware implementations.
//!
//! Simulated devices for exercising every workflow without physical
//! hardware. All mocks use async-safe operations (`tokio::time::sleep`,
//! never `std::thread::sleep`) and share state through `Arc<RwLock<f64>>`
//! cells so a simulated optical bench can be wired together: an actuator
//! writes a cell, a meter or detector computes its reading from the cells
//! it observes.
//!
//! # Example
//!
//! ```rust,ignore
//! let eom = MockActuator::new("eom", "V", 0.0, 10.0);
//! let voltage = eom.value_handle();
//! let meter = MockPowerMeter::from_fn(move || {
//!     let v = *voltage.blocking_read();
//!     2.0 * v // linear plant: 2 mW per volt
//! });
//! ```

use crate::error::DeviceError;
use crate::hardware::capabilities::{Actuator, Detector, DetectorReading, PowerMeter, Shutter};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

/// Shared scalar cell connecting mock devices.
pub type SharedValue = Arc<RwLock<f64>>;

/// Reading closure used by mock meters and detectors.
pub type ResponseFn = Arc<dyn Fn() -> f64 + Send + Sync>;

// =============================================================================
// MockActuator
// =============================================================================

/// Simulated actuator with range checking and a short settle delay.
///
/// One type covers all actuator roles in tests: a rotation stage
/// (`unit = "deg"`), an EOM drive (`unit = "V"`), or a laser wavelength
/// frontend (`unit = "nm"`).
pub struct MockActuator {
    name: String,
    unit: String,
    min: f64,
    max: f64,
    home: f64,
    settle: Duration,
    value: SharedValue,
}

impl MockActuator {
    /// Create a new actuator at its home value (the range minimum).
    pub fn new(name: &str, unit: &str, min: f64, max: f64) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            min,
            max,
            home: min,
            settle: Duration::from_millis(1),
            value: Arc::new(RwLock::new(min)),
        }
    }

    /// Override the simulated settle delay.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Handle to the value cell, for wiring meters/detectors to this device.
    pub fn value_handle(&self) -> SharedValue {
        Arc::clone(&self.value)
    }
}

#[async_trait]
impl Actuator for MockActuator {
    async fn move_abs(&self, value: f64) -> Result<(), DeviceError> {
        if value < self.min || value > self.max {
            return Err(DeviceError::ValueOutOfRange {
                device: self.name.clone(),
                value,
                min: self.min,
                max: self.max,
            });
        }
        sleep(self.settle).await;
        *self.value.write().await = value;
        Ok(())
    }

    async fn position(&self) -> Result<f64, DeviceError> {
        Ok(*self.value.read().await)
    }

    async fn home(&self) -> Result<(), DeviceError> {
        self.move_abs(self.home).await
    }

    fn unit(&self) -> &str {
        &self.unit
    }
}

// =============================================================================
// MockPowerMeter
// =============================================================================

/// Simulated power meter computing its reading from a response closure,
/// with optional uniform noise.
pub struct MockPowerMeter {
    response: ResponseFn,
    noise: f64,
    rng: Mutex<StdRng>,
    settle: Duration,
}

impl MockPowerMeter {
    /// Meter whose reading is produced by `response` on every call.
    pub fn from_fn<F>(response: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self {
            response: Arc::new(response),
            noise: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0x5447)),
            settle: Duration::from_millis(1),
        }
    }

    /// Add uniform noise of the given half-amplitude to every reading.
    pub fn with_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise = amplitude;
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }
}

#[async_trait]
impl PowerMeter for MockPowerMeter {
    async fn read_power(&self) -> Result<f64, DeviceError> {
        sleep(self.settle).await;
        let mut value = (self.response)();
        if self.noise > 0.0 {
            let mut rng = self.rng.lock().map_err(|_| DeviceError::Communication {
                device: "mock_power_meter".into(),
                message: "rng poisoned".into(),
            })?;
            value += rng.gen_range(-self.noise..self.noise);
        }
        Ok(value)
    }

    fn settle_time(&self) -> Duration {
        self.settle
    }
}

// =============================================================================
// MockDetector
// =============================================================================

/// Simulated point detector with scripted failure injection.
///
/// `fail_times(n)` makes the next `n` acquisitions return a communication
/// error, for exercising the engine's retry path.
pub struct MockDetector {
    response: ResponseFn,
    failures: AtomicUsize,
    acquisitions: AtomicUsize,
    integration: Duration,
}

impl MockDetector {
    /// Detector whose signal is produced by `response` on every acquisition.
    pub fn from_fn<F>(response: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self {
            response: Arc::new(response),
            failures: AtomicUsize::new(0),
            acquisitions: AtomicUsize::new(0),
            integration: Duration::from_millis(1),
        }
    }

    /// Make the next `n` acquisitions fail with a communication error.
    pub fn fail_times(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of successful acquisitions performed.
    pub fn acquisition_count(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for MockDetector {
    async fn acquire(&self) -> Result<DetectorReading, DeviceError> {
        sleep(self.integration).await;
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DeviceError::Communication {
                device: "mock_detector".into(),
                message: "simulated dropout".into(),
            });
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(DetectorReading::Scalar((self.response)()))
    }

    fn integration_time(&self) -> Duration {
        self.integration
    }
}

// =============================================================================
// MockShutter
// =============================================================================

/// Simulated beam shutter. The open/closed flag can be shared with detector
/// response closures so a closed shutter yields only background signal.
pub struct MockShutter {
    open: Arc<AtomicBool>,
}

impl MockShutter {
    /// Create an open shutter.
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Handle to the open/closed flag.
    pub fn open_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.open)
    }
}

impl Default for MockShutter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Shutter for MockShutter {
    async fn open(&self) -> Result<(), DeviceError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
