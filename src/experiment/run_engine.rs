//! Sweep execution engine.
//!
//! One worker task per run owns every device exclusively for the run's
//! lifetime, so no synchronization is needed beyond the cooperative pause
//! and cancel flags, which are honored only between sweep points — never
//! mid-move — to keep device state consistent.

use crate::calibration::polarization::PolarizationCalibration;
use crate::calibration::table::CalibrationTable;
use crate::error::ShgError;
use crate::experiment::dataset::{Dataset, DatasetMeta};
use crate::experiment::state::{RunCheckpoint, RunState};
use crate::experiment::sweep::{CommandedValues, SweepCoord, SweepPoint, SweepSpec};
use crate::fitting::power_law::{fit_power_law, PowerLawFit};
use crate::hardware::capabilities::{with_timeout, Actuator, Detector, Shutter};
use crate::storage::DataSink;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

/// Devices a run commands. The worker task takes exclusive ownership of
/// these handles for the duration of the run.
pub struct RunDevices {
    /// Laser wavelength frontend, nm.
    pub wavelength: Arc<dyn Actuator>,
    /// EOM drive, V.
    pub eom: Arc<dyn Actuator>,
    /// Analyzer rotator, degrees.
    pub rotator: Arc<dyn Actuator>,
    /// SHG signal detector.
    pub detector: Arc<dyn Detector>,
    /// Beam shutter for background capture; without one, backgrounds are
    /// skipped even when the sweep requests them.
    pub shutter: Option<Arc<dyn Shutter>>,
}

/// Calibrations a run consumes. Tables are immutable, so sharing them
/// across concurrent runs is free.
pub struct RunCalibrations {
    /// `(wavelength, power) → EOM drive voltage` table.
    pub power: Arc<CalibrationTable>,
    /// Rotator phase/coupling calibration; raw angles are commanded when
    /// absent.
    pub polarization: Option<Arc<PolarizationCalibration>>,
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory for run checkpoints; no checkpoints when unset.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Points between periodic checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    /// Poll interval while paused.
    #[serde(default = "default_pause_poll", with = "humantime_serde")]
    pub pause_poll: Duration,
}

fn default_checkpoint_interval() -> usize {
    25
}
fn default_pause_poll() -> Duration {
    Duration::from_millis(50)
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            checkpoint_interval: default_checkpoint_interval(),
            pause_poll: default_pause_poll(),
        }
    }
}

/// Live view of run progress, published through a watch channel.
#[derive(Debug, Clone)]
pub struct RunStatus {
    /// Identifier of the run being reported on.
    pub run_id: Uuid,
    /// Current lifecycle state.
    pub state: RunState,
    /// Sweep points recorded so far.
    pub points_completed: usize,
    /// Total points in the sweep.
    pub total_points: usize,
    /// Point currently being acquired.
    pub current: Option<SweepCoord>,
    /// Most recent live power-law fit at the current wavelength/angle.
    pub live_fit: Option<PowerLawFit>,
    /// Error message from a failed run.
    pub last_error: Option<String>,
}

/// Callback surface for front-ends following a headless run.
///
/// All methods have empty defaults; implement only what you need.
/// Callbacks run on the worker task, so they must return promptly.
pub trait RunObserver: Send + Sync {
    /// Lifecycle state changed.
    fn on_state(&self, _state: RunState) {}
    /// A sweep point was recorded.
    fn on_point(&self, _point: &SweepPoint) {}
    /// The live power-law fit was refreshed.
    fn on_live_fit(&self, _wavelength_nm: f64, _angle_deg: f64, _fit: &PowerLawFit) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Handle to a running sweep.
///
/// Pause, resume, and cancel are cooperative signals checked at point
/// boundaries. Cancelling finishes the point in flight, persists partial
/// data, and ends the run `Cancelled`.
pub struct RunHandle {
    run_id: Uuid,
    pause: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    status_rx: watch::Receiver<RunStatus>,
    join: JoinHandle<Result<Dataset, ShgError>>,
}

impl RunHandle {
    /// Identifier of the run this handle controls.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request a pause at the next point boundary.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Clear a pending or active pause.
    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    /// Request cancellation at the next point boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Latest published status.
    pub fn status(&self) -> RunStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribe to status updates.
    pub fn watch(&self) -> watch::Receiver<RunStatus> {
        self.status_rx.clone()
    }

    /// Wait for the run to finish and take its dataset.
    ///
    /// Completed and cancelled runs both return their (sealed) dataset;
    /// failures return the error after partial data has been persisted to
    /// the sink.
    pub async fn wait(self) -> Result<Dataset, ShgError> {
        match self.join.await {
            Ok(result) => result,
            Err(join_err) => Err(ShgError::Run {
                run_id: self.run_id.to_string(),
                index: 0,
                message: format!("worker task aborted: {join_err}"),
            }),
        }
    }
}

/// Spawns and supervises sweep workers.
pub struct RunEngine;

impl RunEngine {
    /// Start a sweep on a dedicated worker task.
    ///
    /// Returns immediately; validation happens in the worker's
    /// `Initializing` phase and surfaces as a `Failed` terminal state.
    pub fn start(
        devices: RunDevices,
        calibrations: RunCalibrations,
        spec: SweepSpec,
        sink: Arc<dyn DataSink>,
        observer: Arc<dyn RunObserver>,
        config: RunConfig,
    ) -> RunHandle {
        let run_id = Uuid::new_v4();
        let pause = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let (status_tx, status_rx) = watch::channel(RunStatus {
            run_id,
            state: RunState::Idle,
            points_completed: 0,
            total_points: spec.total_points(),
            current: None,
            live_fit: None,
            last_error: None,
        });

        let worker = Worker {
            devices,
            calibrations,
            spec,
            sink,
            observer,
            config,
            run_id,
            pause: pause.clone(),
            cancel: cancel.clone(),
            status_tx,
        };
        let join = tokio::spawn(worker.run());

        RunHandle {
            run_id,
            pause,
            cancel,
            status_rx,
            join,
        }
    }
}

/// Per-wavelength acquisition context carried across points.
#[derive(Default)]
struct PointContext {
    wavelength_index: Option<usize>,
    background: f64,
    drive_key: Option<(usize, usize)>,
    drive_v: f64,
}

struct Worker {
    devices: RunDevices,
    calibrations: RunCalibrations,
    spec: SweepSpec,
    sink: Arc<dyn DataSink>,
    observer: Arc<dyn RunObserver>,
    config: RunConfig,
    run_id: Uuid,
    pause: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    status_tx: watch::Sender<RunStatus>,
}

impl Worker {
    fn set_state(&self, state: RunState) {
        self.status_tx.send_modify(|s| s.state = state);
        self.observer.on_state(state);
        info!(run_id = %self.run_id, %state, "run state");
    }

    fn fail_status(&self, error: &ShgError) {
        self.status_tx.send_modify(|s| {
            s.state = RunState::Failed;
            s.last_error = Some(error.to_string());
        });
        self.observer.on_state(RunState::Failed);
    }

    async fn run(self) -> Result<Dataset, ShgError> {
        self.set_state(RunState::Initializing);
        if let Err(err) = self.initialize().await {
            warn!(run_id = %self.run_id, %err, "initialization failed");
            self.fail_status(&err);
            self.write_checkpoint(RunState::Failed, 0, Some(err.to_string()), None);
            return Err(err);
        }

        let mut dataset = Dataset::new(&self.spec, self.metadata());
        self.set_state(RunState::Running);

        let mut ctx = PointContext::default();
        let total = self.spec.total_points();
        let mut cancelled = false;

        for index in 0..total {
            // Cooperative signals, point boundary only.
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            if self.pause.load(Ordering::SeqCst) {
                self.set_state(RunState::Paused);
                self.write_checkpoint(RunState::Paused, dataset.points_recorded(), None, None);
                while self.pause.load(Ordering::SeqCst) && !self.cancel.load(Ordering::SeqCst) {
                    sleep(self.config.pause_poll).await;
                }
                if self.cancel.load(Ordering::SeqCst) {
                    cancelled = true;
                    break;
                }
                self.set_state(RunState::Running);
            }

            let coord = match self.spec.coord(index) {
                Some(c) => c,
                None => break,
            };
            self.status_tx.send_modify(|s| s.current = Some(coord));

            let point = match self.acquire_point(coord, &mut ctx).await {
                Ok(point) => point,
                Err(err) if err.is_device() => {
                    warn!(
                        run_id = %self.run_id,
                        index, %err, "device error; retrying point once"
                    );
                    match self.acquire_point(coord, &mut ctx).await {
                        Ok(point) => point,
                        Err(err) => return self.fail(dataset, index, err).await,
                    }
                }
                Err(err) => return self.fail(dataset, index, err).await,
            };

            self.observer.on_point(&point);
            dataset.record(point)?;
            let completed = dataset.points_recorded();
            self.status_tx.send_modify(|s| s.points_completed = completed);

            self.update_live_fit(&dataset, coord);

            if self.config.checkpoint_interval > 0 && completed % self.config.checkpoint_interval == 0
            {
                self.write_checkpoint(RunState::Running, completed, None, None);
            }
        }

        dataset.seal();
        let dataset_path = self.sink.save(&dataset).await?;
        let final_state = if cancelled {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        self.write_checkpoint(final_state, dataset.points_recorded(), None, dataset_path);
        self.set_state(final_state);
        info!(
            run_id = %self.run_id,
            points = dataset.points_recorded(),
            total = total,
            %final_state,
            "run finished"
        );
        Ok(dataset)
    }

    /// Validate calibration coverage and device responsiveness.
    async fn initialize(&self) -> Result<(), ShgError> {
        self.spec.validate()?;

        for &wl in [
            self.spec.wavelengths_nm.first(),
            self.spec.wavelengths_nm.last(),
        ]
        .into_iter()
        .flatten()
        {
            for &p in [self.spec.powers_mw.first(), self.spec.powers_mw.last()]
                .into_iter()
                .flatten()
            {
                if !self.calibrations.power.covers(&[wl, p]) {
                    return Err(ShgError::Config(format!(
                        "power table does not cover sweep corner ({wl} nm, {p} mW)"
                    )));
                }
            }
        }

        let bound = self.spec.device_timeout;
        with_timeout("wavelength", bound, self.devices.wavelength.position()).await?;
        with_timeout("eom", bound, self.devices.eom.position()).await?;
        with_timeout("rotator", bound, self.devices.rotator.position()).await?;
        Ok(())
    }

    fn metadata(&self) -> DatasetMeta {
        let mut calibration_ids = vec![self.calibrations.power.id];
        if let Some(pol) = &self.calibrations.polarization {
            if let Some(table) = &pol.phase_table {
                calibration_ids.push(table.id);
            }
        }
        let mut snapshot = HashMap::new();
        snapshot.insert(
            "wavelength_unit".into(),
            self.devices.wavelength.unit().to_string(),
        );
        snapshot.insert("eom_unit".into(), self.devices.eom.unit().to_string());
        snapshot.insert("rotator_unit".into(), self.devices.rotator.unit().to_string());
        DatasetMeta {
            run_id: self.run_id,
            started: Utc::now(),
            finished: None,
            calibration_ids,
            device_snapshot: snapshot,
            wavelengths_nm: self.spec.wavelengths_nm.clone(),
            powers_mw: self.spec.powers_mw.clone(),
            angles_deg: self.spec.angles_deg.clone(),
        }
    }

    /// Command devices and read one sweep point.
    ///
    /// Context fields are updated only after the corresponding device
    /// interaction succeeds, so a retried point redoes exactly the steps
    /// that had not completed.
    async fn acquire_point(
        &self,
        coord: SweepCoord,
        ctx: &mut PointContext,
    ) -> Result<SweepPoint, ShgError> {
        let bound = self.spec.device_timeout;
        if ctx.wavelength_index != Some(coord.wavelength_index) {
            with_timeout(
                "wavelength",
                bound,
                self.devices.wavelength.move_abs(coord.wavelength_nm),
            )
            .await?;
            sleep(self.spec.settle).await;
            let background = self.capture_background().await?;
            ctx.wavelength_index = Some(coord.wavelength_index);
            ctx.background = background;
            ctx.drive_key = None;
        }

        let drive_key = (coord.wavelength_index, coord.power_index);
        if ctx.drive_key != Some(drive_key) {
            let drive = self
                .calibrations
                .power
                .lookup(&[coord.wavelength_nm, coord.power_mw])?;
            with_timeout("eom", bound, self.devices.eom.move_abs(drive)).await?;
            ctx.drive_key = Some(drive_key);
            ctx.drive_v = drive;
        }

        let rotator_deg = match &self.calibrations.polarization {
            Some(pol) => pol.commanded_angle(coord.angle_deg, coord.wavelength_nm, 0.0),
            None => coord.angle_deg,
        };
        with_timeout("rotator", bound, self.devices.rotator.move_abs(rotator_deg)).await?;
        sleep(self.spec.settle).await;

        let mut total = 0.0;
        for _ in 0..self.spec.averages.max(1) {
            sleep(self.devices.detector.integration_time()).await;
            total += with_timeout("detector", bound, self.devices.detector.acquire())
                .await?
                .mean();
        }
        let raw = total / self.spec.averages.max(1) as f64;

        Ok(SweepPoint {
            coord,
            commanded: CommandedValues {
                drive_v: ctx.drive_v,
                rotator_deg,
            },
            measured: raw - ctx.background,
            background: ctx.background,
            timestamp: Utc::now(),
        })
    }

    /// Shutter-blocked background, captured once per wavelength.
    async fn capture_background(&self) -> Result<f64, ShgError> {
        let shutter = match (&self.devices.shutter, self.spec.subtract_background) {
            (Some(shutter), true) => shutter,
            _ => return Ok(0.0),
        };
        let bound = self.spec.device_timeout;
        with_timeout("shutter", bound, shutter.close()).await?;
        sleep(self.spec.settle).await;
        let mut total = 0.0;
        for _ in 0..self.spec.averages.max(1) {
            sleep(self.devices.detector.integration_time()).await;
            total += with_timeout("detector", bound, self.devices.detector.acquire())
                .await?
                .mean();
        }
        with_timeout("shutter", bound, shutter.open()).await?;
        sleep(self.spec.settle).await;
        Ok(total / self.spec.averages.max(1) as f64)
    }

    fn update_live_fit(&self, dataset: &Dataset, coord: SweepCoord) {
        let (powers, signal) =
            dataset.signal_vs_power(coord.wavelength_index, coord.angle_index);
        if powers.len() < 3 {
            return;
        }
        if let Ok(fit) = fit_power_law(&powers, &signal) {
            self.observer
                .on_live_fit(coord.wavelength_nm, coord.angle_deg, &fit);
            self.status_tx.send_modify(|s| s.live_fit = Some(fit));
        }
    }

    /// Persist partial data, checkpoint, and surface the failure.
    async fn fail(
        &self,
        mut dataset: Dataset,
        index: usize,
        err: ShgError,
    ) -> Result<Dataset, ShgError> {
        warn!(run_id = %self.run_id, index, %err, "run failed");
        dataset.seal();
        let dataset_path = match self.sink.save(&dataset).await {
            Ok(path) => path,
            Err(save_err) => {
                warn!(run_id = %self.run_id, %save_err, "failed to persist partial dataset");
                None
            }
        };
        let run_err = ShgError::Run {
            run_id: self.run_id.to_string(),
            index,
            message: err.to_string(),
        };
        self.fail_status(&run_err);
        self.write_checkpoint(
            RunState::Failed,
            dataset.points_recorded(),
            Some(err.to_string()),
            dataset_path,
        );
        Err(run_err)
    }

    fn write_checkpoint(
        &self,
        state: RunState,
        points: usize,
        error: Option<String>,
        dataset_path: Option<PathBuf>,
    ) {
        let dir = match &self.config.checkpoint_dir {
            Some(dir) => dir.clone(),
            None => return,
        };
        let mut checkpoint = RunCheckpoint::new(
            self.run_id.to_string(),
            state,
            points,
            self.spec.total_points(),
        );
        if let Some(error) = error {
            checkpoint = checkpoint.with_error(error);
        }
        if let Some(dataset_path) = dataset_path {
            checkpoint = checkpoint.with_dataset_path(dataset_path);
        }
        let path = checkpoint.default_path(&dir);
        if let Err(err) = checkpoint.save(&path) {
            warn!(run_id = %self.run_id, %err, "checkpoint write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::table::{AxisSpec, Extrapolation};
    use crate::hardware::mock::{MockActuator, MockDetector, MockShutter};
    use crate::storage::MemorySink;
    use ndarray::{ArrayD, IxDyn};

    fn power_table() -> CalibrationTable {
        // drive = power (identity map) over the test ranges.
        let wl = AxisSpec::new("wavelength", "nm", vec![780.0, 820.0]).unwrap();
        let p = AxisSpec::new("power", "mW", vec![0.0, 10.0]).unwrap();
        let values =
            ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![0.0, 10.0, 0.0, 10.0]).unwrap();
        CalibrationTable::from_grid(vec![wl, p], values, Extrapolation::Error).unwrap()
    }

    fn spec() -> SweepSpec {
        SweepSpec {
            wavelengths_nm: vec![790.0, 810.0],
            powers_mw: vec![1.0, 2.0, 4.0],
            angles_deg: vec![0.0, 60.0],
            averages: 1,
            settle: Duration::from_millis(0),
            subtract_background: true,
            device_timeout: Duration::from_secs(1),
        }
    }

    struct Bench {
        devices: RunDevices,
        calibrations: RunCalibrations,
        detector: Arc<MockDetector>,
    }

    /// Quadratic SHG bench: signal = drive² · cos²(angle) + dark floor,
    /// zero when the shutter is closed except for the floor.
    fn bench() -> Bench {
        let wavelength = Arc::new(MockActuator::new("laser", "nm", 700.0, 900.0));
        let eom = Arc::new(MockActuator::new("eom", "V", 0.0, 10.0));
        let rotator = Arc::new(MockActuator::new("rotator", "deg", -360.0, 360.0));
        let shutter = Arc::new(MockShutter::new());

        let drive = eom.value_handle();
        let angle = rotator.value_handle();
        let open = shutter.open_handle();
        let detector = Arc::new(MockDetector::from_fn(move || {
            let floor = 0.05;
            if !open.load(Ordering::SeqCst) {
                return floor;
            }
            let d = drive.try_read().map(|v| *v).unwrap_or(0.0);
            let a = angle.try_read().map(|v| *v).unwrap_or(0.0);
            d * d * a.to_radians().cos().powi(2) + floor
        }));

        Bench {
            devices: RunDevices {
                wavelength,
                eom,
                rotator,
                detector: detector.clone(),
                shutter: Some(shutter),
            },
            calibrations: RunCalibrations {
                power: Arc::new(power_table()),
                polarization: None,
            },
            detector,
        }
    }

    #[tokio::test]
    async fn full_sweep_completes_with_background_subtracted() {
        let bench = bench();
        let sink = Arc::new(MemorySink::new());
        let handle = RunEngine::start(
            bench.devices,
            bench.calibrations,
            spec(),
            sink.clone(),
            Arc::new(NoopObserver),
            RunConfig::default(),
        );
        let dataset = handle.wait().await.unwrap();

        assert!(dataset.is_sealed());
        assert_eq!(dataset.points_recorded(), 12);
        // drive = power, signal = drive², background removed.
        assert!((dataset.value(0, 2, 0) - 16.0).abs() < 1e-9);
        assert!((dataset.value(1, 1, 0) - 4.0).abs() < 1e-9);
        // cos²(60°) = 0.25.
        assert!((dataset.value(0, 2, 1) - 4.0).abs() < 1e-9);

        let saved = sink.datasets();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].points_recorded(), 12);
    }

    #[tokio::test]
    async fn uncovered_sweep_fails_before_running() {
        let bench = bench();
        let mut s = spec();
        s.wavelengths_nm = vec![600.0]; // outside the power table
        let sink = Arc::new(MemorySink::new());
        let handle = RunEngine::start(
            bench.devices,
            bench.calibrations,
            s,
            sink.clone(),
            Arc::new(NoopObserver),
            RunConfig::default(),
        );
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, ShgError::Config(_)));
        // Nothing was acquired or persisted.
        assert!(sink.datasets().is_empty());
        assert_eq!(bench.detector.acquisition_count(), 0);
    }

    #[tokio::test]
    async fn single_device_error_is_retried() {
        let bench = bench();
        bench.detector.fail_times(1);
        let handle = RunEngine::start(
            bench.devices,
            bench.calibrations,
            spec(),
            Arc::new(MemorySink::new()),
            Arc::new(NoopObserver),
            RunConfig::default(),
        );
        let dataset = handle.wait().await.unwrap();
        assert_eq!(dataset.points_recorded(), 12);
    }

    #[tokio::test]
    async fn repeated_device_errors_fail_with_partial_data() {
        let bench = bench();
        // Every acquisition fails, so the first point fails even after its
        // retry.
        bench.detector.fail_times(usize::MAX);
        let sink = Arc::new(MemorySink::new());
        let handle = RunEngine::start(
            bench.devices,
            bench.calibrations,
            spec(),
            sink.clone(),
            Arc::new(NoopObserver),
            RunConfig::default(),
        );
        let err = handle.wait().await.unwrap_err();
        match err {
            ShgError::Run { index, .. } => assert_eq!(index, 0),
            other => panic!("unexpected error: {other}"),
        }
        // Partial (empty) dataset still persisted and sealed.
        let saved = sink.datasets();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].is_sealed());
    }

    #[tokio::test]
    async fn observer_sees_live_power_law_fit() {
        struct FitSpy(std::sync::Mutex<Vec<PowerLawFit>>);
        impl RunObserver for FitSpy {
            fn on_live_fit(&self, _wl: f64, _angle: f64, fit: &PowerLawFit) {
                if let Ok(mut fits) = self.0.lock() {
                    fits.push(*fit);
                }
            }
        }

        let bench = bench();
        let spy = Arc::new(FitSpy(std::sync::Mutex::new(Vec::new())));
        let handle = RunEngine::start(
            bench.devices,
            bench.calibrations,
            spec(),
            Arc::new(MemorySink::new()),
            spy.clone(),
            RunConfig::default(),
        );
        handle.wait().await.unwrap();

        let fits = spy.0.lock().unwrap();
        assert!(!fits.is_empty());
        // Signal ∝ power², so the live exponent settles near 2.
        let last = fits.last().unwrap();
        assert!((last.exponent - 2.0).abs() < 0.05, "n = {}", last.exponent);
    }

    /// Detector that accepts the acquisition request and never answers.
    struct StalledDetector;

    #[async_trait::async_trait]
    impl crate::hardware::capabilities::Detector for StalledDetector {
        async fn acquire(
            &self,
        ) -> Result<crate::hardware::capabilities::DetectorReading, crate::error::DeviceError>
        {
            std::future::pending().await
        }

        fn integration_time(&self) -> Duration {
            Duration::from_millis(0)
        }
    }

    #[tokio::test]
    async fn hung_detector_fails_the_run_within_the_device_timeout() {
        let mut bench = bench();
        bench.devices.detector = Arc::new(StalledDetector);
        bench.devices.shutter = None;
        let mut s = spec();
        s.subtract_background = false;
        s.device_timeout = Duration::from_millis(20);
        let sink = Arc::new(MemorySink::new());
        let handle = RunEngine::start(
            bench.devices,
            bench.calibrations,
            s,
            sink.clone(),
            Arc::new(NoopObserver),
            RunConfig::default(),
        );

        // The run must end on its own, not ride on an external abort.
        let err = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("run did not terminate despite the device timeout")
            .unwrap_err();
        match err {
            ShgError::Run { index, message, .. } => {
                assert_eq!(index, 0);
                assert!(
                    message.contains("'detector' did not respond"),
                    "message: {message}"
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        // Partial (empty) dataset still persisted.
        assert_eq!(sink.datasets().len(), 1);
    }

    #[tokio::test]
    async fn final_checkpoint_records_where_the_dataset_landed() {
        use crate::storage::JsonSink;

        let bench = bench();
        let data_dir = tempfile::tempdir().unwrap();
        let ckpt_dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonSink::new(data_dir.path()));
        let handle = RunEngine::start(
            bench.devices,
            bench.calibrations,
            spec(),
            sink.clone(),
            Arc::new(NoopObserver),
            RunConfig {
                checkpoint_dir: Some(ckpt_dir.path().to_path_buf()),
                ..RunConfig::default()
            },
        );
        let run_id = handle.run_id();
        let dataset = handle.wait().await.unwrap();

        let checkpoint = RunCheckpoint::load(
            ckpt_dir
                .path()
                .join(run_id.to_string())
                .join("checkpoint_000012.json"),
        )
        .unwrap();
        assert_eq!(checkpoint.state, RunState::Completed);
        let dataset_path = checkpoint.dataset_path.expect("dataset location recorded");
        assert_eq!(dataset_path, sink.path_for(&dataset));
        assert!(dataset_path.exists());
    }
}
