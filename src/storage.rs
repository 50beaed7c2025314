//! Dataset persistence.
//!
//! The runtime hands finished (or partial) datasets to a [`DataSink`]; how
//! and where they land is the sink's business. [`JsonSink`] is the bundled
//! implementation; [`MemorySink`] keeps datasets in memory for tests and
//! embedding.

use crate::error::ShgError;
use crate::experiment::dataset::Dataset;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Persistence sink for sweep datasets.
///
/// `save` is called with the dataset and its provenance already bundled;
/// partial datasets from cancelled or failed runs arrive through the same
/// path as completed ones. Sinks that write to a locatable place return
/// that location so run checkpoints can record where the data went.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Persist the dataset, returning its location when it has one.
    async fn save(&self, dataset: &Dataset) -> Result<Option<PathBuf>, ShgError>;
}

/// Writes each dataset as pretty-printed JSON under a base directory,
/// named by run id.
pub struct JsonSink {
    dir: PathBuf,
}

impl JsonSink {
    /// Sink writing under `dir`, created on first save.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path a given run's dataset is written to.
    pub fn path_for(&self, dataset: &Dataset) -> PathBuf {
        self.dir.join(format!("{}.json", dataset.meta.run_id))
    }
}

#[async_trait]
impl DataSink for JsonSink {
    async fn save(&self, dataset: &Dataset) -> Result<Option<PathBuf>, ShgError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(dataset);
        let json = serde_json::to_string_pretty(dataset)?;
        fs::write(&path, json)?;
        info!(path = %path.display(), points = dataset.points_recorded(), "dataset saved");
        Ok(Some(path))
    }
}

/// Keeps saved datasets in memory. Repeated saves of the same run replace
/// the earlier copy, mirroring how a file sink overwrites.
#[derive(Default)]
pub struct MemorySink {
    saved: Mutex<Vec<Dataset>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything saved so far.
    pub fn datasets(&self) -> Vec<Dataset> {
        match self.saved.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn save(&self, dataset: &Dataset) -> Result<Option<PathBuf>, ShgError> {
        let mut guard = match self.saved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = guard
            .iter_mut()
            .find(|d| d.meta.run_id == dataset.meta.run_id)
        {
            *existing = dataset.clone();
        } else {
            guard.push(dataset.clone());
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::dataset::DatasetMeta;
    use crate::experiment::sweep::SweepSpec;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn dataset() -> Dataset {
        let spec = SweepSpec {
            wavelengths_nm: vec![800.0],
            powers_mw: vec![1.0],
            angles_deg: vec![0.0],
            averages: 1,
            settle: Duration::from_millis(0),
            subtract_background: false,
            device_timeout: Duration::from_secs(1),
        };
        let meta = DatasetMeta {
            run_id: Uuid::new_v4(),
            started: Utc::now(),
            finished: None,
            calibration_ids: Vec::new(),
            device_snapshot: HashMap::new(),
            wavelengths_nm: vec![800.0],
            powers_mw: vec![1.0],
            angles_deg: vec![0.0],
        };
        Dataset::new(&spec, meta)
    }

    #[tokio::test]
    async fn json_sink_writes_loadable_file() {
        let dir = tempdir().unwrap();
        let sink = JsonSink::new(dir.path());
        let ds = dataset();
        let location = sink.save(&ds).await.unwrap();
        assert_eq!(location, Some(sink.path_for(&ds)));

        let json = fs::read_to_string(sink.path_for(&ds)).unwrap();
        let back: Dataset = serde_json::from_str(&json).unwrap();
        assert_eq!(back.meta.run_id, ds.meta.run_id);
    }

    #[tokio::test]
    async fn memory_sink_replaces_same_run() {
        let sink = MemorySink::new();
        let ds = dataset();
        sink.save(&ds).await.unwrap();
        sink.save(&ds).await.unwrap();
        assert_eq!(sink.datasets().len(), 1);
    }
}
