//! Run lifecycle state and checkpointing.

use crate::error::ShgError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Lifecycle state of an experiment run.
///
/// Transitions are monotonic except the `Running ⇄ Paused` cycle:
///
/// ```text
/// Idle → Initializing → Running ⇄ Paused
///                          │
///                          ├──> Completed
///                          ├──> Failed
///                          └──> Cancelled
/// ```
///
/// `Initializing` failures go straight to `Failed` without ever reaching
/// `Running`. Once terminal, no further sweep points execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// No run active.
    Idle,
    /// Validating calibrations and device responsiveness.
    Initializing,
    /// Visiting sweep points.
    Running,
    /// Suspended at a point boundary; resumable.
    Paused,
    /// All points collected.
    Completed,
    /// Aborted on an unrecoverable error; partial data preserved.
    Failed,
    /// Cancelled cooperatively; partial data preserved.
    Cancelled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "Idle",
            RunState::Initializing => "Initializing",
            RunState::Running => "Running",
            RunState::Paused => "Paused",
            RunState::Completed => "Completed",
            RunState::Failed => "Failed",
            RunState::Cancelled => "Cancelled",
        };
        write!(f, "{name}")
    }
}

impl RunState {
    /// True while pausing is meaningful.
    pub fn can_pause(&self) -> bool {
        matches!(self, RunState::Running)
    }

    /// True while resuming is meaningful.
    pub fn can_resume(&self) -> bool {
        matches!(self, RunState::Paused)
    }

    /// True once no further sweep points will execute.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

/// Serializable snapshot of run progress, written at configurable point
/// intervals and on failure so an operator can see where a run stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCheckpoint {
    /// Run identifier.
    pub run_id: String,
    /// Checkpoint creation time.
    pub timestamp: DateTime<Utc>,
    /// State at checkpoint time.
    pub state: RunState,
    /// Sweep points recorded so far.
    pub points_completed: usize,
    /// Total points in the sweep.
    pub total_points: usize,
    /// Error message when the checkpoint was written on a failure path.
    pub error: Option<String>,
    /// Where the partial dataset was persisted, if anywhere.
    pub dataset_path: Option<PathBuf>,
}

impl RunCheckpoint {
    /// Checkpoint stamped with the current time, no error, no dataset
    /// location.
    pub fn new(run_id: String, state: RunState, points_completed: usize, total_points: usize) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            state,
            points_completed,
            total_points,
            error: None,
            dataset_path: None,
        }
    }

    /// Attach the error the run stopped on.
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach where the sink persisted the dataset.
    pub fn with_dataset_path(mut self, path: PathBuf) -> Self {
        self.dataset_path = Some(path);
        self
    }

    /// Save to a JSON file, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ShgError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    /// Load from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ShgError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Default path under a checkpoint directory:
    /// `<dir>/<run_id>/checkpoint_<points>.json`.
    pub fn default_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.run_id)
            .join(format!("checkpoint_{:06}.json", self.points_completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn transition_guards() {
        assert!(RunState::Running.can_pause());
        assert!(!RunState::Paused.can_pause());
        assert!(RunState::Paused.can_resume());
        assert!(!RunState::Running.can_resume());
        assert!(RunState::Cancelled.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(!RunState::Initializing.is_terminal());
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = tempdir().unwrap();
        let checkpoint = RunCheckpoint::new("run-42".into(), RunState::Paused, 17, 120)
            .with_error("meter unplugged".into())
            .with_dataset_path(PathBuf::from("data/run-42.json"));
        let path = checkpoint.default_path(dir.path());
        checkpoint.save(&path).unwrap();

        let loaded = RunCheckpoint::load(&path).unwrap();
        assert_eq!(loaded.run_id, "run-42");
        assert_eq!(loaded.state, RunState::Paused);
        assert_eq!(loaded.points_completed, 17);
        assert_eq!(loaded.total_points, 120);
        assert_eq!(loaded.error.as_deref(), Some("meter unplugged"));
        assert_eq!(loaded.dataset_path.as_deref(), Some(Path::new("data/run-42.json")));
    }
}
