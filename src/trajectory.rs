//! Trajectory data: timestamped frames of raw joint positions, with JSON
//! save/load.
//!
//! Frames always carry raw encoder ticks. Calibration sits alongside for
//! presentation-layer translation and never gates recording or playback.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One timestamped sample of all joints' raw positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Seconds since the start of the recording (monotonic).
    pub t: f64,
    /// Servo ID → raw position.
    #[serde(rename = "pos")]
    pub positions: BTreeMap<u8, u16>,
}

/// An ordered sequence of frames with its nominal sample period.
///
/// Owned by the recorder while capturing, then handed out as an immutable
/// snapshot for playback or storage. The first frame's `t` is the time
/// origin for playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub name: String,
    pub sample_period_s: f64,
    pub servo_ids: Vec<u8>,
    pub frames: Vec<Frame>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Time span covered by the frames, in seconds.
    pub fn duration_s(&self) -> f64 {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => last.t - first.t,
            _ => 0.0,
        }
    }

    /// Write the trajectory as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::persistence(format!("encode {}: {}", path.display(), e)))?;
        std::fs::write(path, json)
            .map_err(|e| Error::persistence(format!("write {}: {}", path.display(), e)))?;
        tracing::info!("saved {} frame(s) to {}", self.frames.len(), path.display());
        Ok(())
    }

    /// Read a trajectory from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::persistence(format!("read {}: {}", path.display(), e)))?;
        let trajectory: Trajectory = serde_json::from_str(&content)
            .map_err(|e| Error::persistence(format!("parse {}: {}", path.display(), e)))?;
        tracing::info!(
            "loaded {} frame(s) from {}",
            trajectory.frames.len(),
            path.display()
        );
        Ok(trajectory)
    }
}
