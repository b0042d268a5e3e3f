//! Three-point joint calibration: records, persistent store, and the manual
//! and automatic capture procedures.
//!
//! A calibration record pins a joint's usable arc with three raw encoder
//! positions (`left`, `right`, `center`). Records are all-or-nothing: the
//! store only ever holds complete records, and partial state lives in the
//! [`ManualSession`] until its third slot is captured.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::arm::Arm;
use crate::config::{ArmConfig, Joint, RING_SIZE};
use crate::error::{Error, Result};
use crate::ring::{self, PathDescriptor};

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A complete three-point calibration for one joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationRecord {
    /// Servo bus address.
    pub id: u8,
    /// Raw position at the logical left end of the arc.
    pub left: u16,
    /// Raw position at the logical right end of the arc.
    pub right: u16,
    /// Raw position somewhere on the arc; picks which of the two arcs
    /// between `left` and `right` is calibrated.
    pub center: u16,
}

impl CalibrationRecord {
    pub fn new(id: u8, left: u16, right: u16, center: u16) -> Self {
        Self {
            id,
            left,
            right,
            center,
        }
    }

    /// The calibrated path this record describes.
    pub fn path(&self) -> PathDescriptor {
        ring::path(self.left, self.right, self.center)
    }

    /// Whether the calibrated arc crosses the encoder's zero tick.
    pub fn wraps(&self) -> bool {
        self.path().wraps
    }

    /// Raw tick → normalized `[0, 1]` along the calibrated arc.
    pub fn normalize(&self, raw: u16) -> f64 {
        ring::normalize(raw, self.left, self.right, self.center)
    }

    /// Normalized `[0, 1]` → raw tick on the calibrated arc.
    pub fn denormalize(&self, value: f64) -> u16 {
        ring::denormalize(value, self.left, self.right, self.center)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// On-disk entry. The current format carries the three points; the legacy
/// format carried only `min_position`/`max_position`, accepted on load with
/// the center synthesized at the integer midpoint.
#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    motor_id: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pos_left: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pos_right: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pos_center: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_position: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_position: Option<u16>,
}

/// Owns every joint's calibration record and persists the mapping as JSON,
/// keyed by joint name.
///
/// Persistence failures are logged, never fatal: a lost save is recoverable
/// by recalibrating.
#[derive(Debug)]
pub struct CalibrationStore {
    path: PathBuf,
    records: BTreeMap<String, CalibrationRecord>,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, joint: &str) -> Option<&CalibrationRecord> {
        self.records.get(joint)
    }

    /// Record lookup that surfaces the "recalibrate" signal as an error.
    pub fn require(&self, joint: &str) -> Result<&CalibrationRecord> {
        self.records
            .get(joint)
            .ok_or_else(|| Error::NotCalibrated(joint.to_string()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CalibrationRecord)> {
        self.records.iter()
    }

    /// Replace a joint's record wholesale and persist.
    pub fn set(&mut self, joint: &str, record: CalibrationRecord) {
        self.records.insert(joint.to_string(), record);
        if let Err(e) = self.persist() {
            tracing::warn!("failed to save calibration for '{}': {}", joint, e);
        }
    }

    /// Remove a joint's record and persist.
    pub fn clear(&mut self, joint: &str) {
        if self.records.remove(joint).is_some() {
            if let Err(e) = self.persist() {
                tracing::warn!("failed to save calibration after clearing '{}': {}", joint, e);
            }
        }
    }

    /// Serialize the full mapping to the calibration file.
    pub fn persist(&self) -> Result<()> {
        let entries: BTreeMap<&String, FileEntry> = self
            .records
            .iter()
            .map(|(name, rec)| {
                (
                    name,
                    FileEntry {
                        motor_id: rec.id,
                        pos_left: Some(rec.left),
                        pos_right: Some(rec.right),
                        pos_center: Some(rec.center),
                        min_position: None,
                        max_position: None,
                    },
                )
            })
            .collect();
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| Error::persistence(format!("encode {}: {}", self.path.display(), e)))?;
        std::fs::write(&self.path, json)
            .map_err(|e| Error::persistence(format!("write {}: {}", self.path.display(), e)))?;
        tracing::info!(
            "saved {} calibration(s) to {}",
            self.records.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Load the calibration file if present.
    ///
    /// A missing or unreadable file is only an informational "no calibration
    /// yet" state. Entries for joints the config doesn't know are skipped.
    /// Returns the number of records loaded.
    pub fn load(&mut self, config: &ArmConfig) -> usize {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no calibration file at {}", self.path.display());
                return 0;
            }
            Err(e) => {
                tracing::warn!("cannot read {}: {}", self.path.display(), e);
                return 0;
            }
        };

        let entries: BTreeMap<String, FileEntry> = match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("cannot parse {}: {}", self.path.display(), e);
                return 0;
            }
        };

        let mut loaded = 0;
        for (name, entry) in entries {
            if config.joint_by_name(&name).is_none() {
                tracing::warn!("skipping calibration for unknown joint '{}'", name);
                continue;
            }

            // Legacy min/max form maps onto left/right; the center is
            // synthesized only when absent.
            let left = entry.pos_left.or(entry.min_position);
            let right = entry.pos_right.or(entry.max_position);
            let center = match (entry.pos_center, left, right) {
                (Some(c), _, _) => Some(c),
                (None, Some(l), Some(r)) => Some(((l as u32 + r as u32) / 2) as u16),
                _ => None,
            };

            let (Some(left), Some(right), Some(center)) = (left, right, center) else {
                tracing::warn!("incomplete calibration entry for '{}'", name);
                continue;
            };

            let record = CalibrationRecord::new(entry.motor_id, left, right, center);
            tracing::info!(
                "loaded '{}': L={} R={} C={}{}",
                name,
                left,
                right,
                center,
                if record.wraps() { " (wrap)" } else { "" }
            );
            self.records.insert(name, record);
            loaded += 1;
        }
        loaded
    }
}

// ---------------------------------------------------------------------------
// Manual calibration workflow
// ---------------------------------------------------------------------------

/// Which of the three calibration points a manual capture targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Left,
    Right,
    Center,
}

#[derive(Debug, Default, Clone, Copy)]
struct Slots {
    left: Option<u16>,
    right: Option<u16>,
    center: Option<u16>,
}

impl Slots {
    fn complete(&self) -> Option<(u16, u16, u16)> {
        Some((self.left?, self.right?, self.center?))
    }
}

/// Operator-driven calibration: capture raw positions for left/right/center
/// independently, in any order.
///
/// The moment all three slots are set the record is committed to the store
/// (which persists it). Re-capturing a slot overwrites it and re-commits; a
/// committed record only goes away via [`ManualSession::reset`].
#[derive(Debug, Default)]
pub struct ManualSession {
    slots: BTreeMap<String, Slots>,
}

impl ManualSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `raw` for one slot of `joint`. Returns `true` if this capture
    /// completed (or re-completed) the record and it was committed.
    pub fn capture(
        &mut self,
        joint: &Joint,
        slot: Slot,
        raw: u16,
        store: &mut CalibrationStore,
    ) -> bool {
        let slots = self.slots.entry(joint.name.clone()).or_default();
        match slot {
            Slot::Left => slots.left = Some(raw),
            Slot::Right => slots.right = Some(raw),
            Slot::Center => slots.center = Some(raw),
        }
        tracing::info!("captured {:?} = {} for '{}'", slot, raw, joint.name);

        if let Some((left, right, center)) = slots.complete() {
            store.set(
                &joint.name,
                CalibrationRecord::new(joint.id, left, right, center),
            );
            true
        } else {
            false
        }
    }

    /// Captured value of one slot, if any.
    pub fn slot(&self, joint: &str, slot: Slot) -> Option<u16> {
        let slots = self.slots.get(joint)?;
        match slot {
            Slot::Left => slots.left,
            Slot::Right => slots.right,
            Slot::Center => slots.center,
        }
    }

    /// Clear all three slots and remove the joint's record from the store.
    pub fn reset(&mut self, joint: &Joint, store: &mut CalibrationStore) {
        self.slots.remove(&joint.name);
        store.clear(&joint.name);
        tracing::info!("reset calibration for '{}'", joint.name);
    }
}

// ---------------------------------------------------------------------------
// Auto-calibration
// ---------------------------------------------------------------------------

/// Delays used by the auto-calibration procedure. Injectable so tests run
/// without real settling time.
#[derive(Debug, Clone, Copy)]
pub struct AutoCalTiming {
    /// After enabling torque.
    pub torque_settle: Duration,
    /// After commanding an extreme, before sampling starts.
    pub travel_settle: Duration,
    /// Between position samples.
    pub sample_interval: Duration,
    /// After commanding the midpoint at the end.
    pub center_settle: Duration,
}

impl Default for AutoCalTiming {
    fn default() -> Self {
        Self {
            torque_settle: Duration::from_millis(100),
            travel_settle: Duration::from_secs(1),
            sample_interval: Duration::from_millis(100),
            center_settle: Duration::from_millis(500),
        }
    }
}

impl AutoCalTiming {
    /// Zero delays, for tests.
    pub fn fast() -> Self {
        Self {
            torque_settle: Duration::ZERO,
            travel_settle: Duration::ZERO,
            sample_interval: Duration::ZERO,
            center_settle: Duration::ZERO,
        }
    }
}

/// Result of auto-calibrating one joint.
#[derive(Debug)]
pub struct AutoCalOutcome {
    pub joint: String,
    pub result: Result<CalibrationRecord>,
}

const SAMPLE_COUNT: usize = 10;
const AVERAGE_LAST: usize = 5;

/// Drives joints to their mechanical extremes and samples the settled
/// positions into a two-point calibration (center at the midpoint).
pub struct AutoCalibrator {
    arm: Arm,
    timing: AutoCalTiming,
}

impl AutoCalibrator {
    pub fn new(arm: Arm, timing: AutoCalTiming) -> Self {
        Self { arm, timing }
    }

    /// Calibrate the given joints sequentially. A joint that fails is
    /// reported and left uncalibrated; the rest of the batch continues.
    pub fn run(&self, joints: &[Joint], store: &mut CalibrationStore) -> Vec<AutoCalOutcome> {
        joints
            .iter()
            .map(|joint| {
                let result = self.calibrate_joint(joint, store);
                if let Err(e) = &result {
                    tracing::warn!("auto-calibration of '{}' failed: {}", joint.name, e);
                }
                AutoCalOutcome {
                    joint: joint.name.clone(),
                    result,
                }
            })
            .collect()
    }

    fn calibrate_joint(
        &self,
        joint: &Joint,
        store: &mut CalibrationStore,
    ) -> Result<CalibrationRecord> {
        tracing::info!("auto-calibrating '{}' (servo {})", joint.name, joint.id);
        let bus = self.arm.bus();

        lock(bus).set_torque(joint.id, true)?;
        std::thread::sleep(self.timing.torque_settle);

        let min = self.settle_at(joint.id, 0)?;
        tracing::info!("'{}' min extreme: {}", joint.name, min);

        let max = self.settle_at(joint.id, RING_SIZE - 1)?;
        tracing::info!("'{}' max extreme: {}", joint.name, max);

        // A flat reading means the joint stalled or never moved.
        if max <= min {
            return Err(Error::validation(format!(
                "'{}': max {} <= min {}",
                joint.name, max, min
            )));
        }

        let center = ((min as u32 + max as u32) / 2) as u16;
        let record = CalibrationRecord::new(joint.id, min, max, center);
        store.set(&joint.name, record);

        lock(bus).write_position(joint.id, center)?;
        std::thread::sleep(self.timing.center_settle);

        Ok(record)
    }

    /// Command one extreme, wait for travel, then sample repeatedly and
    /// average the tail of the samples. Averaging the last few rejects
    /// transient overshoot while the joint is still decelerating.
    fn settle_at(&self, id: u8, goal: u16) -> Result<u16> {
        lock(self.arm.bus()).write_position(id, goal)?;
        std::thread::sleep(self.timing.travel_settle);

        let mut samples = Vec::with_capacity(SAMPLE_COUNT);
        for _ in 0..SAMPLE_COUNT {
            let pos = lock(self.arm.bus()).read_position(id)?;
            samples.push(pos);
            std::thread::sleep(self.timing.sample_interval);
        }

        let tail = &samples[samples.len() - AVERAGE_LAST..];
        let sum: u32 = tail.iter().map(|&p| p as u32).sum();
        Ok((sum / AVERAGE_LAST as u32) as u16)
    }
}

fn lock(bus: &crate::bus::SharedBus) -> std::sync::MutexGuard<'_, dyn crate::bus::ServoBus + 'static> {
    match bus.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{shared, MockBus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_store() -> CalibrationStore {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "soarm-calibration-{}-{}.json",
            std::process::id(),
            n
        ));
        let _ = std::fs::remove_file(&path);
        CalibrationStore::new(path)
    }

    fn so_arm_with_mock() -> (Arm, MockBus) {
        let config = ArmConfig::so_arm();
        let mock = MockBus::new(&config.servo_ids());
        let arm = Arm::new(config, shared(mock.clone()));
        (arm, mock)
    }

    #[test]
    fn test_persist_and_reload() {
        let config = ArmConfig::so_arm();
        let mut store = temp_store();
        store.set("elbow_flex", CalibrationRecord::new(3, 100, 4000, 50));

        let mut reloaded = CalibrationStore::new(store.file_path());
        assert_eq!(reloaded.load(&config), 1);
        let rec = reloaded.get("elbow_flex").unwrap();
        assert_eq!((rec.id, rec.left, rec.right, rec.center), (3, 100, 4000, 50));
        assert!(rec.wraps());

        let _ = std::fs::remove_file(store.file_path());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let config = ArmConfig::so_arm();
        let mut store = temp_store();
        assert_eq!(store.load(&config), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_legacy_format_synthesizes_center() {
        let config = ArmConfig::so_arm();
        let mut store = temp_store();
        let json = r#"{
            "shoulder_pan": { "motor_id": 1, "min_position": 100, "max_position": 4000 },
            "unknown_joint": { "motor_id": 9, "min_position": 0, "max_position": 10 }
        }"#;
        std::fs::write(store.file_path(), json).unwrap();

        assert_eq!(store.load(&config), 1);
        let rec = store.get("shoulder_pan").unwrap();
        assert_eq!((rec.left, rec.right, rec.center), (100, 4000, 2050));
        assert!(store.get("unknown_joint").is_none());

        let _ = std::fs::remove_file(store.file_path());
    }

    #[test]
    fn test_load_keeps_explicit_center_over_midpoint() {
        let config = ArmConfig::so_arm();
        let mut store = temp_store();
        let json = r#"{
            "gripper": { "motor_id": 6, "pos_left": 100, "pos_right": 4000, "pos_center": 50 }
        }"#;
        std::fs::write(store.file_path(), json).unwrap();
        store.load(&config);
        assert_eq!(store.get("gripper").unwrap().center, 50);
        let _ = std::fs::remove_file(store.file_path());
    }

    #[test]
    fn test_load_corrupt_file_is_not_fatal() {
        let config = ArmConfig::so_arm();
        let mut store = temp_store();
        std::fs::write(store.file_path(), "not json {").unwrap();
        assert_eq!(store.load(&config), 0);
        let _ = std::fs::remove_file(store.file_path());
    }

    #[test]
    fn test_clear_removes_record() {
        let mut store = temp_store();
        store.set("wrist_roll", CalibrationRecord::new(5, 10, 20, 15));
        store.clear("wrist_roll");
        assert!(store.get("wrist_roll").is_none());
        assert!(store.require("wrist_roll").is_err());
        let _ = std::fs::remove_file(store.file_path());
    }

    #[test]
    fn test_manual_session_completes_in_any_order() {
        let mut store = temp_store();
        let mut session = ManualSession::new();
        let joint = Joint::new("wrist_flex", 4);

        assert!(!session.capture(&joint, Slot::Center, 2000, &mut store));
        assert!(store.get("wrist_flex").is_none());
        assert!(!session.capture(&joint, Slot::Right, 3500, &mut store));
        assert!(session.capture(&joint, Slot::Left, 500, &mut store));

        let rec = store.get("wrist_flex").unwrap();
        assert_eq!((rec.left, rec.right, rec.center), (500, 3500, 2000));
        let _ = std::fs::remove_file(store.file_path());
    }

    #[test]
    fn test_manual_recapture_overwrites_and_recommits() {
        let mut store = temp_store();
        let mut session = ManualSession::new();
        let joint = Joint::new("wrist_flex", 4);

        session.capture(&joint, Slot::Left, 500, &mut store);
        session.capture(&joint, Slot::Right, 3500, &mut store);
        session.capture(&joint, Slot::Center, 2000, &mut store);

        // Re-capturing stays complete; the record never regresses.
        assert!(session.capture(&joint, Slot::Left, 600, &mut store));
        assert_eq!(store.get("wrist_flex").unwrap().left, 600);
        let _ = std::fs::remove_file(store.file_path());
    }

    #[test]
    fn test_manual_reset_clears_store() {
        let mut store = temp_store();
        let mut session = ManualSession::new();
        let joint = Joint::new("wrist_flex", 4);

        session.capture(&joint, Slot::Left, 500, &mut store);
        session.capture(&joint, Slot::Right, 3500, &mut store);
        session.capture(&joint, Slot::Center, 2000, &mut store);
        session.reset(&joint, &mut store);

        assert!(store.get("wrist_flex").is_none());
        assert!(session.slot("wrist_flex", Slot::Left).is_none());
        let _ = std::fs::remove_file(store.file_path());
    }

    #[test]
    fn test_auto_calibration_stores_extremes() {
        let (arm, mock) = so_arm_with_mock();
        mock.set_stops(1, 100, 4000);
        let mut store = temp_store();
        let joints = vec![Joint::new("shoulder_pan", 1)];

        let calibrator = AutoCalibrator::new(arm, AutoCalTiming::fast());
        let outcomes = calibrator.run(&joints, &mut store);

        let rec = outcomes[0].result.as_ref().unwrap();
        assert_eq!((rec.left, rec.right, rec.center), (100, 4000, 2050));
        assert_eq!(store.get("shoulder_pan").unwrap(), rec);
        // Joint parked at the calibrated midpoint afterwards.
        assert_eq!(mock.position(1), Some(2050));
        let _ = std::fs::remove_file(store.file_path());
    }

    #[test]
    fn test_auto_calibration_rejects_flat_reading() {
        let (arm, mock) = so_arm_with_mock();
        // Stalled joint: both extremes settle at the same tick.
        mock.set_stops(2, 100, 100);
        let mut store = temp_store();
        let joints = vec![Joint::new("shoulder_lift", 2)];

        let calibrator = AutoCalibrator::new(arm, AutoCalTiming::fast());
        let outcomes = calibrator.run(&joints, &mut store);

        assert!(outcomes[0].result.is_err());
        assert!(store.get("shoulder_lift").is_none());
        let _ = std::fs::remove_file(store.file_path());
    }

    #[test]
    fn test_auto_calibration_batch_continues_after_failure() {
        let (arm, mock) = so_arm_with_mock();
        mock.fail_writes(1);
        mock.set_stops(2, 200, 3800);
        let mut store = temp_store();
        let joints = vec![Joint::new("shoulder_pan", 1), Joint::new("shoulder_lift", 2)];

        let calibrator = AutoCalibrator::new(arm, AutoCalTiming::fast());
        let outcomes = calibrator.run(&joints, &mut store);

        assert!(outcomes[0].result.is_err());
        assert!(outcomes[1].result.is_ok());
        assert!(store.get("shoulder_pan").is_none());
        assert!(store.get("shoulder_lift").is_some());
        let _ = std::fs::remove_file(store.file_path());
    }
}
