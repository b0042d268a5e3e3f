//! Arm configuration: the fixed joint set and encoder constants.
//!
//! The joint set is defined once at startup and never changes for the
//! lifetime of the process. Joint names key the calibration file; bus IDs
//! key trajectory frames.

use crate::error::{Error, Result};

/// Size of the encoder's cyclic position space. Tick `RING_SIZE - 1` and
/// tick `0` are physically adjacent.
pub const RING_SIZE: u16 = 4096;

/// Center-of-ring position used as the default "home" goal.
pub const HOME_POSITION: u16 = 2048;

/// Default calibration file name.
pub const DEFAULT_CALIBRATION_FILE: &str = "calibration.json";

/// One joint of the arm: a stable name plus its servo bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joint {
    /// Stable name, used as the key in the calibration file.
    pub name: String,
    /// Bus address (1..=253, unique within the arm).
    pub id: u8,
}

impl Joint {
    pub fn new(name: &str, id: u8) -> Self {
        Self {
            name: name.to_string(),
            id,
        }
    }
}

/// The fixed set of joints making up one arm.
#[derive(Debug, Clone)]
pub struct ArmConfig {
    joints: Vec<Joint>,
}

impl ArmConfig {
    /// Build a config from an explicit joint list.
    ///
    /// Duplicate bus IDs or duplicate names are rejected: frames are keyed
    /// by ID and calibrations by name, so neither may collide.
    pub fn new(joints: Vec<Joint>) -> Result<Self> {
        for (i, a) in joints.iter().enumerate() {
            for b in &joints[i + 1..] {
                if a.id == b.id {
                    return Err(Error::validation(format!(
                        "duplicate servo id {} ({} / {})",
                        a.id, a.name, b.name
                    )));
                }
                if a.name == b.name {
                    return Err(Error::validation(format!(
                        "duplicate joint name '{}'",
                        a.name
                    )));
                }
            }
        }
        Ok(Self { joints })
    }

    /// The standard 6-DOF SO-ARM follower layout, servo IDs 1..=6.
    pub fn so_arm() -> Self {
        let names = [
            "shoulder_pan",
            "shoulder_lift",
            "elbow_flex",
            "wrist_flex",
            "wrist_roll",
            "gripper",
        ];
        let joints = names
            .iter()
            .enumerate()
            .map(|(i, name)| Joint::new(name, (i + 1) as u8))
            .collect();
        // Static table, cannot collide.
        Self { joints }
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    /// Bus IDs in joint order.
    pub fn servo_ids(&self) -> Vec<u8> {
        self.joints.iter().map(|j| j.id).collect()
    }

    pub fn joint_by_name(&self, name: &str) -> Option<&Joint> {
        self.joints.iter().find(|j| j.name == name)
    }

    pub fn joint_by_id(&self, id: u8) -> Option<&Joint> {
        self.joints.iter().find(|j| j.id == id)
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_so_arm_layout() {
        let cfg = ArmConfig::so_arm();
        assert_eq!(cfg.len(), 6);
        assert_eq!(cfg.servo_ids(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(cfg.joint_by_name("gripper").unwrap().id, 6);
        assert_eq!(cfg.joint_by_id(1).unwrap().name, "shoulder_pan");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let joints = vec![Joint::new("a", 1), Joint::new("b", 1)];
        assert!(ArmConfig::new(joints).is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let joints = vec![Joint::new("a", 1), Joint::new("a", 2)];
        assert!(ArmConfig::new(joints).is_err());
    }
}
