//! Whole-arm operations over a shared bus.
//!
//! Thin convenience layer used by the calibration procedures, the recorder
//! and the player: batch reads/writes keyed by servo ID, plus the torque
//! choreography for handing the arm between the operator and the motors.

use std::collections::BTreeMap;

use crate::bus::SharedBus;
use crate::config::{ArmConfig, HOME_POSITION};
use crate::error::{Error, Result};

/// One arm: its joint set plus a handle to the bus.
///
/// Cloning is cheap; clones share the same underlying bus.
#[derive(Clone)]
pub struct Arm {
    config: ArmConfig,
    bus: SharedBus,
}

impl Arm {
    pub fn new(config: ArmConfig, bus: SharedBus) -> Self {
        Self { config, bus }
    }

    pub fn config(&self) -> &ArmConfig {
        &self.config
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    /// Read all joints' raw positions.
    ///
    /// A joint whose read fails is reported as raw 0 rather than failing the
    /// whole snapshot; the failure is logged with the joint ID.
    pub fn read_positions(&self) -> BTreeMap<u8, u16> {
        let ids = self.config.servo_ids();
        let reads = self.lock_bus().sync_read_positions(&ids);
        let mut positions = BTreeMap::new();
        for read in reads {
            if let Err(e) = &read.position {
                tracing::warn!("read failed for servo {}: {}", read.id, e);
            }
            positions.insert(read.id, read.position_or(0));
        }
        positions
    }

    /// Write goal positions for several joints. Fails on the first joint
    /// whose write failed, after attempting all of them.
    pub fn write_positions(&self, targets: &[(u8, u16)]) -> Result<()> {
        let writes = self.lock_bus().sync_write_positions(targets);
        for write in writes {
            if let Err(e) = write.outcome {
                return Err(Error::transport(format!(
                    "goal write failed for servo {}: {}",
                    write.id, e
                )));
            }
        }
        Ok(())
    }

    /// Enable or disable holding torque on all joints.
    pub fn set_torque_all(&self, enabled: bool) -> Result<()> {
        let ids = self.config.servo_ids();
        let writes = self.lock_bus().set_torque_all(&ids, enabled);
        for write in writes {
            if let Err(e) = write.outcome {
                return Err(Error::transport(format!(
                    "torque write failed for servo {}: {}",
                    write.id, e
                )));
            }
        }
        Ok(())
    }

    /// Torque off on every joint so the operator can move the arm by hand.
    pub fn release(&self) -> Result<()> {
        self.set_torque_all(false)?;
        tracing::info!("motors released");
        Ok(())
    }

    /// Lock the arm in place without a jerk: set each goal to the present
    /// position first, then enable torque.
    pub fn hold_and_lock(&self) -> Result<()> {
        let positions = self.read_positions();
        let targets: Vec<(u8, u16)> = positions.into_iter().collect();
        self.write_positions(&targets)?;
        self.set_torque_all(true)?;
        tracing::info!("motors locked at present positions");
        Ok(())
    }

    /// Send every joint to the ring midpoint and hold there.
    ///
    /// Goal first, torque second, so enabling torque does not snap the arm
    /// toward a stale goal.
    pub fn go_home(&self) -> Result<()> {
        let targets: Vec<(u8, u16)> = self
            .config
            .servo_ids()
            .into_iter()
            .map(|id| (id, HOME_POSITION))
            .collect();
        self.write_positions(&targets)?;
        self.set_torque_all(true)?;
        tracing::info!("arm sent home ({})", HOME_POSITION);
        Ok(())
    }

    /// Flush and release the underlying transport.
    pub fn shutdown(&self) -> Result<()> {
        self.lock_bus().close()
    }

    fn lock_bus(&self) -> std::sync::MutexGuard<'_, dyn crate::bus::ServoBus + 'static> {
        match self.bus.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{shared, MockBus};

    fn test_arm() -> (Arm, MockBus) {
        let config = ArmConfig::so_arm();
        let mock = MockBus::new(&config.servo_ids());
        let arm = Arm::new(config, shared(mock.clone()));
        (arm, mock)
    }

    #[test]
    fn test_read_positions_zero_fallback() {
        let (arm, mock) = test_arm();
        mock.set_position(3, 1234);
        mock.fail_reads(5);
        let positions = arm.read_positions();
        assert_eq!(positions[&3], 1234);
        assert_eq!(positions[&5], 0);
        assert_eq!(positions.len(), 6);
    }

    #[test]
    fn test_go_home_writes_midpoint() {
        let (arm, mock) = test_arm();
        arm.go_home().unwrap();
        let writes = mock.writes();
        assert!(writes.iter().all(|&(_, p)| p == HOME_POSITION));
        assert_eq!(writes.len(), 6);
        assert!(mock.torque_enabled(1));
    }

    #[test]
    fn test_hold_and_lock_writes_present_positions() {
        let (arm, mock) = test_arm();
        mock.set_position(2, 777);
        arm.hold_and_lock().unwrap();
        assert!(mock.writes().contains(&(2, 777)));
        assert!(mock.torque_enabled(2));
    }
}
