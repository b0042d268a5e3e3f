//! Actuator bus abstraction.
//!
//! [`ServoBus`] is the seam between the calibration/trajectory engine and a
//! concrete servo transport. The real implementation lives in
//! [`crate::feetech`]; [`MockBus`] lets everything above the bus run in
//! tests without hardware.
//!
//! Batch operations report one result per joint instead of a single error,
//! so callers can tell partial failure from total failure.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Result of reading one joint inside a batch read.
#[derive(Debug)]
pub struct JointRead {
    pub id: u8,
    pub position: Result<u16>,
}

impl JointRead {
    /// Position, or `fallback` if the read failed.
    pub fn position_or(&self, fallback: u16) -> u16 {
        match &self.position {
            Ok(p) => *p,
            Err(_) => fallback,
        }
    }
}

/// Result of writing one joint inside a batch write.
#[derive(Debug)]
pub struct JointWrite {
    pub id: u8,
    pub outcome: Result<()>,
}

/// A servo bus: position reads/writes and torque control, single or batched.
///
/// The default batch implementations fall back to per-joint operations;
/// transports with a native sync protocol override them.
pub trait ServoBus: Send {
    /// Read the present position of one servo.
    fn read_position(&mut self, id: u8) -> Result<u16>;

    /// Write the goal position of one servo.
    fn write_position(&mut self, id: u8, position: u16) -> Result<()>;

    /// Enable or disable holding torque on one servo.
    fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()>;

    /// Read the present positions of several servos, one result per joint.
    fn sync_read_positions(&mut self, ids: &[u8]) -> Vec<JointRead> {
        ids.iter()
            .map(|&id| JointRead {
                id,
                position: self.read_position(id),
            })
            .collect()
    }

    /// Write goal positions to several servos, one result per joint.
    fn sync_write_positions(&mut self, targets: &[(u8, u16)]) -> Vec<JointWrite> {
        targets
            .iter()
            .map(|&(id, pos)| JointWrite {
                id,
                outcome: self.write_position(id, pos),
            })
            .collect()
    }

    /// Enable or disable torque on several servos, one result per joint.
    fn set_torque_all(&mut self, ids: &[u8], enabled: bool) -> Vec<JointWrite> {
        ids.iter()
            .map(|&id| JointWrite {
                id,
                outcome: self.set_torque(id, enabled),
            })
            .collect()
    }

    /// Release the underlying transport.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A bus shared between the foreground and one background worker.
pub type SharedBus = Arc<Mutex<dyn ServoBus>>;

/// Wrap a bus for shared use.
pub fn shared(bus: impl ServoBus + 'static) -> SharedBus {
    Arc::new(Mutex::new(bus))
}

/// In-memory servo bus for tests.
///
/// Each servo has a present position and optional mechanical stops: a goal
/// write settles at the goal clamped to the stops, which is enough to
/// exercise the auto-calibration procedure. Reads and writes can be made to
/// fail per servo, and every goal write is logged in order.
///
/// State lives behind an `Arc`, so a test can keep one handle for
/// inspection while a clone is boxed up as the arm's bus.
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    present: BTreeMap<u8, u16>,
    stops: BTreeMap<u8, (u16, u16)>,
    torque: BTreeMap<u8, bool>,
    fail_reads: BTreeSet<u8>,
    fail_writes: BTreeSet<u8>,
    writes: Vec<(u8, u16)>,
}

impl MockBus {
    /// Create a mock with the given servos, all at `HOME_POSITION`.
    pub fn new(ids: &[u8]) -> Self {
        let bus = Self::default();
        {
            let mut state = bus.state();
            for &id in ids {
                state.present.insert(id, crate::config::HOME_POSITION);
            }
        }
        bus
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Set a servo's present position directly.
    pub fn set_position(&self, id: u8, position: u16) {
        self.state().present.insert(id, position);
    }

    /// Constrain a servo to settle within `[lo, hi]` on goal writes.
    pub fn set_stops(&self, id: u8, lo: u16, hi: u16) {
        self.state().stops.insert(id, (lo, hi));
    }

    /// Make reads of `id` fail until cleared.
    pub fn fail_reads(&self, id: u8) {
        self.state().fail_reads.insert(id);
    }

    /// Make writes to `id` fail until cleared.
    pub fn fail_writes(&self, id: u8) {
        self.state().fail_writes.insert(id);
    }

    pub fn torque_enabled(&self, id: u8) -> bool {
        self.state().torque.get(&id).copied().unwrap_or(false)
    }

    /// Every goal-position write so far, in call order.
    pub fn writes(&self) -> Vec<(u8, u16)> {
        self.state().writes.clone()
    }

    pub fn position(&self, id: u8) -> Option<u16> {
        self.state().present.get(&id).copied()
    }
}

impl ServoBus for MockBus {
    fn read_position(&mut self, id: u8) -> Result<u16> {
        let state = self.state();
        if state.fail_reads.contains(&id) {
            return Err(Error::transport(format!("mock read failure on servo {id}")));
        }
        state
            .present
            .get(&id)
            .copied()
            .ok_or_else(|| Error::transport(format!("no servo with id {id}")))
    }

    fn write_position(&mut self, id: u8, position: u16) -> Result<()> {
        let mut state = self.state();
        state.writes.push((id, position));
        if state.fail_writes.contains(&id) {
            return Err(Error::transport(format!(
                "mock write failure on servo {id}"
            )));
        }
        if !state.present.contains_key(&id) {
            return Err(Error::transport(format!("no servo with id {id}")));
        }
        let settled = match state.stops.get(&id) {
            Some(&(lo, hi)) => position.clamp(lo, hi),
            None => position,
        };
        state.present.insert(id, settled);
        Ok(())
    }

    fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()> {
        let mut state = self.state();
        if state.fail_writes.contains(&id) {
            return Err(Error::transport(format!(
                "mock write failure on servo {id}"
            )));
        }
        state.torque.insert(id, enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_settles_at_stops() {
        let mut bus = MockBus::new(&[1]);
        bus.set_stops(1, 100, 4000);
        bus.write_position(1, 0).unwrap();
        assert_eq!(bus.read_position(1).unwrap(), 100);
        bus.write_position(1, 4095).unwrap();
        assert_eq!(bus.read_position(1).unwrap(), 4000);
    }

    #[test]
    fn test_batch_read_partial_failure() {
        let mut bus = MockBus::new(&[1, 2, 3]);
        bus.fail_reads(2);
        let reads = bus.sync_read_positions(&[1, 2, 3]);
        assert!(reads[0].position.is_ok());
        assert!(reads[1].position.is_err());
        assert!(reads[2].position.is_ok());
        assert_eq!(reads[1].position_or(0), 0);
    }

    #[test]
    fn test_batch_write_partial_failure() {
        let mut bus = MockBus::new(&[1, 2]);
        bus.fail_writes(1);
        let writes = bus.sync_write_positions(&[(1, 10), (2, 20)]);
        assert!(writes[0].outcome.is_err());
        assert!(writes[1].outcome.is_ok());
        assert_eq!(bus.read_position(2).unwrap(), 20);
    }

    #[test]
    fn test_clones_share_state() {
        let bus = MockBus::new(&[1]);
        let mut clone = bus.clone();
        clone.write_position(1, 321).unwrap();
        assert_eq!(bus.position(1), Some(321));
        assert_eq!(bus.writes(), vec![(1, 321)]);
    }
}
