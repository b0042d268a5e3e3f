//! Calibration and trajectory engine for SO-ARM servo arms.
//!
//! Servos report positions as raw ticks on a 4096-step encoder ring. This
//! crate maps those ticks to a normalized 0.0..=1.0 range through 3-point
//! calibration (left stop, right stop, center), drives auto-calibration
//! against the mechanical end stops, and records and replays timestamped
//! raw-position trajectories.
//!
//! The bus layer is blocking serial; background work (capture, replay) runs
//! on dedicated threads with cooperative cancellation.

pub mod arm;
pub mod bus;
pub mod calibration;
pub mod config;
pub mod error;
pub mod feetech;
pub mod player;
pub mod recorder;
pub mod ring;
pub mod session;
pub mod trajectory;

pub use arm::Arm;
pub use bus::{shared, JointRead, JointWrite, ServoBus, SharedBus};
pub use calibration::{
    AutoCalTiming, AutoCalibrator, CalibrationRecord, CalibrationStore, ManualSession, Slot,
};
pub use config::{ArmConfig, Joint, HOME_POSITION, RING_SIZE};
pub use error::{Error, Result};
pub use feetech::{FeetechBus, SerialBus, DEFAULT_BAUD_RATE};
pub use player::Player;
pub use recorder::Recorder;
pub use session::{SessionKind, SessionLock};
pub use trajectory::{Frame, Trajectory};
