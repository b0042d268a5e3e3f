//! Background trajectory recorder.
//!
//! Samples all joints' raw positions at a fixed period onto a timestamped
//! frame list. The sampling loop runs on its own thread so the caller is
//! never blocked; stopping is cooperative, observed once per iteration, so
//! cancellation latency is bounded by one sample period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::arm::Arm;
use crate::error::Result;
use crate::session::{SessionKind, SessionLock};
use crate::trajectory::{Frame, Trajectory};

/// Records raw joint positions into a frame buffer on a worker thread.
pub struct Recorder {
    arm: Arm,
    sessions: SessionLock,
    frames: Arc<Mutex<Vec<Frame>>>,
    recording: Arc<AtomicBool>,
    sample_period: Mutex<Duration>,
    cancel: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    pub fn new(arm: Arm, sessions: SessionLock) -> Self {
        Self {
            arm,
            sessions,
            frames: Arc::new(Mutex::new(Vec::new())),
            recording: Arc::new(AtomicBool::new(false)),
            sample_period: Mutex::new(Duration::from_millis(100)),
            cancel: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start sampling at `period`. Clears any previously captured frames.
    ///
    /// Fails with [`crate::error::Error::SessionActive`] if a recording or
    /// playback session is already running.
    pub fn start(&self, period: Duration) -> Result<()> {
        let guard = self.sessions.try_begin(SessionKind::Recording)?;

        lock(&self.frames).clear();
        *lock_plain(&self.sample_period) = period;
        self.recording.store(true, Ordering::SeqCst);

        let token = CancellationToken::new();
        *lock_plain(&self.cancel) = Some(token.clone());

        let arm = self.arm.clone();
        let frames = Arc::clone(&self.frames);
        let recording = Arc::clone(&self.recording);

        tracing::info!("recording started (period {:?})", period);
        let handle = std::thread::spawn(move || {
            // Guard moves into the worker so the session slot frees exactly
            // when the loop exits.
            let _guard = guard;
            let start = Instant::now();

            while !token.is_cancelled() {
                let iteration_start = Instant::now();
                let t = start.elapsed().as_secs_f64();

                // Per-joint failures fall back to 0 inside read_positions;
                // a bad read never aborts the capture session.
                let positions = arm.read_positions();
                lock(&frames).push(Frame { t, positions });

                // Best effort: sleep whatever is left of the period. An
                // overrun is not compensated; playback trusts the recorded
                // timestamps, not the nominal period.
                let spent = iteration_start.elapsed();
                if let Some(remaining) = period.checked_sub(spent) {
                    std::thread::sleep(remaining);
                }
            }

            recording.store(false, Ordering::SeqCst);
            tracing::info!("recording stopped: {} frame(s)", lock(&frames).len());
        });
        *lock_plain(&self.handle) = Some(handle);

        Ok(())
    }

    /// Stop sampling and wait for the worker to finish its current
    /// iteration.
    pub fn stop(&self) {
        if let Some(token) = lock_plain(&self.cancel).take() {
            token.cancel();
        }
        if let Some(handle) = lock_plain(&self.handle).take() {
            let _ = handle.join();
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Number of frames captured so far (readable while recording).
    pub fn frame_count(&self) -> usize {
        lock(&self.frames).len()
    }

    /// Immutable snapshot of the capture as a [`Trajectory`].
    pub fn snapshot(&self, name: &str) -> Trajectory {
        Trajectory {
            name: name.to_string(),
            sample_period_s: lock_plain(&self.sample_period).as_secs_f64(),
            servo_ids: self.arm.config().servo_ids(),
            frames: lock(&self.frames).clone(),
        }
    }
}

fn lock(frames: &Mutex<Vec<Frame>>) -> std::sync::MutexGuard<'_, Vec<Frame>> {
    match frames.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_plain<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
