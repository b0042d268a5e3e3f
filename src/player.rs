//! Background trajectory player.
//!
//! Replays a frame list against the bus, reproducing each frame's original
//! offset from the recording start via wall-clock target times. Write
//! latency therefore never accumulates into the schedule; a frame that is
//! already past due is written immediately with no catch-up burst.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::arm::Arm;
use crate::error::Result;
use crate::session::{SessionKind, SessionLock};
use crate::trajectory::Trajectory;

/// Emit a progress callback every this many frames, to bound callback
/// overhead.
const PROGRESS_STRIDE: usize = 10;

/// Replays trajectories on a worker thread.
pub struct Player {
    arm: Arm,
    sessions: SessionLock,
    playing: Arc<AtomicBool>,
    current_frame: Arc<AtomicUsize>,
    last_error: Arc<Mutex<Option<String>>>,
    cancel: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    pub fn new(arm: Arm, sessions: SessionLock) -> Self {
        Self {
            arm,
            sessions,
            playing: Arc::new(AtomicBool::new(false)),
            current_frame: Arc::new(AtomicUsize::new(0)),
            last_error: Arc::new(Mutex::new(None)),
            cancel: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Replay `trajectory` without progress reporting.
    pub fn play(&self, trajectory: Trajectory) -> Result<()> {
        self.play_with_progress(trajectory, |_, _| {})
    }

    /// Replay `trajectory`, invoking `progress(frames_done, total)` at a
    /// coarse stride.
    ///
    /// An empty trajectory is a warned no-op. Fails with
    /// [`crate::error::Error::SessionActive`] if a session is already
    /// running. A failed write aborts the replay immediately: continuing
    /// with a stale actuator state could be unsafe, so nothing is retried.
    pub fn play_with_progress(
        &self,
        trajectory: Trajectory,
        progress: impl Fn(usize, usize) + Send + 'static,
    ) -> Result<()> {
        if trajectory.is_empty() {
            tracing::warn!("nothing to play: trajectory has no frames");
            return Ok(());
        }

        let guard = self.sessions.try_begin(SessionKind::Playback)?;

        self.playing.store(true, Ordering::SeqCst);
        self.current_frame.store(0, Ordering::SeqCst);
        *lock(&self.last_error) = None;

        let token = CancellationToken::new();
        *lock(&self.cancel) = Some(token.clone());

        let arm = self.arm.clone();
        let playing = Arc::clone(&self.playing);
        let current_frame = Arc::clone(&self.current_frame);
        let last_error = Arc::clone(&self.last_error);

        tracing::info!(
            "playback started: {} frame(s), {:.1}s",
            trajectory.len(),
            trajectory.duration_s()
        );
        let handle = std::thread::spawn(move || {
            let _guard = guard;
            let total = trajectory.len();
            let t0 = Instant::now();
            let base_t = trajectory.frames[0].t;
            let mut stopped = false;

            for (i, frame) in trajectory.frames.iter().enumerate() {
                // Cancellation is checked once per frame; latency is
                // bounded by one inter-frame gap.
                if token.is_cancelled() {
                    stopped = true;
                    break;
                }

                // Honor the frame's original offset from recording start.
                // Past-due frames are written immediately, never bursted.
                let offset = (frame.t - base_t).max(0.0);
                let target = t0 + std::time::Duration::from_secs_f64(offset);
                let now = Instant::now();
                if target > now {
                    std::thread::sleep(target - now);
                }

                let targets: Vec<(u8, u16)> =
                    frame.positions.iter().map(|(&id, &pos)| (id, pos)).collect();
                if let Err(e) = arm.write_positions(&targets) {
                    tracing::error!("playback aborted at frame {}: {}", i, e);
                    *lock(&last_error) = Some(e.to_string());
                    break;
                }

                current_frame.store(i + 1, Ordering::SeqCst);
                if i % PROGRESS_STRIDE == 0 {
                    progress(i + 1, total);
                }
            }

            playing.store(false, Ordering::SeqCst);
            if stopped {
                // External stop keeps the cursor where playback halted.
                tracing::info!(
                    "playback stopped at frame {}/{}",
                    current_frame.load(Ordering::SeqCst),
                    total
                );
            } else {
                current_frame.store(0, Ordering::SeqCst);
                tracing::info!("playback finished");
            }
        });
        *lock(&self.handle) = Some(handle);

        Ok(())
    }

    /// Stop playback and wait for the worker to observe the cancellation.
    pub fn stop(&self) {
        if let Some(token) = lock(&self.cancel).take() {
            token.cancel();
        }
        if let Some(handle) = lock(&self.handle).take() {
            let _ = handle.join();
        }
    }

    /// Block until a running playback finishes on its own.
    pub fn wait(&self) {
        if let Some(handle) = lock(&self.handle).take() {
            let _ = handle.join();
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Index just past the last frame written (readable while playing).
    pub fn current_frame(&self) -> usize {
        self.current_frame.load(Ordering::SeqCst)
    }

    /// Error that aborted the last playback, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
