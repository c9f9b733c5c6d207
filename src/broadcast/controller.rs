//! Frame broadcast loop
//!
//! A single long-lived task that waits for the start signal, streams every
//! frame artifact currently on disk to the control connection at a paced
//! rate, and goes back to waiting. Stop is cooperative and polled once per
//! artifact.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::frames::{list_frames, FrameArtifact};
use crate::server::{ConnectionRegistry, Role, StreamMessage};

/// Lifecycle of the broadcast loop
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPhase {
    /// Waiting for the start signal
    Idle,
    /// Iterating over frame artifacts
    Streaming,
    /// Torn down by the server; terminal
    Stopped,
}

/// Snapshot reported by the `broadcast_status` command
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BroadcastStatus {
    pub phase: BroadcastPhase,
    pub running: bool,
    pub stop_requested: bool,
    pub frames_sent: u64,
    pub passes: u64,
}

/// How a single pass over the frame directory ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Completed,
    Stopped,
    Shutdown,
}

/// Level-triggered flag that tasks can wait on
struct Signal(watch::Sender<bool>);

impl Signal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(tx)
    }

    fn set(&self) {
        self.0.send_replace(true);
    }

    fn clear(&self) {
        self.0.send_replace(false);
    }

    fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the flag is set (immediately if it already is)
    async fn wait(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|set| *set).await;
    }
}

/// Clears the spawn guard when the loop task exits, however it exits
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the broadcast state and the loop task
///
/// Exactly one loop runs at a time: `start` spawns one only after winning
/// the `running` compare-and-set.
pub struct BroadcastController {
    registry: Arc<ConnectionRegistry>,
    frames_dir: PathBuf,
    frame_interval: Duration,
    start: Signal,
    stop: Signal,
    shutdown: Signal,
    running: AtomicBool,
    phase: watch::Sender<BroadcastPhase>,
    frames_sent: AtomicU64,
    passes: AtomicU64,
}

impl BroadcastController {
    /// Create a controller streaming from `frames_dir` with `frame_interval`
    /// between frames
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        frames_dir: impl Into<PathBuf>,
        frame_interval: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(BroadcastPhase::Idle);
        Self {
            registry,
            frames_dir: frames_dir.into(),
            frame_interval,
            start: Signal::new(),
            stop: Signal::new(),
            shutdown: Signal::new(),
            running: AtomicBool::new(false),
            phase,
            frames_sent: AtomicU64::new(0),
            passes: AtomicU64::new(0),
        }
    }

    /// Request a broadcast pass
    ///
    /// Clears any previous stop request and sets the start signal. Spawns the
    /// loop task if none is running. Returns whether a task was spawned.
    pub fn start(self: &Arc<Self>) -> bool {
        self.stop.clear();
        self.start.set();

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Broadcast loop already running, start signal set");
            return false;
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.run().await;
        });
        true
    }

    /// Request the current pass to end; idempotent
    pub fn stop(&self) {
        self.stop.set();
        self.start.clear();
    }

    /// Tear the loop down for good
    pub fn shutdown(&self) {
        self.shutdown.set();
        self.stop.set();
        self.start.clear();
    }

    /// Current loop phase
    pub fn phase(&self) -> BroadcastPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions
    #[allow(dead_code)]
    pub fn subscribe_phase(&self) -> watch::Receiver<BroadcastPhase> {
        self.phase.subscribe()
    }

    /// Whether a loop task currently exists
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether a stop is pending or in effect; cleared by the next start
    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_set()
    }

    /// Total frames delivered to a control connection
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Passes that have ended, whether exhausted or stopped
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    /// Point-in-time status
    pub fn status(&self) -> BroadcastStatus {
        BroadcastStatus {
            phase: self.phase(),
            running: self.is_running(),
            stop_requested: self.is_stop_requested(),
            frames_sent: self.frames_sent(),
            passes: self.passes(),
        }
    }

    fn set_phase(&self, phase: BroadcastPhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            debug!("Broadcast phase {:?} -> {:?}", current, phase);
            *current = phase;
            true
        });
    }

    async fn run(self: Arc<Self>) {
        let _guard = RunningGuard(&self.running);
        info!("Broadcast loop started");

        loop {
            tokio::select! {
                _ = self.start.wait() => {}
                _ = self.shutdown.wait() => break,
            }
            if self.shutdown.is_set() {
                break;
            }

            self.set_phase(BroadcastPhase::Streaming);
            let outcome = self.stream_pass().await;
            self.start.clear();

            if outcome == PassOutcome::Shutdown {
                break;
            }

            self.set_phase(BroadcastPhase::Idle);
            self.passes.fetch_add(1, Ordering::AcqRel);
        }

        self.set_phase(BroadcastPhase::Stopped);
        info!("Broadcast loop stopped");
    }

    async fn stream_pass(&self) -> PassOutcome {
        let artifacts = match list_frames(&self.frames_dir).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!("Broadcast pass skipped: {}", e);
                return PassOutcome::Completed;
            }
        };

        let total = artifacts.len();
        debug!(
            "Streaming {} frames from {}",
            total,
            self.frames_dir.display()
        );

        for (index, artifact) in artifacts.iter().enumerate() {
            if self.shutdown.is_set() {
                return PassOutcome::Shutdown;
            }
            if self.stop.is_set() {
                info!("Broadcast stopped after {} of {} frames", index, total);
                return PassOutcome::Stopped;
            }

            let started = Instant::now();
            self.send_frame(artifact).await;
            tokio::time::sleep(self.frame_interval.saturating_sub(started.elapsed())).await;
        }

        debug!("Broadcast pass complete ({} frames)", total);
        PassOutcome::Completed
    }

    /// Push one artifact to the control connection, if there is one
    ///
    /// Failures only cost this frame; frames are never buffered or retried.
    async fn send_frame(&self, artifact: &FrameArtifact) {
        let Some(control) = self.registry.get(Role::Control) else {
            debug!("No control connection, skipping {}", artifact.name);
            return;
        };
        if control.is_closed() {
            debug!("Control connection {} is closing, skipping {}", control.id(), artifact.name);
            return;
        }

        let bytes = match artifact.read().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping frame: {}", e);
                return;
            }
        };

        let json = match StreamMessage::frame(&bytes).to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode frame {}: {}", artifact.name, e);
                return;
            }
        };

        match control.send_text(json).await {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Failed to send frame {}: {}", artifact.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Connection, ConnectionHandle};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::Value;
    use std::fs;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    const FAST: Duration = Duration::from_millis(1);

    fn frames_dir(count: usize) -> TempDir {
        let dir = tempdir().unwrap();
        for i in 1..=count {
            fs::write(
                dir.path().join(format!("frame_{:04}.png", i)),
                format!("frame-{}", i),
            )
            .unwrap();
        }
        dir
    }

    fn controller(
        registry: &Arc<ConnectionRegistry>,
        dir: &TempDir,
        interval: Duration,
    ) -> Arc<BroadcastController> {
        Arc::new(BroadcastController::new(
            Arc::clone(registry),
            dir.path(),
            interval,
        ))
    }

    fn control(registry: &ConnectionRegistry) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(64);
        let handle = ConnectionHandle::new(Role::Control, tx, Duration::from_secs(1));
        registry.register(Connection::new(handle));
        rx
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Message>) -> String {
        let message = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        let text = match message {
            Message::Text(text) => text,
            other => panic!("Expected text frame, got {:?}", other),
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "frame");
        let bytes = STANDARD.decode(value["data"].as_str().unwrap()).unwrap();
        String::from_utf8(bytes).unwrap()
    }

    async fn wait_for_passes(controller: &BroadcastController, passes: u64) {
        timeout(Duration::from_secs(5), async {
            while controller.passes() < passes {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("broadcast pass did not finish");
    }

    #[tokio::test]
    async fn test_streams_all_frames_in_order() {
        let dir = frames_dir(24);
        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx = control(&registry);
        let controller = controller(&registry, &dir, FAST);

        assert!(controller.start());
        for i in 1..=24 {
            assert_eq!(next_frame(&mut rx).await, format!("frame-{}", i));
        }

        wait_for_passes(&controller, 1).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(controller.frames_sent(), 24);
        assert_eq!(controller.phase(), BroadcastPhase::Idle);
        assert!(controller.is_running());
    }

    #[tokio::test]
    async fn test_second_start_does_not_spawn_second_loop() {
        let dir = frames_dir(5);
        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx = control(&registry);
        let controller = controller(&registry, &dir, Duration::from_millis(20));

        assert!(controller.start());
        assert!(!controller.start());

        wait_for_passes(&controller, 1).await;
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        // A second loop would double-send.
        assert_eq!(received, 5);
    }

    #[tokio::test]
    async fn test_stop_halts_streaming() {
        let dir = frames_dir(24);
        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx = control(&registry);
        let controller = controller(&registry, &dir, Duration::from_millis(50));

        controller.start();
        for i in 1..=10 {
            assert_eq!(next_frame(&mut rx).await, format!("frame-{}", i));
        }
        controller.stop();

        wait_for_passes(&controller, 1).await;
        let mut after_stop = 0;
        while rx.try_recv().is_ok() {
            after_stop += 1;
        }
        assert!(after_stop <= 2, "received {} frames after stop", after_stop);
        assert!(controller.frames_sent() < 24);
        assert_eq!(controller.phase(), BroadcastPhase::Idle);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = frames_dir(3);
        let registry = Arc::new(ConnectionRegistry::new());
        let controller = controller(&registry, &dir, FAST);

        controller.stop();
        controller.stop();
        assert_eq!(controller.phase(), BroadcastPhase::Idle);
        assert!(!controller.is_running());

        controller.start();
        wait_for_passes(&controller, 1).await;
        controller.stop();
        let once = controller.status();
        controller.stop();
        assert_eq!(controller.status(), once);
        assert_eq!(once.phase, BroadcastPhase::Idle);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let dir = frames_dir(2);
        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx = control(&registry);
        let controller = controller(&registry, &dir, FAST);

        controller.stop();
        assert!(controller.is_stop_requested());
        controller.start();
        assert!(!controller.is_stop_requested());
        assert_eq!(next_frame(&mut rx).await, "frame-1");
        assert_eq!(next_frame(&mut rx).await, "frame-2");

        wait_for_passes(&controller, 1).await;
        controller.start();
        assert_eq!(next_frame(&mut rx).await, "frame-1");
        assert_eq!(next_frame(&mut rx).await, "frame-2");

        wait_for_passes(&controller, 2).await;
        assert_eq!(controller.frames_sent(), 4);
    }

    #[tokio::test]
    async fn test_no_control_connection_skips_frames() {
        let dir = frames_dir(4);
        let registry = Arc::new(ConnectionRegistry::new());
        let controller = controller(&registry, &dir, FAST);

        controller.start();
        wait_for_passes(&controller, 1).await;

        assert_eq!(controller.frames_sent(), 0);
        assert!(controller.is_running());
    }

    #[tokio::test]
    async fn test_closed_control_connection_does_not_kill_loop() {
        let dir = frames_dir(3);
        let registry = Arc::new(ConnectionRegistry::new());
        drop(control(&registry));
        let controller = controller(&registry, &dir, FAST);

        controller.start();
        wait_for_passes(&controller, 1).await;
        assert_eq!(controller.frames_sent(), 0);

        let mut rx = control(&registry);
        controller.start();
        for i in 1..=3 {
            assert_eq!(next_frame(&mut rx).await, format!("frame-{}", i));
        }
    }

    #[tokio::test]
    async fn test_missing_frames_dir_is_not_fatal() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let controller = Arc::new(BroadcastController::new(
            registry,
            dir.path().join("missing"),
            FAST,
        ));

        controller.start();
        wait_for_passes(&controller, 1).await;
        assert!(controller.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let dir = frames_dir(1);
        let registry = Arc::new(ConnectionRegistry::new());
        let controller = controller(&registry, &dir, FAST);
        let mut phases = controller.subscribe_phase();

        controller.start();
        controller.shutdown();
        timeout(
            Duration::from_secs(5),
            phases.wait_for(|p| *p == BroadcastPhase::Stopped),
        )
        .await
        .unwrap()
        .unwrap();

        timeout(Duration::from_secs(1), async {
            while controller.is_running() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
