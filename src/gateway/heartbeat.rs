//! Timer-driven heartbeat and liveness tracking.
//!
//! The monitor never writes to the socket. Its timer task emits
//! [`HeartbeatSignal`]s and the session loop performs the sends, so every
//! outbound frame of a connection goes through one writer. The writer
//! records each heartbeat with [`HeartbeatMonitor::record_sent`]; the timer
//! only reads the state.
//!
//! The zombie deadline is inclusive: reaching `last_ack + interval +
//! tolerance` without an ack counts as a missed ack.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatSignal {
    /// A heartbeat is due.
    Beat,
    /// No ack arrived within interval + tolerance.
    Zombie,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatState {
    pub last_sent: Option<Instant>,
    pub last_ack: Instant,
    pub outstanding: bool,
    pub zombie_reported: bool,
}

impl HeartbeatState {
    fn fresh(now: Instant) -> Self {
        Self {
            last_sent: None,
            last_ack: now,
            outstanding: false,
            zombie_reported: false,
        }
    }
}

/// Liveness tracker for one connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    state: Arc<Mutex<HeartbeatState>>,
    tolerance: Duration,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Creates a stopped monitor that tolerates `tolerance` past one interval
    /// without an ack.
    pub fn new(tolerance: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(HeartbeatState::fresh(Instant::now()))),
            tolerance,
            task: None,
        }
    }

    /// Resets the state and starts beating every `interval`.
    ///
    /// Last-ack is seeded to now so the first interval cannot be judged a
    /// zombie. A running timer is replaced. Call this before the
    /// connection's first heartbeat is written so that beat stays recorded.
    pub fn start(&mut self, interval: Duration, signals: mpsc::UnboundedSender<HeartbeatSignal>) {
        self.stop();
        *self.state.lock() = HeartbeatState::fresh(Instant::now());

        let state = Arc::clone(&self.state);
        let tolerance = self.tolerance;
        self.task = Some(tokio::spawn(async move {
            run_timer(state, interval, tolerance, signals).await;
        }));
    }

    /// Records a heartbeat ack and clears the outstanding flag.
    pub fn on_ack(&self) {
        let mut state = self.state.lock();
        state.outstanding = false;
        state.last_ack = Instant::now();
    }

    /// Records a heartbeat written by the session.
    pub fn record_sent(&self) {
        let mut state = self.state.lock();
        state.last_sent = Some(Instant::now());
        state.outstanding = true;
    }

    /// Aborts the timer task. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether the timer task is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Snapshot of the shared heartbeat state.
    pub fn state(&self) -> HeartbeatState {
        self.state.lock().clone()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_timer(
    state: Arc<Mutex<HeartbeatState>>,
    interval: Duration,
    tolerance: Duration,
    signals: mpsc::UnboundedSender<HeartbeatSignal>,
) {
    let mut next_beat = Instant::now() + interval;

    loop {
        let now = Instant::now();
        let zombie_at = state.lock().last_ack + interval + tolerance;

        if now >= zombie_at {
            let elapsed = now - state.lock().last_ack;
            state.lock().zombie_reported = true;
            warn!(
                event = "heartbeat_zombie",
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = interval.as_millis() as u64
            );
            let _ = signals.send(HeartbeatSignal::Zombie);
            return;
        }

        if now >= next_beat {
            if signals.send(HeartbeatSignal::Beat).is_err() {
                return;
            }
            next_beat += interval;
            if next_beat <= now {
                next_beat = now + interval;
            }
            continue;
        }

        tokio::time::sleep_until(next_beat.min(zombie_at)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::{HeartbeatMonitor, HeartbeatSignal};

    #[tokio::test(start_paused = true)]
    async fn beats_every_interval_while_acked() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        monitor.start(Duration::from_secs(10), tx);

        for beat in 1..=3u32 {
            assert_eq!(rx.recv().await, Some(HeartbeatSignal::Beat));
            assert_eq!(Instant::now(), started + Duration::from_secs(10) * beat);
            assert!(!monitor.state().outstanding);
            monitor.record_sent();
            assert!(monitor.state().outstanding);
            monitor.on_ack();
            assert!(!monitor.state().outstanding);
        }
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_fires_zombie_once_before_next_beat() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        monitor.start(Duration::from_secs(10), tx);

        assert_eq!(rx.recv().await, Some(HeartbeatSignal::Beat));
        assert_eq!(rx.recv().await, Some(HeartbeatSignal::Zombie));
        assert_eq!(Instant::now(), started + Duration::from_secs(15));
        assert!(monitor.state().zombie_reported);

        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn long_tolerance_keeps_beating_until_deadline() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(90));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let interval = Duration::from_millis(41_250);
        monitor.start(interval, tx);

        let mut signals = Vec::new();
        while let Some(signal) = rx.recv().await {
            signals.push(signal);
        }
        assert_eq!(
            signals,
            vec![
                HeartbeatSignal::Beat,
                HeartbeatSignal::Beat,
                HeartbeatSignal::Beat,
                HeartbeatSignal::Zombie
            ]
        );
        assert_eq!(Instant::now(), started + interval + Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_pushes_the_zombie_deadline_out() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.start(Duration::from_secs(10), tx);

        tokio::time::sleep(Duration::from_secs(14)).await;
        monitor.on_ack();
        assert_eq!(rx.recv().await, Some(HeartbeatSignal::Beat));
        assert_eq!(rx.recv().await, Some(HeartbeatSignal::Beat));
        assert!(!monitor.state().zombie_reported);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_silences_the_timer() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.start(Duration::from_secs(10), tx);
        assert!(monitor.is_running());

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn record_sent_marks_outstanding() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(5));
        monitor.record_sent();
        let state = monitor.state();
        assert!(state.outstanding);
        assert!(state.last_sent.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn beat_recorded_after_start_survives() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(5));
        let (tx, _rx) = mpsc::unbounded_channel();
        monitor.start(Duration::from_secs(10), tx);
        monitor.record_sent();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let state = monitor.state();
        assert!(state.outstanding);
        assert!(state.last_sent.is_some());
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn timer_signals_without_recording_sends() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.start(Duration::from_secs(10), tx);

        assert_eq!(rx.recv().await, Some(HeartbeatSignal::Beat));
        assert_eq!(monitor.state().last_sent, None);
        monitor.stop();
    }
}
