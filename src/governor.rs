//! Idle-time resource release.
//!
//! ```text
//!            idle ≥ idle_threshold and
//!            reactivated ≥ release_delay ago
//!   Active ─────────────────────────────────▶ Released   (engine.release())
//!     ▲                                          │
//!     └──────── a statement ran after the release┘
//! ```
//!
//! [`Governor::step`] is the pure transition function; [`spawn`] drives it
//! from a tokio interval until cancelled.

use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResourceLimits;
use crate::engine::EngineHandle;
use crate::error::codes;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Active,
    Released,
}

/// What a tick decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Active → Released; the caller must release engine memory
    Release,
    /// Released → Active
    Reactivate,
}

/// Release state machine. Time is passed in, never read.
#[derive(Debug)]
pub struct Governor {
    idle_threshold: Duration,
    release_delay: Duration,
    phase: Phase,
    released_at: Option<Instant>,
    reactivated_at: Option<Instant>,
}

impl Governor {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            idle_threshold: limits.idle_threshold,
            release_delay: limits.release_delay,
            phase: Phase::Active,
            released_at: None,
            reactivated_at: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Advances the machine given the current time and the engine's last
    /// activity.
    pub fn step(&mut self, now: Instant, last_activity: Instant) -> Option<Transition> {
        match self.phase {
            Phase::Active => {
                let idle = now.saturating_duration_since(last_activity);
                let settled = self
                    .reactivated_at
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.release_delay);
                if idle >= self.idle_threshold && settled {
                    self.phase = Phase::Released;
                    self.released_at = Some(now);
                    Some(Transition::Release)
                } else {
                    None
                }
            }
            Phase::Released => {
                if self.released_at.map_or(true, |at| last_activity > at) {
                    self.phase = Phase::Active;
                    self.reactivated_at = Some(now);
                    Some(Transition::Reactivate)
                } else {
                    None
                }
            }
        }
    }

    /// Returns to Active after a release that did not happen, so the next
    /// tick tries again.
    pub fn release_failed(&mut self) {
        self.phase = Phase::Active;
        self.released_at = None;
    }
}

#[derive(Debug)]
struct Shared {
    phase: Mutex<Phase>,
    releases: AtomicU64,
}

/// Handle to the running governor task.
pub struct GovernorHandle {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GovernorHandle {
    pub fn phase(&self) -> Phase {
        *self.shared.phase.lock()
    }

    /// Releases performed since start.
    pub fn releases(&self) -> u64 {
        self.shared.releases.load(Ordering::SeqCst)
    }

    /// Stops the loop and waits for it. A release in progress finishes
    /// first. Calling it again is a no-op.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "governor task ended abnormally");
            }
        }
    }
}

/// Starts the governor loop for `engine`.
pub fn spawn(engine: Arc<EngineHandle>, limits: ResourceLimits) -> GovernorHandle {
    let shared = Arc::new(Shared { phase: Mutex::new(Phase::Active), releases: AtomicU64::new(0) });
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(engine, limits, shared.clone(), cancel.clone()));
    GovernorHandle { shared, cancel, task: Mutex::new(Some(task)) }
}

async fn run(
    engine: Arc<EngineHandle>,
    limits: ResourceLimits,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut governor = Governor::new(&limits);
    let mut ticker = tokio::time::interval(limits.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(?limits, "governor started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match governor.step(Instant::now(), engine.last_activity()) {
            Some(Transition::Release) => match engine.release().await {
                Ok(report) => {
                    shared.releases.fetch_add(1, Ordering::SeqCst);
                    info!(
                        pages_flushed = report.pages_flushed,
                        pages_dropped = report.pages_dropped,
                        wal_records_compacted = report.wal_records_compacted,
                        "idle: engine memory released"
                    );
                }
                Err(e) if e.code == codes::ER_SERVER_SHUTDOWN => {
                    debug!("engine closed; governor exiting");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "idle release failed");
                    governor.release_failed();
                }
            },
            Some(Transition::Reactivate) => info!("activity after release: engine active"),
            None => {}
        }
        *shared.phase.lock() = governor.phase();
    }
    debug!("governor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    fn limits(idle_ms: u64, delay_ms: u64, tick_ms: u64) -> ResourceLimits {
        ResourceLimits {
            max_connections: 4,
            idle_threshold: Duration::from_millis(idle_ms),
            release_delay: Duration::from_millis(delay_ms),
            tick: Duration::from_millis(tick_ms),
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn releases_once_per_idle_period() {
        let mut g = Governor::new(&limits(10_000, 0, 1000));
        let t0 = Instant::now();
        assert_eq!(g.step(t0 + secs(5), t0), None);
        assert_eq!(g.step(t0 + secs(10), t0), Some(Transition::Release));
        assert_eq!(g.phase(), Phase::Released);
        assert_eq!(g.step(t0 + secs(11), t0), None);
        assert_eq!(g.step(t0 + secs(60), t0), None);
    }

    #[test]
    fn activity_after_release_reactivates() {
        let mut g = Governor::new(&limits(10_000, 0, 1000));
        let t0 = Instant::now();
        g.step(t0 + secs(10), t0);
        assert_eq!(g.step(t0 + secs(13), t0 + secs(12)), Some(Transition::Reactivate));
        assert_eq!(g.phase(), Phase::Active);
        // Idle again from t0+12.
        assert_eq!(g.step(t0 + secs(20), t0 + secs(12)), None);
        assert_eq!(g.step(t0 + secs(22), t0 + secs(12)), Some(Transition::Release));
    }

    #[test]
    fn release_delay_holds_off_after_reactivation() {
        let mut g = Governor::new(&limits(1000, 30_000, 1000));
        let t0 = Instant::now();
        assert_eq!(g.step(t0 + secs(1), t0), Some(Transition::Release));
        assert_eq!(g.step(t0 + secs(3), t0 + secs(2)), Some(Transition::Reactivate));
        // Idle long enough, but reactivated only 10s ago.
        assert_eq!(g.step(t0 + secs(13), t0 + secs(2)), None);
        assert_eq!(g.step(t0 + secs(33), t0 + secs(2)), Some(Transition::Release));
    }

    #[test]
    fn failed_release_is_retried() {
        let mut g = Governor::new(&limits(1000, 0, 1000));
        let t0 = Instant::now();
        assert_eq!(g.step(t0 + secs(2), t0), Some(Transition::Release));
        g.release_failed();
        assert_eq!(g.phase(), Phase::Active);
        assert_eq!(g.step(t0 + secs(3), t0), Some(Transition::Release));
    }

    #[tokio::test]
    async fn loop_releases_and_reactivates() {
        let engine = Arc::new(EngineHandle::new(Engine::in_memory(8)));
        engine.execute("CREATE TABLE t (n INT)").await.unwrap();
        engine.execute("INSERT INTO t VALUES (1)").await.unwrap();

        let gov = spawn(engine.clone(), limits(60, 0, 10));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(gov.phase(), Phase::Released);
        assert_eq!(gov.releases(), 1);
        assert_eq!(engine.stats().releases, 1);

        engine.execute("SELECT * FROM t").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(gov.phase(), Phase::Active);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(gov.releases(), 2);

        gov.stop().await;
        gov.stop().await;
        let before = gov.releases();
        engine.execute("SELECT 1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(gov.releases(), before);
    }

    #[tokio::test]
    async fn exits_when_the_engine_is_closed() {
        let engine = Arc::new(EngineHandle::new(Engine::in_memory(8)));
        engine.close().await.unwrap();
        let gov = spawn(engine, limits(0, 0, 5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gov.releases(), 0);
        gov.stop().await;
    }
}
