use parking_lot::Mutex as SyncMutex;
use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{Engine, ReleaseReport, StatementResult};
use crate::error::EngineError;

/// Execution counters, for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecStats {
    /// Statements that reached the engine
    pub executed: u64,
    /// Operations currently holding the gate (0 or 1)
    pub in_flight: usize,
    /// Highest `in_flight` ever observed
    pub peak_in_flight: usize,
    pub releases: u64,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    releases: AtomicU64,
}

impl Counters {
    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }
}

struct InFlight<'a>(&'a Counters);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared front door to the engine.
///
/// Every statement, release and close goes through one async gate, so at
/// most one operation touches the engine at a time no matter how many
/// connections are open. Waiting for the gate is fair (FIFO) and never
/// blocks a runtime thread.
///
/// The handle also keeps the last-activity clock the governor reads. After
/// [`close`](Self::close) every call fails with `ER_SERVER_SHUTDOWN`.
pub struct EngineHandle {
    gate: Mutex<Option<Engine>>,
    last_activity: SyncMutex<Instant>,
    counters: Counters,
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        Self {
            gate: Mutex::new(Some(engine)),
            last_activity: SyncMutex::new(Instant::now()),
            counters: Counters::default(),
        }
    }

    /// Opens the engine at `storage_path` (`:memory:` or a data directory).
    pub async fn open(storage_path: &str, buffer_pool_pages: usize) -> anyhow::Result<Self> {
        Ok(Self::new(Engine::open(storage_path, buffer_pool_pages).await?))
    }

    /// Runs one SQL statement to completion.
    pub async fn execute(&self, sql: &str) -> Result<StatementResult, EngineError> {
        let guard = self.gate.lock().await;
        let engine = guard.as_ref().ok_or_else(EngineError::shutdown)?;
        let _flight = self.counters.enter();
        self.touch();
        self.counters.executed.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let result = crate::sql::execute(engine, sql).await.map_err(EngineError::from_anyhow);
        self.touch();
        trace!(elapsed = ?started.elapsed(), ok = result.is_ok(), "statement finished");
        result
    }

    /// Records activity now.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.idle_for() >= threshold
    }

    /// Releases cached engine memory. Does not count as activity.
    pub async fn release(&self) -> Result<ReleaseReport, EngineError> {
        let guard = self.gate.lock().await;
        let engine = guard.as_ref().ok_or_else(EngineError::shutdown)?;
        let _flight = self.counters.enter();
        let report = engine.release().await.map_err(EngineError::from_anyhow)?;
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }

    /// Flushes and closes the engine. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), EngineError> {
        let mut guard = self.gate.lock().await;
        let Some(engine) = guard.take() else {
            debug!("engine already closed");
            return Ok(());
        };
        let _flight = self.counters.enter();
        engine.close().await.map_err(EngineError::from_anyhow)
    }

    pub async fn is_closed(&self) -> bool {
        self.gate.lock().await.is_none()
    }

    pub fn stats(&self) -> ExecStats {
        ExecStats {
            executed: self.counters.executed.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.counters.peak.load(Ordering::SeqCst),
            releases: self.counters.releases.load(Ordering::Relaxed),
        }
    }
}
