// 💾 Save Coordinator - one save in flight per writer context, FIFO
//
// Idle → Queued → Running → {Committed, Failed} → Idle
//
// Each operation runs as one unit of work on the writer context's queue:
// BEGIN IMMEDIATE, the caller's work, COMMIT (or ROLLBACK on any error), then
// propagation into the reader before the result is handed back. Failures are
// returned to the caller and never wedge the coordinator. No retries.

use crate::error::SyncResult;
use crate::propagation::{ChangeDelta, ChangePropagator, MergeOutcome};
use crate::store::{Session, WriterContext};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the coordinator is doing right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running { operation: String },
}

impl CoordinatorState {
    pub fn is_idle(&self) -> bool {
        matches!(self, CoordinatorState::Idle)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub committed: u64,
    pub failed: u64,
    pub last_error: Option<String>,
}

/// Result of a committed save operation
#[derive(Debug)]
pub struct SaveOutcome<T> {
    /// What the work closure returned
    pub value: T,
    /// Committed changes (empty if the work wrote nothing)
    pub delta: ChangeDelta,
    /// How the reader absorbed the delta
    pub merge: MergeOutcome,
}

impl<T> SaveOutcome<T> {
    pub fn commit_id(&self) -> Option<u64> {
        (!self.delta.is_empty()).then_some(self.delta.commit_id)
    }
}

struct Inner {
    writer: WriterContext,
    propagator: ChangePropagator,
    /// Fair mutex: waiters acquire it in the order they asked
    gate: tokio::sync::Mutex<()>,
    state: RwLock<CoordinatorState>,
    queued: AtomicUsize,
    stats: Mutex<CoordinatorStats>,
}

#[derive(Clone)]
pub struct SaveCoordinator {
    inner: Arc<Inner>,
}

impl SaveCoordinator {
    pub fn new(writer: WriterContext, propagator: ChangePropagator) -> Self {
        SaveCoordinator {
            inner: Arc::new(Inner {
                writer,
                propagator,
                gate: tokio::sync::Mutex::new(()),
                state: RwLock::new(CoordinatorState::Idle),
                queued: AtomicUsize::new(0),
                stats: Mutex::new(CoordinatorStats::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.writer.name()
    }

    pub fn writer(&self) -> &WriterContext {
        &self.inner.writer
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.state.read().clone()
    }

    /// Operations waiting for the running one to finish
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.inner.stats.lock().clone()
    }

    /// Run `work` as one named unit of work and commit it.
    ///
    /// Once the work has been handed to the writer context it runs to
    /// completion even if this future is dropped.
    pub async fn perform<F, T>(&self, name: &str, work: F) -> SyncResult<SaveOutcome<T>>
    where
        F: FnOnce(&mut Session) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = &self.inner;
        let operation = name.to_string();

        let queued = QueuedGuard::enter(&inner.queued);
        debug!(context = %self.name(), operation = %operation, waiting = self.queued(), "save queued");
        let _slot = inner.gate.lock().await;
        drop(queued);

        *inner.state.write() = CoordinatorState::Running {
            operation: operation.clone(),
        };
        let _running = RunningGuard(&inner.state);
        debug!(context = %self.name(), operation = %operation, "save running");

        let propagator = inner.propagator.clone();
        let unit = operation.clone();
        let result = inner
            .writer
            .handle()
            .run(move |session| {
                session.begin_unit(&unit)?;
                let value = match work(session) {
                    Ok(value) => value,
                    Err(e) => {
                        session.rollback_unit();
                        return Err(e);
                    }
                };
                let delta = session.commit_unit()?;
                let merge = propagator.propagate_blocking(&delta);
                Ok(SaveOutcome { value, delta, merge })
            })
            .await;

        let mut stats = inner.stats.lock();
        match &result {
            Ok(outcome) => {
                stats.committed += 1;
                let (inserted, updated, deleted) = outcome.delta.counts();
                info!(
                    context = %self.name(),
                    operation = %operation,
                    commit_id = outcome.delta.commit_id,
                    inserted,
                    updated,
                    deleted,
                    "save committed"
                );
            }
            Err(e) => {
                stats.failed += 1;
                stats.last_error = Some(e.to_string());
                warn!(context = %self.name(), operation = %operation, error = %e, "save failed, rolled back");
            }
        }
        result
    }
}

/// Counts a caller as queued until it gets the gate or gives up
struct QueuedGuard<'a>(&'a AtomicUsize);

impl<'a> QueuedGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        QueuedGuard(counter)
    }
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Returns the coordinator to Idle however `perform` exits
struct RunningGuard<'a>(&'a RwLock<CoordinatorState>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.0.write() = CoordinatorState::Idle;
    }
}
