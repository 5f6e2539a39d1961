// 🧭 Execution Contexts - serial queues bound to the durable store
//
// Every context is one worker thread that owns one SQLite connection and one
// Session. Work is submitted as closures and runs strictly in submission order.
// Contexts never share mutable state; cross-context visibility only happens
// through commit + propagate.

use super::record::FieldMap;
use super::session::Session;
use super::{open_connection, ContextRole};
use crate::config::StoreConfig;
use crate::entities::{DomainEntity, EntityKind};
use crate::error::{SyncError, SyncResult};
use crate::propagation::{merge_into, ChangeDelta, MergeOutcome};
use crate::resolver::ReferenceResolver;
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce(&mut Session) + Send + 'static>;

// ============================================================================
// CONTEXT HANDLE
// ============================================================================

#[derive(Clone)]
pub(crate) struct ContextHandle {
    name: Arc<str>,
    jobs: mpsc::Sender<Job>,
}

impl ContextHandle {
    pub(crate) fn spawn(
        name: &str,
        role: ContextRole,
        config: &StoreConfig,
        commit_seq: Arc<AtomicU64>,
    ) -> SyncResult<Self> {
        let conn = open_connection(config, role)?;
        let (jobs, queue) = mpsc::channel::<Job>();
        let name: Arc<str> = Arc::from(name);

        let session_name = name.clone();
        let session_config = config.clone();
        // Commits made before this context existed are already in what it reads
        let merged_floor = commit_seq.load(Ordering::SeqCst);
        std::thread::Builder::new()
            .name(format!("ctx-{}", name))
            .spawn(move || {
                let mut session = Session::new(session_name, role, conn, session_config, commit_seq, merged_floor);
                for job in queue {
                    job(&mut session);
                }
                debug!(context = %session.name(), "execution context closed");
            })?;

        info!(context = %name, ?role, "execution context spawned");
        Ok(ContextHandle { name, jobs })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn submit<F, T>(&self, work: F) -> SyncResult<oneshot::Receiver<SyncResult<T>>>
    where
        F: FnOnce(&mut Session) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        self.jobs
            .send(Box::new(move |session: &mut Session| {
                let result = panic::catch_unwind(AssertUnwindSafe(|| work(&mut *session)))
                    .unwrap_or_else(|payload| Err(recover_from_panic(session, payload)));
                // Caller may have stopped waiting; the work still ran to completion
                let _ = reply.send(result);
            }))
            .map_err(|_| SyncError::ContextClosed(self.name.to_string()))?;
        Ok(receiver)
    }

    /// Queue work and await its result
    pub(crate) async fn run<F, T>(&self, work: F) -> SyncResult<T>
    where
        F: FnOnce(&mut Session) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let receiver = self.submit(work)?;
        receiver
            .await
            .map_err(|_| SyncError::ContextClosed(self.name.to_string()))?
    }

    /// Queue work and block the calling thread until it finishes.
    /// Must not be called from inside an async runtime.
    pub(crate) fn run_blocking<F, T>(&self, work: F) -> SyncResult<T>
    where
        F: FnOnce(&mut Session) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let receiver = self.submit(work)?;
        receiver
            .blocking_recv()
            .map_err(|_| SyncError::ContextClosed(self.name.to_string()))?
    }
}

/// A panicking job must not take its context down: roll back whatever unit it
/// left open and report the panic to that caller only.
fn recover_from_panic(session: &mut Session, payload: Box<dyn Any + Send>) -> SyncError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    if session.in_unit() {
        session.rollback_unit();
    }
    warn!(context = %session.name(), panic = %message, "job panicked, context keeps serving");
    SyncError::aborted(format!("work panicked: {}", message))
}

// ============================================================================
// WRITER CONTEXT
// ============================================================================

/// Short-lived context for mutations.
///
/// Writes are only reachable through a `SaveCoordinator`; on its own a writer
/// context offers read access to committed data.
#[derive(Clone)]
pub struct WriterContext {
    handle: ContextHandle,
}

impl WriterContext {
    pub(crate) fn spawn(name: &str, config: &StoreConfig, commit_seq: Arc<AtomicU64>) -> SyncResult<Self> {
        Ok(WriterContext {
            handle: ContextHandle::spawn(name, ContextRole::Writer, config, commit_seq)?,
        })
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub(crate) fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    pub async fn perform_read<F, T>(&self, read: F) -> SyncResult<T>
    where
        F: FnOnce(&Session) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.handle.run(move |session| read(session)).await
    }
}

// ============================================================================
// READER CONTEXT
// ============================================================================

/// Result of a read that may have been served from the fallback snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<T> {
    /// Read from committed store state
    Fresh(T),
    /// Store query failed; last successful snapshot of the kind
    Stale(T),
}

impl<T> ReadOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            ReadOutcome::Fresh(value) | ReadOutcome::Stale(value) => value,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ReadOutcome::Stale(_))
    }
}

/// The single long-lived context backing the UI. Read-only by construction:
/// it never hands out `&mut Session`, and its connection is `query_only`.
#[derive(Clone)]
pub struct ReaderContext {
    handle: ContextHandle,
    chunk_size: usize,
}

impl ReaderContext {
    pub(crate) fn spawn(config: &StoreConfig, commit_seq: Arc<AtomicU64>) -> SyncResult<Self> {
        Ok(ReaderContext {
            handle: ContextHandle::spawn("reader", ContextRole::Reader, config, commit_seq)?,
            chunk_size: config.lookup_chunk_size,
        })
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Fetch one entity through the reader's cache.
    ///
    /// A cached value reflects the last merge; it is only guaranteed current
    /// once the change propagator has delivered the writer's commit.
    pub async fn fetch<T: DomainEntity>(&self, id: &str) -> SyncResult<Option<T>> {
        let id = id.to_string();
        self.handle
            .run(move |session| match session.materialize(T::KIND, &id)? {
                Some(record) => Ok(Some(record.decode::<T>()?)),
                None => Ok(None),
            })
            .await
    }

    /// Fetch every entity of a kind, falling back to the last snapshot on
    /// QueryFailure.
    pub async fn fetch_all<T: DomainEntity>(&self) -> SyncResult<ReadOutcome<Vec<T>>> {
        self.handle
            .run(move |session| {
                let (maps, fresh) = match session.fetch_records(T::KIND, None) {
                    Ok(records) => {
                        let maps: Vec<FieldMap> = records.into_iter().map(|r| r.fields).collect();
                        session.store_snapshot(T::KIND, maps.clone());
                        (maps, true)
                    }
                    Err(e) if e.is_query_failure() => match session.snapshot(T::KIND) {
                        Some(snapshot) => {
                            warn!(kind = %T::KIND, error = %e, "serving stale snapshot");
                            (snapshot.clone(), false)
                        }
                        None => return Err(e),
                    },
                    Err(e) => return Err(e),
                };

                let entities = maps
                    .into_iter()
                    .map(|fields| serde_json::from_value::<T>(Value::Object(fields)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if fresh {
                    ReadOutcome::Fresh(entities)
                } else {
                    ReadOutcome::Stale(entities)
                })
            })
            .await
    }

    /// Identity key of the live link target, or None if the link is dangling
    pub async fn live_link(
        &self,
        owner_kind: EntityKind,
        owner_id: &str,
        ref_name: &str,
    ) -> SyncResult<Option<String>> {
        let owner_id = owner_id.to_string();
        let ref_name = ref_name.to_string();
        let resolver = ReferenceResolver::new(self.chunk_size);
        self.handle
            .run(move |session| resolver.live_target(session, owner_kind, &owner_id, &ref_name))
            .await
    }

    pub async fn count(&self, kind: EntityKind) -> SyncResult<i64> {
        self.handle.run(move |session| session.count(kind)).await
    }

    pub async fn is_cached(&self, kind: EntityKind, id: &str) -> SyncResult<bool> {
        let id = id.to_string();
        self.handle.run(move |session| Ok(session.is_cached(kind, &id))).await
    }

    /// Arbitrary read-only access to the reader's session
    pub async fn perform_read<F, T>(&self, read: F) -> SyncResult<T>
    where
        F: FnOnce(&Session) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.handle.run(move |session| read(session)).await
    }

    /// Merge a committed delta. Used by the change propagator.
    pub(crate) async fn merge(&self, delta: ChangeDelta) -> SyncResult<MergeOutcome> {
        self.handle.run(move |session| Ok(merge_into(session, &delta))).await
    }

    pub(crate) fn merge_blocking(&self, delta: ChangeDelta) -> SyncResult<MergeOutcome> {
        self.handle.run_blocking(move |session| Ok(merge_into(session, &delta)))
    }
}
