// Ledger Sync - Core Library
// Keeps the ledger's domain entities in step with the on-device SQLite store:
// reconciliation, reference wiring, serialized saves, bulk import, duplicate
// suppression and propagation into the read side.

pub mod config;
pub mod error;
pub mod logging;
pub mod entities;       // Domain entity catalog (arena + index)
pub mod deduplication;  // Duplicate Detector
pub mod store;          // Durable Store + execution contexts
pub mod resolver;       // Reference Resolver
pub mod reconciliation; // Reconciliation Engine
pub mod coordinator;    // Save Coordinator
pub mod bulk;           // Bulk Importer
pub mod propagation;    // Change Propagator
pub mod import;         // CSV import pipeline
pub mod producers;      // Recurring generator + aggregate recompute

// Re-export commonly used types
pub use config::StoreConfig;
pub use error::{SyncError, SyncResult};
pub use entities::{
    Account, AccountType, Aggregate, AggregateKey, Category, CategoryKind, DomainEntity, EntityKind, Frequency,
    GeneratedBatch, Link, RecurringOccurrence, RecurringSeries, Reference, SoftRef, Transaction, TransactionKind,
};
pub use deduplication::{is_duplicate, DedupOutcome, DuplicateDetector, Fingerprint};
pub use store::{CommitEvent, ReadOutcome, ReaderContext, Session, Store, WriterContext};
pub use resolver::{LiveLink, ReferenceResolver, WireStats};
pub use reconciliation::{ApplyReport, ChangeSet, EntityUpdate, ReconciliationEngine, Scope, SyncReport};
pub use coordinator::{CoordinatorState, SaveCoordinator, SaveOutcome};
pub use bulk::{BulkImporter, BulkInsertReport};
pub use propagation::{ChangeDelta, ChangePropagator, MergeOutcome};
pub use import::{load_csv, ImportBatch, ImportPipeline, ImportReport};
pub use producers::{commit_aggregates, commit_recurring, RecurringReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
