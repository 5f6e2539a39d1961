// End-to-end sync scenarios against a file-backed store

use chrono::NaiveDate;
use ledger_sync::store::FieldMap;
use ledger_sync::{
    Account, EntityKind, ImportBatch, ImportPipeline, MergeOutcome, ReconciliationEngine, RecurringSeries,
    ReferenceResolver, Scope, SoftRef, Store, StoreConfig, SyncError, Transaction,
};
use std::collections::BTreeSet;
use tempfile::TempDir;

fn open_store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreConfig::new(dir.path().join("ledger.db"))).unwrap();
    (dir, store)
}

fn engine() -> ReconciliationEngine {
    ReconciliationEngine::new(ReferenceResolver::new(100))
}

fn create_test_transaction(id: &str, description: &str, account: SoftRef) -> Transaction {
    Transaction::new(id, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(), 100.0, description, account)
}

async fn sync_accounts(store: &Store, target: Vec<Account>) {
    let engine = engine();
    store
        .coordinator("ui")
        .unwrap()
        .perform("sync accounts", move |session| engine.sync(&target, &Scope::Full, session))
        .await
        .unwrap();
}

async fn persisted_keys(store: &Store, kind: EntityKind) -> BTreeSet<String> {
    store.reader().perform_read(move |session| session.identity_keys(kind)).await.unwrap()
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn scenario_create_into_empty_store() {
    let (_dir, store) = open_store();
    sync_accounts(&store, vec![Account::new("1", "Checking"), Account::new("2", "Savings")]).await;
    assert_eq!(store.reader().count(EntityKind::Account).await.unwrap(), 2);
}

#[tokio::test]
async fn scenario_rename_and_drop() {
    let (_dir, store) = open_store();
    sync_accounts(&store, vec![Account::new("1", "Checking"), Account::new("2", "Savings")]).await;
    sync_accounts(&store, vec![Account::new("1", "Checking-renamed")]).await;

    let accounts = store.reader().fetch_all::<Account>().await.unwrap().into_inner();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].name, "Checking-renamed");
}

#[tokio::test]
async fn scenario_import_duplicate_is_skipped() {
    let (_dir, store) = open_store();
    let engine = engine();
    let existing = create_test_transaction("existing", "coffee", SoftRef::new("1", "Checking"));
    store
        .coordinator("ui")
        .unwrap()
        .perform("seed", move |session| engine.sync(&[existing], &Scope::Full, session))
        .await
        .unwrap();
    let before = store.last_commit_id();

    let candidate = create_test_transaction("fresh-id", "Coffee", SoftRef::new("1", "Checking"));
    let pipeline = ImportPipeline::new(store.coordinator("import").unwrap(), engine, 50);
    let (report, merge) = pipeline
        .run(ImportBatch {
            transactions: vec![candidate],
            ..ImportBatch::default()
        })
        .await
        .unwrap();

    assert_eq!(report.skipped_duplicates, 1);
    assert_eq!(report.imported, 0);
    assert_eq!(merge, MergeOutcome::Empty);
    assert_eq!(store.last_commit_id(), before);
    assert_eq!(
        persisted_keys(&store, EntityKind::Transaction).await,
        BTreeSet::from(["existing".to_string()])
    );
}

#[tokio::test]
async fn scenario_identity_collision_self_heals() {
    let (dir, store) = open_store();
    let raw = rusqlite::Connection::open(dir.path().join("ledger.db")).unwrap();
    for name in ["Kept", "Dropped"] {
        let payload = serde_json::to_string(&Account::new("x", name)).unwrap();
        raw.execute(
            "INSERT INTO accounts (id, payload, updated_at) VALUES ('x', ?1, '2024-01-01T00:00:00Z')",
            [payload],
        )
        .unwrap();
    }

    let engine = engine();
    let report = store
        .coordinator("ui")
        .unwrap()
        .perform("repair", move |session| {
            engine.sync(&[Account::new("x", "Kept").with_balance(5.0)], &Scope::Full, session)
        })
        .await
        .unwrap()
        .value;

    assert_eq!(report.collisions_repaired, 1);
    assert_eq!(report.applied.updated, 1);
    assert_eq!(store.reader().count(EntityKind::Account).await.unwrap(), 1);
    let kept: Account = store.reader().fetch("x").await.unwrap().unwrap();
    assert_eq!(kept.name, "Kept");
    assert_eq!(kept.balance, 5.0);
}

#[tokio::test]
async fn scenario_deleted_target_leaves_soft_reference() {
    let (_dir, store) = open_store();
    let engine = engine();
    let coordinator = store.coordinator("ui").unwrap();
    coordinator
        .perform("seed", move |session| {
            engine.sync(&[Account::new("1", "Checking"), Account::new("5", "Savings")], &Scope::Full, session)?;
            let tx = create_test_transaction("t1", "Transfer", SoftRef::new("1", "Checking"))
                .transfer_to(SoftRef::new("5", "Savings"));
            engine.sync(&[tx], &Scope::Full, session)
        })
        .await
        .unwrap();
    let reader = store.reader();
    assert_eq!(
        reader.live_link(EntityKind::Transaction, "t1", "target_account").await.unwrap(),
        Some("5".to_string())
    );

    coordinator
        .perform("delete account", move |session| engine.delete(EntityKind::Account, "5", session))
        .await
        .unwrap();

    let tx: Transaction = reader.fetch("t1").await.unwrap().unwrap();
    assert_eq!(tx.target_account, Some(SoftRef::new("5", "Savings")));
    assert_eq!(reader.live_link(EntityKind::Transaction, "t1", "target_account").await.unwrap(), None);
    assert_eq!(
        reader.live_link(EntityKind::Transaction, "t1", "account").await.unwrap(),
        Some("1".to_string())
    );
}

// ============================================================================
// PROPERTIES
// ============================================================================

#[tokio::test]
async fn reconciled_key_set_matches_target() {
    let (_dir, store) = open_store();
    let targets: Vec<Vec<&str>> = vec![vec!["a", "b", "c"], vec!["b", "d"], vec![], vec!["e"], vec!["e", "a", "b"]];

    for keys in targets {
        let target: Vec<Account> = keys.iter().map(|k| Account::new(*k, k.to_uppercase())).collect();
        sync_accounts(&store, target).await;

        let expected: BTreeSet<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(persisted_keys(&store, EntityKind::Account).await, expected);
    }
}

#[tokio::test]
async fn failed_save_leaves_no_trace() {
    let (_dir, store) = open_store();
    sync_accounts(&store, vec![Account::new("1", "Checking")]).await;
    let engine = engine();

    let result = store
        .coordinator("ui")
        .unwrap()
        .perform("half applied", move |session| {
            engine.sync(&[Account::new("1", "Changed"), Account::new("2", "New")], &Scope::Full, session)?;
            Err::<(), _>(SyncError::aborted("simulated failure"))
        })
        .await;

    assert!(result.is_err());
    let accounts = store.reader().fetch_all::<Account>().await.unwrap().into_inner();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].name, "Checking");
}

#[tokio::test]
async fn reader_sees_commit_when_perform_returns() {
    let (_dir, store) = open_store();
    sync_accounts(&store, vec![Account::new("1", "Checking")]).await;
    let reader = store.reader();
    let before: Account = reader.fetch("1").await.unwrap().unwrap();
    assert_eq!(before.name, "Checking");

    sync_accounts(&store, vec![Account::new("1", "Everyday")]).await;

    let after: Account = reader.fetch("1").await.unwrap().unwrap();
    assert_eq!(after.name, "Everyday");
}

#[tokio::test]
async fn concurrent_writers_merge_per_field() {
    let (_dir, store) = open_store();
    sync_accounts(&store, vec![Account::new("1", "Checking").with_balance(10.0)]).await;
    let engine = engine();
    let editor = store.coordinator("editor").unwrap();
    let recompute = store.coordinator("recompute").unwrap();

    let mut name = FieldMap::new();
    name.insert("name".into(), serde_json::json!("Main"));
    let mut balance = FieldMap::new();
    balance.insert("balance".into(), serde_json::json!(42.0));

    let (a, b) = tokio::join!(
        editor.perform("rename", move |s| engine.patch::<Account>("1", name, s)),
        recompute.perform("rebalance", move |s| engine.patch::<Account>("1", balance, s)),
    );
    a.unwrap();
    b.unwrap();

    let account: Account = store.reader().fetch("1").await.unwrap().unwrap();
    assert_eq!(account.name, "Main");
    assert_eq!(account.balance, 42.0);
}

#[tokio::test]
async fn concurrent_writes_to_one_field_keep_the_later_commit() {
    let (_dir, store) = open_store();
    sync_accounts(&store, vec![Account::new("1", "Checking")]).await;
    let engine = engine();
    let first = store.coordinator("first").unwrap();
    let second = store.coordinator("second").unwrap();

    let patch = |value: &str| {
        let mut fields = FieldMap::new();
        fields.insert("name".into(), serde_json::json!(value));
        fields
    };
    let (left, right) = (patch("Left"), patch("Right"));

    let (a, b) = tokio::join!(
        first.perform("left", move |s| engine.patch::<Account>("1", left, s)),
        second.perform("right", move |s| engine.patch::<Account>("1", right, s)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let later = if a.delta.commit_id > b.delta.commit_id { a.value } else { b.value };
    let account: Account = store.reader().fetch("1").await.unwrap().unwrap();
    assert_eq!(account.name, later.name);
}

#[tokio::test]
async fn propagating_a_delta_twice_is_a_noop() {
    let (_dir, store) = open_store();
    let outcome = store
        .coordinator("ui")
        .unwrap()
        .perform("create", |s| s.insert_entity(&Account::new("1", "Checking")))
        .await
        .unwrap();

    let again = store.propagator().propagate(&outcome.delta).await.unwrap();
    assert_eq!(again, MergeOutcome::AlreadyApplied);
}

#[tokio::test]
async fn unreadable_store_serves_stale_snapshot() {
    let (dir, store) = open_store();
    sync_accounts(&store, vec![Account::new("1", "Checking")]).await;
    let reader = store.reader();
    assert!(!reader.fetch_all::<Account>().await.unwrap().is_stale());

    let raw = rusqlite::Connection::open(dir.path().join("ledger.db")).unwrap();
    raw.execute_batch("DROP TABLE accounts").unwrap();

    let outcome = reader.fetch_all::<Account>().await.unwrap();
    assert!(outcome.is_stale());
    assert_eq!(outcome.into_inner()[0].name, "Checking");

    // Without a snapshot the failure surfaces instead of an empty list
    raw.execute_batch("DROP TABLE recurring_series").unwrap();
    let err = reader.fetch_all::<RecurringSeries>().await.unwrap_err();
    assert!(err.is_query_failure());
}
