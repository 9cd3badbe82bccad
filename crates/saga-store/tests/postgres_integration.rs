//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use saga_store::{
    CorrelationId, CorrelationStore, DeadLetter, DeadLetterId, DeadLetterStore, OutboxEntry,
    OutboxStore, PostgresSagaStore, SagaRecord, ScheduledTimeout, StoreError, TimeoutStore,
    TimeoutTokenId, Version,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!("../../../migrations/001_create_saga_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/002_add_outbox_and_timeout_leases.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_instances, saga_outbox, saga_timeouts, saga_dead_letters")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

fn create_test_record(correlation_id: CorrelationId, status: &str) -> SagaRecord {
    let now = Utc::now();
    SagaRecord {
        correlation_id,
        saga_type: "BookingSaga".to_string(),
        status: status.to_string(),
        terminal: false,
        version: Version::initial(),
        payload: serde_json::json!({"state": status}),
        created_at: now,
        updated_at: now,
    }
}

fn create_test_timeout(
    correlation_id: CorrelationId,
    deadline: chrono::DateTime<Utc>,
) -> ScheduledTimeout {
    ScheduledTimeout {
        token_id: TimeoutTokenId::new(),
        correlation_id,
        kind: "payment".to_string(),
        deadline,
        payload: serde_json::json!({"type": "PaymentTimeoutExpired"}),
        scheduled_at: Utc::now(),
        claimed_until: None,
    }
}

fn create_test_entry(correlation_id: CorrelationId, seq: u32) -> OutboxEntry {
    OutboxEntry {
        correlation_id,
        version: Version::initial(),
        seq,
        effect_kind: "publish".to_string(),
        payload: serde_json::json!({"effect": "publish", "seq": seq}),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn insert_and_load_record() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let version = store.insert(create_test_record(id, "Initial"), vec![]).await.unwrap();
    assert_eq!(version, Version::first());

    let record = CorrelationStore::get(&store, id).await.unwrap().unwrap();
    assert_eq!(record.correlation_id, id);
    assert_eq!(record.status, "Initial");
    assert_eq!(record.version, Version::first());
    assert_eq!(record.payload["state"], "Initial");
}

#[tokio::test]
async fn duplicate_insert_is_rejected() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    store.insert(create_test_record(id, "Initial"), vec![]).await.unwrap();
    let result = store.insert(create_test_record(id, "Initial"), vec![]).await;

    assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
}

#[tokio::test]
async fn compare_and_swap_update() {
    let store = get_test_store().await;
    let id = CorrelationId::new();
    store.insert(create_test_record(id, "Initial"), vec![]).await.unwrap();

    let version = store
        .update(create_test_record(id, "Waiting"), Version::first(), vec![])
        .await
        .unwrap();
    assert_eq!(version, Version::new(2));

    let stale = store
        .update(create_test_record(id, "Stale"), Version::first(), vec![])
        .await;
    match stale {
        Err(StoreError::ConcurrencyConflict { actual, .. }) => {
            assert_eq!(actual, Version::new(2));
        }
        other => panic!("Expected ConcurrencyConflict, got {:?}", other),
    }

    let record = CorrelationStore::get(&store, id).await.unwrap().unwrap();
    assert_eq!(record.status, "Waiting");
}

#[tokio::test]
async fn concurrent_updates_only_one_wins() {
    let store = get_test_store().await;
    let id = CorrelationId::new();
    store.insert(create_test_record(id, "Initial"), vec![]).await.unwrap();

    let a = store.update(create_test_record(id, "A"), Version::first(), vec![]);
    let b = store.update(create_test_record(id, "B"), Version::first(), vec![]);
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
}

#[tokio::test]
async fn update_missing_record_is_not_found() {
    let store = get_test_store().await;
    let result = store
        .update(
            create_test_record(CorrelationId::new(), "Waiting"),
            Version::first(),
            vec![],
        )
        .await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn find_by_status() {
    let store = get_test_store().await;
    store
        .insert(create_test_record(CorrelationId::new(), "Waiting"), vec![])
        .await
        .unwrap();
    store
        .insert(create_test_record(CorrelationId::new(), "Waiting"), vec![])
        .await
        .unwrap();
    store
        .insert(create_test_record(CorrelationId::new(), "Completed"), vec![])
        .await
        .unwrap();

    assert_eq!(store.find_by_status("Waiting", 10).await.unwrap().len(), 2);
    assert_eq!(store.find_by_status("Waiting", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn timeouts_claim_and_cancel() {
    let store = get_test_store().await;
    let id = CorrelationId::new();
    let now = Utc::now();

    let due = create_test_timeout(id, now - Duration::seconds(5));
    let pending = create_test_timeout(id, now + Duration::minutes(15));
    let cancelled = create_test_timeout(id, now - Duration::seconds(1));
    store.schedule(due.clone()).await.unwrap();
    store.schedule(pending.clone()).await.unwrap();
    store.schedule(cancelled.clone()).await.unwrap();

    assert!(store.cancel(cancelled.token_id).await.unwrap());
    assert!(!store.cancel(cancelled.token_id).await.unwrap());

    let lease_until = now + Duration::seconds(30);
    let claimed = store.claim_due(now, lease_until, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].token_id, due.token_id);
    assert_eq!(claimed[0].payload["type"], "PaymentTimeoutExpired");
    assert!(claimed[0].claimed_until.is_some());

    assert!(store.claim_due(now, lease_until, 10).await.unwrap().is_empty());

    // Delivered timeouts are removed by the poller.
    assert!(store.cancel(due.token_id).await.unwrap());
    let remaining = store.pending_for(id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].token_id, pending.token_id);
}

#[tokio::test]
async fn abandoned_claim_is_handed_out_after_lease_expires() {
    let store = get_test_store().await;
    let now = Utc::now();
    let timeout = create_test_timeout(CorrelationId::new(), now - Duration::seconds(1));
    store.schedule(timeout.clone()).await.unwrap();

    let lease_until = now + Duration::seconds(30);
    assert_eq!(store.claim_due(now, lease_until, 10).await.unwrap().len(), 1);
    assert!(
        store
            .claim_due(now + Duration::seconds(10), lease_until, 10)
            .await
            .unwrap()
            .is_empty()
    );

    let later = now + Duration::minutes(1);
    let reclaimed = store
        .claim_due(later, later + Duration::seconds(30), 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].token_id, timeout.token_id);
}

#[tokio::test]
async fn release_makes_claimed_timeout_due_again() {
    let store = get_test_store().await;
    let now = Utc::now();
    let timeout = create_test_timeout(CorrelationId::new(), now - Duration::seconds(1));
    store.schedule(timeout.clone()).await.unwrap();
    let lease_until = now + Duration::minutes(5);
    store.claim_due(now, lease_until, 10).await.unwrap();

    assert!(store.release(timeout.token_id, now).await.unwrap());
    assert_eq!(store.claim_due(now, lease_until, 10).await.unwrap().len(), 1);
    assert!(!store.release(TimeoutTokenId::new(), now).await.unwrap());
}

#[tokio::test]
async fn outbox_is_committed_with_the_record() {
    let store = get_test_store().await;
    let id = CorrelationId::new();
    store
        .insert(
            create_test_record(id, "Initial"),
            vec![create_test_entry(id, 0), create_test_entry(id, 1)],
        )
        .await
        .unwrap();
    store
        .update(
            create_test_record(id, "Waiting"),
            Version::first(),
            vec![create_test_entry(id, 0)],
        )
        .await
        .unwrap();

    let pending = store.pending_outbox(id).await.unwrap();
    let keys: Vec<_> = pending.iter().map(|e| (e.version, e.seq)).collect();
    assert_eq!(
        keys,
        vec![
            (Version::first(), 0),
            (Version::first(), 1),
            (Version::new(2), 0)
        ]
    );
    assert_eq!(pending[1].payload["seq"], 1);
}

#[tokio::test]
async fn rejected_saves_leave_no_outbox_rows() {
    let store = get_test_store().await;
    let id = CorrelationId::new();
    store.insert(create_test_record(id, "Initial"), vec![]).await.unwrap();

    let duplicate = store
        .insert(create_test_record(id, "Initial"), vec![create_test_entry(id, 0)])
        .await;
    assert!(matches!(duplicate, Err(StoreError::AlreadyExists(_))));
    let stale = store
        .update(
            create_test_record(id, "Waiting"),
            Version::new(5),
            vec![create_test_entry(id, 0)],
        )
        .await;
    assert!(matches!(stale, Err(StoreError::ConcurrencyConflict { .. })));

    assert!(store.pending_outbox(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn settle_and_sweep_outbox() {
    let store = get_test_store().await;
    let id = CorrelationId::new();
    store
        .insert(
            create_test_record(id, "Initial"),
            vec![create_test_entry(id, 0)],
        )
        .await
        .unwrap();

    let now = Utc::now();
    assert!(
        store
            .stale_outbox(now - Duration::minutes(1), 10)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(store.stale_outbox(now, 10).await.unwrap(), vec![id]);

    assert!(store.settle(id, Version::first(), 0).await.unwrap());
    assert!(!store.settle(id, Version::first(), 0).await.unwrap());
    assert!(store.stale_outbox(now, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_claims_hand_out_each_timeout_once() {
    let store = get_test_store().await;
    let now = Utc::now();
    for _ in 0..10 {
        store
            .schedule(create_test_timeout(
                CorrelationId::new(),
                now - Duration::seconds(1),
            ))
            .await
            .unwrap();
    }

    let lease_until = now + Duration::seconds(30);
    let (a, b) = tokio::join!(
        store.claim_due(now, lease_until, 10),
        store.claim_due(now, lease_until, 10)
    );
    let total = a.unwrap().len() + b.unwrap().len();
    assert_eq!(total, 10);
}

#[tokio::test]
async fn dead_letters_roundtrip() {
    let store = get_test_store().await;
    let letter = DeadLetter {
        id: DeadLetterId::new(),
        correlation_id: CorrelationId::new(),
        effect_kind: "publish".to_string(),
        payload: serde_json::json!({"type": "CancelBooking"}),
        last_error: "connection refused".to_string(),
        attempts: 5,
        created_at: Utc::now(),
    };

    store.record(letter.clone()).await.unwrap();

    let loaded = DeadLetterStore::get(&store, letter.id).await.unwrap().unwrap();
    assert_eq!(loaded.effect_kind, "publish");
    assert_eq!(loaded.attempts, 5);
    assert_eq!(store.list(10).await.unwrap().len(), 1);

    assert!(store.remove(letter.id).await.unwrap());
    assert!(DeadLetterStore::get(&store, letter.id).await.unwrap().is_none());
}
