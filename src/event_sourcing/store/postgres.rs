use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Connection, PgConnection, Postgres, Row};
use uuid::Uuid;

use super::{AggregateRecord, EventRepository, Snapshot, SnapshotStore};
use crate::config::DatabaseConfig;
use crate::event_sourcing::core::{CommitToken, EncodedEvent, Position, StoredEvent};
use crate::event_sourcing::subscription::{CursorLease, DeadLetter, SubscriptionCursor, SubscriptionStore};
use crate::event_sourcing::StoreError;

// ============================================================================
// PostgreSQL Event Store
// ============================================================================
//
// Tables (see migrations/0001_event_store.sql):
// - es_aggregate:          version ledger, updated only by compare-and-swap
// - es_event:              write-once event rows tagged with the xid8 of the
//                          appending transaction
// - es_aggregate_snapshot: optional state snapshots
// - es_event_subscription: per-subscription cursor, guarded by a session
//                          advisory lock on hashtext(subscription_name)
// - es_dead_letter:        poison events parked by the dispatcher
//
// The commit token of an event is `pg_current_xact_id()` of the transaction
// that wrote it. The dispatcher's watermark is
// `pg_snapshot_xmin(pg_current_snapshot())`: every xid below it has either
// committed or aborted, so no event with a smaller token can show up later.
//
// ============================================================================

const SCHEMA: &str = include_str!("../../../migrations/0001_event_store.sql");

const SELECT_EVENTS: &str = "
    SELECT e.id, e.transaction_id::text AS transaction_id, e.aggregate_id, a.aggregate_type,
           e.version, e.event_kind, e.payload, e.created_at
    FROM es_event e
    JOIN es_aggregate a ON a.id = e.aggregate_id
    WHERE e.aggregate_id = $1
      AND ($2::bigint IS NULL OR e.version > $2)
      AND ($3::bigint IS NULL OR e.version <= $3)
    ORDER BY e.version ASC";

const SELECT_UNDELIVERED: &str = "
    SELECT e.id, e.transaction_id::text AS transaction_id, e.aggregate_id, a.aggregate_type,
           e.version, e.event_kind, e.payload, e.created_at
    FROM es_event e
    JOIN es_aggregate a ON a.id = e.aggregate_id
    WHERE a.aggregate_type = $1
      AND ($2::text IS NULL OR (e.transaction_id, e.id) > ($2::text::xid8, $3::bigint))
      AND e.transaction_id < $4::text::xid8
    ORDER BY e.transaction_id ASC, e.id ASC
    LIMIT $5";

/// Open a pool with the configured limits
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    Ok(pool)
}

fn parse_token(text: &str) -> Result<CommitToken, StoreError> {
    text.parse::<u64>()
        .map(CommitToken)
        .map_err(|_| StoreError::InvalidCommitToken(text.to_string()))
}

fn stored_event_from_row(row: &PgRow) -> Result<StoredEvent, StoreError> {
    let transaction_id: String = row.try_get("transaction_id")?;
    Ok(StoredEvent {
        id: row.try_get("id")?,
        commit_token: parse_token(&transaction_id)?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        version: row.try_get("version")?,
        event_kind: row.try_get("event_kind")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Unique violations, serialization failures and deadlocks on the append
/// path all mean another writer got to the aggregate first.
fn is_write_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() || matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

pub struct PostgresEventRepository {
    pool: PgPool,
}

impl PostgresEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the event store tables if they do not exist. Concurrent callers
    /// take turns on a transaction-scoped advisory lock.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('es_event_store_schema'))")
            .execute(&mut *tx)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&mut *tx).await?;
        tx.commit().await?;
        tracing::info!("Event store schema is up to date");
        Ok(())
    }

    async fn current_record(conn: &mut PgConnection, aggregate_id: Uuid) -> Result<Option<(String, i64)>, StoreError> {
        let row = sqlx::query("SELECT aggregate_type, version FROM es_aggregate WHERE id = $1")
            .bind(aggregate_id)
            .fetch_optional(conn)
            .await?;

        match row {
            Some(row) => Ok(Some((row.try_get("aggregate_type")?, row.try_get("version")?))),
            None => Ok(None),
        }
    }

    /// Steps 2-5 of the append protocol, inside the caller's transaction
    async fn append_in(
        conn: &mut PgConnection,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: Vec<EncodedEvent>,
    ) -> Result<(), StoreError> {
        let new_version = expected_version + events.len() as i64;
        let type_mismatch = |actual: String| StoreError::AggregateTypeMismatch {
            aggregate_id,
            expected: aggregate_type.to_string(),
            actual,
        };

        let updated: Option<String> = sqlx::query_scalar(
            "UPDATE es_aggregate SET version = $3 WHERE id = $1 AND version = $2 RETURNING aggregate_type",
        )
        .bind(aggregate_id)
        .bind(expected_version)
        .bind(new_version)
        .fetch_optional(&mut *conn)
        .await?;

        match updated {
            // Returning an error drops the caller's transaction, which undoes the update
            Some(stored_type) if stored_type != aggregate_type => return Err(type_mismatch(stored_type)),
            Some(_) => {}
            None => {
                let inserted = if expected_version == 0 {
                    sqlx::query(
                        "INSERT INTO es_aggregate (id, aggregate_type, version) VALUES ($1, $2, $3)
                         ON CONFLICT (id) DO NOTHING",
                    )
                    .bind(aggregate_id)
                    .bind(aggregate_type)
                    .bind(new_version)
                    .execute(&mut *conn)
                    .await?
                    .rows_affected()
                } else {
                    0
                };

                if inserted == 0 {
                    return Err(match Self::current_record(conn, aggregate_id).await? {
                        Some((stored_type, _)) if stored_type != aggregate_type => type_mismatch(stored_type),
                        record => StoreError::Concurrency {
                            aggregate_id,
                            expected_version,
                            actual_version: Some(record.map_or(0, |(_, version)| version)),
                        },
                    });
                }
            }
        }

        let mut version = expected_version;
        for event in events {
            version += 1;
            let event_id: i64 = sqlx::query_scalar(
                "INSERT INTO es_event (transaction_id, aggregate_id, version, event_kind, payload)
                 VALUES (pg_current_xact_id(), $1, $2, $3, $4)
                 RETURNING id",
            )
            .bind(aggregate_id)
            .bind(version)
            .bind(&event.kind)
            .bind(&event.payload)
            .fetch_one(&mut *conn)
            .await?;

            tracing::debug!(
                event_id = event_id,
                aggregate_id = %aggregate_id,
                version = version,
                event_kind = %event.kind,
                "Persisted event"
            );
        }

        Ok(())
    }
}

#[async_trait]
impl EventRepository for PostgresEventRepository {
    async fn append(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: Vec<EncodedEvent>,
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let conflict = |err: sqlx::Error| {
            if is_write_conflict(&err) {
                StoreError::Concurrency { aggregate_id, expected_version, actual_version: None }
            } else {
                StoreError::Database(err)
            }
        };

        let mut tx = self.pool.begin().await?;
        match Self::append_in(&mut tx, aggregate_id, aggregate_type, expected_version, events).await {
            Ok(()) => {}
            Err(StoreError::Database(err)) => return Err(conflict(err)),
            Err(other) => return Err(other),
        }
        tx.commit().await.map_err(conflict)?;

        Ok(())
    }

    async fn events(
        &self,
        aggregate_id: Uuid,
        from_version: Option<i64>,
        to_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let rows = sqlx::query(SELECT_EVENTS)
            .bind(aggregate_id)
            .bind(from_version)
            .bind(to_version)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(stored_event_from_row).collect()
    }

    async fn aggregate_record(&self, aggregate_id: Uuid) -> Result<Option<AggregateRecord>, StoreError> {
        let row = sqlx::query("SELECT id, aggregate_type, version FROM es_aggregate WHERE id = $1")
            .bind(aggregate_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(AggregateRecord {
                aggregate_id: row.try_get("id")?,
                aggregate_type: row.try_get("aggregate_type")?,
                current_version: row.try_get("version")?,
            })),
            None => Ok(None),
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    async fn latest(
        &self,
        aggregate_id: Uuid,
        max_version: Option<i64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(
            "SELECT s.aggregate_id, a.aggregate_type, s.version, s.state, s.created_at
             FROM es_aggregate_snapshot s
             JOIN es_aggregate a ON a.id = s.aggregate_id
             WHERE s.aggregate_id = $1 AND ($2::bigint IS NULL OR s.version <= $2)
             ORDER BY s.version DESC
             LIMIT 1",
        )
        .bind(aggregate_id)
        .bind(max_version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Snapshot {
                aggregate_id: row.try_get("aggregate_id")?,
                aggregate_type: row.try_get("aggregate_type")?,
                version: row.try_get("version")?,
                state: row.try_get("state")?,
                created_at: row.try_get("created_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO es_aggregate_snapshot (aggregate_id, version, state, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (aggregate_id, version) DO NOTHING",
        )
        .bind(snapshot.aggregate_id)
        .bind(snapshot.version)
        .bind(&snapshot.state)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ============================================================================
// Subscription cursors
// ============================================================================

pub struct PostgresSubscriptionStore {
    pool: PgPool,
}

impl PostgresSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Exclusive hold on one subscription for the length of a batch.
///
/// Exclusivity comes from a session advisory lock on a dedicated pooled
/// connection. Advisory locks do not allocate an xid, so a slow handler
/// never holds back the watermark other subscriptions read. Reads run as
/// plain autocommit statements; the cursor and any dead letters are written
/// in one short transaction at `commit`.
struct PostgresLease {
    conn: Option<PoolConnection<Postgres>>,
    cursor: SubscriptionCursor,
    dead_letters: Vec<DeadLetter>,
}

impl PostgresLease {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(StoreError::LeaseReleased(self.cursor.subscription_name.clone())),
        }
    }
}

impl Drop for PostgresLease {
    fn drop(&mut self) {
        // Still locked: the lock lives as long as the session, so the
        // session goes instead of back to the pool
        if let Some(mut conn) = self.conn.take() {
            conn.close_on_drop();
        }
    }
}

async fn insert_dead_letter(conn: &mut PgConnection, letter: &DeadLetter) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO es_dead_letter (
            subscription_name, event_id, transaction_id, aggregate_id, aggregate_type,
            event_kind, payload, error_message, attempts, failed_at
         ) VALUES ($1, $2, $3::text::xid8, $4, $5, $6, $7, $8, $9, $10)
         ON CONFLICT (subscription_name, event_id) DO UPDATE
         SET error_message = EXCLUDED.error_message,
             attempts = es_dead_letter.attempts + EXCLUDED.attempts,
             failed_at = EXCLUDED.failed_at",
    )
    .bind(&letter.subscription_name)
    .bind(letter.event_id)
    .bind(letter.commit_token.to_string())
    .bind(letter.aggregate_id)
    .bind(&letter.aggregate_type)
    .bind(&letter.event_kind)
    .bind(&letter.payload)
    .bind(&letter.error)
    .bind(letter.attempts as i32)
    .bind(letter.failed_at)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl CursorLease for PostgresLease {
    fn cursor(&self) -> &SubscriptionCursor {
        &self.cursor
    }

    async fn watermark(&mut self) -> Result<CommitToken, StoreError> {
        let xmin: String = sqlx::query_scalar("SELECT pg_snapshot_xmin(pg_current_snapshot())::text")
            .fetch_one(self.conn()?)
            .await?;
        parse_token(&xmin)
    }

    async fn fetch_batch(
        &mut self,
        aggregate_type: &str,
        watermark: CommitToken,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let last_token = self.cursor.position().map(|p| p.commit_token.to_string());
        let last_event_id = self.cursor.position().map(|p| p.event_id);

        let rows = sqlx::query(SELECT_UNDELIVERED)
            .bind(aggregate_type)
            .bind(last_token)
            .bind(last_event_id)
            .bind(watermark.to_string())
            .bind(limit as i64)
            .fetch_all(self.conn()?)
            .await?;

        rows.iter().map(stored_event_from_row).collect()
    }

    async fn dead_letter(&mut self, letter: DeadLetter) -> Result<(), StoreError> {
        self.conn()?;
        self.dead_letters.push(letter);
        Ok(())
    }

    async fn commit(&mut self, position: Option<Position>) -> Result<(), StoreError> {
        let name = self.cursor.subscription_name.clone();
        let advance = position.filter(|p| self.cursor.precedes(*p));
        let letters = std::mem::take(&mut self.dead_letters);

        let conn = self.conn()?;
        if advance.is_some() || !letters.is_empty() {
            let mut tx = conn.begin().await?;
            for letter in &letters {
                insert_dead_letter(&mut tx, letter).await?;
            }
            if let Some(position) = advance {
                sqlx::query(
                    "UPDATE es_event_subscription
                     SET last_transaction_id = $2::text::xid8, last_event_id = $3
                     WHERE subscription_name = $1",
                )
                .bind(&name)
                .bind(position.commit_token.to_string())
                .bind(position.event_id)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }

        sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&name)
            .execute(&mut *conn)
            .await?;

        if let Some(position) = advance {
            self.cursor.advance_to(position);
        }
        // Unlocked, the connection can go back to the pool
        self.conn = None;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PostgresSubscriptionStore {
    async fn lease(&self, subscription_name: &str) -> Result<Box<dyn CursorLease>, StoreError> {
        let mut lease = PostgresLease {
            conn: Some(self.pool.acquire().await?),
            cursor: SubscriptionCursor::new(subscription_name),
            dead_letters: Vec::new(),
        };
        let conn = lease.conn()?;

        sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
            .bind(subscription_name)
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            "INSERT INTO es_event_subscription (subscription_name) VALUES ($1)
             ON CONFLICT (subscription_name) DO NOTHING",
        )
        .bind(subscription_name)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query(
            "SELECT last_transaction_id::text AS last_transaction_id, last_event_id
             FROM es_event_subscription
             WHERE subscription_name = $1",
        )
        .bind(subscription_name)
        .fetch_one(&mut *conn)
        .await?;

        let last_token: Option<String> = row.try_get("last_transaction_id")?;
        lease.cursor.last_commit_token = last_token.as_deref().map(parse_token).transpose()?;
        lease.cursor.last_event_id = row.try_get("last_event_id")?;

        Ok(Box::new(lease))
    }

    async fn cursor(&self, subscription_name: &str) -> Result<Option<SubscriptionCursor>, StoreError> {
        let row = sqlx::query(
            "SELECT last_transaction_id::text AS last_transaction_id, last_event_id
             FROM es_event_subscription
             WHERE subscription_name = $1",
        )
        .bind(subscription_name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let last_token: Option<String> = row.try_get("last_transaction_id")?;
        Ok(Some(SubscriptionCursor {
            subscription_name: subscription_name.to_string(),
            last_commit_token: last_token.as_deref().map(parse_token).transpose()?,
            last_event_id: row.try_get("last_event_id")?,
        }))
    }

    async fn dead_letters(&self, subscription_name: &str) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            "SELECT subscription_name, event_id, transaction_id::text AS transaction_id, aggregate_id,
                    aggregate_type, event_kind, payload, error_message, attempts, failed_at
             FROM es_dead_letter
             WHERE subscription_name = $1
             ORDER BY transaction_id ASC, event_id ASC",
        )
        .bind(subscription_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DeadLetter, StoreError> {
                let transaction_id: String = row.try_get("transaction_id")?;
                let attempts: i32 = row.try_get("attempts")?;
                Ok(DeadLetter {
                    subscription_name: row.try_get("subscription_name")?,
                    event_id: row.try_get("event_id")?,
                    commit_token: parse_token(&transaction_id)?,
                    aggregate_id: row.try_get("aggregate_id")?,
                    aggregate_type: row.try_get("aggregate_type")?,
                    event_kind: row.try_get("event_kind")?,
                    payload: row.try_get("payload")?,
                    error: row.try_get("error_message")?,
                    attempts: attempts.max(0) as u32,
                    failed_at: row.try_get("failed_at")?,
                })
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
//
// These need a live PostgreSQL 13+ reachable through DATABASE_URL and are
// ignored by default: `cargo test -- --ignored postgres`.
//
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn encoded(n: usize) -> Vec<EncodedEvent> {
        (0..n)
            .map(|_| EncodedEvent { kind: "Tick".to_string(), payload: json!({ "kind": "Tick" }) })
            .collect()
    }

    /// A fresh aggregate type per test keeps subscription fetches isolated
    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
        let pool = PgPool::connect(&url).await.unwrap();
        PostgresEventRepository::new(pool.clone()).migrate().await.unwrap();
        pool
    }

    async fn repository() -> PostgresEventRepository {
        PostgresEventRepository::new(pool().await)
    }

    /// Poll until at least `n` events are visible below the watermark. Other
    /// tests' open transactions may hold the watermark back for a moment.
    async fn fetch_until(store: &PostgresSubscriptionStore, name: &str, kind: &str, n: usize) -> Vec<StoredEvent> {
        let mut batch = Vec::new();
        for _ in 0..50 {
            let mut lease = store.lease(name).await.unwrap();
            let watermark = lease.watermark().await.unwrap();
            batch = lease.fetch_batch(kind, watermark, 100).await.unwrap();
            lease.commit(None).await.unwrap();
            if batch.len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        batch
    }

    #[test]
    fn test_parse_token_rejects_garbage() {
        assert_eq!(parse_token("742").unwrap(), CommitToken(742));
        assert!(matches!(parse_token("-1"), Err(StoreError::InvalidCommitToken(_))));
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_append_is_gapless_and_checks_versions() {
        let repository = repository().await;
        let id = Uuid::new_v4();

        repository.append(id, "Clock", 0, encoded(2)).await.unwrap();
        repository.append(id, "Clock", 2, encoded(1)).await.unwrap();
        let stale = repository.append(id, "Clock", 2, encoded(1)).await.unwrap_err();

        assert!(stale.is_concurrency_conflict());
        let versions: Vec<i64> = repository
            .events(id, None, None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_events_of_one_append_share_a_commit_token() {
        let repository = repository().await;
        let id = Uuid::new_v4();

        repository.append(id, "Clock", 0, encoded(3)).await.unwrap();
        let events = repository.events(id, None, None).await.unwrap();

        assert!(events.iter().all(|e| e.commit_token == events[0].commit_token));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore]
    async fn test_postgres_concurrent_appends_have_one_winner() {
        let repository = repository().await;

        for expected_version in [0, 1] {
            let id = Uuid::new_v4();
            if expected_version == 1 {
                repository.append(id, "Clock", 0, encoded(1)).await.unwrap();
            }

            let (left, right) = tokio::join!(
                repository.append(id, "Clock", expected_version, encoded(1)),
                repository.append(id, "Clock", expected_version, encoded(2)),
            );

            let outcomes = [left, right];
            assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(outcomes
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| e.is_concurrency_conflict()));

            let record = repository.aggregate_record(id).await.unwrap().unwrap();
            let history = repository.events(id, None, None).await.unwrap();
            assert_eq!(history.len() as i64, record.current_version);
            assert!(history.iter().enumerate().all(|(i, e)| e.version == i as i64 + 1));
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_append_under_another_type_is_rejected() {
        let repository = repository().await;
        let id = Uuid::new_v4();
        repository.append(id, "Clock", 0, encoded(1)).await.unwrap();

        let err = repository.append(id, "Alarm", 1, encoded(1)).await.unwrap_err();

        assert!(matches!(err, StoreError::AggregateTypeMismatch { ref actual, .. } if actual == "Clock"));
        let record = repository.aggregate_record(id).await.unwrap().unwrap();
        assert_eq!(record.aggregate_type, "Clock");
        assert_eq!(record.current_version, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_open_transaction_holds_back_later_commits() {
        let pool = pool().await;
        let repository = PostgresEventRepository::new(pool.clone());
        let store = PostgresSubscriptionStore::new(pool.clone());
        let kind = unique("Clock");
        let name = unique("clock-watch");
        let (early, late) = (Uuid::new_v4(), Uuid::new_v4());

        let mut open = pool.begin().await.unwrap();
        PostgresEventRepository::append_in(&mut open, early, &kind, 0, encoded(1)).await.unwrap();
        repository.append(late, &kind, 0, encoded(1)).await.unwrap();

        let mut lease = store.lease(&name).await.unwrap();
        let watermark = lease.watermark().await.unwrap();
        assert!(lease.fetch_batch(&kind, watermark, 100).await.unwrap().is_empty());
        lease.commit(None).await.unwrap();

        open.commit().await.unwrap();
        let batch = fetch_until(&store, &name, &kind, 2).await;

        let order: Vec<Uuid> = batch.iter().map(|e| e.aggregate_id).collect();
        assert_eq!(order, vec![early, late]);
        assert!(batch[0].position() < batch[1].position());
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_held_lease_does_not_hold_back_other_subscriptions() {
        let pool = pool().await;
        let repository = PostgresEventRepository::new(pool.clone());
        let store = PostgresSubscriptionStore::new(pool.clone());
        let kind = unique("Clock");
        let (stuck, moving) = (unique("stuck"), unique("moving"));

        repository.append(Uuid::new_v4(), &kind, 0, encoded(1)).await.unwrap();
        let mut held = store.lease(&stuck).await.unwrap();
        let watermark = held.watermark().await.unwrap();
        assert_eq!(held.fetch_batch(&kind, watermark, 100).await.unwrap().len(), 1);

        // Committed while the other subscription is mid-batch
        repository.append(Uuid::new_v4(), &kind, 0, encoded(1)).await.unwrap();
        let batch = fetch_until(&store, &moving, &kind, 2).await;
        assert_eq!(batch.len(), 2);

        held.commit(None).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_cursor_survives_across_leases() {
        let pool = pool().await;
        let repository = PostgresEventRepository::new(pool.clone());
        let store = PostgresSubscriptionStore::new(pool.clone());
        let kind = unique("Clock");
        let name = unique("clock-watch");

        repository.append(Uuid::new_v4(), &kind, 0, encoded(2)).await.unwrap();
        let batch = fetch_until(&store, &name, &kind, 2).await;
        let last = batch[1].position();

        let mut lease = store.lease(&name).await.unwrap();
        lease.commit(Some(last)).await.unwrap();
        assert_eq!(store.cursor(&name).await.unwrap().and_then(|c| c.position()), Some(last));

        let mut lease = store.lease(&name).await.unwrap();
        assert_eq!(lease.cursor().position(), Some(last));
        let watermark = lease.watermark().await.unwrap();
        assert!(lease.fetch_batch(&kind, watermark, 100).await.unwrap().is_empty());
        // Moving backwards is ignored
        lease.commit(Some(batch[0].position())).await.unwrap();
        assert_eq!(store.cursor(&name).await.unwrap().and_then(|c| c.position()), Some(last));

        let third = Uuid::new_v4();
        repository.append(third, &kind, 0, encoded(1)).await.unwrap();
        let batch = fetch_until(&store, &name, &kind, 1).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].aggregate_id, third);
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_dead_letter_is_upserted_per_event() {
        let pool = pool().await;
        let repository = PostgresEventRepository::new(pool.clone());
        let store = PostgresSubscriptionStore::new(pool.clone());
        let name = unique("clock-watch");
        let id = Uuid::new_v4();

        repository.append(id, "Clock", 0, encoded(1)).await.unwrap();
        let event = repository.events(id, None, None).await.unwrap().remove(0);

        for (attempts, error) in [(3, "first failure"), (2, "second failure")] {
            let mut lease = store.lease(&name).await.unwrap();
            lease
                .dead_letter(DeadLetter::from_event(&name, &event, error.to_string(), attempts))
                .await
                .unwrap();
            lease.commit(None).await.unwrap();
        }

        let letters = store.dead_letters(&name).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event_id, event.id);
        assert_eq!(letters[0].attempts, 5);
        assert_eq!(letters[0].error, "second failure");
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_dropped_lease_releases_the_subscription() {
        let pool = pool().await;
        let store = PostgresSubscriptionStore::new(pool.clone());
        let name = unique("clock-watch");

        drop(store.lease(&name).await.unwrap());

        let relocked = tokio::time::timeout(Duration::from_secs(5), store.lease(&name)).await;
        assert!(relocked.is_ok(), "lease should be free once the holder is dropped");
    }
}
