//! Record store backends
//!
//! A record store persists `(id, value, expires_at)` rows. The SQL backend runs
//! on a sqlx `Any` pool so the connection string picks SQLite or MySQL at
//! runtime; the memory backend keeps rows in a map and is used for tests and
//! embedding.

use crate::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use kvsession_core::{
    now_epoch, validate_table_name, RecordLookup, SessionRecord, StoreConfig,
    DEFAULT_MAX_VALUE_LEN, MAX_SESSION_ID_LEN,
};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Persistence seam for session rows
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Whether a row exists for the id, expired or not
    async fn exists(&self, id: &str) -> StoreResult<bool>;

    /// Read the raw row for an id
    async fn read(&self, id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Insert a new row; an existing id yields `StoreError::Conflict`
    async fn insert(&self, record: &SessionRecord) -> StoreResult<()>;

    /// Overwrite value and expiry of an existing row, returning the number of
    /// rows matched. Zero means the row is gone.
    async fn update(&self, record: &SessionRecord) -> StoreResult<u64>;

    /// Overwrite only the expiry of an existing row
    async fn touch(&self, id: &str, expires_at: i64) -> StoreResult<()>;

    /// Delete a row. Deleting a missing id is not an error.
    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// Number of rows with `expires_at <= now`
    async fn count_expired_before(&self, now: i64) -> StoreResult<u64>;

    /// Delete rows with `expires_at <= now`, returning how many went
    async fn delete_expired_before(&self, now: i64) -> StoreResult<u64>;

    /// Health check for the storage backend
    async fn health_check(&self) -> StoreResult<()>;

    /// Release backend resources. Later calls fail with `StoreError::Closed`
    /// or a driver error.
    async fn close(&self);

    /// Backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Read a row and classify it against `now`
    async fn lookup(&self, id: &str, now: i64) -> StoreResult<RecordLookup> {
        Ok(RecordLookup::from_row(self.read(id).await?, now))
    }
}

/// Statement text for one table, built once at construction
#[derive(Debug, Clone)]
struct Statements {
    exists: String,
    read: String,
    insert: String,
    update: String,
    touch: String,
    delete: String,
    count_expired: String,
    delete_expired: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            exists: format!("SELECT COUNT(*) FROM {table} WHERE id = ?"),
            read: format!("SELECT id, value, expired_at FROM {table} WHERE id = ?"),
            insert: format!("INSERT INTO {table} (id, value, expired_at) VALUES (?, ?, ?)"),
            update: format!("UPDATE {table} SET value = ?, expired_at = ? WHERE id = ?"),
            touch: format!("UPDATE {table} SET expired_at = ? WHERE id = ?"),
            delete: format!("DELETE FROM {table} WHERE id = ?"),
            count_expired: format!("SELECT COUNT(*) FROM {table} WHERE expired_at <= ?"),
            delete_expired: format!("DELETE FROM {table} WHERE expired_at <= ?"),
        }
    }
}

/// SQL record store over a sqlx `Any` pool
pub struct SqlRecordStore {
    pool: AnyPool,
    table: String,
    value_len: usize,
    statements: Statements,
}

impl SqlRecordStore {
    /// Open a pool for `config.database_url` and make sure the table exists
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        sqlx::any::install_default_drivers();

        let lifetime = config.conn_max_lifetime();
        let idle_timeout = config.idle_timeout();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.min_connections())
            .max_lifetime((!lifetime.is_zero()).then_some(lifetime))
            .idle_timeout((!idle_timeout.is_zero()).then_some(idle_timeout))
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.database_url)
            .await?;

        let store = Self::with_pool(pool, config.effective_table_name())?
            .with_value_len(config.max_value_len);
        store.ensure_schema().await?;

        info!(
            table = %store.table,
            max_open = config.max_open_conns,
            min_idle = config.min_connections(),
            "Connected session record store"
        );
        Ok(store)
    }

    /// Wrap an existing pool. The schema is not touched; call
    /// [`ensure_schema`](Self::ensure_schema) when the table may be missing.
    pub fn with_pool(pool: AnyPool, table: &str) -> StoreResult<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            value_len: DEFAULT_MAX_VALUE_LEN,
            statements: Statements::for_table(table),
        })
    }

    /// Width of the value column used when creating the table
    pub fn with_value_len(mut self, value_len: usize) -> Self {
        self.value_len = value_len;
        self
    }

    /// Create the session table and its expiry index if missing
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        let table = &self.table;
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id VARCHAR({MAX_SESSION_ID_LEN}) NOT NULL PRIMARY KEY, \
             value VARCHAR({}) NOT NULL, \
             expired_at BIGINT NOT NULL)",
            self.value_len
        );
        sqlx::query(&create_table).execute(&self.pool).await?;

        // MySQL has no CREATE INDEX IF NOT EXISTS, so an existing index shows up
        // as an error on every start after the first.
        let create_index =
            format!("CREATE INDEX idx_{table}_expired_at ON {table} (expired_at)");
        if let Err(e) = sqlx::query(&create_index).execute(&self.pool).await {
            debug!(table = %table, error = %e, "Expiry index not created");
        }

        Ok(())
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn row_to_record(row: &AnyRow) -> StoreResult<SessionRecord> {
        Ok(SessionRecord {
            id: row.try_get("id")?,
            value: row.try_get("value")?,
            expires_at: row.try_get("expired_at")?,
        })
    }
}

#[async_trait]
impl RecordStore for SqlRecordStore {
    async fn exists(&self, id: &str) -> StoreResult<bool> {
        let count: i64 = sqlx::query_scalar(&self.statements.exists)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn read(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        let row = sqlx::query(&self.statements.read)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn insert(&self, record: &SessionRecord) -> StoreResult<()> {
        sqlx::query(&self.statements.insert)
            .bind(record.id.as_str())
            .bind(record.value.as_str())
            .bind(record.expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_insert(&record.id, e))?;

        debug!(session_id = %record.id, table = %self.table, "Inserted session row");
        Ok(())
    }

    async fn update(&self, record: &SessionRecord) -> StoreResult<u64> {
        let result = sqlx::query(&self.statements.update)
            .bind(record.value.as_str())
            .bind(record.expires_at)
            .bind(record.id.as_str())
            .execute(&self.pool)
            .await?;

        debug!(
            session_id = %record.id,
            table = %self.table,
            rows = result.rows_affected(),
            "Updated session row"
        );
        Ok(result.rows_affected())
    }

    async fn touch(&self, id: &str, expires_at: i64) -> StoreResult<()> {
        sqlx::query(&self.statements.touch)
            .bind(expires_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query(&self.statements.delete)
            .bind(id)
            .execute(&self.pool)
            .await?;

        debug!(
            session_id = %id,
            rows = result.rows_affected(),
            "Deleted session row"
        );
        Ok(())
    }

    async fn count_expired_before(&self, now: i64) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(&self.statements.count_expired)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_expired_before(&self, now: i64) -> StoreResult<u64> {
        let result = sqlx::query(&self.statements.delete_expired)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!(table = %self.table, "Closed session record store");
    }

    fn backend_name(&self) -> &'static str {
        "sql"
    }
}

/// In-memory record store
///
/// Rows live in a map for the lifetime of the value. Count and delete
/// failures can be injected to exercise reaper error handling.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, SessionRecord>>,
    closed: AtomicBool,
    failing_counts: AtomicUsize,
    failing_deletes: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` expired-row counts fail
    pub fn fail_next_count(&self, n: usize) {
        self.failing_counts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` expired-row deletes fail
    pub fn fail_next_delete(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    /// Number of rows held, live or expired
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn take_injected(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn exists(&self, id: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        Ok(self.records.read().await.contains_key(id))
    }

    async fn read(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        self.ensure_open()?;
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn insert(&self, record: &SessionRecord) -> StoreResult<()> {
        self.ensure_open()?;
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Conflict {
                id: record.id.clone(),
            });
        }
        records.insert(record.id.clone(), record.clone());
        debug!(session_id = %record.id, "Inserted session into memory storage");
        Ok(())
    }

    async fn update(&self, record: &SessionRecord) -> StoreResult<u64> {
        self.ensure_open()?;
        match self.records.write().await.get_mut(&record.id) {
            Some(existing) => {
                existing.value = record.value.clone();
                existing.expires_at = record.expires_at;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn touch(&self, id: &str, expires_at: i64) -> StoreResult<()> {
        self.ensure_open()?;
        if let Some(existing) = self.records.write().await.get_mut(id) {
            existing.expires_at = expires_at;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.ensure_open()?;
        if self.records.write().await.remove(id).is_some() {
            debug!(session_id = %id, "Deleted session from memory storage");
        }
        Ok(())
    }

    async fn count_expired_before(&self, now: i64) -> StoreResult<u64> {
        self.ensure_open()?;
        if Self::take_injected(&self.failing_counts) {
            return Err(StoreError::backend("injected count failure"));
        }
        let records = self.records.read().await;
        Ok(records.values().filter(|r| r.expires_at <= now).count() as u64)
    }

    async fn delete_expired_before(&self, now: i64) -> StoreResult<u64> {
        self.ensure_open()?;
        if Self::take_injected(&self.failing_deletes) {
            return Err(StoreError::backend("injected delete failure"));
        }
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        Ok((before - records.len()) as u64)
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.ensure_open()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Lookup against the current clock
pub(crate) async fn lookup_now(store: &dyn RecordStore, id: &str) -> StoreResult<RecordLookup> {
    store.lookup(id, now_epoch()).await
}

/// Write a row whether or not one exists for its id.
///
/// An update that matches nothing (the row was reaped or deleted after the
/// `exists` check) falls through to an insert. An insert that loses a race
/// falls back to an update.
pub(crate) async fn upsert(store: &dyn RecordStore, record: &SessionRecord) -> StoreResult<()> {
    if store.exists(&record.id).await? && store.update(record).await? > 0 {
        return Ok(());
    }

    match store.insert(record).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_conflict() => {
            debug!(session_id = %record.id, "Insert raced with another writer, updating instead");
            if store.update(record).await? == 0 {
                return Err(StoreError::backend(format!(
                    "session {} changed concurrently and was not written",
                    record.id
                )));
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
