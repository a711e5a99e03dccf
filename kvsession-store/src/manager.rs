//! Session manager
//!
//! The manager owns the record store, the handle pool and the reaper, and
//! hands out [`SessionHandle`]s. Missing and expired sessions are never errors:
//! `update` and `refresh` quietly start a fresh session instead.

use crate::errors::{SessionError, SessionResult, StoreError};
use crate::handle::{HandleShared, SessionHandle};
use crate::pool::{HandlePool, PoolStats};
use crate::reaper::{ErrorReporter, Reaper, ReaperStats};
use crate::storage::{lookup_now, upsert, RecordStore, SqlRecordStore};
use kvsession_core::{
    expiry_from_now, JsonCodec, RecordLookup, SessionRecord, SessionValues, StoreConfig,
    ValueCodec,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Builder for [`SessionManager`]
pub struct SessionManagerBuilder {
    config: StoreConfig,
    store: Option<Arc<dyn RecordStore>>,
    codec: Option<Arc<dyn ValueCodec>>,
    reporter: Option<ErrorReporter>,
}

impl SessionManagerBuilder {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            store: None,
            codec: None,
            reporter: None,
        }
    }

    /// Use an existing record store instead of connecting to `database_url`
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default JSON value codec
    pub fn with_codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Receive background reaper failures
    pub fn with_error_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Connect (unless a store was supplied) and start the reaper
    pub async fn build(self) -> SessionResult<SessionManager> {
        self.config.validate()?;

        let store: Arc<dyn RecordStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqlRecordStore::connect(&self.config).await?),
        };

        Ok(SessionManager::assemble(
            store,
            self.codec.unwrap_or_else(|| Arc::new(JsonCodec)),
            self.reporter,
            self.config,
        ))
    }
}

/// Entry point for session operations
pub struct SessionManager {
    shared: Arc<HandleShared>,
    reaper: Reaper,
    config: StoreConfig,
    closed: AtomicBool,
}

impl SessionManager {
    pub fn builder(config: StoreConfig) -> SessionManagerBuilder {
        SessionManagerBuilder::new(config)
    }

    /// Connect to `config.database_url`, create the table if needed and start
    /// the reaper
    pub async fn connect(config: StoreConfig) -> SessionResult<Self> {
        Self::builder(config).build().await
    }

    /// Connect with default pool sizing, table name and reaper interval
    pub async fn new_default(database_url: &str) -> SessionResult<Self> {
        Self::connect(StoreConfig::new(database_url)).await
    }

    /// Run on an existing record store. Must be called from within a tokio
    /// runtime because it starts the reaper.
    pub fn with_store(store: Arc<dyn RecordStore>, config: StoreConfig) -> SessionResult<Self> {
        config.validate()?;
        Ok(Self::assemble(store, Arc::new(JsonCodec), None, config))
    }

    fn assemble(
        store: Arc<dyn RecordStore>,
        codec: Arc<dyn ValueCodec>,
        reporter: Option<ErrorReporter>,
        config: StoreConfig,
    ) -> Self {
        let reaper = Reaper::spawn(store.clone(), config.gc_interval(), reporter);
        let shared = Arc::new(HandleShared {
            store,
            codec,
            pool: Arc::new(HandlePool::new(config.handle_pool_capacity)),
            max_value_len: config.max_value_len,
        });

        info!(
            backend = shared.store.backend_name(),
            codec = shared.codec.name(),
            table = config.effective_table_name(),
            gc_interval_secs = config.gc_interval().as_secs(),
            "Session manager ready"
        );

        Self {
            shared,
            reaper,
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// True iff a live row exists for the id. A flushed session with no
    /// values still counts.
    pub async fn check(&self, session_id: &str) -> SessionResult<bool> {
        self.ensure_open()?;
        Ok(self.lookup(session_id).await?.is_present())
    }

    /// Start an empty session. Nothing is written until the handle saves.
    pub fn create(
        &self,
        context: CancellationToken,
        session_id: &str,
        ttl_secs: i64,
    ) -> SessionResult<SessionHandle> {
        self.ensure_open()?;
        debug!(session_id = %session_id, ttl_secs, "Creating session");
        Ok(self.new_handle(context, session_id, ttl_secs, None))
    }

    /// Load a live session and extend its expiry to `now + ttl`, or start a
    /// fresh one when it is missing or expired
    pub async fn update(
        &self,
        context: CancellationToken,
        session_id: &str,
        ttl_secs: i64,
    ) -> SessionResult<SessionHandle> {
        self.ensure_open()?;

        let record = match self.lookup(session_id).await? {
            RecordLookup::Present(record) => record,
            RecordLookup::Expired | RecordLookup::Absent => {
                debug!(session_id = %session_id, "No live session to update, starting fresh");
                return Ok(self.new_handle(context, session_id, ttl_secs, None));
            }
        };

        let values = self.decode(session_id, &record.value)?;
        self.shared
            .store
            .touch(session_id, expiry_from_now(ttl_secs))
            .await?;

        debug!(session_id = %session_id, ttl_secs, keys = values.len(), "Updated session");
        Ok(self.new_handle(context, session_id, ttl_secs, Some(values)))
    }

    /// Move a live session to a new id with a fresh expiry.
    ///
    /// The copy and the delete of the old row are separate statements; a
    /// failure between them leaves both rows in place until the old one
    /// expires. A live row under `new_id` fails with a conflict and is left
    /// untouched; an expired one is overwritten.
    pub async fn refresh(
        &self,
        context: CancellationToken,
        old_id: &str,
        new_id: &str,
        ttl_secs: i64,
    ) -> SessionResult<SessionHandle> {
        self.ensure_open()?;

        if old_id == new_id {
            return self.update(context, new_id, ttl_secs).await;
        }

        let record = match self.lookup(old_id).await? {
            RecordLookup::Present(record) => record,
            RecordLookup::Expired | RecordLookup::Absent => {
                debug!(old_id = %old_id, new_id = %new_id, "No live session to rotate, starting fresh");
                return Ok(self.new_handle(context, new_id, ttl_secs, None));
            }
        };

        let values = self.decode(old_id, &record.value)?;
        let rotated = SessionRecord::new(new_id, record.value, expiry_from_now(ttl_secs));
        let store = self.shared.store.as_ref();
        match store.insert(&rotated).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => match lookup_now(store, new_id).await? {
                RecordLookup::Present(_) => return Err(e.into()),
                RecordLookup::Expired | RecordLookup::Absent => {
                    debug!(new_id = %new_id, "Replacing stale row under the new id");
                    upsert(store, &rotated).await?;
                }
            },
            Err(e) => return Err(e.into()),
        }
        store.delete(old_id).await?;

        debug!(old_id = %old_id, new_id = %new_id, ttl_secs, "Rotated session id");
        Ok(self.new_handle(context, new_id, ttl_secs, Some(values)))
    }

    /// Remove a session row. Removing a missing id succeeds.
    pub async fn delete(&self, session_id: &str) -> SessionResult<()> {
        self.ensure_open()?;
        self.shared.store.delete(session_id).await?;
        Ok(())
    }

    /// Stop the reaper and close the store. Later calls fail with
    /// `StoreError::Closed`; closing twice is a no-op.
    pub async fn close(&self) -> SessionResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.reaper.stop();
        self.shared.store.close().await;
        info!("Session manager closed");
        Ok(())
    }

    /// Run one reaper pass immediately
    pub async fn reap_now(&self) -> SessionResult<u64> {
        self.ensure_open()?;
        Ok(self.reaper.reap_once().await?)
    }

    pub async fn health_check(&self) -> SessionResult<()> {
        self.ensure_open()?;
        Ok(self.shared.store.health_check().await?)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    pub fn reaper_stats(&self) -> ReaperStats {
        self.reaper.stats()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.is_closed() {
            Err(StoreError::Closed.into())
        } else {
            Ok(())
        }
    }

    async fn lookup(&self, session_id: &str) -> SessionResult<RecordLookup> {
        Ok(lookup_now(self.shared.store.as_ref(), session_id).await?)
    }

    fn decode(&self, session_id: &str, raw: &str) -> SessionResult<SessionValues> {
        self.shared
            .codec
            .decode(raw)
            .map_err(|source| SessionError::Decode {
                session_id: session_id.to_string(),
                source,
            })
    }

    fn new_handle(
        &self,
        context: CancellationToken,
        session_id: &str,
        ttl_secs: i64,
        initial: Option<SessionValues>,
    ) -> SessionHandle {
        SessionHandle::new(self.shared.clone(), context, session_id, ttl_secs, initial)
    }
}
