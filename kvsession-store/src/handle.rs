//! Session handle
//!
//! A handle is the in-memory working copy of one session. Reads and writes go
//! to the local value map; nothing reaches storage until [`SessionHandle::save`]
//! or [`SessionHandle::flush`]. Handles are `Send + Sync` and may be shared
//! behind an `Arc` by concurrent tasks serving the same request.

use crate::errors::{SessionError, SessionResult};
use crate::pool::HandlePool;
use crate::storage::{upsert, RecordStore};
use kvsession_core::{expiry_from_now, SessionRecord, SessionValues, Value, ValueCodec};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Collaborators shared by every handle of one manager
pub(crate) struct HandleShared {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) codec: Arc<dyn ValueCodec>,
    pub(crate) pool: Arc<HandlePool>,
    pub(crate) max_value_len: usize,
}

/// Working copy of one session
pub struct SessionHandle {
    session_id: String,
    ttl_secs: i64,
    values: RwLock<SessionValues>,
    context: CancellationToken,
    shared: Arc<HandleShared>,
}

impl SessionHandle {
    pub(crate) fn new(
        shared: Arc<HandleShared>,
        context: CancellationToken,
        session_id: impl Into<String>,
        ttl_secs: i64,
        initial: Option<SessionValues>,
    ) -> Self {
        let values = match initial {
            Some(initial) => shared.pool.acquire_with(initial),
            None => shared.pool.acquire(),
        };

        Self {
            session_id: session_id.into(),
            ttl_secs,
            values: RwLock::new(values),
            context,
            shared,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Relative TTL applied on every save
    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// The caller's cancellation context captured at creation
    pub fn context(&self) -> &CancellationToken {
        &self.context
    }

    /// Insert or overwrite a value
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.write().insert(key.into(), value.into());
    }

    /// Clone of the value under `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// Value under `key` deserialized into `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.get(key).map(serde_json::from_value).transpose()
    }

    /// Remove a key and return what was removed.
    ///
    /// The presence check and the removal take the lock separately, so when two
    /// tasks delete the same key only one of them gets the value back.
    pub fn delete(&self, key: &str) -> Option<Value> {
        if !self.values.read().contains_key(key) {
            return None;
        }
        self.values.write().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    /// Copy of all values
    pub fn snapshot(&self) -> SessionValues {
        self.values.read().clone()
    }

    /// Drop every value and persist the empty session.
    ///
    /// The row survives with an empty value, so the session still exists.
    pub async fn flush(&self) -> SessionResult<()> {
        self.values.write().clear();
        self.save().await
    }

    /// Persist the current values with expiry `now + ttl`
    pub async fn save(&self) -> SessionResult<()> {
        let encoded = {
            let values = self.values.read();
            self.shared
                .codec
                .encode(&values)
                .map_err(|source| SessionError::Encode {
                    session_id: self.session_id.clone(),
                    source,
                })?
        };

        if encoded.len() > self.shared.max_value_len {
            return Err(SessionError::ValueTooLarge {
                session_id: self.session_id.clone(),
                len: encoded.len(),
                limit: self.shared.max_value_len,
            });
        }

        let record = SessionRecord::new(
            self.session_id.as_str(),
            encoded,
            expiry_from_now(self.ttl_secs),
        );
        upsert(self.shared.store.as_ref(), &record).await?;

        debug!(
            session_id = %self.session_id,
            ttl_secs = self.ttl_secs,
            bytes = record.value.len(),
            "Saved session"
        );
        Ok(())
    }

    /// Give the value buffer back to the pool now
    pub fn release(self) {}
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let values = std::mem::take(self.values.get_mut());
        self.shared.pool.release(values);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("ttl_secs", &self.ttl_secs)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreResult;
    use crate::storage::MemoryRecordStore;
    use kvsession_core::{now_epoch, JsonCodec, RecordLookup};
    use serde_json::json;

    fn shared(store: Arc<MemoryRecordStore>, max_value_len: usize) -> Arc<HandleShared> {
        Arc::new(HandleShared {
            store,
            codec: Arc::new(JsonCodec),
            pool: Arc::new(HandlePool::new(4)),
            max_value_len,
        })
    }

    fn handle(shared: &Arc<HandleShared>, id: &str) -> SessionHandle {
        SessionHandle::new(shared.clone(), CancellationToken::new(), id, 60, None)
    }

    #[test]
    fn test_set_get_delete() {
        let shared = shared(Arc::new(MemoryRecordStore::new()), 2048);
        let session = handle(&shared, "sid");

        session.set("user", "ada");
        session.set("visits", 3);
        assert_eq!(session.get("user"), Some(json!("ada")));
        assert_eq!(session.get_as::<u32>("visits").unwrap(), Some(3));
        assert_eq!(session.len(), 2);

        assert_eq!(session.delete("user"), Some(json!("ada")));
        assert_eq!(session.delete("user"), None);
        assert_eq!(session.get("missing"), None);
    }

    #[test]
    fn test_get_as_type_mismatch() {
        let shared = shared(Arc::new(MemoryRecordStore::new()), 2048);
        let session = handle(&shared, "sid");
        session.set("visits", "many");
        assert!(session.get_as::<u32>("visits").is_err());
    }

    #[tokio::test]
    async fn test_save_inserts_then_updates() {
        let store = Arc::new(MemoryRecordStore::new());
        let shared = shared(store.clone(), 2048);
        let session = handle(&shared, "sid");

        session.set("a", 1);
        session.save().await.unwrap();
        session.set("b", 2);
        session.save().await.unwrap();

        let record = store.read("sid").await.unwrap().unwrap();
        let values = JsonCodec.decode(&record.value).unwrap();
        assert_eq!(values.len(), 2);
        assert!(record.expires_at > now_epoch());
    }

    /// Deletes the row right before every update, as the reaper or another
    /// manager would between `exists` and `update`
    struct VanishingStore {
        inner: MemoryRecordStore,
    }

    #[async_trait::async_trait]
    impl RecordStore for VanishingStore {
        async fn exists(&self, id: &str) -> StoreResult<bool> {
            self.inner.exists(id).await
        }

        async fn read(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
            self.inner.read(id).await
        }

        async fn insert(&self, record: &SessionRecord) -> StoreResult<()> {
            self.inner.insert(record).await
        }

        async fn update(&self, record: &SessionRecord) -> StoreResult<u64> {
            self.inner.delete(&record.id).await?;
            self.inner.update(record).await
        }

        async fn touch(&self, id: &str, expires_at: i64) -> StoreResult<()> {
            self.inner.touch(id, expires_at).await
        }

        async fn delete(&self, id: &str) -> StoreResult<()> {
            self.inner.delete(id).await
        }

        async fn count_expired_before(&self, now: i64) -> StoreResult<u64> {
            self.inner.count_expired_before(now).await
        }

        async fn delete_expired_before(&self, now: i64) -> StoreResult<u64> {
            self.inner.delete_expired_before(now).await
        }

        async fn health_check(&self) -> StoreResult<()> {
            self.inner.health_check().await
        }

        async fn close(&self) {
            self.inner.close().await
        }

        fn backend_name(&self) -> &'static str {
            "vanishing"
        }
    }

    #[tokio::test]
    async fn test_save_rewrites_row_deleted_before_update() {
        let store = Arc::new(VanishingStore {
            inner: MemoryRecordStore::new(),
        });
        store
            .inner
            .insert(&SessionRecord::new("sid", r#"{"a":1}"#, now_epoch() + 60))
            .await
            .unwrap();
        let shared = Arc::new(HandleShared {
            store: store.clone(),
            codec: Arc::new(JsonCodec),
            pool: Arc::new(HandlePool::new(4)),
            max_value_len: 2048,
        });
        let session = handle(&shared, "sid");

        session.set("a", 2);
        session.save().await.unwrap();

        let record = store.inner.read("sid").await.unwrap().unwrap();
        let values = JsonCodec.decode(&record.value).unwrap();
        assert_eq!(values.get("a"), Some(&json!(2)));
        assert!(record.expires_at > now_epoch());
    }

    #[tokio::test]
    async fn test_flush_keeps_row_with_empty_value() {
        let store = Arc::new(MemoryRecordStore::new());
        let shared = shared(store.clone(), 2048);
        let session = handle(&shared, "sid");

        session.set("a", 1);
        session.save().await.unwrap();
        session.flush().await.unwrap();

        assert!(session.is_empty());
        match store.lookup("sid", now_epoch()).await.unwrap() {
            RecordLookup::Present(record) => assert_eq!(record.value, ""),
            other => panic!("expected present row, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_value_is_rejected() {
        let store = Arc::new(MemoryRecordStore::new());
        let shared = shared(store.clone(), 16);
        let session = handle(&shared, "sid");

        session.set("blob", "x".repeat(64));
        let err = session.save().await.unwrap_err();
        assert!(matches!(err, SessionError::ValueTooLarge { limit: 16, .. }));
        assert!(!store.exists("sid").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_reads() {
        let shared = shared(Arc::new(MemoryRecordStore::new()), 2048);
        let session = Arc::new(handle(&shared, "sid"));
        session.set("k", "v");

        let readers = (0..8).map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.get("k") })
        });
        for value in futures::future::join_all(readers).await {
            assert_eq!(value.unwrap(), Some(json!("v")));
        }
    }

    #[test]
    fn test_drop_returns_buffer_to_pool() {
        let shared = shared(Arc::new(MemoryRecordStore::new()), 2048);
        let session = handle(&shared, "sid");
        session.set("k", "v");
        session.release();

        assert_eq!(shared.pool.stats().idle, 1);
        let next = handle(&shared, "other");
        assert!(next.is_empty());
        assert_eq!(shared.pool.stats().reused, 1);
    }

    #[test]
    fn test_context_is_carried() {
        let shared = shared(Arc::new(MemoryRecordStore::new()), 2048);
        let token = CancellationToken::new();
        let session = SessionHandle::new(shared, token.clone(), "sid", 60, None);

        token.cancel();
        assert!(session.context().is_cancelled());
    }
}
