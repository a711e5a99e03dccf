//! kvsession store - persistent TTL-expiring sessions
//!
//! Sessions are rows of `(id, encoded values, expiry)` in a single SQL table.
//! This crate provides:
//!
//! - Record stores: SQL over a sqlx `Any` pool, and an in-memory map
//! - Session handles with local reads and writes and explicit save
//! - A bounded pool of reusable value buffers
//! - A background reaper deleting expired rows
//! - The session manager tying these together
//!
//! ## Example
//!
//! ```no_run
//! use kvsession_store::{CancellationToken, SessionManager};
//!
//! # async fn demo() -> kvsession_store::SessionResult<()> {
//! let manager = SessionManager::new_default("sqlite://sessions.db?mode=rwc").await?;
//!
//! let session = manager.create(CancellationToken::new(), "sid-1", 3600)?;
//! session.set("user", "ada");
//! session.save().await?;
//!
//! assert!(manager.check("sid-1").await?);
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod handle;
pub mod manager;
pub mod pool;
pub mod reaper;
pub mod storage;

pub use errors::{ReapError, SessionError, SessionResult, StoreError, StoreResult};
pub use handle::SessionHandle;
pub use manager::{SessionManager, SessionManagerBuilder};
pub use pool::{HandlePool, PoolStats};
pub use reaper::{ErrorReporter, Reaper, ReaperStats};
pub use storage::{MemoryRecordStore, RecordStore, SqlRecordStore};

// Re-export commonly used types
pub use kvsession_core::{JsonCodec, RecordLookup, SessionRecord, SessionValues, StoreConfig, ValueCodec};
pub use tokio_util::sync::CancellationToken;
