//! Background expiry reaper
//!
//! One reaper task per manager. Every interval it counts rows whose expiry has
//! passed and deletes them when there are any. Failures never stop the loop:
//! they are logged, handed to the optional [`ErrorReporter`] and the pass is
//! retried on the next tick.

use crate::errors::ReapError;
use crate::storage::RecordStore;
use kvsession_core::now_epoch;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback receiving every failed background pass
pub type ErrorReporter = Arc<dyn Fn(&ReapError) + Send + Sync>;

/// Reaper counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaperStats {
    /// Completed passes, successful or not
    pub runs: u64,
    /// Rows deleted across all passes
    pub reaped: u64,
    /// Passes that ended in an error
    pub failures: u64,
}

struct ReaperCore {
    store: Arc<dyn RecordStore>,
    reporter: Option<ErrorReporter>,
    runs: AtomicU64,
    reaped: AtomicU64,
    failures: AtomicU64,
}

impl ReaperCore {
    async fn pass(&self) -> Result<u64, ReapError> {
        let now = now_epoch();
        let result = self.count_and_delete(now).await;

        self.runs.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(deleted) => {
                self.reaped.fetch_add(*deleted, Ordering::Relaxed);
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn count_and_delete(&self, now: i64) -> Result<u64, ReapError> {
        let expired = self
            .store
            .count_expired_before(now)
            .await
            .map_err(ReapError::Count)?;
        if expired == 0 {
            return Ok(0);
        }

        let deleted = self
            .store
            .delete_expired_before(now)
            .await
            .map_err(ReapError::Delete)?;
        debug!(expired, deleted, "Reaped expired sessions");
        Ok(deleted)
    }

    async fn tick(&self) {
        if let Err(e) = self.pass().await {
            warn!(phase = e.phase(), error = %e, "Expired session cleanup failed, retrying next tick");
            if let Some(reporter) = &self.reporter {
                reporter(&e);
            }
        }
    }
}

/// Handle to a running reaper task
pub struct Reaper {
    core: Arc<ReaperCore>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    task: JoinHandle<()>,
    interval: Duration,
}

impl Reaper {
    /// Start the reaper loop. The first pass runs one full `interval` after
    /// start. Must be called from within a tokio runtime.
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        interval: Duration,
        reporter: Option<ErrorReporter>,
    ) -> Self {
        let core = Arc::new(ReaperCore {
            store,
            reporter,
            runs: AtomicU64::new(0),
            reaped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(core.clone(), interval, cancel.clone()));
        info!(interval_secs = interval.as_secs_f64(), "Started session reaper");

        Self {
            core,
            cancel,
            stopped: AtomicBool::new(false),
            task,
            interval,
        }
    }

    /// Run one count and delete pass now, returning the number of rows deleted
    pub async fn reap_once(&self) -> Result<u64, ReapError> {
        self.core.pass().await
    }

    /// Stop the loop. Safe to call more than once; a pass already running
    /// is allowed to finish.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            info!("Stopping session reaper");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> ReaperStats {
        ReaperStats {
            runs: self.core.runs.load(Ordering::Relaxed),
            reaped: self.core.reaped.load(Ordering::Relaxed),
            failures: self.core.failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(core: Arc<ReaperCore>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => core.tick().await,
        }
    }

    debug!("Session reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRecordStore;
    use kvsession_core::SessionRecord;
    use parking_lot::Mutex;

    async fn store_with_expired(n: usize) -> Arc<MemoryRecordStore> {
        let store = Arc::new(MemoryRecordStore::new());
        let past = now_epoch() - 10;
        for i in 0..n {
            store
                .insert(&SessionRecord::new(format!("old-{i}"), "", past))
                .await
                .unwrap();
        }
        store
            .insert(&SessionRecord::new("live", "", now_epoch() + 600))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_reap_once_deletes_expired_rows() {
        let store = store_with_expired(3).await;
        let reaper = Reaper::spawn(store.clone(), Duration::from_secs(3600), None);

        assert_eq!(reaper.reap_once().await.unwrap(), 3);
        assert_eq!(reaper.reap_once().await.unwrap(), 0);
        assert_eq!(store.len().await, 1);

        let stats = reaper.stats();
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.reaped, 3);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_loop_reaps_on_interval() {
        let store = store_with_expired(2).await;
        let reaper = Reaper::spawn(store.clone(), Duration::from_millis(20), None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.len().await, 1);
        assert!(reaper.stats().runs >= 1);
    }

    #[tokio::test]
    async fn test_count_and_delete_failures_are_reported_and_retried() {
        let store = store_with_expired(2).await;
        store.fail_next_count(1);
        store.fail_next_delete(1);

        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter: ErrorReporter = Arc::new(move |e: &ReapError| sink.lock().push(e.phase()));

        let reaper = Reaper::spawn(store.clone(), Duration::from_millis(20), Some(reporter));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(*seen.lock(), vec!["count", "delete"]);
        assert_eq!(store.len().await, 1);
        assert!(reaper.is_running());
        assert_eq!(reaper.stats().failures, 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let store = Arc::new(MemoryRecordStore::new());
        let reaper = Reaper::spawn(store, Duration::from_millis(10), None);

        reaper.stop();
        reaper.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reaper.is_running());
    }

    #[tokio::test]
    async fn test_first_pass_waits_one_interval() {
        let store = store_with_expired(1).await;
        let reaper = Reaper::spawn(store.clone(), Duration::from_secs(3600), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reaper.stats().runs, 0);
        assert_eq!(store.len().await, 2);
    }
}
