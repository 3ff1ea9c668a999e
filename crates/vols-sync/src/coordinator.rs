//! Process-wide single-run guard plus the observable state of the current run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use vols_core::SearchFilters;
use vols_storage::{ActivityStore, StoreError};

use crate::SyncError;

/// Progress of the most recent sync run. Survives the run so callers can read the
/// final counters and error afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncRun {
    pub run_id: Option<Uuid>,
    pub filters: SearchFilters,
    pub current_page: u32,
    pub total_pages: u32,
    pub fetched: usize,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What the status endpoint reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub running: bool,
    pub run_id: Option<Uuid>,
    pub page: u32,
    pub total_pages: u32,
    pub fetched: usize,
    pub error: Option<String>,
    pub db_count: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct SyncCoordinator {
    running: AtomicBool,
    current: Mutex<SyncRun>,
}

impl SyncCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the running flag. A second caller gets [`SyncError::AlreadyRunning`] and
    /// the in-flight run's counters are left alone.
    pub fn try_begin(self: &Arc<Self>, filters: SearchFilters) -> Result<ActiveRun, SyncError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::AlreadyRunning)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        *self.lock() = SyncRun {
            run_id: Some(run_id),
            filters,
            started_at: Some(started_at),
            ..Default::default()
        };
        Ok(ActiveRun {
            coordinator: Arc::clone(self),
            run_id,
            started_at,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> SyncRun {
        self.lock().clone()
    }

    /// Current run state joined with cache counters read through `store`.
    pub async fn status(&self, store: &ActivityStore) -> Result<SyncStatus, StoreError> {
        let (db_count, last_sync) = store.count_and_last_sync_time().await?;
        let running = self.is_running();
        let run = self.snapshot();
        Ok(SyncStatus {
            running,
            run_id: run.run_id,
            page: run.current_page,
            total_pages: run.total_pages,
            fetched: run.fetched,
            error: run.error,
            db_count,
            last_sync,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SyncRun> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of the running flag. Dropping it stamps `finished_at` and releases the
/// flag, so a panicking run cannot wedge the coordinator.
#[derive(Debug)]
pub struct ActiveRun {
    coordinator: Arc<SyncCoordinator>,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

impl ActiveRun {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn filters(&self) -> SearchFilters {
        self.coordinator.lock().filters.clone()
    }

    pub(crate) fn set_total_pages(&self, total_pages: u32) {
        self.coordinator.lock().total_pages = total_pages;
    }

    pub(crate) fn record_progress(&self, current_page: u32, total_pages: u32, fetched: usize) {
        let mut run = self.coordinator.lock();
        run.current_page = current_page;
        run.total_pages = total_pages;
        run.fetched = fetched;
    }

    pub(crate) fn record_error(&self, error: String) {
        let mut run = self.coordinator.lock();
        if run.error.is_none() {
            run.error = Some(error);
        }
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.coordinator.lock().finished_at = Some(Utc::now());
        self.coordinator.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_rejected_without_touching_counters() {
        let coordinator = SyncCoordinator::new();
        let run = coordinator.try_begin(SearchFilters::default()).unwrap();
        run.record_progress(2, 5, 20);

        let rejected = coordinator.try_begin(SearchFilters {
            keyword: "other".into(),
            ..Default::default()
        });
        assert!(matches!(rejected, Err(SyncError::AlreadyRunning)));

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.run_id, Some(run.run_id()));
        assert_eq!((snapshot.current_page, snapshot.total_pages, snapshot.fetched), (2, 5, 20));
        assert_eq!(snapshot.filters.keyword, "");
    }

    #[test]
    fn dropping_the_run_releases_the_flag() {
        let coordinator = SyncCoordinator::new();
        {
            let run = coordinator.try_begin(SearchFilters::default()).unwrap();
            assert!(coordinator.is_running());
            run.record_error("first".into());
            run.record_error("second".into());
        }
        assert!(!coordinator.is_running());
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.error.as_deref(), Some("first"));
        assert!(snapshot.finished_at.is_some());

        let next = coordinator.try_begin(SearchFilters::default()).unwrap();
        assert_eq!(coordinator.snapshot().error, None);
        assert_eq!(coordinator.snapshot().run_id, Some(next.run_id()));
    }
}
