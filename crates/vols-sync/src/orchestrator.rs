use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vols_adapters::{ActivityExtractor, PortalHtmlExtractor, PortalSource};
use vols_core::{total_pages_for, SearchFilters};
use vols_storage::{ActivityStore, SyncRunRow, SyncRunStatus};

use crate::coordinator::{ActiveRun, SyncCoordinator};
use crate::SyncError;

/// Outcome of one finished run. `error` is the first fatal failure, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: u32,
    pub total_pages: u32,
    pub fetched: usize,
    pub error: Option<String>,
}

impl SyncRunSummary {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives the paginated listing crawl into the local store.
///
/// The store handed in here should be the orchestrator's own, separate from the
/// one request handlers read through.
#[derive(Clone)]
pub struct SyncOrchestrator {
    portal: Arc<dyn PortalSource>,
    extractor: Arc<dyn ActivityExtractor>,
    store: ActivityStore,
    coordinator: Arc<SyncCoordinator>,
}

impl SyncOrchestrator {
    pub fn new(portal: Arc<dyn PortalSource>, store: ActivityStore) -> Self {
        Self {
            portal,
            extractor: Arc::new(PortalHtmlExtractor),
            store,
            coordinator: SyncCoordinator::new(),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ActivityExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn coordinator(&self) -> Arc<SyncCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn portal(&self) -> Arc<dyn PortalSource> {
        Arc::clone(&self.portal)
    }

    pub fn extractor(&self) -> Arc<dyn ActivityExtractor> {
        Arc::clone(&self.extractor)
    }

    pub fn begin(&self, filters: SearchFilters) -> Result<ActiveRun, SyncError> {
        self.coordinator.try_begin(filters)
    }

    /// Run a full sync in the current task. `progress` sees
    /// `(current_page, total_pages, fetched)` after every stored page.
    pub async fn run<F>(&self, filters: SearchFilters, progress: F) -> Result<SyncRunSummary, SyncError>
    where
        F: FnMut(u32, u32, usize) + Send,
    {
        let run = self.begin(filters)?;
        Ok(self.run_active(run, progress).await)
    }

    /// Claim the flag now and crawl on a background task.
    pub fn spawn(&self, filters: SearchFilters) -> Result<Uuid, SyncError> {
        let run = self.begin(filters)?;
        let run_id = run.run_id();
        let this = self.clone();
        tokio::spawn(async move {
            this.run_active(run, |_, _, _| {}).await;
        });
        Ok(run_id)
    }

    pub async fn run_active<F>(&self, run: ActiveRun, mut progress: F) -> SyncRunSummary
    where
        F: FnMut(u32, u32, usize) + Send,
    {
        let run_id = run.run_id();
        let started_at = run.started_at();
        let filters = run.filters();
        info!(%run_id, ?filters, "sync run started");
        self.record_started(&run, &filters).await;

        let mut page = 0u32;
        let mut total_pages = 0u32;
        let mut fetched = 0usize;

        let outcome: Result<(), String> = loop {
            let next = page + 1;
            let html = match self.portal.fetch_listing_page(&filters, next).await {
                Ok(html) => html,
                Err(err) => break Err(format!("fetching page {next}: {err}")),
            };
            let listing = self.extractor.parse_listing(&html);

            if next == 1 {
                total_pages = total_pages_for(listing.total_count);
                if total_pages == 0 && !listing.records.is_empty() {
                    total_pages = 1;
                }
                run.set_total_pages(total_pages);
            }
            if listing.records.is_empty() {
                debug!(%run_id, page = next, "empty listing page; stopping");
                break Ok(());
            }

            let mut records = listing.records;
            for record in &mut records {
                record.stamp_listing(started_at);
            }
            if let Err(err) = self.store.upsert_many(&records).await {
                break Err(format!("storing page {next}: {err}"));
            }

            page = next;
            fetched += records.len();
            run.record_progress(page, total_pages, fetched);
            self.record_progress(run_id, page, total_pages, fetched).await;
            progress(page, total_pages, fetched);
            debug!(%run_id, page, total_pages, fetched, "listing page stored");

            if page >= total_pages {
                break Ok(());
            }
        };

        let finished_at = Utc::now();
        let error = outcome.err();
        match &error {
            None => info!(%run_id, pages = page, total_pages, fetched, "sync run finished"),
            Some(err) => {
                warn!(%run_id, pages = page, total_pages, fetched, error = %err, "sync run failed");
                run.record_error(err.clone());
            }
        }
        self.record_finished(run_id, error.as_deref(), finished_at).await;
        drop(run);

        SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            pages: page,
            total_pages,
            fetched,
            error,
        }
    }

    async fn record_started(&self, run: &ActiveRun, filters: &SearchFilters) {
        let row = SyncRunRow {
            run_id: run.run_id().to_string(),
            filters_json: serde_json::to_string(filters).unwrap_or_default(),
            started_at: run.started_at(),
            finished_at: None,
            status: SyncRunStatus::Running,
            current_page: 0,
            total_pages: 0,
            fetched: 0,
            error: None,
        };
        if let Err(err) = self.store.record_run_started(&row).await {
            warn!(run_id = %run.run_id(), error = %err, "could not record sync run start");
        }
    }

    async fn record_progress(&self, run_id: Uuid, page: u32, total_pages: u32, fetched: usize) {
        if let Err(err) = self
            .store
            .record_run_progress(&run_id.to_string(), page, total_pages, fetched as u64)
            .await
        {
            warn!(%run_id, error = %err, "could not record sync progress");
        }
    }

    async fn record_finished(&self, run_id: Uuid, error: Option<&str>, finished_at: DateTime<Utc>) {
        let status = if error.is_some() {
            SyncRunStatus::Failed
        } else {
            SyncRunStatus::Succeeded
        };
        if let Err(err) = self
            .store
            .record_run_finished(&run_id.to_string(), status, error, finished_at)
            .await
        {
            warn!(%run_id, error = %err, "could not record sync run finish");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;
    use vols_storage::TransportError;

    use super::*;

    fn listing_html(total: usize, ids: &[String]) -> String {
        let entries = ids
            .iter()
            .enumerate()
            .map(|(n, id)| {
                format!(
                    r#"<li><input type="hidden" name="progrmRegistNo" value="{id}">
                       <div class="ing blue"><ul><li>오프라인</li><li>교육</li></ul></div>
                       <div class="tit_board_list">{}회차 급식 지원</div>
                       <div class="close_dDay"><div class="end">모집중</div></div></li>"#,
                    n + 1
                )
            })
            .collect::<String>();
        format!(
            r#"<html><body><p>전체 <em>{total}</em> 건</p><ul class="list_wrap wrap2">{entries}</ul></body></html>"#
        )
    }

    fn ids(prefix: &str, count: usize) -> Vec<String> {
        (0..count).map(|n| format!("{prefix}{n:03}")).collect()
    }

    enum Page {
        Html(String),
        Fail,
    }

    #[derive(Default)]
    struct ScriptedPortal {
        pages: HashMap<u32, Page>,
        requested: Mutex<Vec<u32>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedPortal {
        fn with_page(mut self, page: u32, html: String) -> Self {
            self.pages.insert(page, Page::Html(html));
            self
        }

        fn failing_at(mut self, page: u32) -> Self {
            self.pages.insert(page, Page::Fail);
            self
        }
    }

    #[async_trait]
    impl PortalSource for ScriptedPortal {
        async fn fetch_listing_page(
            &self,
            _filters: &SearchFilters,
            page: u32,
        ) -> Result<String, TransportError> {
            self.requested.lock().unwrap().push(page);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match self.pages.get(&page) {
                Some(Page::Html(html)) => Ok(html.clone()),
                Some(Page::Fail) | None => Err(TransportError::HttpStatus {
                    status: 504,
                    url: format!("https://portal.test/list?cPage={page}"),
                }),
            }
        }

        async fn fetch_detail_page(&self, _program_id: &str) -> Result<String, TransportError> {
            Ok(String::new())
        }

        async fn fetch_district_list(
            &self,
            _city_code: &str,
        ) -> Result<BTreeMap<String, String>, TransportError> {
            Ok(BTreeMap::new())
        }
    }

    async fn temp_store() -> (TempDir, ActivityStore) {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("sync.db").display());
        (dir, ActivityStore::open(&url).await.unwrap())
    }

    async fn db_count(store: &ActivityStore) -> u64 {
        store.count_and_last_sync_time().await.unwrap().0
    }

    #[tokio::test]
    async fn two_page_sync_reports_progress_and_stores_every_row() {
        let (_dir, store) = temp_store().await;
        let page1 = ids("A", 10);
        let page2 = ids("B", 5);
        let portal = ScriptedPortal::default()
            .with_page(1, listing_html(15, &page1))
            .with_page(2, listing_html(15, &page2));
        let orchestrator = SyncOrchestrator::new(Arc::new(portal), store.clone());

        let mut calls = Vec::new();
        let summary = orchestrator
            .run(SearchFilters::default(), |page, total, fetched| {
                calls.push((page, total, fetched))
            })
            .await
            .unwrap();

        assert_eq!(calls, vec![(1, 2, 10), (2, 2, 15)]);
        assert!(summary.succeeded());
        assert_eq!(summary.fetched, 15);
        assert_eq!(db_count(&store).await, 15);

        let (_, last_sync) = store.count_and_last_sync_time().await.unwrap();
        assert_eq!(
            last_sync.map(|ts| ts.timestamp_micros()),
            Some(summary.started_at.timestamp_micros())
        );
        let row = store.get("A000").await.unwrap().unwrap();
        assert_eq!(row.group_key, "급식 지원");

        let coordinator = orchestrator.coordinator();
        assert!(!coordinator.is_running());
        let status = coordinator.status(&store).await.unwrap();
        assert_eq!((status.page, status.total_pages, status.fetched), (2, 2, 15));
        assert_eq!(status.error, None);
        assert_eq!(status.db_count, 15);

        let runs = store.recent_runs(1).await.unwrap();
        assert_eq!(runs[0].status, SyncRunStatus::Succeeded);
        assert_eq!(runs[0].fetched, 15);
    }

    #[tokio::test]
    async fn transport_failure_keeps_earlier_pages_and_records_error() {
        let (_dir, store) = temp_store().await;
        let portal = ScriptedPortal::default()
            .with_page(1, listing_html(50, &ids("A", 10)))
            .with_page(2, listing_html(50, &ids("B", 10)))
            .failing_at(3)
            .with_page(4, listing_html(50, &ids("D", 10)));
        let portal = Arc::new(portal);
        let orchestrator = SyncOrchestrator::new(portal.clone(), store.clone());

        let summary = orchestrator
            .run(SearchFilters::default(), |_, _, _| {})
            .await
            .unwrap();

        assert!(!summary.succeeded());
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.total_pages, 5);
        assert_eq!(db_count(&store).await, 20);
        assert_eq!(*portal.requested.lock().unwrap(), vec![1, 2, 3]);

        let coordinator = orchestrator.coordinator();
        assert!(!coordinator.is_running());
        let error = coordinator.snapshot().error.unwrap();
        assert!(error.contains("page 3"), "{error}");

        let runs = store.recent_runs(1).await.unwrap();
        assert_eq!(runs[0].status, SyncRunStatus::Failed);
        assert_eq!(runs[0].current_page, 2);
    }

    #[tokio::test]
    async fn empty_first_page_finishes_without_progress() {
        let (_dir, store) = temp_store().await;
        let portal = ScriptedPortal::default().with_page(1, listing_html(0, &[]));
        let orchestrator = SyncOrchestrator::new(Arc::new(portal), store.clone());

        let mut calls = 0;
        let summary = orchestrator
            .run(SearchFilters::default(), |_, _, _| calls += 1)
            .await
            .unwrap();
        assert!(summary.succeeded());
        assert_eq!(calls, 0);
        assert_eq!((summary.pages, summary.total_pages), (0, 0));
        assert_eq!(db_count(&store).await, 0);
    }

    #[tokio::test]
    async fn short_page_before_total_ends_the_run() {
        let (_dir, store) = temp_store().await;
        let portal = ScriptedPortal::default()
            .with_page(1, listing_html(30, &ids("A", 10)))
            .with_page(2, listing_html(30, &[]));
        let orchestrator = SyncOrchestrator::new(Arc::new(portal), store.clone());
        let summary = orchestrator
            .run(SearchFilters::default(), |_, _, _| {})
            .await
            .unwrap();
        assert!(summary.succeeded());
        assert_eq!((summary.pages, summary.total_pages, summary.fetched), (1, 3, 10));
    }

    #[tokio::test]
    async fn busy_start_is_rejected_and_in_flight_run_continues() {
        let (_dir, store) = temp_store().await;
        let gate = Arc::new(Notify::new());
        let portal = ScriptedPortal {
            gate: Some(gate.clone()),
            ..Default::default()
        }
        .with_page(1, listing_html(3, &ids("A", 3)));
        let orchestrator = SyncOrchestrator::new(Arc::new(portal), store.clone());

        let run_id = orchestrator.spawn(SearchFilters::default()).unwrap();
        let rejected = orchestrator.spawn(SearchFilters {
            keyword: "again".into(),
            ..Default::default()
        });
        assert!(matches!(rejected, Err(SyncError::AlreadyRunning)));
        assert!(matches!(
            orchestrator.run(SearchFilters::default(), |_, _, _| {}).await,
            Err(SyncError::AlreadyRunning)
        ));
        let snapshot = orchestrator.coordinator().snapshot();
        assert_eq!(snapshot.run_id, Some(run_id));
        assert_eq!(snapshot.filters.keyword, "");

        gate.notify_one();
        let coordinator = orchestrator.coordinator();
        for _ in 0..200 {
            if !coordinator.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!coordinator.is_running());
        assert_eq!(coordinator.snapshot().fetched, 3);
        assert_eq!(db_count(&store).await, 3);
    }
}
