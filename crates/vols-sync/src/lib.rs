//! Sync orchestration: paginated crawl into the local cache, single-run coordination,
//! on-demand detail enrichment and the optional cron trigger.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use vols_adapters::{PortalClient, PortalConfig, DEFAULT_PORTAL_BASE_URL};
use vols_core::SearchFilters;
use vols_storage::{ActivityStore, StoreError, TransportError, BROWSER_USER_AGENT};

pub mod coordinator;
pub mod on_demand;
pub mod orchestrator;

pub use coordinator::{ActiveRun, SyncCoordinator, SyncRun, SyncStatus};
pub use on_demand::{
    load_activity_with_detail, refresh_activity_detail, related_activities, search_upstream,
};
pub use orchestrator::{SyncOrchestrator, SyncRunSummary};

pub const CRATE_NAME: &str = "vols-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
}

#[derive(Debug, Error)]
pub enum DetailError {
    #[error("portal request failed: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub portal_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub district_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub default_filters: SearchFilters,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/volunteer.db".to_string(),
            portal_base_url: DEFAULT_PORTAL_BASE_URL.to_string(),
            user_agent: BROWSER_USER_AGENT.to_string(),
            http_timeout_secs: 20,
            district_timeout_secs: 10,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            default_filters: SearchFilters::default(),
            web_port: 8080,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        let default_filters = SearchFilters {
            region: text("VOLS_SYNC_REGION", String::new()),
            district: text("VOLS_SYNC_DISTRICT", String::new()),
            category: text("VOLS_SYNC_CATEGORY", String::new()),
            keyword: text("VOLS_SYNC_KEYWORD", String::new()),
            status: text("VOLS_SYNC_STATUS", defaults.default_filters.status.clone()),
            ..Default::default()
        };

        Self {
            database_url: text("DATABASE_URL", defaults.database_url),
            portal_base_url: text("VOLS_PORTAL_BASE_URL", defaults.portal_base_url),
            user_agent: text("VOLS_USER_AGENT", defaults.user_agent),
            http_timeout_secs: number("VOLS_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            district_timeout_secs: number(
                "VOLS_DISTRICT_TIMEOUT_SECS",
                defaults.district_timeout_secs,
            ),
            scheduler_enabled: lookup("VOLS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: text("VOLS_SYNC_CRON", defaults.sync_cron),
            default_filters,
            web_port: lookup("VOLS_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }

    pub fn portal_config(&self) -> PortalConfig {
        PortalConfig {
            base_url: self.portal_base_url.clone(),
            user_agent: self.user_agent.clone(),
            page_timeout: Duration::from_secs(self.http_timeout_secs),
            district_timeout: Duration::from_secs(self.district_timeout_secs),
        }
    }
}

/// Live portal client plus an orchestrator with its own store connection.
pub async fn build_orchestrator(config: &SyncConfig) -> Result<SyncOrchestrator> {
    let portal = PortalClient::new(config.portal_config()).context("building portal client")?;
    let store = ActivityStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening activity store {}", config.database_url))?;
    Ok(SyncOrchestrator::new(Arc::new(portal), store))
}

/// Cron trigger for the configured default filters. `None` when disabled. A tick
/// that lands while a run is active is skipped.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: &SyncOrchestrator,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let orchestrator = orchestrator.clone();
    let filters = config.default_filters.clone();
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        let filters = filters.clone();
        Box::pin(async move {
            match orchestrator.spawn(filters) {
                Ok(run_id) => info!(%run_id, "scheduled sync started"),
                Err(SyncError::AlreadyRunning) => {
                    info!("scheduled sync skipped; a run is already in progress")
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> SyncConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = config_from(&[]);
        assert_eq!(config.database_url, "sqlite://data/volunteer.db");
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.district_timeout_secs, 10);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.default_filters.status, "0");
        assert_eq!(config.web_port, 8080);
        let portal = config.portal_config();
        assert_eq!(portal.page_timeout, Duration::from_secs(20));
        assert_eq!(portal.district_timeout, Duration::from_secs(10));
    }

    #[test]
    fn env_overrides_are_read() {
        let config = config_from(&[
            ("DATABASE_URL", "sqlite://:memory:"),
            ("VOLS_HTTP_TIMEOUT_SECS", "5"),
            ("VOLS_DISTRICT_TIMEOUT_SECS", "oops"),
            ("VOLS_SCHEDULER_ENABLED", "true"),
            ("VOLS_SYNC_REGION", "6110000"),
            ("VOLS_SYNC_STATUS", "3"),
            ("VOLS_WEB_PORT", "9090"),
        ]);
        assert_eq!(config.database_url, "sqlite://:memory:");
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.district_timeout_secs, 10);
        assert!(config.scheduler_enabled);
        assert_eq!(config.default_filters.region, "6110000");
        assert_eq!(config.default_filters.status, "3");
        assert_eq!(config.web_port, 9090);
    }

    #[tokio::test]
    async fn scheduler_is_off_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            database_url: format!("sqlite://{}", dir.path().join("s.db").display()),
            ..Default::default()
        };
        let orchestrator = build_orchestrator(&config).await.unwrap();
        assert!(maybe_build_scheduler(&config, &orchestrator)
            .await
            .unwrap()
            .is_none());
    }
}
