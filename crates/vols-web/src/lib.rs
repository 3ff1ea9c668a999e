//! Axum JSON surface over the activity cache and the sync orchestrator.

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use vols_adapters::PortalSource;
use vols_core::codes::{
    ACTIVITY_TYPE_CODES, CATEGORY_CODES, REGION_CODES, STATUS_CODES, TARGET_CODES,
};
use vols_core::{group_activities, ActivityGroup, ActivityRecord, SearchFilters};
use vols_storage::{ActivityStore, CacheQuery};
use vols_sync::{
    build_orchestrator, load_activity_with_detail, maybe_build_scheduler, related_activities,
    search_upstream, DetailError, SyncConfig, SyncError, SyncOrchestrator,
};

pub const CRATE_NAME: &str = "vols-web";

const DEFAULT_CACHE_PAGE_SIZE: usize = 20;

/// Shared handler state. `store` is the reader handle; the orchestrator writes
/// through its own.
#[derive(Clone)]
pub struct AppState {
    pub store: ActivityStore,
    pub orchestrator: SyncOrchestrator,
}

impl AppState {
    pub fn new(store: ActivityStore, orchestrator: SyncOrchestrator) -> Self {
        Self {
            store,
            orchestrator,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
struct UpstreamSearchResponse {
    items: Vec<ActivityRecord>,
    total: usize,
    page: u32,
    per_page: usize,
    groups: Vec<ActivityGroup>,
}

#[derive(Debug, Serialize)]
struct ActivityDetailResponse {
    activity: ActivityRecord,
    related: Vec<ActivityRecord>,
}

#[derive(Debug, Serialize)]
struct CodeEntry {
    code: &'static str,
    label: &'static str,
}

#[derive(Debug, Serialize)]
struct CodesResponse {
    regions: Vec<CodeEntry>,
    categories: Vec<CodeEntry>,
    activity_types: Vec<CodeEntry>,
    targets: Vec<CodeEntry>,
    statuses: Vec<CodeEntry>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/search", get(upstream_search_handler))
        .route("/api/activities", get(cached_search_handler))
        .route("/api/activities/{id}", get(activity_detail_handler))
        .route("/api/groups/{key}", get(group_handler))
        .route("/api/sync", post(start_sync_handler))
        .route("/api/sync/status", get(sync_status_handler))
        .route("/api/sync/runs", get(sync_runs_handler))
        .route("/api/districts/{city}", get(districts_handler))
        .route("/api/codes", get(codes_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = ActivityStore::open(&config.database_url).await?;
    let orchestrator = build_orchestrator(&config).await?;

    let scheduler = maybe_build_scheduler(&config, &orchestrator).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving activity api");
    axum::serve(listener, app(AppState::new(store, orchestrator))).await?;
    Ok(())
}

async fn upstream_search_handler(
    State(state): State<Arc<AppState>>,
    Query(filters): Query<SearchFilters>,
    Query(paging): Query<PageQuery>,
) -> Response {
    let portal = state.orchestrator.portal();
    let extractor = state.orchestrator.extractor();
    let page = paging.page.unwrap_or(1);
    match search_upstream(portal.as_ref(), extractor.as_ref(), &filters, page).await {
        Ok(result) => {
            if let Err(err) = state.store.upsert_many(&result.items).await {
                warn!(error = %err, "caching direct search results failed");
            }
            let groups = group_activities(result.items.iter().cloned());
            Json(UpstreamSearchResponse {
                items: result.items,
                total: result.total,
                page: result.page,
                per_page: result.per_page,
                groups,
            })
            .into_response()
        }
        Err(err) => bad_gateway(err),
    }
}

async fn cached_search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CacheQuery>,
    Query(paging): Query<PageQuery>,
) -> Response {
    let page = paging.page.unwrap_or(1);
    let per_page = paging.per_page.unwrap_or(DEFAULT_CACHE_PAGE_SIZE);
    match state.store.search(&query, page, per_page).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => server_error(err),
    }
}

async fn activity_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let portal = state.orchestrator.portal();
    let extractor = state.orchestrator.extractor();
    let activity =
        match load_activity_with_detail(portal.as_ref(), extractor.as_ref(), &state.store, &id)
            .await
        {
            Ok(Some(activity)) => activity,
            Ok(None) => return not_found(format!("activity {id} not found")),
            Err(DetailError::Transport(err)) => return bad_gateway(err),
            Err(err) => return server_error(err),
        };
    match related_activities(&state.store, &activity).await {
        Ok(related) => Json(ActivityDetailResponse { activity, related }).into_response(),
        Err(err) => server_error(err),
    }
}

async fn group_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(key): AxumPath<String>,
) -> Response {
    match state.store.get_by_group(&key).await {
        Ok(items) => Json(ActivityGroup {
            group_key: key,
            items,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn start_sync_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let filters = if body.iter().all(u8::is_ascii_whitespace) {
        SearchFilters::default()
    } else {
        match serde_json::from_slice::<SearchFilters>(&body) {
            Ok(filters) => filters,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("invalid filters: {err}") })),
                )
                    .into_response()
            }
        }
    };
    match state.orchestrator.spawn(filters) {
        Ok(run_id) => (StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))).into_response(),
        Err(err @ SyncError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.coordinator().status(&state.store).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => server_error(err),
    }
}

async fn sync_runs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.recent_runs(20).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn districts_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(city): AxumPath<String>,
) -> Response {
    match state.orchestrator.portal().fetch_district_list(&city).await {
        Ok(districts) => Json(districts).into_response(),
        Err(err) => bad_gateway(err),
    }
}

async fn codes_handler() -> Response {
    let entries = |table: &'static [(&'static str, &'static str)]| {
        table
            .iter()
            .map(|&(code, label)| CodeEntry { code, label })
            .collect::<Vec<_>>()
    };
    Json(CodesResponse {
        regions: entries(REGION_CODES),
        categories: entries(CATEGORY_CODES),
        activity_types: entries(ACTIVITY_TYPE_CODES),
        targets: entries(TARGET_CODES),
        statuses: entries(STATUS_CODES),
    })
    .into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn not_found(message: String) -> Response {
    error_response(StatusCode::NOT_FOUND, message)
}

fn bad_gateway(err: impl Display) -> Response {
    error_response(StatusCode::BAD_GATEWAY, format!("portal error: {err}"))
}

fn server_error(err: impl Display) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("server error: {err}"),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;
    use vols_storage::TransportError;

    struct FakePortal;

    #[async_trait]
    impl PortalSource for FakePortal {
        async fn fetch_listing_page(
            &self,
            _filters: &SearchFilters,
            page: u32,
        ) -> Result<String, TransportError> {
            if page > 1 {
                return Ok(String::new());
            }
            Ok(r#"<p>전체 <em>2</em> 건</p><ul class="list_wrap wrap2">
                <li><input name="progrmRegistNo" value="S1">
                  <div class="tit_board_list">1회차 급식 지원</div>
                  <div class="close_dDay"><div class="end">모집중</div></div></li>
                <li><input name="progrmRegistNo" value="S2">
                  <div class="tit_board_list">2회차 급식 지원</div>
                  <div class="close_dDay"><div class="end">모집완료</div></div></li>
              </ul>"#
                .to_string())
        }

        async fn fetch_detail_page(&self, program_id: &str) -> Result<String, TransportError> {
            match program_id {
                "S1" => Ok(r#"<div class="board_view"><h3 class="tit_board_view">1회차 급식 지원 (모집중)</h3>
                    <div class="board_data_show"><dl><dt>봉사장소</dt><dd>복지관 식당</dd></dl></div></div>"#
                    .to_string()),
                "DOWN" => Err(TransportError::HttpStatus {
                    status: 503,
                    url: "https://portal.test/show".into(),
                }),
                _ => Ok("<html></html>".to_string()),
            }
        }

        async fn fetch_district_list(
            &self,
            city_code: &str,
        ) -> Result<BTreeMap<String, String>, TransportError> {
            let mut districts = BTreeMap::new();
            if city_code == "6110000" {
                districts.insert("3160000".to_string(), "구로구".to_string());
            }
            Ok(districts)
        }
    }

    async fn test_app() -> (TempDir, AppState, Router) {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("web.db").display());
        let reader = ActivityStore::open(&url).await.unwrap();
        let writer = ActivityStore::connect(&url).await.unwrap();
        let orchestrator = SyncOrchestrator::new(Arc::new(FakePortal), writer);
        let state = AppState::new(reader, orchestrator);
        let router = app(state.clone());
        (dir, state, router)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
        send(router, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
    }

    async fn post_sync(router: &Router, body: &str) -> (StatusCode, Value) {
        send(
            router,
            Request::builder()
                .method("POST")
                .uri("/api/sync")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    #[tokio::test]
    async fn codes_lists_every_table() {
        let (_dir, _state, router) = test_app().await;
        let (status, body) = get_json(&router, "/api/codes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["regions"].as_array().unwrap().len(), REGION_CODES.len());
        assert_eq!(body["activity_types"][2]["label"], "온라인+오프라인");
    }

    #[tokio::test]
    async fn direct_search_groups_and_caches_results() {
        let (_dir, state, router) = test_app().await;
        let (status, body) = get_json(&router, "/api/search?region=6110000&page=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
        assert_eq!(body["groups"].as_array().unwrap().len(), 1);
        assert_eq!(body["groups"][0]["group_key"], "급식 지원");
        assert!(state.store.get("S2").await.unwrap().is_some());

        let (_, cached) = get_json(&router, "/api/activities?status=1").await;
        assert_eq!(cached["total"], 1);
        assert_eq!(cached["items"][0]["program_id"], "S2");

        let (_, group) = get_json(&router, "/api/groups/%EA%B8%89%EC%8B%9D%20%EC%A7%80%EC%9B%90").await;
        assert_eq!(group["items"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn detail_enriches_and_lists_related() {
        let (_dir, _state, router) = test_app().await;
        get_json(&router, "/api/search").await;

        let (status, body) = get_json(&router, "/api/activities/S1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activity"]["detail_fetched"], true);
        assert_eq!(body["activity"]["location"], "복지관 식당");
        assert_eq!(body["related"][0]["program_id"], "S2");
    }

    #[tokio::test]
    async fn detail_errors_map_to_status_codes() {
        let (_dir, _state, router) = test_app().await;
        let (status, _) = get_json(&router, "/api/activities/NOPE").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = get_json(&router, "/api/activities/DOWN").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn sync_start_conflict_and_status() {
        let (_dir, state, router) = test_app().await;

        let held = state.orchestrator.begin(SearchFilters::default()).unwrap();
        let (status, _) = post_sync(&router, "").await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (_, running) = get_json(&router, "/api/sync/status").await;
        assert_eq!(running["running"], true);
        drop(held);

        let (status, body) = post_sync(&router, r#"{"region":"6110000"}"#).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["run_id"].is_string());

        let coordinator = state.orchestrator.coordinator();
        for _ in 0..200 {
            if !coordinator.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (_, done) = get_json(&router, "/api/sync/status").await;
        assert_eq!(done["running"], false);
        assert_eq!(done["fetched"], 2);
        assert_eq!(done["db_count"], 2);
        assert!(done["error"].is_null());

        let (_, runs) = get_json(&router, "/api/sync/runs").await;
        assert_eq!(runs[0]["status"], "succeeded");
    }

    #[tokio::test]
    async fn malformed_sync_body_is_rejected() {
        let (_dir, _state, router) = test_app().await;
        let (status, _) = post_sync(&router, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn districts_come_from_the_portal() {
        let (_dir, _state, router) = test_app().await;
        let (status, body) = get_json(&router, "/api/districts/6110000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["3160000"], "구로구");
    }
}
