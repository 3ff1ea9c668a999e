//! Single-request operations that sit beside the bulk crawl: detail enrichment for
//! one activity and a direct, uncached portal search.

use chrono::Utc;
use tracing::{debug, warn};
use vols_adapters::{ActivityExtractor, PortalSource};
use vols_core::{ActivityRecord, SearchFilters, SearchPage, LISTING_PAGE_SIZE};
use vols_storage::{ActivityStore, TransportError};

use crate::DetailError;

/// Return the activity with its detail fields filled, fetching the detail page first
/// if it has not been fetched yet.
///
/// An id the cache has never seen gets a placeholder row before the fetch. `None`
/// means the portal has no such activity and the row carries nothing to show.
pub async fn load_activity_with_detail(
    portal: &dyn PortalSource,
    extractor: &dyn ActivityExtractor,
    store: &ActivityStore,
    program_id: &str,
) -> Result<Option<ActivityRecord>, DetailError> {
    match store.get(program_id).await? {
        Some(record) if record.detail_fetched => return Ok(Some(record)),
        Some(_) => {}
        None => {
            store.ensure_placeholder(program_id, Utc::now()).await?;
        }
    }
    refresh_activity_detail(portal, extractor, store, program_id).await
}

/// Fetch and apply the detail page unconditionally.
pub async fn refresh_activity_detail(
    portal: &dyn PortalSource,
    extractor: &dyn ActivityExtractor,
    store: &ActivityStore,
    program_id: &str,
) -> Result<Option<ActivityRecord>, DetailError> {
    let html = portal.fetch_detail_page(program_id).await.map_err(|err| {
        warn!(program_id, error = %err, "detail fetch failed");
        DetailError::Transport(err)
    })?;

    match extractor.parse_detail(&html, program_id) {
        Some(detail) => store.apply_detail(&detail).await?,
        None => debug!(program_id, "detail page has no content"),
    }

    Ok(store
        .get(program_id)
        .await?
        .filter(|record| record.detail_fetched || !record.title.is_empty()))
}

/// Other activities sharing `record`'s group key.
pub async fn related_activities(
    store: &ActivityStore,
    record: &ActivityRecord,
) -> Result<Vec<ActivityRecord>, DetailError> {
    if record.group_key.is_empty() {
        return Ok(Vec::new());
    }
    Ok(store
        .get_by_group(&record.group_key)
        .await?
        .into_iter()
        .filter(|other| other.program_id != record.program_id)
        .collect())
}

/// One listing page straight from the portal, group-keyed and stamped, bypassing the
/// cache.
pub async fn search_upstream(
    portal: &dyn PortalSource,
    extractor: &dyn ActivityExtractor,
    filters: &SearchFilters,
    page: u32,
) -> Result<SearchPage, TransportError> {
    let page = page.max(1);
    let html = portal.fetch_listing_page(filters, page).await?;
    let listing = extractor.parse_listing(&html);
    let fetched_at = Utc::now();
    let items = listing
        .records
        .into_iter()
        .map(|mut record| {
            record.stamp_listing(fetched_at);
            record
        })
        .collect();
    Ok(SearchPage {
        items,
        total: listing.total_count,
        page,
        per_page: LISTING_PAGE_SIZE,
    })
}
