//! Portal adapter contracts: the request side ([`PortalSource`]) and the markup side
//! ([`ActivityExtractor`]).
//!
//! Parsers are infallible. A missing optional element degrades to an empty string and
//! a listing entry without a program id is skipped.

use std::collections::BTreeMap;

use async_trait::async_trait;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use vols_core::{ActivityRecord, SearchFilters};
use vols_storage::TransportError;

mod detail;
mod listing;
mod portal;

pub use detail::parse_detail;
pub use listing::{parse_listing, parse_total_count};
pub use portal::{PortalClient, PortalConfig, DEFAULT_PORTAL_BASE_URL, DISTRICT_PATH, LISTING_PATH};

pub const CRATE_NAME: &str = "vols-adapters";

/// Records parsed from one listing page plus the portal's total hit count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPage {
    pub records: Vec<ActivityRecord>,
    pub total_count: usize,
}

/// Outbound requests to the volunteer portal. No retries, no parsing.
#[async_trait]
pub trait PortalSource: Send + Sync {
    async fn fetch_listing_page(
        &self,
        filters: &SearchFilters,
        page: u32,
    ) -> Result<String, TransportError>;

    async fn fetch_detail_page(&self, program_id: &str) -> Result<String, TransportError>;

    /// District code -> district name for one region code.
    async fn fetch_district_list(
        &self,
        city_code: &str,
    ) -> Result<BTreeMap<String, String>, TransportError>;
}

/// Markup-to-record extraction, isolated so markup drift stays a local change.
pub trait ActivityExtractor: Send + Sync {
    fn parse_listing(&self, html: &str) -> ListingPage;
    fn parse_detail(&self, html: &str, program_id: &str) -> Option<ActivityRecord>;
}

/// Extractor for the portal's current HTML layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortalHtmlExtractor;

impl ActivityExtractor for PortalHtmlExtractor {
    fn parse_listing(&self, html: &str) -> ListingPage {
        listing::parse_listing(html)
    }

    fn parse_detail(&self, html: &str, program_id: &str) -> Option<ActivityRecord> {
        detail::parse_detail(html, program_id)
    }
}

pub(crate) fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("invalid selector")
}

/// Concatenated text of every descendant text node, each trimmed.
pub(crate) fn stripped_text(el: ElementRef<'_>) -> String {
    el.text().map(str::trim).collect()
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn select_first_text(el: ElementRef<'_>, sel: &Selector) -> String {
    el.select(sel).next().map(stripped_text).unwrap_or_default()
}

/// First two dotted dates in `text` as ISO dates, or a pair of empty strings when
/// fewer than two are present.
pub(crate) fn date_pair(text: &str) -> (String, String) {
    let mut dates = listing::DATE_RE
        .find_iter(text)
        .map(|m| m.as_str().replace('.', "-"));
    match (dates.next(), dates.next()) {
        (Some(start), Some(end)) => (start, end),
        _ => (String::new(), String::new()),
    }
}
