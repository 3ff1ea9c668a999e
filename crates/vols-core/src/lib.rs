//! Core domain model for volunteer activity listings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod codes;
pub mod group_key;

pub use group_key::{group_activities, normalize_title, ActivityGroup};

pub const CRATE_NAME: &str = "vols-core";

/// Number of entries the portal serves per listing page.
pub const LISTING_PAGE_SIZE: usize = 10;

/// One externally listed volunteer opportunity, keyed by `program_id`.
///
/// Listing-derived fields are overwritten on every listing fetch. The detail set
/// (`description` through `register_org`) is only filled by a detail fetch, after
/// which `detail_fetched` stays true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ActivityRecord {
    pub program_id: String,
    pub title: String,
    pub location: String,
    pub organization: String,
    pub category: String,
    pub activity_type: String,
    pub recruit_status: String,
    pub recognized_hours: String,
    pub period_start: String,
    pub period_end: String,
    pub volunteer_time: String,
    pub recruit_start: String,
    pub recruit_end: String,
    pub group_key: String,
    pub fetched_at: DateTime<Utc>,
    pub description: String,
    pub recruit_count: String,
    pub apply_count: String,
    pub target: String,
    pub active_days: String,
    pub volunteer_type: String,
    pub register_org: String,
    pub detail_fetched: bool,
}

impl ActivityRecord {
    /// Deep-link placeholder: only the id and fetch time are known.
    pub fn placeholder(program_id: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            program_id: program_id.into(),
            fetched_at,
            ..Default::default()
        }
    }

    pub fn canonical_status(&self) -> RecruitStatus {
        RecruitStatus::from_label(&self.recruit_status)
    }

    /// Stamp listing-level derived fields before a store write.
    pub fn stamp_listing(&mut self, fetched_at: DateTime<Utc>) {
        self.group_key = normalize_title(&self.title);
        self.fetched_at = fetched_at;
    }
}

/// Canonical recruitment state. The upstream label is free text; the code is what
/// the local store indexes and what cached searches filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecruitStatus {
    Recruiting,
    Closed,
    Unknown,
}

impl RecruitStatus {
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        if label.contains("모집중") || label.contains("마감임박") {
            Self::Recruiting
        } else if label.contains("모집완료") || label.contains("마감") {
            Self::Closed
        } else {
            Self::Unknown
        }
    }

    /// Portal status code (`searchSrvcStts`); unknown labels map to the empty code.
    pub fn code(self) -> &'static str {
        match self {
            Self::Recruiting => "0",
            Self::Closed => "1",
            Self::Unknown => "",
        }
    }

    /// `None` means "no status constraint" (`3`, empty, or anything unrecognised).
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(Self::Recruiting),
            "1" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Search criteria accepted by a sync run or a direct portal search.
///
/// All values are portal codes (see [`codes`]); empty strings mean "any".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub region: String,
    pub district: String,
    pub category: String,
    pub activity_type: String,
    pub target: String,
    pub status: String,
    pub date_start: String,
    pub date_end: String,
    pub keyword: String,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            region: String::new(),
            district: String::new(),
            category: String::new(),
            activity_type: String::new(),
            target: String::new(),
            status: "0".to_string(),
            date_start: String::new(),
            date_end: String::new(),
            keyword: String::new(),
        }
    }
}

impl SearchFilters {
    /// Form fields for one listing page request.
    pub fn form_params(&self, page: u32) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("cPage", page.max(1).to_string()),
            ("searchFlag", "search".to_string()),
            ("searchHopeArea1", self.region.clone()),
            ("searchHopeArea2", self.district.clone()),
            ("searchSrvcStts", self.status.clone()),
            ("searchProgrmBgnde", self.date_start.clone()),
            ("searchProgrmEndde", self.date_end.clone()),
            ("adultPosblAt", "Y".to_string()),
            ("yngbgsPosblAt", "Y".to_string()),
        ];
        let optional = [
            ("searchHopeSrvc1", &self.category),
            ("searchActOnline", &self.activity_type),
            ("searchSrvcTarget", &self.target),
            ("searchKeyword", &self.keyword),
        ];
        for (name, value) in optional {
            if !value.is_empty() {
                params.push((name, value.clone()));
            }
        }
        params
    }
}

/// One page of search results, from the portal or from the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    pub items: Vec<ActivityRecord>,
    pub total: usize,
    pub page: u32,
    pub per_page: usize,
}

/// Number of listing pages needed for `total_count` entries.
pub fn total_pages_for(total_count: usize) -> u32 {
    total_count.div_ceil(LISTING_PAGE_SIZE) as u32
}
