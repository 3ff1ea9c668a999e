use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use vols_core::SearchFilters;
use vols_storage::{HttpClientConfig, HttpFetcher, TransportError, BROWSER_USER_AGENT};

use crate::PortalSource;

pub const DEFAULT_PORTAL_BASE_URL: &str = "https://www.1365.go.kr";
pub const LISTING_PATH: &str = "/vols/1572247904127/partcptn/timeCptn.do";
pub const DISTRICT_PATH: &str = "/vols/P9210/mber/volsMberJson.do";

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Listing and detail requests.
    pub page_timeout: Duration,
    pub district_timeout: Duration,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PORTAL_BASE_URL.to_string(),
            user_agent: BROWSER_USER_AGENT.to_string(),
            page_timeout: Duration::from_secs(20),
            district_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DistrictListResponse {
    #[serde(default)]
    list: Vec<DistrictEntry>,
}

#[derive(Debug, Deserialize)]
struct DistrictEntry {
    code: String,
    #[serde(rename = "codeNm")]
    name: String,
}

/// Live portal client over [`HttpFetcher`].
#[derive(Debug)]
pub struct PortalClient {
    http: HttpFetcher,
    listing_url: String,
    district_url: String,
    page_timeout: Duration,
    district_timeout: Duration,
}

impl PortalClient {
    pub fn new(config: PortalConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.page_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let base = config.base_url.trim_end_matches('/');
        Ok(Self {
            http,
            listing_url: format!("{base}{LISTING_PATH}"),
            district_url: format!("{base}{DISTRICT_PATH}"),
            page_timeout: config.page_timeout,
            district_timeout: config.district_timeout,
        })
    }
}

fn detail_form(program_id: &str) -> Vec<(&'static str, String)> {
    vec![
        ("cPage", "1".to_string()),
        ("actType", "A01".to_string()),
        ("searchSrvcStts", "0".to_string()),
        ("adultPosblAt", "Y".to_string()),
        ("yngbgsPosblAt", "Y".to_string()),
        ("searchFlag", "search".to_string()),
        ("progrmRegistNo", program_id.to_string()),
    ]
}

fn decode_district_list(body: &str) -> Result<BTreeMap<String, String>, TransportError> {
    let parsed: DistrictListResponse =
        serde_json::from_str(body).map_err(|err| TransportError::Decode(err.to_string()))?;
    Ok(parsed
        .list
        .into_iter()
        .map(|entry| (entry.code, entry.name))
        .collect())
}

#[async_trait]
impl PortalSource for PortalClient {
    async fn fetch_listing_page(
        &self,
        filters: &SearchFilters,
        page: u32,
    ) -> Result<String, TransportError> {
        let form = filters.form_params(page);
        let body = self
            .http
            .post_form(&self.listing_url, &[], &form, Some(self.page_timeout))
            .await?;
        debug!(page, bytes = body.len(), "listing page fetched");
        Ok(body)
    }

    async fn fetch_detail_page(&self, program_id: &str) -> Result<String, TransportError> {
        let query = [
            ("type", "show".to_string()),
            ("progrmRegistNo", program_id.to_string()),
        ];
        self.http
            .post_form(
                &self.listing_url,
                &query,
                &detail_form(program_id),
                Some(self.page_timeout),
            )
            .await
    }

    async fn fetch_district_list(
        &self,
        city_code: &str,
    ) -> Result<BTreeMap<String, String>, TransportError> {
        let form = [
            ("type", "hopeAreaList".to_string()),
            ("upper", city_code.to_string()),
            ("engnSe", "4".to_string()),
        ];
        let body = self
            .http
            .post_form(&self.district_url, &[], &form, Some(self.district_timeout))
            .await?;
        decode_district_list(&body)
    }
}
