use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use vols_core::{normalize_title, ActivityRecord};

use crate::{collapse_whitespace, date_pair, select_first_text, selector, stripped_text};

static STATUS_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]+)\)\s*$").expect("invalid regex: status suffix"));
static RECOGNIZED_HOURS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"최대\s*(\d+)시간\s*인정").expect("invalid regex: recognized hours")
});

static BOARD_VIEW_SEL: LazyLock<Selector> = LazyLock::new(|| selector("div.board_view"));
static HEADER_SEL: LazyLock<Selector> = LazyLock::new(|| selector("h3.tit_board_view"));
static DATA_SHOW_SEL: LazyLock<Selector> = LazyLock::new(|| selector("div.board_data_show"));
static DL_SEL: LazyLock<Selector> = LazyLock::new(|| selector("dl"));
static DT_SEL: LazyLock<Selector> = LazyLock::new(|| selector("dt"));
static DD_SEL: LazyLock<Selector> = LazyLock::new(|| selector("dd"));
static ORG_NAME_SEL: LazyLock<Selector> = LazyLock::new(|| selector("span.text-l"));
static BODY_SEL: LazyLock<Selector> = LazyLock::new(|| selector("div.board_body"));

/// Parse a detail page. `None` when the page has no detail container, which the
/// portal serves for unknown or withdrawn ids.
pub fn parse_detail(html: &str, program_id: &str) -> Option<ActivityRecord> {
    let document = Html::parse_document(html);
    let view = document.select(&BOARD_VIEW_SEL).next()?;

    let (title, recruit_status) = split_header(&select_first_text(view, &HEADER_SEL));
    let fields = DetailFields::collect(view);

    let (period_start, period_end) = date_pair(&fields.raw("봉사기간"));
    let (recruit_start, recruit_end) = date_pair(&fields.raw("모집기간"));
    let volunteer_time = fields.collapsed("봉사시간");
    let recognized_hours = RECOGNIZED_HOURS_RE
        .captures(&volunteer_time)
        .map(|caps| format!("{}시간", &caps[1]))
        .unwrap_or_default();

    let organization = fields
        .cell("모집기관")
        .map(|dd| {
            dd.select(&ORG_NAME_SEL)
                .next()
                .map(stripped_text)
                .unwrap_or_else(|| stripped_text(dd))
        })
        .unwrap_or_default();

    let description = view
        .select(&BODY_SEL)
        .next()
        .map(body_text)
        .unwrap_or_default();

    Some(ActivityRecord {
        program_id: program_id.to_string(),
        group_key: normalize_title(&title),
        title,
        recruit_status,
        location: fields.text("봉사장소"),
        organization,
        category: fields.collapsed("봉사분야"),
        activity_type: fields.collapsed("활동구분"),
        recognized_hours,
        period_start,
        period_end,
        volunteer_time,
        recruit_start,
        recruit_end,
        description,
        recruit_count: fields.collapsed("모집인원"),
        apply_count: fields.collapsed("신청인원"),
        target: fields.collapsed("봉사대상"),
        active_days: fields.collapsed("활동요일"),
        volunteer_type: fields.collapsed("봉사자유형"),
        register_org: fields.text("등록기관"),
        detail_fetched: true,
        ..Default::default()
    })
}

/// "title (status)" -> (title, status). No trailing parenthetical means no status.
fn split_header(header: &str) -> (String, String) {
    match STATUS_SUFFIX_RE.captures(header) {
        Some(caps) => {
            let start = caps.get(0).map_or(header.len(), |m| m.start());
            (header[..start].trim().to_string(), caps[1].trim().to_string())
        }
        None => (header.trim().to_string(), String::new()),
    }
}

/// Paragraphs of the body, one trimmed text node per line.
fn body_text(body: ElementRef<'_>) -> String {
    body.text()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// `dt` label -> `dd` cell from the detail data table.
struct DetailFields<'a> {
    cells: HashMap<String, ElementRef<'a>>,
}

impl<'a> DetailFields<'a> {
    fn collect(view: ElementRef<'a>) -> Self {
        let mut cells = HashMap::new();
        if let Some(table) = view.select(&DATA_SHOW_SEL).next() {
            for dl in table.select(&DL_SEL) {
                if let (Some(dt), Some(dd)) = (dl.select(&DT_SEL).next(), dl.select(&DD_SEL).next()) {
                    cells.insert(stripped_text(dt), dd);
                }
            }
        }
        Self { cells }
    }

    fn cell(&self, label: &str) -> Option<ElementRef<'a>> {
        self.cells.get(label).copied()
    }

    /// Untrimmed cell text, for regex extraction.
    fn raw(&self, label: &str) -> String {
        self.cell(label)
            .map(|dd| dd.text().collect())
            .unwrap_or_default()
    }

    fn text(&self, label: &str) -> String {
        self.cell(label).map(stripped_text).unwrap_or_default()
    }

    fn collapsed(&self, label: &str) -> String {
        collapse_whitespace(&self.text(label))
    }
}
