use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use vols_core::codes::{OFFLINE, ONLINE, ONLINE_OFFLINE, TIME_CERTIFIED};
use vols_core::ActivityRecord;

use crate::{collapse_whitespace, date_pair, select_first_text, selector, stripped_text, ListingPage};

pub(crate) static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}\.\d{2}\.\d{2}").expect("invalid regex: dotted date"));

static TOTAL_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"전체\s*<em>([\d,]+)</em>\s*건").expect("invalid regex: total count")
});

static LIST_SEL: LazyLock<Selector> = LazyLock::new(|| selector("ul.list_wrap.wrap2"));
static PROGRAM_ID_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"input[name="progrmRegistNo"]"#));
static BADGE_LIST_SEL: LazyLock<Selector> = LazyLock::new(|| selector("div.ing.blue ul"));
static LI_SEL: LazyLock<Selector> = LazyLock::new(|| selector("li"));
static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| selector("div.tit_board_list"));
static LOCATION_SEL: LazyLock<Selector> = LazyLock::new(|| selector("div.vols-location"));
static SPAN_SEL: LazyLock<Selector> = LazyLock::new(|| selector("span"));
static STATUS_SEL: LazyLock<Selector> = LazyLock::new(|| selector("div.close_dDay div.end"));
static PC_INFO_SEL: LazyLock<Selector> = LazyLock::new(|| selector("div.txts_pc_ver"));
static DIV_SEL: LazyLock<Selector> = LazyLock::new(|| selector("div"));
static P_SEL: LazyLock<Selector> = LazyLock::new(|| selector("p"));

/// Portal-wide hit count from the "전체 <em>N</em> 건" badge; 0 when absent.
pub fn parse_total_count(html: &str) -> usize {
    TOTAL_COUNT_RE
        .captures(html)
        .and_then(|caps| caps[1].replace(',', "").parse().ok())
        .unwrap_or(0)
}

/// Parse one listing page. A page without the list container yields nothing.
pub fn parse_listing(html: &str) -> ListingPage {
    let document = Html::parse_document(html);
    let Some(list) = document.select(&LIST_SEL).next() else {
        return ListingPage::default();
    };

    let records = list
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "li")
        .filter_map(parse_entry)
        .collect();

    ListingPage {
        records,
        total_count: parse_total_count(html),
    }
}

fn parse_entry(li: ElementRef<'_>) -> Option<ActivityRecord> {
    let program_id = li
        .select(&PROGRAM_ID_SEL)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(str::trim)
        .filter(|id| !id.is_empty())?
        .to_string();

    let badges = li
        .select(&BADGE_LIST_SEL)
        .next()
        .map(|ul| ul.select(&LI_SEL).map(stripped_text).collect::<Vec<_>>())
        .unwrap_or_default();

    let mut spans = li
        .select(&LOCATION_SEL)
        .next()
        .map(|loc| loc.select(&SPAN_SEL).map(stripped_text).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter();

    let mut record = ActivityRecord {
        program_id,
        title: select_first_text(li, &TITLE_SEL),
        location: spans.next().unwrap_or_default(),
        organization: spans.next().unwrap_or_default(),
        category: category_from_badges(&badges),
        activity_type: activity_type_from_badges(&badges),
        recruit_status: select_first_text(li, &STATUS_SEL),
        ..Default::default()
    };

    if let Some(info) = li.select(&PC_INFO_SEL).next() {
        apply_info_rows(info, &mut record);
    }
    Some(record)
}

/// Label/value rows inside the desktop info block; each row is a div with a `p`
/// label and a `span` value.
fn apply_info_rows(info: ElementRef<'_>, record: &mut ActivityRecord) {
    for row in info.select(&DIV_SEL) {
        let (Some(label), Some(value)) = (row.select(&P_SEL).next(), row.select(&SPAN_SEL).next())
        else {
            continue;
        };
        let value = stripped_text(value);
        match stripped_text(label).as_str() {
            "봉사기간" => {
                (record.period_start, record.period_end) = date_pair(&value);
            }
            "봉사시간" => record.volunteer_time = collapse_whitespace(&value),
            "모집기간" => {
                (record.recruit_start, record.recruit_end) = date_pair(&value);
            }
            "인정시간" => record.recognized_hours = value,
            _ => {}
        }
    }
}

fn activity_type_from_badges(badges: &[String]) -> String {
    let has_online = badges.iter().any(|b| b.contains(ONLINE));
    let has_offline = badges.iter().any(|b| b.contains(OFFLINE));
    match (has_online, has_offline) {
        (true, true) => ONLINE_OFFLINE,
        (false, true) => OFFLINE,
        (true, false) => ONLINE,
        (false, false) => "",
    }
    .to_string()
}

fn category_from_badges(badges: &[String]) -> String {
    const RESERVED: [&str; 4] = [TIME_CERTIFIED, ONLINE, OFFLINE, ONLINE_OFFLINE];
    badges
        .iter()
        .find(|b| !b.is_empty() && !RESERVED.contains(&b.as_str()))
        .cloned()
        .unwrap_or_default()
}
