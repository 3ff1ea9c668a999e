//! Title normalization into group keys.
//!
//! Postings for the same activity often differ only by a session counter, a date or
//! a time slot ("13일차 유적지 봉사활동" / "14일차 유적지 봉사활동"). Each rule below strips
//! one class of that noise. Rules run in order, specific before general, so a full
//! date is removed whole before the bare-year rule can split it.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::ActivityRecord;

/// One named strip rule.
pub struct StripRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub replacement: &'static str,
}

/// `(name, pattern, replacement)`. Only the standalone half-day rule puts a space
/// back, since its match consumes the separators on both sides.
const RULE_PATTERNS: &[(&str, &str, &str)] = &[
    ("day_counter", r"\d+일차\s*", ""),
    ("session_counter", r"\d+회차\s*", ""),
    ("phase_counter", r"제?\d+차\s*", ""),
    ("cohort_counter", r"제?\d+기\s*", ""),
    ("full_date", r"\d{4}[.\-/]\d{1,2}[.\-/]\d{1,2}\s*", ""),
    ("bare_year", r"\d{4}년?\s*", ""),
    ("paren_month_day", r"\(\d{1,2}[/월]\d{0,2}일?\)\s*", ""),
    ("month_day", r"\d{1,2}월\s*\d{0,2}일?\s*", ""),
    ("paren_time_range", r"\(\s*\d{1,2}:\d{2}\s*~?\s*(?:\d{1,2}:\d{2})?\s*\)\s*", ""),
    ("bracket_time_range", r"\[\s*\d{1,2}:\d{2}\s*~?\s*\d{0,2}:?\d{0,2}\s*\]\s*", ""),
    ("paren_half_day", r"\(\s*오[전후]\s*\)\s*", ""),
    ("half_day", r"(?:^|\s)오[전후](?:\s|$)", " "),
    ("leading_ordinal", r"^\d+\.\s*", ""),
    ("trailing_dash_number", r"\s*-\s*\d+$", ""),
];

pub static STRIP_RULES: LazyLock<Vec<StripRule>> = LazyLock::new(|| {
    RULE_PATTERNS
        .iter()
        .map(|&(name, pattern, replacement)| StripRule {
            name,
            pattern: Regex::new(pattern).expect("invalid regex: group key strip rule"),
            replacement,
        })
        .collect()
});

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_once(text: &str) -> String {
    let mut key = text.to_string();
    for rule in STRIP_RULES.iter() {
        key = rule.pattern.replace_all(&key, rule.replacement).into_owned();
    }
    collapse_whitespace(&key)
}

/// Canonical group key for a listing title. Never empty for a non-blank title.
///
/// The rule chain is repeated until the key stops changing, because one strip can
/// expose another ("도서 정리 - 3 - 4" only loses " - 3" after " - 4" is gone). That
/// makes the function idempotent.
pub fn normalize_title(title: &str) -> String {
    let original = title.trim();
    let mut key = original.to_string();
    loop {
        let next = strip_once(&key);
        if next == key {
            break;
        }
        key = next;
    }
    if key.is_empty() {
        original.to_string()
    } else {
        key
    }
}

/// Records sharing one group key, in the order they were seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityGroup {
    pub group_key: String,
    pub items: Vec<ActivityRecord>,
}

/// Cluster records by their existing `group_key`. Groups come out in order of first
/// occurrence; items keep their input order within a group.
pub fn group_activities(records: impl IntoIterator<Item = ActivityRecord>) -> Vec<ActivityGroup> {
    let mut groups: Vec<ActivityGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for record in records {
        match index.get(&record.group_key) {
            Some(&slot) => groups[slot].items.push(record),
            None => {
                index.insert(record.group_key.clone(), groups.len());
                groups.push(ActivityGroup {
                    group_key: record.group_key.clone(),
                    items: vec![record],
                });
            }
        }
    }
    groups
}
