/// Yamaguchi Prefecture disaster information system client
///
/// Retrieves the dam and river gauge table pages of the prefecture's civil
/// engineering disaster information system and pulls the labelled values out
/// of them. The pages are HTML tables meant for people; extraction here is
/// deliberately shallow: strip the markup, find each label, take the token
/// that follows it. Values are returned as text and parsed by the record
/// builder, so a garbled cell surfaces as a typed `InvalidValue`.
///
/// Dam page:  kdm_table.aspx?check=<code>&obsdt=<YYYYMMDDHHMM>&pop=1
/// River page: kwl_table.aspx?check=<code>&obsdt=<YYYYMMDDHHMM>&pop=1

use std::time::Duration;

use chrono::{NaiveDateTime, TimeZone};

use crate::config::SourceConfig;
use crate::ingest::ObservationSource;
use crate::model::{FetchError, RawField, RawFields, Timestamp};
use crate::stations::{Station, StationKind};
use crate::timegrid::format_obsdt;

/// Timestamp format printed on the pages, e.g. `2025/06/23 04:50`.
const PAGE_TIME_FORMAT: &str = "%Y/%m/%d %H:%M";
const REPORTED_TIME_LABEL: &str = "観測時刻";

// ============================================================================
// Labels
// ============================================================================

/// A caption that precedes a value. `not_after` lists text that, directly in
/// front of the caption, means it belongs to a different quantity (the river
/// page prints its threshold stages as `氾濫危険水位` and so on).
struct Label {
    caption: &'static str,
    not_after: &'static [&'static str],
}

const fn label(caption: &'static str) -> Label {
    Label { caption, not_after: &[] }
}

const THRESHOLD_PREFIXES: &[&str] = &["待機", "注意", "判断", "危険", "貯"];

const DAM_LEVEL: &[Label] = &[label("貯水位")];
const STORAGE_RATE: &[Label] = &[label("貯水率")];
const INFLOW: &[Label] = &[label("流入量")];
const OUTFLOW: &[Label] = &[label("放流量"), label("流出量")];
const RAIN_HOURLY: &[Label] = &[label("時間雨量"), label("60分雨量")];
const RAIN_CUMULATIVE: &[Label] = &[label("累加雨量"), label("累積雨量"), label("総雨量")];
const RIVER_LEVEL: &[Label] = &[
    label("現在水位"),
    Label { caption: "水位", not_after: THRESHOLD_PREFIXES },
];

fn labels_for(field: RawField) -> &'static [Label] {
    match field {
        RawField::DamWaterLevel => DAM_LEVEL,
        RawField::DamStorageRate => STORAGE_RATE,
        RawField::DamInflow => INFLOW,
        RawField::DamOutflow => OUTFLOW,
        RawField::RainfallHourly => RAIN_HOURLY,
        RawField::RainfallCumulative => RAIN_CUMULATIVE,
        RawField::RiverWaterLevel => RIVER_LEVEL,
    }
}

fn fields_for(kind: StationKind) -> &'static [RawField] {
    crate::stations::expected_fields(kind)
}

// ============================================================================
// Client
// ============================================================================

pub struct BousaiClient {
    client: reqwest::blocking::Client,
    dam_url: String,
    river_url: String,
}

impl BousaiClient {
    pub fn new(source: &SourceConfig, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(source.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Network(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            dam_url: source.dam_url.clone(),
            river_url: source.river_url.clone(),
        })
    }

    fn page_url(&self, kind: StationKind) -> &str {
        match kind {
            StationKind::Dam => &self.dam_url,
            StationKind::River => &self.river_url,
        }
    }
}

impl ObservationSource for BousaiClient {
    fn fetch(&self, obsdt: Timestamp, station: &Station) -> Result<RawFields, FetchError> {
        let obsdt_param = format_obsdt(obsdt);
        let response = self
            .client
            .get(self.page_url(station.kind))
            .query(&[("check", station.code.as_str()), ("obsdt", obsdt_param.as_str()), ("pop", "1")])
            .send()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(format!(
                "HTTP 404 for station {} at {}",
                station.code, obsdt_param
            )));
        }
        if !status.is_success() {
            return Err(FetchError::Network(format!("HTTP {}", status)));
        }

        let body = response.text().map_err(|e| FetchError::Network(e.to_string()))?;
        parse_page(&body, station.kind, obsdt)
    }
}

// ============================================================================
// Page parsing
// ============================================================================

/// Extracts the station's fields from a page body.
///
/// Fields without a caption on the page are left `None`. A page on which
/// none of the station's captions appear is a `Parse` error: it is the
/// wrong page, an error page, or a layout change.
pub fn parse_page(html: &str, kind: StationKind, obsdt: Timestamp) -> Result<RawFields, FetchError> {
    let text = html_to_text(html);
    let mut raw = RawFields::new(obsdt);

    for &field in fields_for(kind) {
        if let Some(value) = labels_for(field).iter().find_map(|l| labelled_token(&text, l)) {
            raw.set(field, value);
        }
    }

    if fields_for(kind).iter().all(|f| raw.get(*f).is_none()) {
        return Err(FetchError::Parse(format!("no {:?} values found on page", kind)));
    }

    raw.reported_at = reported_time(&text, obsdt);
    Ok(raw)
}

/// Drops tags, decodes the handful of entities the pages use, and collapses
/// whitespace.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            _ => out.push(c),
        }
    }
    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The token following the first qualifying occurrence of `label`.
fn labelled_token(text: &str, label: &Label) -> Option<String> {
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find(label.caption) {
        let start = search_from + pos;
        let end = start + label.caption.len();
        search_from = end;

        let before = &text[..start];
        if label.not_after.iter().any(|p| before.ends_with(p)) {
            continue;
        }
        if let Some(token) = token_after(&text[end..]) {
            return Some(token);
        }
    }
    None
}

/// Skips separators and a parenthesised unit such as `(m3/s)`, then returns
/// the next token: a number if one starts there, else the raw word (e.g.
/// `欠測`) so the caller can tell "missing" from "garbled".
fn token_after(rest: &str) -> Option<String> {
    let mut chars = rest.char_indices().peekable();
    let mut depth = 0usize;
    while let Some(&(_, c)) = chars.peek() {
        match c {
            '(' | '（' => depth += 1,
            ')' | '）' => depth = depth.saturating_sub(1),
            _ if depth > 0 => {}
            ' ' | ':' | '：' | '=' => {}
            _ => break,
        }
        chars.next();
    }
    let (start, first) = chars.next()?;
    let tail = &rest[start..];

    let numeric = first.is_ascii_digit() || (first == '-' && tail[1..].starts_with(|c: char| c.is_ascii_digit()));
    let token: String = if numeric {
        tail.chars()
            .enumerate()
            .take_while(|(i, c)| c.is_ascii_digit() || *c == '.' || *c == ',' || (*i == 0 && *c == '-'))
            .map(|(_, c)| c)
            .collect()
    } else {
        tail.chars().take_while(|c| !c.is_whitespace()).collect()
    };
    Some(token.trim_end_matches([',', '.']).to_string())
}

/// The observation time the page reports: the one after `観測時刻` if
/// present, else the first timestamp anywhere on the page.
fn reported_time(text: &str, obsdt: Timestamp) -> Option<Timestamp> {
    let offset = *obsdt.offset();
    let labelled = text
        .find(REPORTED_TIME_LABEL)
        .and_then(|pos| first_timestamp(&text[pos + REPORTED_TIME_LABEL.len()..]));
    let naive = labelled.or_else(|| first_timestamp(text))?;
    offset.from_local_datetime(&naive).single()
}

fn first_timestamp(text: &str) -> Option<NaiveDateTime> {
    let mut prev_digit = false;
    for (i, c) in text.char_indices() {
        let is_digit = c.is_ascii_digit();
        if is_digit && !prev_digit {
            if let Ok((t, _)) = NaiveDateTime::parse_and_remainder(&text[i..], PAGE_TIME_FORMAT) {
                return Some(t);
            }
        }
        prev_digit = is_digit;
    }
    None
}

// ============================================================================
// Tests
// ============================================================================
