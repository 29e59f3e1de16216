//! Result normalizer.
//!
//! Converts whatever a unit returned into `ResultRecord`s. Accepted
//! shapes: a column table, a list of mappings, a row stream, or a mapping
//! that wraps one of those under a conventional key. Wrapped tables may be
//! records, `split`-orient (`columns` + `data`) or dict-of-lists.
//!
//! Records are deduplicated on `(ticker, date, pattern_name)`; when a key
//! repeats, the later row wins.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::runtime::{RawOutput, Table};
use crate::types::{RecordKey, ResultRecord};

const TICKER_FIELDS: &[&str] = &["ticker", "symbol", "Ticker", "T", "sym"];
const DATE_FIELDS: &[&str] = &["date", "Date", "scan_date", "d0", "timestamp", "trade_date"];
const PATTERN_FIELDS: &[&str] = &["pattern", "pattern_name", "signal", "setup"];

/// Keys a mapping may wrap its rows under, in lookup order.
pub const CONTAINER_KEYS: &[&str] = &[
    "results",
    "signals",
    "df_results",
    "scan_results",
    "hits",
    "data",
    "rows",
    "records",
];

#[derive(Debug, Default, Clone)]
pub struct ResultNormalizer;

impl ResultNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalise one unit's output; rows lacking a ticker or a date are
    /// dropped.
    pub fn normalize(&self, raw: RawOutput) -> Vec<ResultRecord> {
        let rows: Box<dyn Iterator<Item = Map<String, Json>>> = match raw {
            RawOutput::Table(table) => Box::new(table_rows(table).into_iter()),
            RawOutput::Records(rows) => Box::new(rows.into_iter()),
            RawOutput::Stream(stream) => stream,
            RawOutput::Container(value) => Box::new(container_rows(value).into_iter()),
        };

        let mut skipped = 0usize;
        let records: Vec<ResultRecord> = rows
            .filter_map(|row| {
                let record = to_record(&row);
                if record.is_none() {
                    skipped += 1;
                }
                record
            })
            .collect();

        if skipped > 0 {
            warn!(skipped, kept = records.len(), "Dropped rows without ticker or date");
        }
        self.dedup(records)
    }

    /// Collapse duplicate keys (later wins) and order by date, ticker,
    /// pattern.
    pub fn dedup(&self, records: impl IntoIterator<Item = ResultRecord>) -> Vec<ResultRecord> {
        let mut by_key: IndexMap<RecordKey, ResultRecord> = IndexMap::new();
        let mut total = 0usize;
        for record in records {
            total += 1;
            by_key.insert(record.key(), record);
        }
        let mut out: Vec<ResultRecord> = by_key.into_values().collect();
        out.sort_by(|a, b| {
            (a.date, &a.ticker, &a.pattern_name).cmp(&(b.date, &b.ticker, &b.pattern_name))
        });
        if out.len() < total {
            debug!(total, unique = out.len(), "Deduplicated results");
        }
        out
    }
}

fn table_rows(table: Table) -> Vec<Map<String, Json>> {
    let Table { columns, rows } = table;
    rows.into_iter()
        .map(|values| columns.iter().cloned().zip(values).collect())
        .collect()
}

/// Rows inside a wrapped or table-like JSON value.
fn container_rows(value: Json) -> Vec<Map<String, Json>> {
    match value {
        Json::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Json::Object(m) => Some(m),
                _ => None,
            })
            .collect(),
        Json::Object(mut map) => {
            if let Some(rows) = table_like(&map) {
                return rows;
            }
            if let Some(key) = CONTAINER_KEYS.iter().find(|k| map.contains_key(**k)) {
                return map.remove(*key).map(container_rows).unwrap_or_default();
            }
            // A single unconventional key holding rows.
            if map.len() == 1 {
                if let Some((key, inner)) = map.into_iter().next() {
                    debug!(key = %key, "Unwrapping single-key container");
                    return container_rows(inner);
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

/// `split` orient (`{"columns": [...], "data": [[...]]}`) or dict-of-lists.
fn table_like(map: &Map<String, Json>) -> Option<Vec<Map<String, Json>>> {
    if let (Some(Json::Array(columns)), Some(Json::Array(data))) = (map.get("columns"), map.get("data")) {
        let columns: Vec<String> = columns.iter().filter_map(|c| c.as_str().map(str::to_string)).collect();
        return Some(
            data.iter()
                .filter_map(Json::as_array)
                .map(|values| columns.iter().cloned().zip(values.iter().cloned()).collect())
                .collect(),
        );
    }

    let has_ticker = TICKER_FIELDS.iter().any(|f| matches!(map.get(*f), Some(Json::Array(_))));
    if !has_ticker || !map.values().all(Json::is_array) {
        return None;
    }
    let len = map.values().filter_map(Json::as_array).map(Vec::len).max().unwrap_or(0);
    Some(
        (0..len)
            .map(|i| {
                map.iter()
                    .map(|(k, v)| (k.clone(), v.as_array().and_then(|a| a.get(i)).cloned().unwrap_or(Json::Null)))
                    .collect()
            })
            .collect(),
    )
}

/// The first alias present (and non-null) in `row`, with its name.
fn first_field<'a>(row: &'a Map<String, Json>, names: &[&'static str]) -> Option<(&'static str, &'a Json)> {
    names
        .iter()
        .find_map(|n| row.get(*n).filter(|v| !v.is_null()).map(|v| (*n, v)))
}

/// Parse `YYYY-MM-DD`, RFC 3339, `YYYY-MM-DD HH:MM:SS`, or epoch
/// seconds/milliseconds.
pub fn parse_date(value: &Json) -> Option<NaiveDate> {
    match value {
        Json::String(s) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
                .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok().map(|dt| dt.date()))
                .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok().map(|dt| dt.date()))
        }
        Json::Number(n) => {
            let v = n.as_i64()?;
            let millis = if v.abs() >= 100_000_000_000 { v } else { v * 1000 };
            DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
        }
        _ => None,
    }
}

fn to_record(row: &Map<String, Json>) -> Option<ResultRecord> {
    let (ticker_field, ticker) = first_field(row, TICKER_FIELDS)?;
    let ticker = ticker.as_str()?.trim().to_string();
    if ticker.is_empty() {
        return None;
    }
    let (date_field, date) = first_field(row, DATE_FIELDS)?;
    let date = parse_date(date)?;
    let pattern = first_field(row, PATTERN_FIELDS);
    let pattern_field = pattern.map(|(f, _)| f);
    let pattern_name = pattern.and_then(|(_, v)| v.as_str()).map(str::to_string);

    let metrics: BTreeMap<String, f64> = row
        .iter()
        .filter(|(k, _)| {
            let k = k.as_str();
            k != ticker_field && k != date_field && Some(k) != pattern_field
        })
        .filter_map(|(k, v)| {
            let x = match v {
                Json::Number(n) => n.as_f64()?,
                Json::Bool(b) => f64::from(u8::from(*b)),
                _ => return None,
            };
            x.is_finite().then(|| (k.clone(), x))
        })
        .collect();

    Some(ResultRecord {
        ticker,
        date,
        pattern_name,
        metrics,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
