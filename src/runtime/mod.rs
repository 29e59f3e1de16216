//! Unit runtime: compiling scanner units and executing them under the
//! sandbox contract.

pub mod compile;
pub mod expr;
pub mod sandbox;

use serde_json::{Map, Value as Json};
use std::fmt;

/// Row columns every unit can read without defining them. D-1 columns come
/// from the same instrument's prior trading session.
pub const BUILTIN_COLUMNS: &[&str] = &[
    "open",
    "high",
    "low",
    "close",
    "volume",
    "vwap",
    "transactions",
    "prev_open",
    "prev_high",
    "prev_low",
    "prev_close",
    "prev_volume",
    "gap_pct",
    "change_pct",
    "range_pct",
    "dollar_volume",
];

/// Column-oriented table, the usual unit return shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Json>>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Whatever a unit's entry point produced, before normalisation.
pub enum RawOutput {
    Table(Table),
    Records(Vec<Map<String, Json>>),
    Stream(Box<dyn Iterator<Item = Map<String, Json>> + Send>),
    /// A mapping that wraps the results under a conventional key.
    Container(Json),
}

impl fmt::Debug for RawOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawOutput::Table(t) => write!(f, "Table({} rows)", t.len()),
            RawOutput::Records(r) => write!(f, "Records({} rows)", r.len()),
            RawOutput::Stream(_) => write!(f, "Stream(..)"),
            RawOutput::Container(v) => write!(f, "Container({v})"),
        }
    }
}
