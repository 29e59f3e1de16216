//! Shared types for SCANLAB.
//!
//! These types form the data model used across the analysis, runtime and
//! engine modules. They carry no behaviour beyond small invariants
//! (hashing, validation, terminal-state checks) so every layer can depend
//! on them without circular references.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Scanner source
// ---------------------------------------------------------------------------

/// Raw scanner text as uploaded. Immutable once ingested.
#[derive(Debug, Clone)]
pub struct ScannerSource {
    text: Arc<str>,
    content_hash: String,
    byte_len: usize,
}

impl ScannerSource {
    pub fn new(text: impl Into<String>) -> Self {
        let text: String = text.into();
        let content_hash = format!("{:x}", Sha256::digest(text.as_bytes()));
        let byte_len = text.len();
        Self {
            text: Arc::from(text),
            content_hash,
            byte_len,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Hex SHA-256 of the source bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Structural shape of a scanner source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    StandaloneScript,
    AsyncEntryWithDates,
    MultiPatternAssignments,
    SingleExtractedScanner,
    Unknown,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternKind::StandaloneScript => write!(f, "standalone_script"),
            PatternKind::AsyncEntryWithDates => write!(f, "async_entry_with_dates"),
            PatternKind::MultiPatternAssignments => write!(f, "multi_pattern_assignments"),
            PatternKind::SingleExtractedScanner => write!(f, "single_extracted_scanner"),
            PatternKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A reusable callable the sandbox may invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub name: String,
    pub is_async: bool,
    /// True when the signature is `(start, end)`-shaped; false for zero-arg.
    pub takes_date_range: bool,
    /// 1-based line of the `def`.
    pub line: usize,
}

/// Result of `SourceClassifier::classify`. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternClassification {
    pub pattern_kind: PatternKind,
    /// 0.0–1.0
    pub confidence: f64,
    /// Structural signals that drove the decision, for audit.
    pub signals: Vec<String>,
    pub entry_point: Option<EntryPoint>,
}

/// Confidence reported for every `unknown` classification.
pub const UNKNOWN_CONFIDENCE: f64 = 0.0;

impl PatternClassification {
    pub fn unknown(signals: Vec<String>) -> Self {
        Self {
            pattern_kind: PatternKind::Unknown,
            confidence: UNKNOWN_CONFIDENCE,
            signals,
            entry_point: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamCategory {
    TradingFilter,
    TechnicalIndicator,
    ApiConstant,
    Other,
}

impl fmt::Display for ParamCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamCategory::TradingFilter => write!(f, "trading_filter"),
            ParamCategory::TechnicalIndicator => write!(f, "technical_indicator"),
            ParamCategory::ApiConstant => write!(f, "api_constant"),
            ParamCategory::Other => write!(f, "other"),
        }
    }
}

/// Which extraction pass produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionPass {
    LiteralAssignment,
    ConfigBlock,
    ApiConstant,
    ComparisonThreshold,
}

/// A literal value found in source. Numbers keep their exact decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(Decimal),
    Text(String),
}

impl ParamValue {
    pub const REDACTED: &'static str = "<redacted>";

    /// Canonical text used for hashing (`1.50` and `1.5` hash the same).
    pub fn canonical(&self) -> String {
        match self {
            ParamValue::Number(d) => d.normalize().to_string(),
            ParamValue::Text(s) => format!("{s:?}"),
        }
    }

    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            ParamValue::Number(d) => Some(*d),
            ParamValue::Text(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(d) => write!(f, "{}", d.normalize()),
            ParamValue::Text(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEntry {
    pub value: ParamValue,
    pub category: ParamCategory,
    pub confidence: f64,
    /// 1-based line of the first occurrence.
    pub line: usize,
    pub pass: ExtractionPass,
}

/// Ordered name → entry mapping plus an order-independent hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSignature {
    pub parameters: IndexMap<String, ParameterEntry>,
    pub parameter_hash: String,
}

impl ParameterSignature {
    pub fn new(parameters: IndexMap<String, ParameterEntry>) -> Self {
        let parameter_hash = Self::hash_of(&parameters);
        Self {
            parameters,
            parameter_hash,
        }
    }

    /// SHA-256 over the sorted `(name, value)` pairs.
    pub fn hash_of(parameters: &IndexMap<String, ParameterEntry>) -> String {
        let mut pairs: Vec<(&str, String)> = parameters
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.value.canonical()))
            .collect();
        pairs.sort();

        let mut hasher = Sha256::new();
        for (name, value) in pairs {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, name: &str) -> Option<&ParameterEntry> {
        self.parameters.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.parameters.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Decomposition
// ---------------------------------------------------------------------------

/// One self-contained single-pattern unit cut from a multi-pattern source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternUnit {
    pub name: String,
    /// Boolean expression over row-level columns.
    pub logic_expression: String,
    pub standalone_source: String,
    pub parameters: ParameterSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub name: String,
    pub reason: String,
}

/// Per-unit outcome of a decomposition: ready units plus explicit failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decomposition {
    pub units: Vec<PatternUnit>,
    pub failures: Vec<UnitFailure>,
}

impl Decomposition {
    /// Number of patterns that were found, whether or not they compiled.
    pub fn pattern_count(&self) -> usize {
        self.units.len() + self.failures.len()
    }

    pub fn unit(&self, name: &str) -> Option<&PatternUnit> {
        self.units.iter().find(|u| u.name == name)
    }
}

// ---------------------------------------------------------------------------
// Date ranges
// ---------------------------------------------------------------------------

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> anyhow::Result<Self> {
        if start > end {
            anyhow::bail!("start date {start} is after end date {end}");
        }
        Ok(Self { start, end })
    }

    /// Number of calendar days, inclusive.
    pub fn calendar_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Weekdays in the range, inclusive.
    pub fn weekdays(&self) -> Vec<NaiveDate> {
        self.start
            .iter_days()
            .take_while(|d| *d <= self.end)
            .filter(|d| is_weekday(*d))
            .collect()
    }

    pub fn trading_day_count(&self) -> usize {
        self.weekdays().len()
    }

    /// Split into sequential, non-overlapping windows of at most
    /// `max_days` calendar days each.
    pub fn split(&self, max_days: i64) -> Vec<DateRange> {
        let max_days = max_days.max(1);
        let mut windows = Vec::new();
        let mut cursor = self.start;
        while cursor <= self.end {
            let end = (cursor + Duration::days(max_days - 1)).min(self.end);
            windows.push(DateRange { start: cursor, end });
            cursor = end + Duration::days(1);
        }
        windows
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// How a submitted source is turned into executable units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobMode {
    /// Decompose multi-pattern sources and run every ready unit.
    #[default]
    Auto,
    /// Run the whole source as one unit.
    Single,
    /// Run only the named decomposed unit.
    Pattern(String),
    /// Classification, parameters and units only.
    Analyze,
}

impl std::str::FromStr for JobMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "" | "auto" => Ok(JobMode::Auto),
            "single" => Ok(JobMode::Single),
            "analyze" | "analyse" => Ok(JobMode::Analyze),
            _ => match trimmed.split_once(':') {
                Some((prefix, name)) if prefix.eq_ignore_ascii_case("pattern") && !name.is_empty() => {
                    Ok(JobMode::Pattern(name.to_string()))
                }
                _ => anyhow::bail!("unknown job mode: {s}"),
            },
        }
    }
}

impl TryFrom<String> for JobMode {
    type Error = anyhow::Error;

    fn try_from(value: String) -> anyhow::Result<Self> {
        value.parse()
    }
}

impl From<JobMode> for String {
    fn from(mode: JobMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobMode::Auto => write!(f, "auto"),
            JobMode::Single => write!(f, "single"),
            JobMode::Pattern(name) => write!(f, "pattern:{name}"),
            JobMode::Analyze => write!(f, "analyze"),
        }
    }
}

/// One flagged (ticker, date) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub ticker: String,
    pub date: NaiveDate,
    /// None for single-pattern jobs.
    pub pattern_name: Option<String>,
    pub metrics: BTreeMap<String, f64>,
}

pub type RecordKey = (String, NaiveDate, Option<String>);

impl ResultRecord {
    pub fn key(&self) -> RecordKey {
        (self.ticker.clone(), self.date, self.pattern_name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSummary {
    pub name: String,
    pub logic_expression: String,
    pub parameters: ParameterSignature,
}

/// What the engine learned about a job's source before executing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAnalysis {
    pub classification: PatternClassification,
    pub parameters: ParameterSignature,
    pub units: Vec<UnitSummary>,
    pub failures: Vec<UnitFailure>,
}

/// A submitted job. Mutated only by the controller and the sandbox's
/// progress sink; frozen once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub message: String,
    pub date_range: DateRange,
    pub mode: JobMode,
    pub source_hash: String,
    pub results: Vec<ResultRecord>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub analysis: Option<JobAnalysis>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionJob {
    pub fn new(date_range: DateRange, mode: JobMode, source_hash: String) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            status: JobStatus::Queued,
            progress_percent: 0,
            message: "Queued".to_string(),
            date_range,
            mode,
            source_hash,
            results: Vec::new(),
            error: None,
            warnings: Vec::new(),
            analysis: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.job_id,
            status: self.status,
            progress_percent: self.progress_percent,
            message: self.message.clone(),
            results: (self.status == JobStatus::Completed).then(|| self.results.clone()),
            error: self.error.clone(),
            warnings: self.warnings.clone(),
            analysis: self.analysis.clone(),
        }
    }
}

/// Polling response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ResultRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<JobAnalysis>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
