//! Parameter extractor.
//!
//! Four independent passes each propose `(name, value, category)`
//! candidates:
//!
//! 1. literal assignments (`atr_mult = 1.5`, `self.gap_min = 2`)
//! 2. config blocks (class-body fields, dict literals)
//! 3. uppercase API/date constants (`BASE_URL = "..."`)
//! 4. named comparison thresholds (`atr_mult >= 1.5`), including those
//!    written inside string literals such as pattern-list logic
//!
//! Results are merged by pass priority, then low-information technical
//! parameters are suppressed when real trading filters exist. Every
//! surfaced name is checked against the tokens of the analysed text, so
//! nothing outside this source can appear in its signature.

use indexmap::IndexMap;
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::debug;

use super::lexer::{self, bracket_body, split_top_level, unquote, LogicalLine};
use crate::config::ExtractionConfig;
use crate::types::{
    ExtractionPass, ParamCategory, ParamValue, ParameterEntry, ParameterSignature,
    PatternClassification, PatternKind, ScannerSource,
};

// ---------------------------------------------------------------------------
// Lexicon
// ---------------------------------------------------------------------------

const API_WORDS: &[&str] = &["api_key", "apikey", "base_url", "url", "endpoint", "token", "date", "host"];
/// Plumbing knobs that look numeric but never change detection logic.
const PLUMBING_WORDS: &[&str] = &["worker", "timeout", "retries", "retry", "concurrency", "concurrent", "batch", "sleep", "delay", "chunk", "cache"];
const STRONG_TECHNICAL_WORDS: &[&str] = &["rolling", "window", "span", "ema", "sma", "period"];
const TRADING_WORDS: &[&str] = &[
    "threshold", "thresh", "min", "max", "filter", "cutoff", "limit", "mult", "pct", "percent",
    "ratio", "gap", "price", "volume", "atr", "score", "dollar", "change",
];
const WEAK_TECHNICAL_WORDS: &[&str] = &["lookback", "rsi", "macd", "std", "alpha", "fast", "slow", "signal", "smoothing", "length"];
const SECRET_WORDS: &[&str] = &["key", "apikey", "secret", "token", "password", "passwd"];

/// Loop counters and bookkeeping names that are never parameters.
const IGNORED_NAMES: &[&str] = &[
    "i", "j", "k", "n", "m", "x", "y", "z", "idx", "index", "count", "total", "row", "col", "df",
    "data", "result", "results", "tmp", "attempt", "attempts", "page", "status", "status_code",
    "verbose", "debug", "self", "cls",
];

/// Lowercase words of an identifier, split on `_` and camelCase humps,
/// with trailing digits dropped (`emaFast20` → `ema`, `fast`).
fn name_words(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in name.chars() {
        if !ch.is_alphanumeric() {
            words.push(std::mem::take(&mut current));
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    words.push(current);
    words
        .into_iter()
        .map(|w| w.trim_end_matches(|c: char| c.is_ascii_digit()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// `word` matches one identifier word, or a run of them when it contains
/// `_`. A plural `s`/`es` on the last word is accepted.
fn has_word(words: &[String], word: &str) -> bool {
    let parts: Vec<&str> = word.split('_').collect();
    let last = parts.len() - 1;
    words.windows(parts.len()).any(|run| {
        run.iter().zip(&parts).enumerate().all(|(i, (w, p))| {
            w == p
                || (i == last
                    && w.strip_prefix(p).is_some_and(|rest| rest == "s" || rest == "es"))
        })
    })
}

/// Keyword-match a parameter name into a category, word by word.
pub fn categorize(name: &str) -> ParamCategory {
    let words = name_words(name);
    let has = |lexicon: &[&str]| lexicon.iter().any(|w| has_word(&words, w));
    if has(API_WORDS) {
        ParamCategory::ApiConstant
    } else if has(PLUMBING_WORDS) {
        ParamCategory::Other
    } else if has(STRONG_TECHNICAL_WORDS) {
        ParamCategory::TechnicalIndicator
    } else if has(TRADING_WORDS) {
        ParamCategory::TradingFilter
    } else if has(WEAK_TECHNICAL_WORDS) {
        ParamCategory::TechnicalIndicator
    } else {
        ParamCategory::Other
    }
}

fn is_secret_name(name: &str) -> bool {
    let words = name_words(name);
    SECRET_WORDS.iter().any(|w| has_word(&words, w))
}

fn is_ignored(name: &str) -> bool {
    IGNORED_NAMES.contains(&name) || name.starts_with("__")
}

/// Parse a Python numeric literal (`20`, `-1.5`, `1_000_000`, `1e6`).
pub fn parse_number(text: &str) -> Option<Decimal> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[-+]?(?:\d[\d_]*\.?\d*|\.\d+)(?:[eE][-+]?\d+)?$").expect("valid number regex")
    });
    let t = text.trim();
    if !re.is_match(t) {
        return None;
    }
    let cleaned: String = t.chars().filter(|c| *c != '_').collect();
    let cleaned = cleaned.strip_prefix('+').unwrap_or(&cleaned).to_string();
    if cleaned.contains(['e', 'E']) {
        Decimal::from_scientific(&cleaned).ok()
    } else {
        Decimal::from_str(cleaned.trim_end_matches('.')).ok()
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    value: ParamValue,
    line: usize,
    pass: ExtractionPass,
}

impl ExtractionPass {
    pub fn confidence(&self) -> f64 {
        match self {
            ExtractionPass::LiteralAssignment => 0.95,
            ExtractionPass::ConfigBlock => 0.9,
            ExtractionPass::ApiConstant => 0.85,
            ExtractionPass::ComparisonThreshold => 0.7,
        }
    }
}

fn assign_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:self\.)?([A-Za-z_]\w*)\s*(?::\s*[A-Za-z_][\w\.\[\], ]*)?\s*=\s*(.+)$")
            .expect("valid assignment regex")
    })
}

fn tuple_assign_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_]\w*(?:\s*,\s*[A-Za-z_]\w*)+)\s*=\s*(.+)$").expect("valid tuple regex")
    })
}

fn comparison_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?:[A-Za-z_]\w*\s*\[\s*['"](\w+)['"]\s*\]|(?:[A-Za-z_]\w*\.)*([A-Za-z_]\w*))\s*(?:>=|<=|>|<)\s*(-?\s*(?:\d[\d_]*\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)"#,
        )
        .expect("valid comparison regex")
    })
}

fn reverse_comparison_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?:^|[^\w\.\]\)])(-?(?:\d[\d_]*\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*(?:>=|<=|>|<)\s*(?:[A-Za-z_]\w*\s*\[\s*['"](\w+)['"]\s*\]|(?:[A-Za-z_]\w*\.)*([A-Za-z_]\w*))"#,
        )
        .expect("valid reverse comparison regex")
    })
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ParameterExtractor {
    config: ExtractionConfig,
}

impl Default for ParameterExtractor {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}

impl ParameterExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    /// Extract the configurable parameters of `source`.
    pub fn extract(&self, source: &ScannerSource, classification: &PatternClassification) -> ParameterSignature {
        self.extract_text(source.text(), classification.pattern_kind)
    }

    /// Extract from raw text. Used directly for decomposed units, which are
    /// analysed independently of their parent.
    pub fn extract_text(&self, text: &str, kind: PatternKind) -> ParameterSignature {
        let scan = lexer::scan(text);
        let lines = &scan.lines;

        // A main-guard block only runs when the file is executed as a
        // script, so its literals are not configuration of the scanner.
        let guard = if kind == PatternKind::StandaloneScript {
            None
        } else {
            lexer::main_guard(lines)
        };
        let class_body = class_body_lines(lines);

        let mut plain = Vec::new();
        let mut config_block = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if guard.as_ref().is_some_and(|g| g.contains(&idx)) {
                continue;
            }
            let target = if class_body.contains(&idx) { &mut config_block } else { &mut plain };
            target.extend(split_top_level(&line.text, ';').into_iter().map(|s| (s, line.number)));
        }

        let mut candidates = Vec::new();
        candidates.extend(literal_assignments(&plain));
        candidates.extend(config_blocks(&plain, &config_block));
        candidates.extend(api_constants(&plain));
        candidates.extend(comparison_thresholds(&plain, &config_block));

        let grounded = grounding_tokens(text);
        let total_candidates = candidates.len();
        let merged = merge(candidates, &grounded);
        let parameters = self.finalize(merged, kind);

        debug!(
            candidates = total_candidates,
            surfaced = parameters.len(),
            kind = %kind,
            "Parameters extracted"
        );
        ParameterSignature::new(parameters)
    }

    /// Apply categorisation, suppression, redaction and confidence scaling.
    fn finalize(&self, merged: Vec<Candidate>, kind: PatternKind) -> IndexMap<String, ParameterEntry> {
        let scale = if kind == PatternKind::Unknown { 0.8 } else { 1.0 };
        let categorized: Vec<(Candidate, ParamCategory)> = merged
            .into_iter()
            .map(|c| {
                let category = categorize(&c.name);
                (c, category)
            })
            .collect();

        let has_trading_filter = categorized
            .iter()
            .any(|(_, cat)| *cat == ParamCategory::TradingFilter);
        let suppress = has_trading_filter && self.config.suppress_low_information;

        let mut out = IndexMap::new();
        let mut suppressed = Vec::new();
        for (candidate, category) in categorized {
            if suppress && category == ParamCategory::TechnicalIndicator && self.is_low_information(&candidate.name) {
                suppressed.push(candidate.name);
                continue;
            }
            let value = match candidate.value {
                ParamValue::Text(_) if is_secret_name(&candidate.name) => ParamValue::Text(ParamValue::REDACTED.to_string()),
                other => other,
            };
            out.insert(
                candidate.name,
                ParameterEntry {
                    value,
                    category,
                    confidence: candidate.pass.confidence() * scale,
                    line: candidate.line,
                    pass: candidate.pass,
                },
            );
        }

        if !suppressed.is_empty() {
            debug!(suppressed = ?suppressed, "Low-information technical parameters suppressed");
        }
        out
    }

    fn is_low_information(&self, name: &str) -> bool {
        let n = name.to_lowercase();
        self.config
            .low_information_patterns
            .iter()
            .any(|p| n.contains(&p.to_lowercase()))
    }
}

/// Pick one candidate per name by pass priority, keep names only if they
/// occur in the analysed text, and order by first appearance in source.
fn merge(candidates: Vec<Candidate>, grounded: &HashSet<String>) -> Vec<Candidate> {
    let mut first_line: HashMap<String, usize> = HashMap::new();
    let mut winners: IndexMap<String, Candidate> = IndexMap::new();

    for c in candidates {
        if is_ignored(&c.name) || !grounded.contains(&c.name) {
            continue;
        }
        first_line
            .entry(c.name.clone())
            .and_modify(|l| *l = (*l).min(c.line))
            .or_insert(c.line);
        let replace = winners
            .get(&c.name)
            .map_or(true, |existing| c.pass < existing.pass);
        if replace {
            winners.insert(c.name.clone(), c);
        }
    }

    let mut ordered: Vec<(usize, usize, Candidate)> = winners
        .into_values()
        .enumerate()
        .map(|(seen, c)| (first_line.get(&c.name).copied().unwrap_or(c.line), seen, c))
        .collect();
    ordered.sort_by_key(|(line, seen, _)| (*line, *seen));
    ordered.into_iter().map(|(_, _, c)| c).collect()
}

/// Identifiers and identifier-like string contents of `text`.
fn grounding_tokens(text: &str) -> HashSet<String> {
    let mut tokens: HashSet<String> = lexer::identifiers(text).into_iter().collect();
    for lit in lexer::string_literals(text) {
        tokens.extend(lexer::identifiers(&lit));
    }
    tokens
}

/// Logical-line indices that sit directly in a class body (not in methods).
fn class_body_lines(lines: &[LogicalLine]) -> HashSet<usize> {
    let mut out = HashSet::new();
    for (idx, line) in lines.iter().enumerate() {
        if !line.text.starts_with("class ") || !line.text.ends_with(':') {
            continue;
        }
        let end = lexer::block_end(lines, idx);
        let Some(body_indent) = lines.get(idx + 1).filter(|_| idx + 1 < end).map(|l| l.indent) else {
            continue;
        };
        out.extend((idx + 1..end).filter(|i| lines[*i].indent == body_indent && !lines[*i].text.starts_with("def ")));
    }
    out
}

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

fn literal_assignments(stmts: &[(String, usize)]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (text, line) in stmts {
        if let Some(caps) = tuple_assign_regex().captures(text) {
            let names: Vec<&str> = caps[1].split(',').map(str::trim).collect();
            let values = split_top_level(caps[2].trim().trim_start_matches('(').trim_end_matches(')'), ',');
            if names.len() == values.len() {
                for (name, value) in names.iter().zip(values.iter()) {
                    if let Some(d) = parse_number(value) {
                        out.push(Candidate {
                            name: name.to_string(),
                            value: ParamValue::Number(d),
                            line: *line,
                            pass: ExtractionPass::LiteralAssignment,
                        });
                    }
                }
            }
            continue;
        }
        let Some(caps) = assign_regex().captures(text) else {
            continue;
        };
        if let Some(d) = parse_number(&caps[2]) {
            out.push(Candidate {
                name: caps[1].to_string(),
                value: ParamValue::Number(d),
                line: *line,
                pass: ExtractionPass::LiteralAssignment,
            });
        }
    }
    out
}

fn config_blocks(plain: &[(String, usize)], class_body: &[(String, usize)]) -> Vec<Candidate> {
    let mut out = Vec::new();

    for (text, line) in class_body {
        let Some(caps) = assign_regex().captures(text) else {
            continue;
        };
        if let Some(d) = parse_number(&caps[2]) {
            out.push(Candidate {
                name: caps[1].to_string(),
                value: ParamValue::Number(d),
                line: *line,
                pass: ExtractionPass::ConfigBlock,
            });
        } else {
            dict_literal_entries(caps[2].trim(), *line, &mut out);
        }
    }

    for (text, line) in plain {
        if let Some(caps) = assign_regex().captures(text) {
            dict_literal_entries(caps[2].trim(), *line, &mut out);
        }
    }
    out
}

/// Numeric fields of `{"k": 1}` or `dict(k=1)`, recursing into nested dicts.
fn dict_literal_entries(rhs: &str, line: usize, out: &mut Vec<Candidate>) {
    let (body, sep) = if rhs.starts_with('{') {
        match bracket_body(rhs, 0) {
            Some((s, e)) => (&rhs[s..e], ':'),
            None => return,
        }
    } else if rhs.starts_with("dict(") {
        match bracket_body(rhs, 4) {
            Some((s, e)) => (&rhs[s..e], '='),
            None => return,
        }
    } else {
        return;
    };

    for pair in split_top_level(body, ',') {
        let parts = split_top_level(&pair, sep);
        if parts.len() != 2 {
            continue;
        }
        let key = if sep == ':' {
            let k = parts[0].trim();
            if !(k.starts_with('\'') || k.starts_with('"')) {
                continue;
            }
            unquote(k)
        } else {
            parts[0].trim().to_string()
        };
        if !is_identifier(&key) {
            continue;
        }
        let value = parts[1].trim();
        if let Some(d) = parse_number(value) {
            out.push(Candidate {
                name: key,
                value: ParamValue::Number(d),
                line,
                pass: ExtractionPass::ConfigBlock,
            });
        } else if value.starts_with('{') || value.starts_with("dict(") {
            dict_literal_entries(value, line, out);
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn api_constants(stmts: &[(String, usize)]) -> Vec<Candidate> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^([A-Z][A-Z0-9_]*)\s*(?::\s*\w+)?\s*=\s*(.+)$").expect("valid constant regex")
    });

    let mut out = Vec::new();
    for (text, line) in stmts {
        let Some(caps) = re.captures(text) else {
            continue;
        };
        let name = caps[1].to_string();
        let words = name_words(&name);
        if !API_WORDS.iter().chain(SECRET_WORDS).any(|w| has_word(&words, w)) {
            continue;
        }
        let rhs = caps[2].trim();
        let value = if let Some(d) = parse_number(rhs) {
            ParamValue::Number(d)
        } else if is_plain_string_literal(rhs) {
            ParamValue::Text(unquote(rhs))
        } else {
            continue;
        };
        out.push(Candidate {
            name,
            value,
            line: *line,
            pass: ExtractionPass::ApiConstant,
        });
    }
    out
}

/// A single quoted literal with no prefix (f-strings are not constants).
fn is_plain_string_literal(rhs: &str) -> bool {
    let Some(q) = rhs.chars().next().filter(|c| *c == '\'' || *c == '"') else {
        return false;
    };
    rhs.len() >= 2 && rhs.ends_with(q) && lexer::string_literals(rhs).len() == 1
}

fn comparison_thresholds(plain: &[(String, usize)], class_body: &[(String, usize)]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (text, line) in plain.iter().chain(class_body) {
        for caps in comparison_regex().captures_iter(text) {
            let Some(name) = caps.get(1).or_else(|| caps.get(2)) else {
                continue;
            };
            let raw: String = caps[3].chars().filter(|c| !c.is_whitespace()).collect();
            if let Some(d) = parse_number(&raw) {
                out.push(Candidate {
                    name: name.as_str().to_string(),
                    value: ParamValue::Number(d),
                    line: *line,
                    pass: ExtractionPass::ComparisonThreshold,
                });
            }
        }
        for caps in reverse_comparison_regex().captures_iter(text) {
            let Some(name) = caps.get(2).or_else(|| caps.get(3)) else {
                continue;
            };
            if let Some(d) = parse_number(&caps[1]) {
                out.push(Candidate {
                    name: name.as_str().to_string(),
                    value: ParamValue::Number(d),
                    line: *line,
                    pass: ExtractionPass::ComparisonThreshold,
                });
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
