//! Source classifier.
//!
//! Determines the structural shape of a scanner source from independently
//! checked indicators (run-on-import triggers, entry points, pattern
//! definitions, size) and a fixed priority of decision rules. Never fails:
//! anything it cannot place is `Unknown`.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

use super::lexer::{self, FunctionDef, LogicalLine};
use super::patterns::{find_pattern_definitions, find_pattern_list, parse_boolean_assignment};
use crate::config::ClassifierConfig;
use crate::types::{EntryPoint, PatternClassification, PatternKind, ScannerSource, UNKNOWN_CONFIDENCE};

// ---------------------------------------------------------------------------
// Structural signals
// ---------------------------------------------------------------------------

/// Independently checked indicators, before any decision is made.
#[derive(Debug, Clone, Default)]
pub struct StructuralSignals {
    pub main_guard: bool,
    /// Unguarded module-level statements that execute scanner code.
    pub top_level_triggers: Vec<String>,
    pub entry_point: Option<EntryPoint>,
    /// Async functions with a `(start, end)`-shaped signature.
    pub async_date_entries: Vec<String>,
    /// Distinct pattern names from the explicit list or boolean assignments.
    pub pattern_names: Vec<String>,
    pub pattern_list_entries: usize,
    pub boolean_assignments: usize,
    pub function_count: usize,
    pub byte_len: usize,
}

impl StructuralSignals {
    pub fn run_on_import(&self) -> bool {
        self.main_guard || !self.top_level_triggers.is_empty()
    }

    /// Each boolean pattern assignment counts once; an explicit list with
    /// several entries counts double.
    pub fn weighted_count(&self) -> u32 {
        let list_weight = match self.pattern_list_entries {
            0 => 0,
            1 => 1,
            _ => 2,
        };
        list_weight + self.boolean_assignments as u32
    }

    pub fn pattern_definitions(&self) -> usize {
        self.pattern_names.len()
    }

    fn audit(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.main_guard {
            out.push("main_guard".to_string());
        }
        for t in &self.top_level_triggers {
            out.push(format!("top_level_trigger:{t}"));
        }
        if let Some(ep) = &self.entry_point {
            out.push(format!(
                "entry_point:{}{}",
                ep.name,
                if ep.takes_date_range { "(start, end)" } else { "()" }
            ));
        }
        for name in &self.async_date_entries {
            out.push(format!("async_date_entry:{name}"));
        }
        if self.pattern_list_entries > 0 {
            out.push(format!("pattern_list:{}", self.pattern_list_entries));
        }
        if self.boolean_assignments > 0 {
            out.push(format!("boolean_assignments:{}", self.boolean_assignments));
        }
        out.push(format!("weighted_signals:{}", self.weighted_count()));
        out.push(format!("bytes:{}", self.byte_len));
        out
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

fn is_start_name(name: &str) -> bool {
    let n = name.to_lowercase();
    n.contains("start") || n.contains("from") || n.contains("begin")
}

fn is_end_name(name: &str) -> bool {
    let n = name.to_lowercase();
    n.contains("end") || n.starts_with("to") || n.contains("until") || n.contains("stop")
}

/// Whether a parameter list is `(start, end, ...)`-shaped.
pub fn takes_date_range(params: &[String]) -> bool {
    params.len() >= 2 && is_start_name(&params[0]) && is_end_name(&params[1])
}

/// Find the single conventional entry point: the first configured name
/// that is defined with zero arguments or a date-range signature.
/// Module-level definitions win over methods.
pub fn discover_entry_point(
    defs: &[FunctionDef],
    lines: &[LogicalLine],
    names: &[String],
) -> Option<EntryPoint> {
    for wanted in names {
        let mut candidates: Vec<&FunctionDef> = defs
            .iter()
            .filter(|d| &d.name == wanted)
            .filter(|d| d.params.is_empty() || takes_date_range(&d.params))
            .collect();
        candidates.sort_by_key(|d| d.indent);
        if let Some(def) = candidates.first() {
            return Some(EntryPoint {
                name: def.name.clone(),
                is_async: def.is_async,
                takes_date_range: takes_date_range(&def.params),
                line: lines[def.def_index].number,
            });
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SourceClassifier {
    config: ClassifierConfig,
}

impl Default for SourceClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

impl SourceClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify a source. Rules are evaluated in priority order; a single
    /// cleanly extracted scanner must win over the coarser multi-pattern
    /// heuristic.
    pub fn classify(&self, source: &ScannerSource) -> PatternClassification {
        let scan = lexer::scan(source.text());
        if scan.lines.is_empty() {
            return PatternClassification::unknown(vec!["empty_source".to_string()]);
        }

        let signals = self.detect_signals(&scan.lines, source.byte_len());
        let mut audit = signals.audit();
        if !scan.is_clean() {
            audit.push(format!("syntax_issues:{}", scan.issues.len()));
        }

        let large = signals.byte_len > self.config.large_file_bytes;
        let weighted = signals.weighted_count();

        let (kind, confidence) = if signals.run_on_import() && signals.entry_point.is_none() {
            let confidence = if signals.function_count == 0 { 0.95 } else { 0.85 };
            (PatternKind::StandaloneScript, confidence)
        } else if signals.pattern_definitions() == 1 && !signals.run_on_import() {
            (PatternKind::SingleExtractedScanner, 0.9)
        } else if weighted >= self.config.multi_signal_threshold || large {
            let confidence = if weighted >= self.config.multi_signal_threshold {
                (0.6 + 0.1 * weighted as f64).min(0.95)
            } else {
                0.5
            };
            (PatternKind::MultiPatternAssignments, confidence)
        } else if !signals.async_date_entries.is_empty() {
            (PatternKind::AsyncEntryWithDates, 0.8)
        } else {
            (PatternKind::Unknown, UNKNOWN_CONFIDENCE)
        };

        debug!(
            kind = %kind,
            confidence,
            weighted,
            patterns = signals.pattern_definitions(),
            run_on_import = signals.run_on_import(),
            "Source classified"
        );

        PatternClassification {
            pattern_kind: kind,
            confidence,
            signals: audit,
            entry_point: signals.entry_point,
        }
    }

    /// Compute every structural indicator for a scanned source.
    pub fn detect_signals(&self, lines: &[LogicalLine], byte_len: usize) -> StructuralSignals {
        let defs = lexer::function_defs(lines);
        let guard = lexer::main_guard(lines);
        let local_functions: HashSet<&str> = defs.iter().map(|d| d.name.as_str()).collect();

        let pattern_defs = find_pattern_definitions(lines);
        let pattern_list_entries = find_pattern_list(lines).map(|l| l.entries.len()).unwrap_or(0);
        let boolean_assignments = {
            let mut cols = HashSet::new();
            for line in lines {
                if let Some((name, _)) = parse_boolean_assignment(&line.text) {
                    cols.insert(name);
                }
            }
            cols.len()
        };

        let top_level_triggers = lines
            .iter()
            .enumerate()
            .filter(|(idx, line)| {
                line.indent == 0 && guard.as_ref().map_or(true, |g| !g.contains(idx))
            })
            .filter_map(|(_, line)| trigger_name(&line.text, &local_functions))
            .collect();

        let async_date_entries = defs
            .iter()
            .filter(|d| d.is_async && takes_date_range(&d.params))
            .map(|d| d.name.clone())
            .collect();

        StructuralSignals {
            main_guard: guard.is_some(),
            top_level_triggers,
            entry_point: discover_entry_point(&defs, lines, &self.config.entry_point_names),
            async_date_entries,
            pattern_names: pattern_defs.into_iter().map(|d| d.name).collect(),
            pattern_list_entries,
            boolean_assignments,
            function_count: defs.len(),
            byte_len,
        }
    }
}

/// If a module-level statement executes scanner code on import, name the
/// callee. Bare calls (`main()`, `asyncio.run(main())`) and assignments
/// from a locally defined function (`results = scan()`) both count.
fn trigger_name(text: &str, local_functions: &HashSet<&str>) -> Option<String> {
    static CALL: OnceLock<Regex> = OnceLock::new();
    static ASSIGN_CALL: OnceLock<Regex> = OnceLock::new();
    let call = CALL.get_or_init(|| {
        Regex::new(r"^(?:await\s+)?([A-Za-z_][\w\.]*)\s*\(.*\)$").expect("valid call regex")
    });
    let assign_call = ASSIGN_CALL.get_or_init(|| {
        Regex::new(r"^[A-Za-z_]\w*(?:\s*,\s*[A-Za-z_]\w*)*\s*=\s*(?:await\s+)?([A-Za-z_][\w\.]*)\s*\(")
            .expect("valid assign regex")
    });

    const RUNNERS: &[&str] = &["asyncio.run", "loop.run_until_complete", "asyncio.get_event_loop"];
    const IGNORED: &[&str] = &["print", "warnings.filterwarnings", "logging.basicConfig", "load_dotenv", "pd.set_option"];

    if let Some(caps) = call.captures(text) {
        let callee = &caps[1];
        if IGNORED.contains(&callee) {
            return None;
        }
        if RUNNERS.iter().any(|r| callee.ends_with(r)) || local_functions.contains(callee) {
            return Some(callee.to_string());
        }
        return None;
    }
    if let Some(caps) = assign_call.captures(text) {
        let callee = &caps[1];
        if RUNNERS.iter().any(|r| callee.ends_with(r)) || local_functions.contains(callee) {
            return Some(callee.to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(src: &str) -> PatternClassification {
        SourceClassifier::default().classify(&ScannerSource::new(src))
    }

    #[test]
    fn test_empty_source_is_unknown_zero_confidence() {
        let c = classify("   \n# only a comment\n");
        assert_eq!(c.pattern_kind, PatternKind::Unknown);
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_standalone_script() {
        let src = "import pandas as pd\n\ndef fetch():\n    return 1\n\ndata = fetch()\nprint(data)\n";
        let c = classify(src);
        assert_eq!(c.pattern_kind, PatternKind::StandaloneScript);
        assert!(c.signals.iter().any(|s| s == "top_level_trigger:fetch"));
        assert!(c.entry_point.is_none());
    }

    #[test]
    fn test_guard_with_entry_point_is_not_standalone() {
        let src = "async def main(start_date, end_date):\n    return []\n\nif __name__ == '__main__':\n    asyncio.run(main('2024-01-01', '2024-02-01'))\n";
        let c = classify(src);
        assert_eq!(c.pattern_kind, PatternKind::AsyncEntryWithDates);
        let ep = c.entry_point.unwrap();
        assert_eq!(ep.name, "main");
        assert!(ep.is_async);
        assert!(ep.takes_date_range);
    }

    #[test]
    fn test_single_extracted_scanner_wins_over_multi() {
        // Large enough to trip the size heuristic, but only one pattern.
        let mut src = String::from("def run_scan(start_date, end_date):\n    df['hit'] = (df['gap_pct'] > 2).astype(int)\n    return df[df['hit'] == 1]\n");
        src.push_str(&"# padding\n".repeat(20_000));
        src.push_str("X = 1\n");
        let c = classify(&src);
        assert_eq!(c.pattern_kind, PatternKind::SingleExtractedScanner);
    }

    #[test]
    fn test_pattern_list_is_multi() {
        let c = classify(r#"self.pattern_assignments = [{"name":"p1","logic":"a>1"},{"name":"p2","logic":"a<-1"}]"#);
        assert_eq!(c.pattern_kind, PatternKind::MultiPatternAssignments);
        assert!(c.signals.iter().any(|s| s == "pattern_list:2"));
    }

    #[test]
    fn test_boolean_assignments_multi() {
        let src = "def main():\n    df['a1'] = (df['x'] > 1).astype(int)\n    df['a2'] = np.where(df['x'] < 0, 1, 0)\n    return df\n";
        let c = classify(src);
        assert_eq!(c.pattern_kind, PatternKind::MultiPatternAssignments);
        assert!(c.confidence > 0.6);
    }

    #[test]
    fn test_large_file_without_patterns_is_multi_low_confidence() {
        let mut cfg = ClassifierConfig::default();
        cfg.large_file_bytes = 10;
        let c = SourceClassifier::new(cfg).classify(&ScannerSource::new("def main():\n    return 1\n"));
        assert_eq!(c.pattern_kind, PatternKind::MultiPatternAssignments);
        assert_eq!(c.confidence, 0.5);
    }

    #[test]
    fn test_unknown_fallback() {
        let c = classify("def helper(x):\n    return x\n");
        assert_eq!(c.pattern_kind, PatternKind::Unknown);
        assert_eq!(c.confidence, UNKNOWN_CONFIDENCE);
        assert_eq!(c.confidence, classify("").confidence);
    }

    #[test]
    fn test_entry_point_priority_and_arity() {
        let src = "def run(a):\n    pass\n\ndef scan():\n    pass\n\ndef run_scan(start, end):\n    pass\n";
        let scan = lexer::scan(src);
        let defs = lexer::function_defs(&scan.lines);
        let ep = discover_entry_point(&defs, &scan.lines, &ClassifierConfig::default().entry_point_names).unwrap();
        // `run(a)` has the wrong arity and `run_scan` outranks `scan`.
        assert_eq!(ep.name, "run_scan");
        assert!(ep.takes_date_range);
        assert_eq!(ep.line, 7);
    }

    #[test]
    fn test_print_is_not_a_trigger() {
        let locals = HashSet::new();
        assert!(trigger_name("print('hello')", &locals).is_none());
        assert_eq!(trigger_name("asyncio.run(main())", &locals).as_deref(), Some("asyncio.run"));
    }
}
