//! Classification, extraction and decomposition through the public API.

use rust_decimal_macros::dec;
use std::collections::HashSet;

use scanlab::analysis::lexer;
use scanlab::analysis::{ParameterExtractor, PatternDecomposer, SourceClassifier};
use scanlab::runtime::compile::{compile, CompileOptions};
use scanlab::types::{Decomposition, ParameterSignature, PatternKind, ScannerSource};

const PATTERN_LIST: &str = r#"self.pattern_assignments = [{"name":"p1","logic":"a>1"},{"name":"p2","logic":"a<-1"}]"#;

const THREE_PATTERNS: &str = r#"
import numpy as np

GAP_MIN = 8
VOL_FLOOR = 500_000

def liquid(df):
    return df['volume'] > VOL_FLOOR

async def run_scan(start_date, end_date):
    df = await fetch_grouped_daily(start_date, end_date)
    df['gap_up'] = ((df['gap_pct'] > GAP_MIN) & liquid(df)).astype(int)
    df['gap_down'] = (df['gap_pct'] < -GAP_MIN).astype(int)
    df['wide_range'] = np.where(df['range_pct'] > 15, 1, 0)
    return df[(df['gap_up'] == 1) | (df['gap_down'] == 1) | (df['wide_range'] == 1)]
"#;

fn analyse(src: &str) -> (PatternKind, ParameterSignature, Decomposition) {
    let source = ScannerSource::new(src);
    let classification = SourceClassifier::default().classify(&source);
    let params = ParameterExtractor::default().extract(&source, &classification);
    let decomposition = PatternDecomposer::default().decompose(&source, &classification);
    (classification.pattern_kind, params, decomposition)
}

// ---------------------------------------------------------------------------
// Decomposition
// ---------------------------------------------------------------------------

#[test]
fn test_pattern_list_decomposes_into_two_compiling_units() {
    let (kind, _, d) = analyse(PATTERN_LIST);
    assert_eq!(kind, PatternKind::MultiPatternAssignments);
    assert!(d.failures.is_empty(), "{:?}", d.failures);
    let names: Vec<&str> = d.units.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["p1", "p2"]);

    for (unit, own, other) in [(&d.units[0], "a>1", "a<-1"), (&d.units[1], "a<-1", "a>1")] {
        assert!(unit.standalone_source.contains(own));
        assert!(!unit.standalone_source.contains(other));
        assert!(compile(&unit.standalone_source, &CompileOptions::default()).is_ok());
    }
}

#[test]
fn test_n_patterns_yield_n_units_without_leakage() {
    let (kind, _, d) = analyse(THREE_PATTERNS);
    assert_eq!(kind, PatternKind::MultiPatternAssignments);
    assert!(d.failures.is_empty(), "{:?}", d.failures);
    assert_eq!(d.units.len(), 3);

    for unit in &d.units {
        for other in d.units.iter().filter(|o| o.name != unit.name) {
            let defining = format!("df['{}'] =", other.name);
            assert!(
                !unit.standalone_source.contains(&defining),
                "unit {} leaks {}",
                unit.name,
                other.name
            );
        }
    }

    let gap_up = d.units.iter().find(|u| u.name == "gap_up").unwrap();
    assert!(gap_up.standalone_source.contains("def liquid(df):"));
    assert!(gap_up.parameters.get("VOL_FLOOR").is_some());
    let wide = d.units.iter().find(|u| u.name == "wide_range").unwrap();
    assert!(!wide.standalone_source.contains("def liquid(df):"));
}

#[test]
fn test_failed_units_are_reported_not_fatal() {
    let src = "def main():\n    df['ok'] = (df['gap_pct'] > 2).astype(int)\n    df['bad'] = (df['close'].rolling(5).mean() > 1).astype(int)\n    return df\n";
    let (_, _, d) = analyse(src);
    assert_eq!(d.pattern_count(), 2);
    assert_eq!(d.units.len(), 1);
    assert_eq!(d.failures[0].name, "bad");
    assert!(!d.failures[0].reason.is_empty());
}

#[test]
fn test_single_scanner_is_not_decomposed() {
    let src = "async def main(start_date, end_date):\n    df = await fetch(start_date, end_date)\n    df['gap_up'] = (df['gap_pct'] > 8).astype(int)\n    return df[df['gap_up'] == 1]\n";
    let (kind, _, d) = analyse(src);
    assert_eq!(kind, PatternKind::SingleExtractedScanner);
    assert_eq!(d.pattern_count(), 0);
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[test]
fn test_low_information_only_source_keeps_full_set() {
    let (_, sig, _) = analyse("rolling_window = 20; ema_span = 9\n");
    assert_eq!(sig.names(), vec!["rolling_window", "ema_span"]);
    assert_eq!(sig.get("rolling_window").unwrap().value.as_number(), Some(dec!(20)));
    assert_eq!(sig.get("ema_span").unwrap().value.as_number(), Some(dec!(9)));
}

#[test]
fn test_trading_filter_hides_low_information() {
    let (_, sig, _) = analyse("rolling_window = 20\nif atr_mult >= 1.5:\n    pass\n");
    assert_eq!(sig.names(), vec!["atr_mult"]);
    assert_eq!(sig.get("atr_mult").unwrap().value.as_number(), Some(dec!(1.5)));
}

#[test]
fn test_extraction_is_idempotent_and_grounded() {
    for src in [PATTERN_LIST, THREE_PATTERNS, "rolling_window = 20; ema_span = 9\n"] {
        let (_, first, _) = analyse(src);
        let (_, second, _) = analyse(src);
        assert_eq!(first.parameter_hash, second.parameter_hash);

        // Names may come from logic strings, so check the raw text too.
        let ids: HashSet<String> = lexer::identifiers(src).into_iter().collect();
        for name in first.names() {
            assert!(ids.contains(name) || src.contains(name), "{name} does not occur in source");
        }
    }
}

#[test]
fn test_unit_signatures_are_independent_of_siblings() {
    let (_, _, d) = analyse(THREE_PATTERNS);
    let gap_down = d.units.iter().find(|u| u.name == "gap_down").unwrap();
    assert!(gap_down.parameters.get("VOL_FLOOR").is_none());
    let wide = d.units.iter().find(|u| u.name == "wide_range").unwrap();
    assert!(wide.parameters.get("GAP_MIN").is_none());
}
