//! Pattern decomposer.
//!
//! Splits a multi-pattern source into one standalone unit per pattern.
//! Each unit carries the original imports, the constants and helper
//! functions its logic reaches (transitively), the derived columns it
//! reads, and a `detect` step that selects only its own pattern column.
//!
//! Units are checked for leakage (no other pattern's definition may
//! survive in the text) and compiled; a unit that fails either check is
//! reported as a failure without stopping the others.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::lexer::{self, FunctionDef, LogicalLine};
use super::params::{categorize, ParameterExtractor};
use super::patterns::{find_pattern_definitions, find_pattern_list, is_column_assignment, parse_boolean_assignment, split_assignment, PatternDef, PatternOrigin};
use crate::runtime::compile::{compile, CompileOptions};
use crate::runtime::expr::{self, Expr};
use crate::types::{Decomposition, ParamCategory, PatternClassification, PatternKind, PatternUnit, ScannerSource, UnitFailure};

/// A top-level-like literal assignment that a unit may need.
#[derive(Debug, Clone)]
struct ConstantDef {
    name: String,
    text: String,
    rhs: String,
}

/// A non-pattern column assignment.
#[derive(Debug, Clone)]
struct DerivedDef {
    name: String,
    text: String,
    rhs: String,
}

/// Everything a unit can draw from, collected once per source.
struct SourceParts<'a> {
    text: &'a str,
    lines: Vec<LogicalLine>,
    imports: Vec<String>,
    constants: Vec<ConstantDef>,
    derived: Vec<DerivedDef>,
    helpers: Vec<FunctionDef>,
    patterns: Vec<PatternDef>,
}

pub struct PatternDecomposer {
    extractor: ParameterExtractor,
    options: CompileOptions,
}

impl Default for PatternDecomposer {
    fn default() -> Self {
        Self::new(ParameterExtractor::default(), CompileOptions::default())
    }
}

impl PatternDecomposer {
    pub fn new(extractor: ParameterExtractor, options: CompileOptions) -> Self {
        Self { extractor, options }
    }

    /// Split `source` into per-pattern units. Non-multi-pattern sources
    /// yield an empty decomposition.
    pub fn decompose(&self, source: &ScannerSource, classification: &PatternClassification) -> Decomposition {
        if classification.pattern_kind != PatternKind::MultiPatternAssignments {
            return Decomposition::default();
        }

        let parts = self.collect_parts(source.text());
        let mut out = Decomposition::default();

        for pattern in &parts.patterns {
            match self.build_unit(&parts, pattern) {
                Ok(unit) => {
                    debug!(unit = %unit.name, params = unit.parameters.len(), "Unit ready");
                    out.units.push(unit);
                }
                Err(reason) => {
                    warn!(unit = %pattern.name, reason = %reason, "Unit failed");
                    out.failures.push(UnitFailure {
                        name: pattern.name.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            patterns = parts.patterns.len(),
            units = out.units.len(),
            failures = out.failures.len(),
            "Decomposition complete"
        );
        out
    }

    fn collect_parts<'a>(&self, text: &'a str) -> SourceParts<'a> {
        let scan = lexer::scan(text);
        let lines = scan.lines;
        let guard = lexer::main_guard(&lines);
        let active = |idx: usize| guard.as_ref().map_or(true, |g| !g.contains(&idx));
        let patterns = find_pattern_definitions(&lines);
        let pattern_names: HashSet<&str> = patterns.iter().map(|p| p.name.as_str()).collect();
        let list_line = find_pattern_list(&lines).map(|l| l.line_index);

        let imports = lines
            .iter()
            .enumerate()
            .filter(|(idx, l)| active(*idx) && l.indent == 0)
            .filter(|(_, l)| l.text.starts_with("import ") || l.text.starts_with("from "))
            .map(|(_, l)| l.text.clone())
            .collect();

        let mut constants = Vec::new();
        let mut derived = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if !active(idx) || Some(idx) == list_line {
                continue;
            }
            for stmt in lexer::split_top_level(&line.text, ';') {
                if parse_boolean_assignment(&stmt).is_some() {
                    continue;
                }
                let Some((name, rhs)) = split_assignment(&stmt) else {
                    continue;
                };
                if is_column_assignment(&stmt) {
                    if !pattern_names.contains(name.as_str()) {
                        derived.push(DerivedDef { name, text: stmt.clone(), rhs });
                    }
                } else if is_constant_rhs(&rhs) {
                    constants.push(ConstantDef {
                        text: format!("{name} = {rhs}"),
                        name,
                        rhs,
                    });
                }
            }
        }

        let entry_names: HashSet<&str> = self.options.entry_point_names.iter().map(String::as_str).collect();
        let helpers = lexer::function_defs(&lines)
            .into_iter()
            .filter(|d| active(d.def_index))
            .filter(|d| !entry_names.contains(d.name.as_str()) && !d.name.starts_with("__"))
            .filter(|d| {
                // Pipeline functions that assign columns are not helpers;
                // their assignments are picked up statement by statement.
                !d.body_lines(&lines).iter().any(|l| is_column_assignment(&l.text))
            })
            .collect();

        SourceParts {
            text,
            lines,
            imports,
            constants,
            derived,
            helpers,
            patterns,
        }
    }

    fn build_unit(&self, parts: &SourceParts<'_>, pattern: &PatternDef) -> Result<PatternUnit, String> {
        let unit_text = assemble(parts, pattern);

        check_leakage(&unit_text, pattern, &parts.patterns)?;
        compile(&unit_text, &self.options).map_err(|e| e.to_string())?;

        let parameters = self
            .extractor
            .extract_text(&unit_text, PatternKind::SingleExtractedScanner);
        Ok(PatternUnit {
            name: pattern.name.clone(),
            logic_expression: pattern.logic.clone(),
            standalone_source: unit_text,
            parameters,
        })
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Names referenced by `text`: identifiers plus identifier-like string
/// contents (column subscripts such as `df['gap']`).
fn references(text: &str) -> HashSet<String> {
    let mut out: HashSet<String> = lexer::identifiers(text).into_iter().collect();
    for literal in lexer::string_literals(text) {
        if lexer::identifiers(&literal) == [literal.clone()] {
            out.insert(literal);
        }
    }
    out
}

/// True when an assignment's right side is a literal value (possibly built
/// from other constants), not a row computation or a call.
fn is_constant_rhs(rhs: &str) -> bool {
    if rhs.starts_with('{') || rhs.starts_with("dict(") {
        return true;
    }
    match expr::parse(rhs) {
        Ok(e) => is_literal_expr(&e),
        Err(_) => false,
    }
}

fn is_literal_expr(e: &Expr) -> bool {
    match e {
        Expr::Literal(_) | Expr::Name(_) => true,
        Expr::Unary(_, inner) => is_literal_expr(inner),
        Expr::Binary(_, l, r) => is_literal_expr(l) && is_literal_expr(r),
        Expr::Compare(first, rest) => is_literal_expr(first) && rest.iter().all(|(_, e)| is_literal_expr(e)),
        Expr::Column(_) | Expr::Call(..) | Expr::Method(..) => false,
    }
}

fn py_string(s: &str) -> String {
    if !s.contains('"') {
        format!("\"{}\"", s.replace('\\', "\\\\"))
    } else if !s.contains('\'') {
        format!("'{}'", s.replace('\\', "\\\\"))
    } else {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

fn render_logic(pattern: &PatternDef) -> String {
    match pattern.origin {
        PatternOrigin::Assignment => pattern.logic.clone(),
        PatternOrigin::ListEntry => format!("df.eval({})", py_string(&pattern.logic)),
    }
}

/// Build the standalone text of one unit.
fn assemble(parts: &SourceParts<'_>, pattern: &PatternDef) -> String {
    let logic = render_logic(pattern);
    let mut refs = references(&logic);
    let mut helper_used = vec![false; parts.helpers.len()];
    let mut derived_used = vec![false; parts.derived.len()];
    let mut constant_used = vec![false; parts.constants.len()];
    let mut pattern_used = vec![false; parts.patterns.len()];

    // Transitive closure over helpers, derived columns, constants and any
    // other pattern column the logic reads.
    loop {
        let mut changed = false;
        for (i, other) in parts.patterns.iter().enumerate() {
            if !pattern_used[i] && other.name != pattern.name && refs.contains(&other.name) {
                pattern_used[i] = true;
                refs.extend(references(&render_logic(other)));
                changed = true;
            }
        }
        for (i, helper) in parts.helpers.iter().enumerate() {
            if !helper_used[i] && refs.contains(&helper.name) {
                helper_used[i] = true;
                refs.extend(references(&parts.text[helper.span.clone()]));
                changed = true;
            }
        }
        for (i, d) in parts.derived.iter().enumerate() {
            if !derived_used[i] && refs.contains(&d.name) {
                derived_used[i] = true;
                refs.extend(references(&d.rhs));
                changed = true;
            }
        }
        for (i, c) in parts.constants.iter().enumerate() {
            if !constant_used[i] && refs.contains(&c.name) {
                constant_used[i] = true;
                refs.extend(references(&c.rhs));
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let is_api_constant = |c: &ConstantDef| {
        c.name.chars().all(|ch| !ch.is_lowercase()) && categorize(&c.name) == ParamCategory::ApiConstant
    };

    let mut sections = vec![format!("# Pattern unit: {}", pattern.name)];
    if !parts.imports.is_empty() {
        sections.push(parts.imports.join("\n"));
    }

    let mut seen = HashSet::new();
    let constants: Vec<&str> = parts
        .constants
        .iter()
        .enumerate()
        .filter(|(i, c)| constant_used[*i] || is_api_constant(c))
        .map(|(_, c)| c.text.as_str())
        .filter(|t| seen.insert(*t))
        .collect();
    if !constants.is_empty() {
        sections.push(constants.join("\n"));
    }

    for (i, helper) in parts.helpers.iter().enumerate() {
        if helper_used[i] {
            sections.push(lexer::dedent(&parts.text[helper.span.clone()]).trim_end().to_string());
        }
    }

    let mut features = String::from("def compute_features(df):\n");
    for (i, d) in parts.derived.iter().enumerate() {
        if derived_used[i] {
            features.push_str(&format!("    {}\n", d.text));
        }
    }
    for (i, other) in parts.patterns.iter().enumerate() {
        if pattern_used[i] {
            features.push_str(&format!(
                "    df['{}'] = ({}).astype(int)\n",
                other.name,
                render_logic(other)
            ));
        }
    }
    features.push_str("    return df");
    sections.push(features);

    sections.push(format!(
        "def detect(df):\n    df['{name}'] = ({logic}).astype(int)\n    return df[df['{name}'] == 1]",
        name = pattern.name,
    ));
    sections.push(
        "async def run_scan(start_date, end_date):\n    df = compute_features(await fetch_grouped_daily(start_date, end_date))\n    return detect(df)"
            .to_string(),
    );

    let mut text = sections.join("\n\n");
    text.push('\n');
    text
}

/// No other pattern's definition may appear in a unit.
fn check_leakage(unit_text: &str, pattern: &PatternDef, all: &[PatternDef]) -> Result<(), String> {
    let scan = lexer::scan(unit_text);
    let defined: Vec<String> = find_pattern_definitions(&scan.lines)
        .into_iter()
        .map(|d| d.name)
        .collect();
    if defined != [pattern.name.clone()] {
        let others: Vec<&str> = defined.iter().map(String::as_str).filter(|n| *n != pattern.name).collect();
        return Err(format!("pattern leakage: unit also defines {}", others.join(", ")));
    }
    for other in all.iter().filter(|o| o.name != pattern.name) {
        let assigns = [format!("['{}'] =", other.name), format!("[\"{}\"] =", other.name)];
        if unit_text.contains(&other.defining_text) || assigns.iter().any(|a| unit_text.contains(a.as_str())) {
            return Err(format!("pattern leakage: unit contains the definition of `{}`", other.name));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::classifier::SourceClassifier;
    use rust_decimal_macros::dec;

    fn decompose(src: &str) -> Decomposition {
        let source = ScannerSource::new(src);
        let classification = SourceClassifier::default().classify(&source);
        PatternDecomposer::default().decompose(&source, &classification)
    }

    const MULTI: &str = r#"
import pandas as pd
import numpy as np

API_KEY = "secret"
BASE_URL = "https://api.polygon.io"
GAP_MIN = 2.0
FADE_MAX = -3.0
VOL_FLOOR = 500_000

def strong_volume(df):
    return df['volume'] > VOL_FLOOR

def big_gap(df):
    return df['gap_pct'] > GAP_MIN

async def run_scan(start_date, end_date):
    df = await fetch(start_date, end_date)
    df['dv'] = df['close'] * df['volume']
    df['intraday'] = df['close'] / df['open'] - 1
    df['gap_go'] = (big_gap(df) & strong_volume(df)).astype(int)
    df['fade'] = (df['intraday'] * 100 < FADE_MAX).astype(int)
    df['dv_spike'] = np.where(df['dv'] > 5e7, 1, 0)
    return df[(df['gap_go'] == 1) | (df['fade'] == 1) | (df['dv_spike'] == 1)]
"#;

    #[test]
    fn test_pattern_list_units() {
        let d = decompose(r#"self.pattern_assignments = [{"name":"p1","logic":"a>1"},{"name":"p2","logic":"a<-1"}]"#);
        assert!(d.failures.is_empty(), "{:?}", d.failures);
        let names: Vec<&str> = d.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["p1", "p2"]);

        let p1 = d.unit("p1").unwrap();
        assert!(p1.standalone_source.contains("a>1"));
        assert!(!p1.standalone_source.contains("a<-1"));
        assert!(!p1.standalone_source.contains("p2"));
        assert_eq!(p1.logic_expression, "a>1");
        assert_eq!(p1.parameters.get("a").unwrap().value.as_number(), Some(dec!(1)));

        let p2 = d.unit("p2").unwrap();
        assert!(p2.standalone_source.contains("a<-1"));
        assert_eq!(p2.parameters.get("a").unwrap().value.as_number(), Some(dec!(-1)));
    }

    #[test]
    fn test_assignment_units_carry_only_their_closure() {
        let d = decompose(MULTI);
        assert!(d.failures.is_empty(), "{:?}", d.failures);
        assert_eq!(d.units.len(), 3);

        let gap = d.unit("gap_go").unwrap();
        let src = &gap.standalone_source;
        assert!(src.contains("import pandas as pd"));
        assert!(src.contains("def big_gap(df):"));
        assert!(src.contains("def strong_volume(df):"));
        assert!(src.contains("GAP_MIN = 2.0"));
        assert!(src.contains("VOL_FLOOR = 500_000"));
        assert!(src.contains("BASE_URL"));
        assert!(!src.contains("FADE_MAX"));
        assert!(!src.contains("df['dv']"));
        assert!(!src.contains("fade"));

        let fade = d.unit("fade").unwrap();
        assert!(fade.standalone_source.contains("df['intraday'] = df['close'] / df['open'] - 1"));
        assert!(!fade.standalone_source.contains("big_gap"));

        let spike = d.unit("dv_spike").unwrap();
        assert!(spike.standalone_source.contains("df['dv'] = df['close'] * df['volume']"));
        assert_eq!(spike.logic_expression, "df['dv'] > 5e7");
    }

    #[test]
    fn test_units_are_single_pattern_scanners() {
        let d = decompose(MULTI);
        let classifier = SourceClassifier::default();
        for unit in &d.units {
            let c = classifier.classify(&ScannerSource::new(unit.standalone_source.clone()));
            assert_eq!(c.pattern_kind, PatternKind::SingleExtractedScanner, "{}", unit.name);
            assert_eq!(c.entry_point.unwrap().name, "run_scan");
        }
    }

    #[test]
    fn test_unit_parameters_extracted_independently() {
        let d = decompose(MULTI);
        let gap = d.unit("gap_go").unwrap();
        assert!(gap.parameters.get("GAP_MIN").is_some());
        assert!(gap.parameters.get("FADE_MAX").is_none());
        assert_eq!(
            gap.parameters.get("API_KEY").unwrap().value,
            crate::types::ParamValue::Text(crate::types::ParamValue::REDACTED.into())
        );
    }

    #[test]
    fn test_partial_failure_keeps_other_units() {
        let src = "def main():\n    df['ok'] = (df['gap_pct'] > 2).astype(int)\n    df['bad'] = (df['close'].rolling(5).mean() > 1).astype(int)\n    return df\n";
        let d = decompose(src);
        assert_eq!(d.pattern_count(), 2);
        assert_eq!(d.units.len(), 1);
        assert_eq!(d.units[0].name, "ok");
        assert_eq!(d.failures.len(), 1);
        assert_eq!(d.failures[0].name, "bad");
        assert!(d.failures[0].reason.contains("rolling"));
    }

    #[test]
    fn test_cross_pattern_reference_is_leakage() {
        let src = "def main():\n    df['p1'] = (df['a'] > 1).astype(int)\n    df['p2'] = (df['a'] < -1).astype(int)\n    df['both'] = (df['p1'] + df['p2'] > 0).astype(int)\n    return df\n";
        let d = decompose(src);
        assert_eq!(d.units.len(), 2);
        assert_eq!(d.failures.len(), 1);
        assert_eq!(d.failures[0].name, "both");
        assert!(d.failures[0].reason.contains("leakage"));
    }

    #[test]
    fn test_non_multi_source_not_decomposed() {
        let d = decompose("def run_scan(start, end):\n    df['hit'] = (df['gap_pct'] > 2).astype(int)\n    return df[df['hit'] == 1]\n");
        assert!(d.units.is_empty());
        assert!(d.failures.is_empty());
    }

    #[test]
    fn test_method_helper_with_unicode_blank_docstring_line() {
        let src = "class GapScanner:\n    def big_gap(df):\n        \"\"\"Gap filter.\n   x\n\u{a0}\u{a0}\n        \"\"\"\n        return df['gap_pct'] > 2\n\n    def run_scan(self, start, end):\n        df['gap_go'] = big_gap(df).astype(int)\n        df['fade'] = (df['gap_pct'] < -2).astype(int)\n        return df[(df['gap_go'] == 1) | (df['fade'] == 1)]\n";
        let d = decompose(src);
        assert_eq!(d.units.len() + d.failures.len(), d.pattern_count());
    }

    #[test]
    fn test_py_string_quoting() {
        assert_eq!(py_string("a > 1"), "\"a > 1\"");
        assert_eq!(py_string("sym == \"X\""), "'sym == \"X\"'");
    }
}
