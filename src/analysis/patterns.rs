//! Recognisers for pattern-defining statements.
//!
//! A pattern is defined either by an entry in an explicit list of
//! `{"name": ..., "logic": ...}` objects, or by a boolean column
//! assignment converted to 0/1:
//!
//! ```text
//! df['gap_up'] = ((df['open'] > df['prev_close'] * 1.02)).astype(int)
//! df['fade']   = np.where(df['close'] < df['open'], 1, 0)
//! ```

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use super::lexer::{bracket_body, split_top_level, unquote, LogicalLine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOrigin {
    ListEntry,
    Assignment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternDef {
    pub name: String,
    /// Boolean expression over row-level columns.
    pub logic: String,
    pub origin: PatternOrigin,
    /// Index into the logical-line list.
    pub line_index: usize,
    /// 1-based physical line.
    pub line_number: usize,
    /// The text that defines this pattern and nothing else; used by the
    /// leakage check.
    pub defining_text: String,
}

/// Explicit ordered pattern list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternList {
    pub var_name: String,
    pub line_index: usize,
    pub entries: Vec<(String, String)>,
}

const LOGIC_KEYS: &[&str] = &["logic", "condition", "expr", "expression", "rule"];

fn target_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^(?:[A-Za-z_][\w\.]*\s*\[\s*(?::\s*,\s*)?(?:'(\w+)'|"(\w+)")\s*\]|(?:self\.)?([A-Za-z_]\w*)(?:\s*:\s*[A-Za-z_][\w\.\[\], ]*)?)\s*=\s*(.+)$"#,
        )
        .expect("valid target regex")
    })
}

fn astype_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\.astype\(\s*['"]?(?:np\.)?(?:u?int\d*|bool)['"]?\s*\)$"#)
            .expect("valid astype regex")
    })
}

const KEYWORDS: &[&str] = &[
    "if", "elif", "else", "while", "for", "with", "return", "lambda", "assert", "del", "try",
    "except", "class", "def", "async", "await", "yield", "not", "and", "or", "in", "is",
];

/// Split `target = value` into (column name, rhs). Column assignments like
/// `df['x'] = ...` and `df.loc[:, 'x'] = ...` yield `x`; bare names (and
/// `self.x`, optionally annotated) yield the name. Comparisons (`==`) and
/// augmented assignments are rejected.
pub fn split_assignment(text: &str) -> Option<(String, String)> {
    let caps = target_regex().captures(text)?;
    let rhs = caps.get(4)?.as_str().trim();
    if rhs.starts_with('=') {
        return None;
    }
    if caps.get(3).is_some_and(|m| KEYWORDS.contains(&m.as_str())) {
        return None;
    }
    let name = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))?
        .as_str()
        .to_string();
    Some((name, rhs.to_string()))
}

/// True when the statement assigns a column (`x[...] = ...`) rather than
/// a plain variable.
pub fn is_column_assignment(text: &str) -> bool {
    target_regex()
        .captures(text)
        .map(|c| c.get(1).is_some() || c.get(2).is_some())
        .unwrap_or(false)
}

/// Recognise `(<bool expr>).astype(int)` and `np.where(<cond>, 1, 0)`,
/// returning the boolean expression.
pub fn boolean_rhs(rhs: &str) -> Option<String> {
    let rhs = rhs.trim();
    if rhs.starts_with('(') {
        let (start, end) = bracket_body(rhs, 0)?;
        let rest = rhs[end + 1..].trim();
        if astype_regex().is_match(rest) {
            return Some(rhs[start..end].trim().to_string());
        }
        return None;
    }
    for prefix in ["np.where(", "numpy.where("] {
        if rhs.starts_with(prefix) {
            let (start, end) = bracket_body(rhs, prefix.len() - 1)?;
            if end + 1 != rhs.len() {
                return None;
            }
            let args = split_top_level(&rhs[start..end], ',');
            if args.len() == 3 && is_one(&args[1]) && is_zero(&args[2]) {
                return Some(args[0].clone());
            }
        }
    }
    None
}

fn is_one(s: &str) -> bool {
    matches!(s.trim(), "1" | "True" | "1.0")
}

fn is_zero(s: &str) -> bool {
    matches!(s.trim(), "0" | "False" | "0.0")
}

/// `(column, logic)` for a boolean pattern assignment statement.
pub fn parse_boolean_assignment(text: &str) -> Option<(String, String)> {
    let (name, rhs) = split_assignment(text)?;
    let logic = boolean_rhs(&rhs)?;
    Some((name, logic))
}

/// Find the first list assignment whose elements are objects carrying
/// a name and a logic field.
pub fn find_pattern_list(lines: &[LogicalLine]) -> Option<PatternList> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(?:self\.)?([A-Za-z_]\w*)\s*(?::[^=]+)?=\s*\[").expect("valid list regex")
    });

    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = re.captures(&line.text) else {
            continue;
        };
        let open = caps.get(0).map(|m| m.end() - 1)?;
        let Some((start, end)) = bracket_body(&line.text, open) else {
            continue;
        };
        let entries: Vec<(String, String)> = split_top_level(&line.text[start..end], ',')
            .iter()
            .filter_map(|elem| parse_pattern_object(elem))
            .collect();
        if !entries.is_empty() {
            return Some(PatternList {
                var_name: caps[1].to_string(),
                line_index: idx,
                entries,
            });
        }
    }
    None
}

/// Parse `{"name": "p1", "logic": "a > 1"}` or `dict(name="p1", logic="a > 1")`.
fn parse_pattern_object(elem: &str) -> Option<(String, String)> {
    let elem = elem.trim();
    let (body, sep) = if elem.starts_with('{') {
        let (s, e) = bracket_body(elem, 0)?;
        (&elem[s..e], ':')
    } else if elem.starts_with("dict(") {
        let (s, e) = bracket_body(elem, 4)?;
        (&elem[s..e], '=')
    } else {
        return None;
    };

    let mut name = None;
    let mut logic = None;
    for pair in split_top_level(body, ',') {
        let parts = split_top_level(&pair, sep);
        if parts.len() != 2 {
            continue;
        }
        let key = unquote(&parts[0]);
        let value = parts[1].trim();
        if !(value.starts_with('\'') || value.starts_with('"')) {
            continue;
        }
        if key == "name" {
            name = Some(unquote(value));
        } else if LOGIC_KEYS.contains(&key.as_str()) {
            logic = Some(unquote(value));
        }
    }
    Some((name?, logic?))
}

/// Ordered, de-duplicated pattern definitions. An explicit list wins over
/// boolean assignments when both are present.
pub fn find_pattern_definitions(lines: &[LogicalLine]) -> Vec<PatternDef> {
    let mut seen = HashSet::new();

    if let Some(list) = find_pattern_list(lines) {
        let line = &lines[list.line_index];
        return list
            .entries
            .into_iter()
            .filter(|(name, _)| seen.insert(name.clone()))
            .map(|(name, logic)| PatternDef {
                defining_text: format!("\"name\": \"{name}\""),
                name,
                logic,
                origin: PatternOrigin::ListEntry,
                line_index: list.line_index,
                line_number: line.number,
            })
            .collect();
    }

    lines
        .iter()
        .enumerate()
        .filter_map(|(idx, line)| {
            let (name, logic) = parse_boolean_assignment(&line.text)?;
            Some(PatternDef {
                name,
                logic,
                origin: PatternOrigin::Assignment,
                line_index: idx,
                line_number: line.number,
                defining_text: line.text.clone(),
            })
        })
        .filter(|def| seen.insert(def.name.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
