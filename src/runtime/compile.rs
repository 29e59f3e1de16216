//! Unit loader.
//!
//! Turns unit text into a `CompiledUnit`: module constants, row steps
//! (derived columns and 0/1 pattern columns, in source order), the row
//! selection, and exactly one resolved entry point. Single-expression
//! helper functions are inlined into the expressions that call them.
//!
//! Loading never executes anything. With `run_as_main` off (the default)
//! the `if __name__ == "__main__":` block is ignored entirely, and
//! module-level calls are recorded rather than run.

use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::expr::{self, Expr, Row, RowContext, Value, FUNCTIONS, METHODS};
use super::BUILTIN_COLUMNS;
use crate::analysis::classifier::discover_entry_point;
use crate::analysis::lexer::{self, bracket_body, split_top_level, unquote, FunctionDef, LogicalLine};
use crate::analysis::patterns::{find_pattern_list, is_column_assignment, parse_boolean_assignment, split_assignment};
use crate::config::ClassifierConfig;
use crate::error::CompileError;
use crate::types::EntryPoint;

/// Global names a legacy scanner may leave its results in.
pub const LEGACY_RESULT_NAMES: &[&str] = &["results", "signals", "df_results", "scan_results", "output", "hits"];

const MAX_INLINE_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Execute the body of the main guard as if the file were run directly.
    pub run_as_main: bool,
    pub entry_point_names: Vec<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}

impl CompileOptions {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self {
            run_as_main: false,
            entry_point_names: config.entry_point_names.clone(),
        }
    }
}

/// How results are obtained from the unit.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryRef {
    Function(EntryPoint),
    /// Compatibility path: results read from a module-level variable.
    LegacyGlobal(String),
}

/// The shape the entry point returns its rows in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputShape {
    Table,
    Records,
    Stream,
    Container(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub expr: Expr,
    pub is_pattern: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub entry: EntryRef,
    pub shape: OutputShape,
    pub constants: BTreeMap<String, Value>,
    pub steps: Vec<Step>,
    /// Columns whose truthy rows are emitted.
    pub selection: Vec<String>,
    /// Module-level calls seen while loading; never executed.
    pub top_level_calls: Vec<String>,
}

impl CompiledUnit {
    pub fn is_async(&self) -> bool {
        matches!(&self.entry, EntryRef::Function(ep) if ep.is_async)
    }

    pub fn entry_name(&self) -> &str {
        match &self.entry {
            EntryRef::Function(ep) => &ep.name,
            EntryRef::LegacyGlobal(name) => name,
        }
    }

    pub fn pattern_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .filter(|s| s.is_pattern && seen.insert(s.name.as_str()))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Evaluate every step on `row` (in place) and return the selected
    /// columns that fired.
    pub fn evaluate_row(&self, row: &mut Row, previous: Option<&Row>) -> Result<Vec<String>, expr::EvalError> {
        for step in &self.steps {
            let value = expr::eval(&step.expr, RowContext { current: &*row, previous })?;
            let value = if step.is_pattern {
                Value::Num(if value.truthy() { 1.0 } else { 0.0 })
            } else {
                value
            };
            row.insert(step.name.clone(), value);
        }
        Ok(self
            .selection
            .iter()
            .filter(|name| row.get(*name).is_some_and(Value::truthy))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A function whose body is local assignments followed by one `return`.
#[derive(Debug, Clone)]
struct Helper {
    params: Vec<String>,
    defaults: HashMap<String, String>,
    locals: Vec<(String, String)>,
    ret: String,
}

fn param_defaults(def_text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(open) = def_text.find('(') else {
        return out;
    };
    let Some((start, end)) = bracket_body(def_text, open) else {
        return out;
    };
    for param in split_top_level(&def_text[start..end], ',') {
        let parts = split_top_level(&param, '=');
        if parts.len() == 2 {
            let name = parts[0].split(':').next().unwrap_or("").trim().to_string();
            out.insert(name, parts[1].trim().to_string());
        }
    }
    out
}

fn collect_helpers(defs: &[FunctionDef], lines: &[LogicalLine]) -> HashMap<String, Helper> {
    let mut helpers = HashMap::new();
    for def in defs {
        let defaults = param_defaults(&lines[def.def_index].text);
        if let Some(inline) = &def.inline_body {
            if let Some(ret) = inline.strip_prefix("return ") {
                helpers.insert(
                    def.name.clone(),
                    Helper { params: def.params.clone(), defaults, locals: Vec::new(), ret: ret.trim().to_string() },
                );
            }
            continue;
        }

        let body: Vec<&LogicalLine> = def
            .body_lines(lines)
            .iter()
            .filter(|l| !(l.text.starts_with('"') || l.text.starts_with('\'')) && l.text != "pass")
            .collect();
        let Some((last, init)) = body.split_last() else {
            continue;
        };
        let Some(ret) = last.text.strip_prefix("return ") else {
            continue;
        };
        if body.iter().any(|l| l.indent != last.indent) {
            continue;
        }
        let locals: Option<Vec<(String, String)>> = init
            .iter()
            .map(|l| {
                if is_column_assignment(&l.text) {
                    return None;
                }
                split_assignment(&l.text)
            })
            .collect();
        if let Some(locals) = locals {
            helpers.insert(
                def.name.clone(),
                Helper { params: def.params.clone(), defaults, locals, ret: ret.trim().to_string() },
            );
        }
    }
    helpers
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

enum ResolveError {
    Helper(String),
    Message(String),
}

struct Resolver<'a> {
    constants: &'a HashMap<String, Value>,
    helpers: &'a HashMap<String, Helper>,
    local_defs: &'a HashSet<String>,
    columns: &'a HashSet<String>,
}

impl Resolver<'_> {
    fn resolve_text(&self, raw: &str, bindings: &HashMap<String, Expr>, depth: usize) -> Result<Expr, ResolveError> {
        let parsed = expr::parse(raw).map_err(ResolveError::Message)?;
        self.resolve(&parsed, bindings, depth)
    }

    fn resolve(&self, e: &Expr, bindings: &HashMap<String, Expr>, depth: usize) -> Result<Expr, ResolveError> {
        Ok(match e {
            Expr::Literal(_) => e.clone(),
            Expr::Name(n) => {
                if let Some(bound) = bindings.get(n) {
                    bound.clone()
                } else if let Some(v) = self.constants.get(n) {
                    Expr::Literal(v.clone())
                } else if is_type_name(n) {
                    Expr::Literal(Value::Str(n.clone()))
                } else {
                    Expr::Column(n.clone())
                }
            }
            Expr::Column(c) => match self.constants.get(c) {
                Some(v) if !self.columns.contains(c) => Expr::Literal(v.clone()),
                _ => e.clone(),
            },
            Expr::Unary(op, inner) => Expr::Unary(*op, Box::new(self.resolve(inner, bindings, depth)?)),
            Expr::Binary(op, l, r) => Expr::Binary(
                *op,
                Box::new(self.resolve(l, bindings, depth)?),
                Box::new(self.resolve(r, bindings, depth)?),
            ),
            Expr::Compare(first, rest) => {
                let first = self.resolve(first, bindings, depth)?;
                let rest = rest
                    .iter()
                    .map(|(op, e)| Ok((*op, self.resolve(e, bindings, depth)?)))
                    .collect::<Result<Vec<_>, ResolveError>>()?;
                Expr::Compare(Box::new(first), rest)
            }
            Expr::Call(name, args) => {
                let args = self.resolve_all(args, bindings, depth)?;
                if let Some(helper) = self.helpers.get(name) {
                    self.inline(name, helper, args, depth)?
                } else if self.local_defs.contains(name) {
                    return Err(ResolveError::Helper(name.clone()));
                } else if FUNCTIONS.contains(&name.as_str()) {
                    Expr::Call(name.clone(), args)
                } else {
                    return Err(ResolveError::Message(format!("unknown function `{name}`")));
                }
            }
            Expr::Method(recv, name, args) => {
                if matches!(name.as_str(), "eval" | "query") {
                    if let Some(Expr::Literal(Value::Str(text))) = args.first() {
                        return self.resolve_text(text, bindings, depth + 1);
                    }
                }
                let args = self.resolve_all(args, bindings, depth)?;
                if matches!(recv.as_ref(), Expr::Name(r) if r == "self" || r == "cls") {
                    if let Some(helper) = self.helpers.get(name) {
                        return self.inline(name, helper, args, depth);
                    }
                    if self.local_defs.contains(name) {
                        return Err(ResolveError::Helper(name.clone()));
                    }
                }
                if !METHODS.contains(&name.as_str()) {
                    return Err(ResolveError::Message(format!("unsupported method `.{name}()`")));
                }
                Expr::Method(Box::new(self.resolve(recv, bindings, depth)?), name.clone(), args)
            }
        })
    }

    fn resolve_all(&self, args: &[Expr], bindings: &HashMap<String, Expr>, depth: usize) -> Result<Vec<Expr>, ResolveError> {
        args.iter().map(|a| self.resolve(a, bindings, depth)).collect()
    }

    fn inline(&self, name: &str, helper: &Helper, args: Vec<Expr>, depth: usize) -> Result<Expr, ResolveError> {
        if depth >= MAX_INLINE_DEPTH {
            return Err(ResolveError::Message(format!("helper `{name}` recurses too deeply")));
        }
        if args.len() > helper.params.len() {
            return Err(ResolveError::Message(format!(
                "`{name}` takes {} arguments but {} were given",
                helper.params.len(),
                args.len()
            )));
        }
        let mut bindings = HashMap::new();
        let mut args = args.into_iter();
        for param in &helper.params {
            let value = match args.next() {
                Some(arg) => arg,
                None => match helper.defaults.get(param) {
                    Some(default) => self.resolve_text(default, &HashMap::new(), depth + 1)?,
                    None => {
                        return Err(ResolveError::Message(format!("`{name}` missing argument `{param}`")));
                    }
                },
            };
            bindings.insert(param.clone(), value);
        }
        for (local, raw) in &helper.locals {
            let value = self.resolve_text(raw, &bindings, depth + 1)?;
            bindings.insert(local.clone(), value);
        }
        self.resolve_text(&helper.ret, &bindings, depth + 1)
    }
}

fn is_type_name(n: &str) -> bool {
    let base = n.trim_start_matches("np.").trim_start_matches("numpy.");
    matches!(base, "int" | "float" | "bool" | "str")
        || base.starts_with("int")
        || base.starts_with("uint")
        || base.starts_with("float")
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Compile unit text.
pub fn compile(text: &str, options: &CompileOptions) -> Result<CompiledUnit, CompileError> {
    lexer::check_balanced(text).map_err(|issue| CompileError::Syntax {
        line: issue.line,
        message: issue.message,
    })?;

    let scan = lexer::scan(text);
    let lines = &scan.lines;
    let main_block = lexer::main_guard(lines);
    let guard = if options.run_as_main { None } else { main_block.clone() };
    let is_active = |idx: usize| guard.as_ref().map_or(true, |g| !g.contains(&idx));

    let defs = lexer::function_defs(lines);
    let helpers = collect_helpers(&defs, lines);
    let local_defs: HashSet<String> = defs.iter().map(|d| d.name.clone()).collect();

    // Raw steps in source order; pattern-list entries run after every
    // assignment so their logic can read derived columns.
    let mut raw_steps: Vec<(String, String, bool)> = Vec::new();
    for (_, line) in lines.iter().enumerate().filter(|(i, _)| is_active(*i)) {
        for stmt in split_top_level(&line.text, ';') {
            if let Some((name, logic)) = parse_boolean_assignment(&stmt) {
                raw_steps.push((name, logic, true));
            } else if is_column_assignment(&stmt) {
                if let Some((name, rhs)) = split_assignment(&stmt) {
                    raw_steps.push((name, rhs, false));
                }
            }
        }
    }
    if let Some(list) = find_pattern_list(lines).filter(|l| is_active(l.line_index)) {
        for (name, logic) in list.entries {
            raw_steps.push((name, logic, true));
        }
    }

    let mut columns: HashSet<String> = BUILTIN_COLUMNS.iter().map(|c| c.to_string()).collect();
    columns.extend(raw_steps.iter().map(|(name, _, _)| name.clone()));

    let constants = collect_constants(lines, &is_active, &helpers, &local_defs, &columns);

    let resolver = Resolver {
        constants: &constants,
        helpers: &helpers,
        local_defs: &local_defs,
        columns: &columns,
    };

    let mut steps = Vec::new();
    let mut unsupported: HashMap<String, (String, String)> = HashMap::new();
    for (name, raw, is_pattern) in raw_steps {
        match resolver.resolve_text(&raw, &HashMap::new(), 0) {
            Ok(expr) => {
                unsupported.remove(&name);
                steps.push(Step { name, expr, is_pattern });
            }
            Err(ResolveError::Helper(helper)) if is_pattern => {
                return Err(CompileError::UnsupportedHelper(helper));
            }
            Err(ResolveError::Message(message)) if is_pattern => {
                return Err(CompileError::Expression { expr: raw, message });
            }
            Err(err) => {
                let message = match err {
                    ResolveError::Helper(h) => format!("helper `{h}` is not a single-expression function"),
                    ResolveError::Message(m) => m,
                };
                unsupported.insert(name, (raw, message));
            }
        }
    }

    let selection = find_selection(lines, &is_active, &steps);
    if selection.is_empty() {
        return Err(CompileError::NoPatterns);
    }

    let steps = prune_steps(steps, &selection, &unsupported)?;

    let entry = resolve_entry(&defs, lines, &is_active, &options.entry_point_names)?;
    let shape = match &entry {
        EntryRef::Function(ep) => output_shape(&defs, lines, &ep.name),
        EntryRef::LegacyGlobal(name) => OutputShape::Container(name.clone()),
    };

    let top_level_calls = top_level_calls(lines, &is_active, main_block.as_ref(), &local_defs);
    if !top_level_calls.is_empty() {
        debug!(calls = ?top_level_calls, "Module-level calls recorded, not executed");
    }

    Ok(CompiledUnit {
        entry,
        shape,
        constants: constants.into_iter().collect(),
        steps,
        selection,
        top_level_calls,
    })
}

/// Literal-valued names: plain assignments whose right side evaluates
/// without reading any row column, plus numeric fields of dict literals.
fn collect_constants(
    lines: &[LogicalLine],
    is_active: &dyn Fn(usize) -> bool,
    helpers: &HashMap<String, Helper>,
    local_defs: &HashSet<String>,
    columns: &HashSet<String>,
) -> HashMap<String, Value> {
    let mut constants: HashMap<String, Value> = HashMap::new();
    let empty = Row::new();

    for (idx, line) in lines.iter().enumerate() {
        if !is_active(idx) {
            continue;
        }
        for stmt in split_top_level(&line.text, ';') {
            if is_column_assignment(&stmt) {
                continue;
            }
            let Some((name, rhs)) = split_assignment(&stmt) else {
                continue;
            };
            if rhs.starts_with('{') || rhs.starts_with("dict(") {
                dict_constants(&rhs, &mut constants);
                continue;
            }
            let resolver = Resolver { constants: &constants, helpers, local_defs, columns };
            let Ok(resolved) = resolver.resolve_text(&rhs, &HashMap::new(), 0) else {
                continue;
            };
            if !resolved.columns().is_empty() {
                continue;
            }
            if let Ok(value) = expr::eval(&resolved, RowContext { current: &empty, previous: None }) {
                constants.insert(name, value);
            }
        }
    }
    constants
}

fn dict_constants(rhs: &str, constants: &mut HashMap<String, Value>) {
    let (open, sep) = if rhs.starts_with('{') { (0, ':') } else { (4, '=') };
    let Some((start, end)) = bracket_body(rhs, open) else {
        return;
    };
    for pair in split_top_level(&rhs[start..end], ',') {
        let parts = split_top_level(&pair, sep);
        if parts.len() != 2 {
            continue;
        }
        let key = unquote(&parts[0]);
        let value = parts[1].trim();
        if value.starts_with('{') || value.starts_with("dict(") {
            dict_constants(value, constants);
            continue;
        }
        let literal = match expr::parse(value) {
            Ok(Expr::Literal(v)) => v,
            Ok(Expr::Unary(expr::UnaryOp::Neg, inner)) => match *inner {
                Expr::Literal(Value::Num(n)) => Value::Num(-n),
                _ => continue,
            },
            _ => continue,
        };
        constants.insert(key, literal);
    }
}

fn selection_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"\[\s*[A-Za-z_]\w*\s*\[\s*['"](\w+)['"]\s*\]\s*(?:(?:==\s*(?:1|True))|(?:\.astype\(\s*bool\s*\)))?\s*\]"#,
        )
        .expect("valid selection regex")
    })
}

/// Columns named by a row filter like `df[df['p'] == 1]`; all pattern
/// columns when the unit has no explicit filter.
fn find_selection(lines: &[LogicalLine], is_active: &dyn Fn(usize) -> bool, steps: &[Step]) -> Vec<String> {
    let defined: HashSet<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    let mut selection: Vec<String> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if !is_active(idx) {
            continue;
        }
        for caps in selection_regex().captures_iter(&line.text) {
            let name = caps[1].to_string();
            if defined.contains(name.as_str()) && !selection.contains(&name) {
                selection.push(name);
            }
        }
    }
    if selection.is_empty() {
        for step in steps.iter().filter(|s| s.is_pattern) {
            if !selection.contains(&step.name) {
                selection.push(step.name.clone());
            }
        }
    }
    selection
}

/// Keep only the steps the selection depends on, failing if any of them
/// needs a column that could not be compiled.
fn prune_steps(
    steps: Vec<Step>,
    selection: &[String],
    unsupported: &HashMap<String, (String, String)>,
) -> Result<Vec<Step>, CompileError> {
    let mut needed: HashSet<String> = selection.iter().cloned().collect();
    for step in steps.iter().rev() {
        if needed.contains(&step.name) {
            needed.extend(step.expr.columns());
        }
    }
    if let Some((raw, message)) = needed.iter().find_map(|c| unsupported.get(c)) {
        return Err(CompileError::Expression {
            expr: raw.clone(),
            message: message.clone(),
        });
    }
    Ok(steps.into_iter().filter(|s| needed.contains(&s.name)).collect())
}

fn resolve_entry(
    defs: &[FunctionDef],
    lines: &[LogicalLine],
    is_active: &dyn Fn(usize) -> bool,
    names: &[String],
) -> Result<EntryRef, CompileError> {
    if let Some(ep) = discover_entry_point(defs, lines, names) {
        return Ok(EntryRef::Function(ep));
    }

    let legacy = lines
        .iter()
        .enumerate()
        .filter(|(idx, line)| is_active(*idx) && line.indent == 0)
        .filter_map(|(_, line)| split_assignment(&line.text).map(|(name, _)| name))
        .find(|name| LEGACY_RESULT_NAMES.contains(&name.as_str()));
    match legacy {
        Some(name) => {
            warn!(
                variable = %name,
                "No entry point; reading results from a module-level variable (legacy fallback)"
            );
            Ok(EntryRef::LegacyGlobal(name))
        }
        None => Err(CompileError::NoEntryPoint(names.join(", "))),
    }
}

fn output_shape(defs: &[FunctionDef], lines: &[LogicalLine], entry: &str) -> OutputShape {
    static CONTAINER: OnceLock<Regex> = OnceLock::new();
    static RECORDS: OnceLock<Regex> = OnceLock::new();
    let container = CONTAINER.get_or_init(|| {
        Regex::new(r#"^return\s*\{\s*['"](\w+)['"]\s*:"#).expect("valid container regex")
    });
    let records = RECORDS.get_or_init(|| {
        Regex::new(r#"to_dict\(\s*(?:orient\s*=\s*)?['"]records['"]"#).expect("valid records regex")
    });

    let Some(def) = defs.iter().filter(|d| d.name == entry).min_by_key(|d| d.indent) else {
        return OutputShape::Table;
    };
    let body: Vec<&str> = def
        .body_lines(lines)
        .iter()
        .map(|l| l.text.as_str())
        .chain(def.inline_body.as_deref())
        .collect();

    if body.iter().any(|t| t.starts_with("yield ") || *t == "yield" || t.contains("= yield")) {
        return OutputShape::Stream;
    }
    if let Some(key) = body.iter().find_map(|t| container.captures(t).map(|c| c[1].to_string())) {
        return OutputShape::Container(key);
    }
    if body.iter().any(|t| t.starts_with("return") && records.is_match(t)) {
        return OutputShape::Records;
    }
    OutputShape::Table
}

fn top_level_calls(
    lines: &[LogicalLine],
    is_active: &dyn Fn(usize) -> bool,
    main_block: Option<&std::ops::Range<usize>>,
    local_defs: &HashSet<String>,
) -> Vec<String> {
    static CALL: OnceLock<Regex> = OnceLock::new();
    let call = CALL.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z_]\w*\s*=\s*)?(?:await\s+)?([A-Za-z_][\w\.]*)\s*\(").expect("valid call regex")
    });
    lines
        .iter()
        .enumerate()
        .filter(|(idx, line)| is_active(*idx) && (line.indent == 0 || main_block.is_some_and(|b| b.contains(idx))))
        .filter_map(|(_, line)| {
            let callee = call.captures(&line.text)?.get(1)?.as_str().to_string();
            let keyword = matches!(callee.as_str(), "if" | "while" | "for" | "def" | "class" | "return" | "print");
            let relevant = local_defs.contains(&callee) || callee.starts_with("asyncio.");
            (relevant && !keyword).then(|| line.text.clone())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
