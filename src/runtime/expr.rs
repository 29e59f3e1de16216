//! Row-level expression language for pattern logic.
//!
//! Covers the subset of pandas/numpy expressions scanners use to define
//! patterns: column access (`df['gap']`, `df.gap`, bare `gap`), arithmetic,
//! chained comparisons, boolean combinators, a handful of numpy helpers and
//! the `.astype/.abs/.fillna/.shift` methods.
//!
//! `&` and `|` share the precedence of `and`/`or`, as in `DataFrame.query`,
//! so unparenthesised query strings read the way their authors meant.

use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
    Str(String),
    Null,
}

impl Value {
    pub fn num(v: f64) -> Self {
        if v.is_finite() {
            Value::Num(v)
        } else {
            Value::Null
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(v) => Some(*v),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(_) | Value::Null => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Num(v) => *v != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Null => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Null => write!(f, "None"),
        }
    }
}

/// Column values for one instrument on one date.
pub type Row = HashMap<String, Value>;

/// The row being evaluated plus the same instrument's prior session (D-1).
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub current: &'a Row,
    pub previous: Option<&'a Row>,
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Column(String),
    /// Bare identifier, resolved to a constant, binding or column later.
    Name(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    Call(String, Vec<Expr>),
    Method(Box<Expr>, String, Vec<Expr>),
}

impl Expr {
    /// Column names read by this expression (after resolution).
    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Column(c) = e {
                if !out.contains(c) {
                    out.push(c.clone());
                }
            }
        });
        out
    }

    fn walk(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Column(_) | Expr::Name(_) => {}
            Expr::Unary(_, e) => e.walk(f),
            Expr::Binary(_, l, r) => {
                l.walk(f);
                r.walk(f);
            }
            Expr::Compare(first, rest) => {
                first.walk(f);
                for (_, e) in rest {
                    e.walk(f);
                }
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.walk(f)),
            Expr::Method(recv, _, args) => {
                recv.walk(f);
                args.iter().for_each(|a| a.walk(f));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Assign,
}

const OPERATORS: &[&str] = &[
    "**", "//", ">=", "<=", "==", "!=", ">", "<", "+", "-", "*", "/", "%", "&", "|", "~",
];

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| format!("invalid number `{text}`"))?;
            tokens.push(Token::Num(value));
            continue;
        }
        if c == '\'' || c == '"' {
            let mut j = i + 1;
            let mut s = String::new();
            while j < chars.len() && chars[j] != c {
                if chars[j] == '\\' && j + 1 < chars.len() {
                    j += 1;
                }
                s.push(chars[j]);
                j += 1;
            }
            if j >= chars.len() {
                return Err("unterminated string".to_string());
            }
            tokens.push(Token::Str(s));
            i = j + 1;
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let simple = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            ',' => Some(Token::Comma),
            '.' => Some(Token::Dot),
            ':' => Some(Token::Colon),
            _ => None,
        };
        if let Some(tok) = simple {
            tokens.push(tok);
            i += 1;
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        if let Some(op) = OPERATORS.iter().copied().find(|op| rest.starts_with(*op)) {
            tokens.push(Token::Op(op));
            i += op.len();
            continue;
        }
        if c == '=' {
            tokens.push(Token::Assign);
            i += 1;
            continue;
        }
        return Err(format!("unexpected character `{c}`"));
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Module aliases whose attributes are functions, not columns.
const MODULES: &[&str] = &["np", "numpy", "pd", "pandas", "math"];

/// Functions the evaluator implements.
pub const FUNCTIONS: &[&str] = &[
    "abs", "min", "max", "round", "float", "int", "bool", "np.abs", "numpy.abs", "math.fabs",
    "np.log", "numpy.log", "math.log", "np.sqrt", "numpy.sqrt", "math.sqrt", "np.minimum",
    "np.maximum", "numpy.minimum", "numpy.maximum", "np.where", "numpy.where", "np.isnan",
    "numpy.isnan", "pd.isna", "pd.isnull", "pandas.isna",
];

/// Methods the evaluator implements.
pub const METHODS: &[&str] = &[
    "shift", "astype", "abs", "fillna", "round", "clip", "between", "isna", "isnull", "notna",
    "notnull", "values", "copy", "squeeze",
];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Parse one expression.
pub fn parse(src: &str) -> Result<Expr, String> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected trailing token {:?}", parser.tokens[parser.pos]));
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token) -> Result<(), String> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(format!("expected {:?}, found {:?}", tok, self.peek()))
        }
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == kw)
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and_expr()?;
        while self.is_keyword("or") || self.is_op("|") {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.not_expr()?;
        while self.is_keyword("and") || self.is_op("&") {
            self.pos += 1;
            let right = self.not_expr()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, String> {
        if self.is_keyword("not") {
            self.pos += 1;
            let inner = self.not_expr()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let first = self.additive()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Op(">")) => CmpOp::Gt,
                Some(Token::Op(">=")) => CmpOp::Ge,
                Some(Token::Op("<")) => CmpOp::Lt,
                Some(Token::Op("<=")) => CmpOp::Le,
                Some(Token::Op("==")) => CmpOp::Eq,
                Some(Token::Op("!=")) => CmpOp::Ne,
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.additive()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.term()?;
        loop {
            let op = if self.is_op("+") {
                BinaryOp::Add
            } else if self.is_op("-") {
                BinaryOp::Sub
            } else {
                break;
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        loop {
            let op = if self.is_op("*") {
                BinaryOp::Mul
            } else if self.is_op("/") {
                BinaryOp::Div
            } else if self.is_op("//") {
                BinaryOp::FloorDiv
            } else if self.is_op("%") {
                BinaryOp::Mod
            } else {
                break;
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        let op = if self.is_op("-") {
            UnaryOp::Neg
        } else if self.is_op("+") {
            UnaryOp::Pos
        } else if self.is_op("~") {
            UnaryOp::Not
        } else {
            return self.power();
        };
        self.pos += 1;
        let inner = self.unary()?;
        Ok(Expr::Unary(op, Box::new(inner)))
    }

    fn power(&mut self) -> Result<Expr, String> {
        let base = self.postfix()?;
        if self.is_op("**") {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let name = match self.next() {
                        Some(Token::Ident(n)) => n,
                        other => return Err(format!("expected attribute, found {other:?}")),
                    };
                    let args = if self.peek() == Some(&Token::LParen) {
                        self.pos += 1;
                        self.call_args()?
                    } else {
                        Vec::new()
                    };
                    expr = Expr::Method(Box::new(expr), name, args);
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Str(col)) => {
                            self.expect(Token::RBracket)?;
                            expr = Expr::Column(col);
                        }
                        other => return Err(format!("unsupported subscript {other:?}")),
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Num(v)) => Ok(Expr::Literal(Value::Num(v))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.identifier(name),
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn identifier(&mut self, name: String) -> Result<Expr, String> {
        match name.as_str() {
            "True" => return Ok(Expr::Literal(Value::Bool(true))),
            "False" => return Ok(Expr::Literal(Value::Bool(false))),
            "None" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }

        // `np.where(...)`, `math.log(...)`: dotted function names.
        if MODULES.contains(&name.as_str()) && self.peek() == Some(&Token::Dot) {
            let mut dotted = name;
            while self.eat(&Token::Dot) {
                match self.next() {
                    Some(Token::Ident(part)) => {
                        dotted.push('.');
                        dotted.push_str(&part);
                    }
                    other => return Err(format!("expected name after `.`, found {other:?}")),
                }
            }
            if self.eat(&Token::LParen) {
                let args = self.call_args()?;
                return Ok(Expr::Call(dotted, args));
            }
            return Ok(Expr::Name(dotted));
        }

        if self.eat(&Token::LParen) {
            let args = self.call_args()?;
            return Ok(Expr::Call(name, args));
        }

        // `df.gap` reads column `gap` unless a call follows (`df.gap.abs()`
        // is handled by postfix on the column).
        if self.peek() == Some(&Token::Dot) {
            if let Some(Token::Ident(attr)) = self.tokens.get(self.pos + 1).cloned() {
                if self.tokens.get(self.pos + 2) != Some(&Token::LParen) {
                    self.pos += 2;
                    return Ok(Expr::Column(attr));
                }
            }
        }

        // `df['gap']`: the frame name itself is irrelevant.
        if self.peek() == Some(&Token::LBracket) {
            if let Some(Token::Str(col)) = self.tokens.get(self.pos + 1).cloned() {
                self.pos += 2;
                self.expect(Token::RBracket)?;
                return Ok(Expr::Column(col));
            }
        }

        Ok(Expr::Name(name))
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            // Keyword arguments are taken positionally.
            if matches!(self.peek(), Some(Token::Ident(_)))
                && self.tokens.get(self.pos + 1) == Some(&Token::Assign)
            {
                self.pos += 2;
            }
            args.push(self.or_expr()?);
            if self.eat(&Token::Comma) {
                if self.eat(&Token::RParen) {
                    return Ok(args);
                }
                continue;
            }
            self.expect(Token::RParen)?;
            return Ok(args);
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("KeyError: column '{0}' not found")]
    UnknownColumn(String),
    #[error("NameError: function '{0}' is not defined")]
    UnknownFunction(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("TypeError: {0}")]
    Type(String),
}

/// Evaluate a resolved expression against one row.
pub fn eval(expr: &Expr, ctx: RowContext<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column(name) => ctx
            .current
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownColumn(name.clone())),
        Expr::Name(name) => Err(EvalError::UnknownColumn(name.clone())),
        Expr::Unary(op, inner) => {
            let v = eval(inner, ctx)?;
            Ok(match op {
                UnaryOp::Not => Value::Bool(!v.truthy()),
                UnaryOp::Neg => v.as_f64().map(|x| Value::num(-x)).unwrap_or(Value::Null),
                UnaryOp::Pos => v.as_f64().map(Value::num).unwrap_or(Value::Null),
            })
        }
        Expr::Binary(BinaryOp::And, l, r) => {
            if !eval(l, ctx)?.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(r, ctx)?.truthy()))
        }
        Expr::Binary(BinaryOp::Or, l, r) => {
            if eval(l, ctx)?.truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(r, ctx)?.truthy()))
        }
        Expr::Binary(op, l, r) => {
            let (a, b) = (eval(l, ctx)?, eval(r, ctx)?);
            arithmetic(*op, &a, &b)
        }
        Expr::Compare(first, rest) => {
            let mut left = eval(first, ctx)?;
            for (op, rhs) in rest {
                let right = eval(rhs, ctx)?;
                if !compare(*op, &left, &right) {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::Call(name, args) => call(name, args, ctx),
        Expr::Method(recv, name, args) => method(recv, name, args, ctx),
    }
}

fn arithmetic(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, EvalError> {
    if let (Value::Str(x), Value::Str(y), BinaryOp::Add) = (a, b, op) {
        return Ok(Value::Str(format!("{x}{y}")));
    }
    if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
        return Err(EvalError::Type(format!("unsupported operand types for {op:?}: {a} and {b}")));
    }
    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return Ok(Value::Null);
    };
    let out = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
        BinaryOp::FloorDiv => (x / y).floor(),
        BinaryOp::Mod => x.rem_euclid(y),
        BinaryOp::Pow => x.powf(y),
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit ops handled in eval"),
    };
    Ok(Value::num(out))
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
        },
        _ => {
            // Missing values never satisfy a comparison, as with NaN.
            let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                return op == CmpOp::Ne && a != b;
            };
            match op {
                CmpOp::Gt => x > y,
                CmpOp::Ge => x >= y,
                CmpOp::Lt => x < y,
                CmpOp::Le => x <= y,
                CmpOp::Eq => x == y,
                CmpOp::Ne => x != y,
            }
        }
    }
}

fn numeric_arg(args: &[Expr], idx: usize, ctx: RowContext<'_>, name: &str) -> Result<Option<f64>, EvalError> {
    let expr = args
        .get(idx)
        .ok_or_else(|| EvalError::Type(format!("{name}() missing argument {}", idx + 1)))?;
    Ok(eval(expr, ctx)?.as_f64())
}

fn call(name: &str, args: &[Expr], ctx: RowContext<'_>) -> Result<Value, EvalError> {
    let unary = |f: fn(f64) -> f64| -> Result<Value, EvalError> {
        Ok(numeric_arg(args, 0, ctx, name)?
            .map(|x| Value::num(f(x)))
            .unwrap_or(Value::Null))
    };
    match name {
        "abs" | "np.abs" | "numpy.abs" | "math.fabs" => unary(f64::abs),
        "np.log" | "numpy.log" | "math.log" => unary(f64::ln),
        "np.sqrt" | "numpy.sqrt" | "math.sqrt" => unary(f64::sqrt),
        "float" => unary(|x| x),
        "int" => unary(f64::trunc),
        "bool" => Ok(Value::Bool(
            args.first().map(|a| eval(a, ctx)).transpose()?.is_some_and(|v| v.truthy()),
        )),
        "round" => {
            let x = numeric_arg(args, 0, ctx, name)?;
            let digits = if args.len() > 1 { numeric_arg(args, 1, ctx, name)?.unwrap_or(0.0) } else { 0.0 };
            let scale = 10f64.powi(digits as i32);
            Ok(x.map(|x| Value::num((x * scale).round() / scale)).unwrap_or(Value::Null))
        }
        "min" | "max" | "np.minimum" | "np.maximum" | "numpy.minimum" | "numpy.maximum" => {
            let mut values = Vec::with_capacity(args.len());
            for (idx, _) in args.iter().enumerate() {
                match numeric_arg(args, idx, ctx, name)? {
                    Some(v) => values.push(v),
                    None => return Ok(Value::Null),
                }
            }
            let take_min = name.ends_with("min") || name.ends_with("minimum");
            let folded = values
                .into_iter()
                .reduce(|a, b| if take_min { a.min(b) } else { a.max(b) });
            Ok(folded.map(Value::num).unwrap_or(Value::Null))
        }
        "np.where" | "numpy.where" => {
            if args.len() != 3 {
                return Err(EvalError::Type("np.where() takes 3 arguments".to_string()));
            }
            if eval(&args[0], ctx)?.truthy() {
                eval(&args[1], ctx)
            } else {
                eval(&args[2], ctx)
            }
        }
        "np.isnan" | "numpy.isnan" | "pd.isna" | "pd.isnull" | "pandas.isna" => {
            let v = args.first().map(|a| eval(a, ctx)).transpose()?;
            Ok(Value::Bool(matches!(v, None | Some(Value::Null))))
        }
        other => Err(EvalError::UnknownFunction(other.to_string())),
    }
}

fn method(recv: &Expr, name: &str, args: &[Expr], ctx: RowContext<'_>) -> Result<Value, EvalError> {
    match name {
        "shift" => {
            let periods = match args.first() {
                None => 1.0,
                Some(Expr::Literal(Value::Num(n))) => *n,
                Some(Expr::Unary(UnaryOp::Neg, inner)) if matches!(**inner, Expr::Literal(Value::Num(_))) => {
                    return Err(EvalError::Unsupported("negative shift looks ahead in time".to_string()));
                }
                Some(_) => return Err(EvalError::Unsupported("shift() needs a literal period".to_string())),
            };
            if periods == 0.0 {
                return eval(recv, ctx);
            }
            if periods != 1.0 {
                return Err(EvalError::Unsupported(format!("shift({periods}) beyond D-1")));
            }
            match ctx.previous {
                Some(prev) => eval(recv, RowContext { current: prev, previous: None }),
                None => Ok(Value::Null),
            }
        }
        "astype" => {
            let v = eval(recv, ctx)?;
            let target = match args.first() {
                Some(Expr::Name(t)) => t.clone(),
                Some(Expr::Literal(Value::Str(t))) => t.clone(),
                _ => "float".to_string(),
            };
            let target = target.trim_start_matches("np.").to_string();
            if target.starts_with("int") || target.starts_with("uint") {
                Ok(Value::Num(if v.truthy() { v.as_f64().map(f64::trunc).unwrap_or(0.0) } else { 0.0 }))
            } else if target == "bool" {
                Ok(Value::Bool(v.truthy()))
            } else {
                Ok(v.as_f64().map(Value::num).unwrap_or(Value::Null))
            }
        }
        "abs" => {
            let v = eval(recv, ctx)?;
            Ok(v.as_f64().map(|x| Value::num(x.abs())).unwrap_or(Value::Null))
        }
        "fillna" => {
            let v = eval(recv, ctx)?;
            if v == Value::Null {
                match args.first() {
                    Some(fill) => eval(fill, ctx),
                    None => Ok(Value::Null),
                }
            } else {
                Ok(v)
            }
        }
        "round" => {
            let v = eval(recv, ctx)?;
            let digits = match args.first() {
                Some(a) => eval(a, ctx)?.as_f64().unwrap_or(0.0),
                None => 0.0,
            };
            let scale = 10f64.powi(digits as i32);
            Ok(v.as_f64().map(|x| Value::num((x * scale).round() / scale)).unwrap_or(Value::Null))
        }
        "clip" => {
            let v = eval(recv, ctx)?;
            let Some(mut x) = v.as_f64() else {
                return Ok(Value::Null);
            };
            if let Some(lo) = args.first().map(|a| eval(a, ctx)).transpose()?.and_then(|v| v.as_f64()) {
                x = x.max(lo);
            }
            if let Some(hi) = args.get(1).map(|a| eval(a, ctx)).transpose()?.and_then(|v| v.as_f64()) {
                x = x.min(hi);
            }
            Ok(Value::num(x))
        }
        "between" => {
            let v = eval(recv, ctx)?;
            let lo = numeric_arg(args, 0, ctx, name)?;
            let hi = numeric_arg(args, 1, ctx, name)?;
            Ok(Value::Bool(match (v.as_f64(), lo, hi) {
                (Some(x), Some(lo), Some(hi)) => x >= lo && x <= hi,
                _ => false,
            }))
        }
        "isna" | "isnull" => Ok(Value::Bool(eval(recv, ctx)? == Value::Null)),
        "notna" | "notnull" => Ok(Value::Bool(eval(recv, ctx)? != Value::Null)),
        "values" | "copy" | "squeeze" => eval(recv, ctx),
        other => Err(EvalError::UnknownFunction(format!(".{other}()"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, f64)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Num(*v)))
            .collect()
    }

    fn eval_on(src: &str, current: &Row, previous: Option<&Row>) -> Value {
        eval(&parse(src).unwrap(), RowContext { current, previous }).unwrap()
    }

    #[test]
    fn test_parse_column_forms() {
        assert_eq!(parse("df['gap']").unwrap(), Expr::Column("gap".into()));
        assert_eq!(parse("df.gap").unwrap(), Expr::Column("gap".into()));
        assert_eq!(parse("gap").unwrap(), Expr::Name("gap".into()));
        assert_eq!(
            parse("np.where(a, 1, 0)").unwrap(),
            Expr::Call(
                "np.where".into(),
                vec![Expr::Name("a".into()), Expr::Literal(Value::Num(1.0)), Expr::Literal(Value::Num(0.0))]
            )
        );
    }

    #[test]
    fn test_query_precedence_of_ampersand() {
        // `a > 1 & b < 2` means (a > 1) & (b < 2), as in DataFrame.query.
        let r = row(&[("a", 2.0), ("b", 1.0)]);
        let expr = parse("df['a'] > 1 & df['b'] < 2").unwrap();
        assert!(matches!(expr, Expr::Binary(BinaryOp::And, _, _)));
        assert_eq!(eval(&expr, RowContext { current: &r, previous: None }).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_negative_threshold_and_chained_compare() {
        let r = row(&[("a", -2.0)]);
        assert_eq!(eval_on("df['a']<-1", &r, None), Value::Bool(true));
        assert_eq!(eval_on("-3 < df['a'] < -1", &r, None), Value::Bool(true));
        assert_eq!(eval_on("-1 < df['a'] < 1", &r, None), Value::Bool(false));
    }

    #[test]
    fn test_arithmetic_and_exponent() {
        let r = row(&[("close", 10.0), ("volume", 2e6)]);
        assert_eq!(eval_on("df.close * df.volume >= 2e7", &r, None), Value::Bool(true));
        assert_eq!(eval_on("-2 ** 2", &r, None), Value::Num(-4.0));
        assert_eq!(eval_on("7 // 2 + 7 % 2", &r, None), Value::Num(4.0));
    }

    #[test]
    fn test_shift_reads_previous_session() {
        let today = row(&[("close", 11.0)]);
        let yesterday = row(&[("close", 10.0)]);
        assert_eq!(
            eval_on("df['close'] > df['close'].shift(1) * 1.05", &today, Some(&yesterday)),
            Value::Bool(true)
        );
        // No D-1 row: comparison with a missing value is false.
        assert_eq!(eval_on("df['close'] > df['close'].shift(1)", &today, None), Value::Bool(false));
    }

    #[test]
    fn test_negative_shift_rejected() {
        let r = row(&[("close", 1.0)]);
        let err = eval(&parse("df.close.shift(-1)").unwrap(), RowContext { current: &r, previous: None });
        assert!(matches!(err, Err(EvalError::Unsupported(_))));
    }

    #[test]
    fn test_astype_and_np_where() {
        let r = row(&[("a", 3.0)]);
        assert_eq!(eval_on("(df['a'] > 1).astype(int)", &r, None), Value::Num(1.0));
        assert_eq!(eval_on("np.where(df['a'] > 5, 1, 0)", &r, None), Value::Num(0.0));
        assert_eq!(eval_on("~(df['a'] > 1)", &r, None), Value::Bool(false));
    }

    #[test]
    fn test_division_by_zero_is_missing() {
        let r = row(&[("a", 1.0), ("b", 0.0)]);
        assert_eq!(eval_on("df.a / df.b", &r, None), Value::Null);
        assert_eq!(eval_on("(df.a / df.b).fillna(0)", &r, None), Value::Num(0.0));
    }

    #[test]
    fn test_unknown_column_errors() {
        let r = row(&[]);
        let err = eval(&parse("df['missing'] > 1").unwrap(), RowContext { current: &r, previous: None });
        assert_eq!(err, Err(EvalError::UnknownColumn("missing".into())));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("a >").is_err());
        assert!(parse("(a > 1").is_err());
        assert!(parse("a $ b").is_err());
        assert!(parse("df[0]").is_err());
    }

    #[test]
    fn test_columns_collected_once() {
        let expr = parse("(df['a'] > 1) & (df['a'] < df['b'])").unwrap();
        assert_eq!(expr.columns(), vec!["a".to_string(), "b".to_string()]);
    }
}
