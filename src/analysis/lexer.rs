//! Logical-line scanner for Python-like scanner sources.
//!
//! Produces one `LogicalLine` per statement: comments removed, bracket and
//! backslash continuations joined onto one line, string literals kept
//! verbatim. Also records structural problems (unterminated strings,
//! unbalanced brackets) so the unit loader can reject broken text without
//! a full parser.

use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Logical lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    /// 1-based physical line where the statement starts.
    pub number: usize,
    /// 1-based physical line where the statement ends.
    pub last_line: usize,
    /// Leading whitespace width (tab = 4).
    pub indent: usize,
    /// Statement text without comments, continuations joined.
    pub text: String,
    /// Byte span in the original source, from the first physical line's
    /// start to the end of the last physical line.
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Scan {
    pub lines: Vec<LogicalLine>,
    pub issues: Vec<SyntaxIssue>,
}

impl Scan {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Clone, Copy)]
struct Quote {
    ch: char,
    triple: bool,
    line: usize,
}

/// Split `src` into logical lines.
pub fn scan(src: &str) -> Scan {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut out = Scan::default();

    let mut buf = String::new();
    let mut depth: i32 = 0;
    let mut open_line = 0usize;
    let mut quote: Option<Quote> = None;
    let mut line_no = 1usize;
    let mut start_line = 1usize;
    let mut start_byte = 0usize;
    let mut indent = 0usize;
    let mut leading = true;

    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if let Some(q) = quote {
            buf.push(c);
            if c == '\\' {
                if let Some(n) = next {
                    buf.push(n);
                    if n == '\n' {
                        line_no += 1;
                    }
                    i += 2;
                    continue;
                }
            } else if c == q.ch {
                if !q.triple {
                    quote = None;
                } else if next == Some(q.ch) && chars.get(i + 2).map(|(_, c)| *c) == Some(q.ch) {
                    buf.push(q.ch);
                    buf.push(q.ch);
                    quote = None;
                    i += 3;
                    continue;
                }
            } else if c == '\n' {
                line_no += 1;
                if !q.triple {
                    buf.pop();
                    out.issues.push(SyntaxIssue {
                        line: q.line,
                        message: "unterminated string literal".to_string(),
                    });
                    quote = None;
                    finish_line(&mut out, &mut buf, start_line, line_no - 1, indent, start_byte..pos);
                    depth = 0;
                    start_line = line_no;
                    start_byte = pos + 1;
                    indent = 0;
                    leading = true;
                }
            }
            i += 1;
            continue;
        }

        if leading {
            match c {
                ' ' => {
                    indent += 1;
                    i += 1;
                    continue;
                }
                '\t' => {
                    indent += 4;
                    i += 1;
                    continue;
                }
                '\r' => {
                    i += 1;
                    continue;
                }
                _ => leading = false,
            }
        }

        match c {
            '#' => {
                while i < chars.len() && chars[i].1 != '\n' {
                    i += 1;
                }
                continue;
            }
            '\'' | '"' => {
                let triple = next == Some(c) && chars.get(i + 2).map(|(_, c)| *c) == Some(c);
                quote = Some(Quote { ch: c, triple, line: line_no });
                if triple {
                    buf.push(c);
                    buf.push(c);
                    buf.push(c);
                    i += 3;
                    continue;
                }
                buf.push(c);
            }
            '(' | '[' | '{' => {
                if depth == 0 {
                    open_line = line_no;
                }
                depth += 1;
                buf.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    out.issues.push(SyntaxIssue {
                        line: line_no,
                        message: format!("unmatched closing `{c}`"),
                    });
                    depth = 0;
                }
                buf.push(c);
            }
            '\\' if next == Some('\n') || (next == Some('\r') && chars.get(i + 2).map(|(_, c)| *c) == Some('\n')) => {
                buf.push(' ');
                i += if next == Some('\r') { 3 } else { 2 };
                line_no += 1;
                continue;
            }
            '\r' => {}
            '\n' => {
                if depth > 0 {
                    buf.push(' ');
                    line_no += 1;
                } else {
                    finish_line(&mut out, &mut buf, start_line, line_no, indent, start_byte..pos);
                    line_no += 1;
                    start_line = line_no;
                    start_byte = pos + 1;
                    indent = 0;
                    leading = true;
                }
            }
            _ => buf.push(c),
        }
        i += 1;
    }

    if let Some(q) = quote {
        out.issues.push(SyntaxIssue {
            line: q.line,
            message: "unterminated string literal".to_string(),
        });
    }
    if depth > 0 {
        out.issues.push(SyntaxIssue {
            line: open_line,
            message: "unclosed bracket".to_string(),
        });
    }
    finish_line(&mut out, &mut buf, start_line, line_no, indent, start_byte..src.len());
    out
}

fn finish_line(
    out: &mut Scan,
    buf: &mut String,
    start_line: usize,
    last_line: usize,
    indent: usize,
    span: Range<usize>,
) {
    let text = buf.trim().to_string();
    buf.clear();
    if text.is_empty() {
        return;
    }
    out.lines.push(LogicalLine {
        number: start_line,
        last_line,
        indent,
        text,
        span,
    });
}

/// First structural problem in `src`, if any.
pub fn check_balanced(src: &str) -> Result<(), SyntaxIssue> {
    match scan(src).issues.into_iter().next() {
        Some(issue) => Err(issue),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Token helpers
// ---------------------------------------------------------------------------

/// Identifier tokens outside string literals, in order. Numeric literals
/// (including exponents like `1e6`) are skipped.
pub fn identifiers(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            i = skip_string(&chars, i);
            continue;
        }
        if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '_') {
                i += 1;
            }
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            out.push(chars[start..i].iter().collect());
            continue;
        }
        i += 1;
    }
    out
}

/// Contents of the string literals in `text`, escapes resolved for the
/// common cases.
pub fn string_literals(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            let end = skip_string(&chars, i);
            out.push(unquote(&chars[i..end].iter().collect::<String>()));
            i = end;
            continue;
        }
        i += 1;
    }
    out
}

/// Index just past the string literal starting at `start`.
fn skip_string(chars: &[char], start: usize) -> usize {
    let q = chars[start];
    let triple = chars.get(start + 1) == Some(&q) && chars.get(start + 2) == Some(&q);
    let mut i = start + if triple { 3 } else { 1 };
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            i += 2;
            continue;
        }
        if c == q {
            if !triple {
                return i + 1;
            }
            if chars.get(i + 1) == Some(&q) && chars.get(i + 2) == Some(&q) {
                return i + 3;
            }
        }
        i += 1;
    }
    chars.len()
}

/// Strip the quotes from a literal like `'abc'` or `"""abc"""`.
pub fn unquote(literal: &str) -> String {
    let lit = literal.trim();
    let body = ["\"\"\"", "'''", "\"", "'"]
        .iter()
        .find_map(|q| {
            lit.strip_prefix(q)
                .and_then(|rest| rest.strip_suffix(q).or(Some(rest)))
        })
        .unwrap_or(lit);
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split on `sep` at bracket depth zero, outside strings.
pub fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            let end = skip_string(&chars, i);
            current.extend(&chars[i..end]);
            i = end;
            continue;
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
        if c == sep && depth == 0 {
            parts.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(c);
        }
        i += 1;
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Text between the bracket at `open` and its matching closer, exclusive.
pub fn bracket_body(text: &str, open: usize) -> Option<(usize, usize)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let start_idx = chars.iter().position(|(p, _)| *p == open)?;
    let opener = chars[start_idx].1;
    let closer = match opener {
        '(' => ')',
        '[' => ']',
        '{' => '}',
        _ => return None,
    };
    let plain: Vec<char> = chars.iter().map(|(_, c)| *c).collect();
    let mut depth = 0i32;
    let mut i = start_idx;
    while i < plain.len() {
        let c = plain[i];
        if c == '\'' || c == '"' {
            i = skip_string(&plain, i);
            continue;
        }
        if c == opener {
            depth += 1;
        } else if c == closer {
            depth -= 1;
            if depth == 0 {
                return Some((open + opener.len_utf8(), chars[i].0));
            }
        }
        i += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Blocks and function definitions
// ---------------------------------------------------------------------------

/// Index one past the last line of the block opened by `lines[idx]`.
pub fn block_end(lines: &[LogicalLine], idx: usize) -> usize {
    let indent = lines[idx].indent;
    let mut end = idx + 1;
    while end < lines.len() && lines[end].indent > indent {
        end += 1;
    }
    end
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    pub is_async: bool,
    /// Parameter names, `self`/`cls` and star-args removed.
    pub params: Vec<String>,
    pub indent: usize,
    /// Index of the `def` line in the logical-line list.
    pub def_index: usize,
    /// Logical-line indices of the body.
    pub body: Range<usize>,
    /// Body text for one-liners (`def f(x): return x`).
    pub inline_body: Option<String>,
    /// Byte span covering decorators, signature and body.
    pub span: Range<usize>,
}

impl FunctionDef {
    pub fn body_lines<'a>(&self, lines: &'a [LogicalLine]) -> &'a [LogicalLine] {
        &lines[self.body.clone()]
    }

    /// Every identifier used in the body.
    pub fn referenced_identifiers(&self, lines: &[LogicalLine]) -> Vec<String> {
        let mut ids: Vec<String> = self
            .body_lines(lines)
            .iter()
            .flat_map(|l| identifiers(&l.text))
            .collect();
        if let Some(inline) = &self.inline_body {
            ids.extend(identifiers(inline));
        }
        ids
    }
}

fn def_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(async\s+)?def\s+([A-Za-z_]\w*)\s*\((.*)\)\s*(?:->\s*[^:]+)?:\s*(.*)$")
            .expect("valid def regex")
    })
}

/// Parse a `def` line into (is_async, name, params, inline body).
pub fn parse_def(text: &str) -> Option<(bool, String, Vec<String>, Option<String>)> {
    let caps = def_regex().captures(text)?;
    let is_async = caps.get(1).is_some();
    let name = caps[2].to_string();
    let params = split_top_level(&caps[3], ',')
        .into_iter()
        .filter_map(|p| {
            let p = p.trim();
            if p.is_empty() || p.starts_with('*') || p == "/" {
                return None;
            }
            let name = p
                .split(|c| c == ':' || c == '=')
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            if name.is_empty() || name == "self" || name == "cls" {
                None
            } else {
                Some(name)
            }
        })
        .collect();
    let inline = caps
        .get(4)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());
    Some((is_async, name, params, inline))
}

/// Every `def` in the source, at any nesting depth.
pub fn function_defs(lines: &[LogicalLine]) -> Vec<FunctionDef> {
    let mut defs = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let Some((is_async, name, params, inline_body)) = parse_def(&line.text) else {
            continue;
        };
        let end = block_end(lines, idx);

        let mut first = idx;
        while first > 0 && lines[first - 1].text.starts_with('@') && lines[first - 1].indent == line.indent {
            first -= 1;
        }
        let span_end = if end > idx + 1 {
            lines[end - 1].span.end
        } else {
            line.span.end
        };

        defs.push(FunctionDef {
            name,
            is_async,
            params,
            indent: line.indent,
            def_index: idx,
            body: idx + 1..end,
            inline_body,
            span: lines[first].span.start..span_end,
        });
    }
    defs
}

/// Logical-line range of an `if __name__ == "__main__":` block.
pub fn main_guard(lines: &[LogicalLine]) -> Option<Range<usize>> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"^if\s+(?:__name__\s*==\s*['"]__main__['"]|['"]__main__['"]\s*==\s*__name__)\s*:"#)
            .expect("valid guard regex")
    });
    lines
        .iter()
        .position(|l| l.indent == 0 && re.is_match(&l.text))
        .map(|idx| idx..block_end(lines, idx))
}

/// Remove the common leading indentation from a block of raw text.
pub fn dedent(text: &str) -> String {
    let width = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    text.lines()
        .map(|l| {
            if l.trim().is_empty() {
                ""
            } else {
                l.get(width..).unwrap_or_else(|| l.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_joins_bracket_continuation() {
        let src = "x = (1 +\n     2)\ny = 3\n";
        let scan = scan(src);
        assert!(scan.is_clean());
        assert_eq!(scan.lines.len(), 2);
        assert_eq!(scan.lines[0].text, "x = (1 +      2)");
        assert_eq!(scan.lines[0].number, 1);
        assert_eq!(scan.lines[0].last_line, 2);
        assert_eq!(scan.lines[1].number, 3);
    }

    #[test]
    fn test_scan_strips_comments_not_hashes_in_strings() {
        let scan = scan("a = '#notcomment'  # real comment\n# whole line\nb = 1\n");
        assert_eq!(scan.lines.len(), 2);
        assert_eq!(scan.lines[0].text, "a = '#notcomment'");
    }

    #[test]
    fn test_scan_backslash_continuation() {
        let scan = scan("total = 1 + \\\n    2\n");
        assert_eq!(scan.lines.len(), 1);
        assert!(scan.lines[0].text.starts_with("total = 1 +"));
    }

    #[test]
    fn test_scan_indent_and_triple_strings() {
        let src = "def f():\n    \"\"\"doc\n    more\"\"\"\n    return 1\n";
        let scan = scan(src);
        assert!(scan.is_clean());
        assert_eq!(scan.lines.len(), 3);
        assert_eq!(scan.lines[0].indent, 0);
        assert_eq!(scan.lines[1].indent, 4);
        assert_eq!(scan.lines[2].text, "return 1");
        assert_eq!(scan.lines[2].number, 4);
    }

    #[test]
    fn test_scan_reports_unbalanced() {
        assert!(check_balanced("x = (1 + 2\n").is_err());
        assert!(check_balanced("x = 1)\n").is_err());
        assert!(check_balanced("x = 'abc\n").is_err());
        assert!(check_balanced("x = [1, 2]\n").is_ok());
    }

    #[test]
    fn test_identifiers_skip_strings_and_numbers() {
        let ids = identifiers("df['gap'] > GAP_MIN * 1e6 and helper(x)");
        assert_eq!(ids, vec!["df", "GAP_MIN", "and", "helper", "x"]);
    }

    #[test]
    fn test_string_literals() {
        let lits = string_literals(r#"{"name": "p1", 'logic': 'a>1'}"#);
        assert_eq!(lits, vec!["name", "p1", "logic", "a>1"]);
    }

    #[test]
    fn test_split_top_level() {
        let parts = split_top_level("a, f(b, c), [d, e], 'x,y'", ',');
        assert_eq!(parts, vec!["a", "f(b, c)", "[d, e]", "'x,y'"]);
    }

    #[test]
    fn test_bracket_body() {
        let text = "x = [1, (2, 3)] + y";
        let open = text.find('[').unwrap();
        let (s, e) = bracket_body(text, open).unwrap();
        assert_eq!(&text[s..e], "1, (2, 3)");
    }

    #[test]
    fn test_function_defs() {
        let src = "import x\n\n@cache\ndef helper(df, n=3):\n    return df\n\nasync def main(start_date, end_date):\n    await go()\n    return 1\n\nrun = 2\n";
        let scan = scan(src);
        let defs = function_defs(&scan.lines);
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "helper");
        assert_eq!(defs[0].params, vec!["df", "n"]);
        assert!(src[defs[0].span.clone()].starts_with("@cache"));
        assert!(defs[1].is_async);
        assert_eq!(defs[1].params, vec!["start_date", "end_date"]);
        assert_eq!(defs[1].body.len(), 2);
    }

    #[test]
    fn test_parse_def_inline_body() {
        let (is_async, name, params, inline) = parse_def("def big(x): return x > 5").unwrap();
        assert!(!is_async);
        assert_eq!(name, "big");
        assert_eq!(params, vec!["x"]);
        assert_eq!(inline.as_deref(), Some("return x > 5"));
    }

    #[test]
    fn test_main_guard() {
        let scan = scan("def main():\n    pass\n\nif __name__ == \"__main__\":\n    main()\n");
        let guard = main_guard(&scan.lines).unwrap();
        assert_eq!(guard, 2..4);
    }

    #[test]
    fn test_dedent() {
        assert_eq!(dedent("    def f():\n        return 1"), "def f():\n    return 1");
        assert_eq!(dedent("    a\n   x\n\u{a0}\u{a0}\n    b"), " a\nx\n\n b");
    }
}
