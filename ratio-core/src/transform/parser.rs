use crate::error::MappingError;
use regex::Regex;
use serde_json::Number;
use std::sync::OnceLock;

/// Parsed form of a mapping rule.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    StrLit(String),
    NumLit(Number),
    BoolLit(bool),
    /// Array literal, e.g. `[rows, "literal"]`.
    Array(Vec<Expr>),
    /// Object template, e.g. `{name: item.file_path, kind: "doc"}`.
    Object(Vec<(String, Expr)>),
    /// Dot path into the transform scope, e.g. `summary.total` or
    /// `rows[0].name`. Paths beginning `item.` are passed to collection
    /// functions as literal item paths.
    Path(String),
    Call {
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    /// `pipeline(initial, [op1, op2, ...])` threading `current`.
    Pipeline {
        initial: Box<Expr>,
        ops: Vec<Expr>,
    },
}

fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\((.*)\)$").expect("static regex"))
}

fn kwarg_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.+)$").expect("static regex"))
}

/// Parse one mapping rule string into an expression tree.
pub fn parse_rule(rule: &str) -> Result<Expr, MappingError> {
    parse_expr(rule.trim())
}

fn parse_expr(s: &str) -> Result<Expr, MappingError> {
    if s.is_empty() {
        return Err(MappingError::new("empty expression"));
    }

    // String literals (no escape processing, matching the rule grammar).
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        return Ok(Expr::StrLit(s[1..s.len() - 1].to_string()));
    }

    if s.starts_with('[') && s.ends_with(']') {
        let mut elements = Vec::new();
        for element in split_top_level(&s[1..s.len() - 1])? {
            elements.push(parse_expr(&element)?);
        }
        return Ok(Expr::Array(elements));
    }

    if s.starts_with('{') && s.ends_with('}') {
        let mut pairs = Vec::new();
        for pair in split_top_level(&s[1..s.len() - 1])? {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| MappingError::new(format!("invalid object template entry: {pair}")))?;
            pairs.push((key.trim().to_string(), parse_expr(value.trim())?));
        }
        return Ok(Expr::Object(pairs));
    }

    if let Some(caps) = call_regex().captures(s) {
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let args_str = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

        if name == "pipeline" {
            return parse_pipeline(args_str);
        }

        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        for raw in split_top_level(args_str)? {
            if let Some(kw) = kwarg_regex().captures(&raw) {
                let param = kw.get(1).map(|m| m.as_str()).unwrap_or_default();
                let value = kw.get(2).map(|m| m.as_str()).unwrap_or_default();
                kwargs.push((param.to_string(), parse_expr(value.trim())?));
            } else {
                args.push(parse_expr(&raw)?);
            }
        }

        return Ok(Expr::Call {
            name: name.to_string(),
            args,
            kwargs,
        });
    }

    if s == "true" {
        return Ok(Expr::BoolLit(true));
    }
    if s == "false" {
        return Ok(Expr::BoolLit(false));
    }
    if let Ok(int) = s.parse::<i64>() {
        return Ok(Expr::NumLit(Number::from(int)));
    }
    if let Ok(float) = s.parse::<f64>() {
        if let Some(number) = Number::from_f64(float) {
            return Ok(Expr::NumLit(number));
        }
    }

    Ok(Expr::Path(s.to_string()))
}

fn parse_pipeline(args_str: &str) -> Result<Expr, MappingError> {
    let args = split_top_level(args_str)?;
    if args.len() != 2 {
        return Err(MappingError::new(
            "pipeline requires exactly 2 arguments: initial_value, [operations]",
        ));
    }

    let initial = parse_expr(&args[0])?;

    let ops_str = args[1].trim();
    if !(ops_str.starts_with('[') && ops_str.ends_with(']')) {
        return Err(MappingError::new("pipeline operations must be an array [...]"));
    }

    let mut ops = Vec::new();
    for op in split_top_level(&ops_str[1..ops_str.len() - 1])? {
        ops.push(parse_expr(&op)?);
    }

    Ok(Expr::Pipeline {
        initial: Box::new(initial),
        ops,
    })
}

/// Split on top-level commas, respecting quotes, brackets, parentheses,
/// and braces.
fn split_top_level(s: &str) -> Result<Vec<String>, MappingError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for ch in s.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }

        match ch {
            '"' | '\'' => {
                quote = Some(ch);
                current.push(ch);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(MappingError::new(format!("unbalanced brackets in '{s}'")));
                }
                current.push(ch);
            }
            ',' if depth == 0 => {
                let part = current.trim().to_string();
                if !part.is_empty() {
                    parts.push(part);
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    if quote.is_some() || depth != 0 {
        return Err(MappingError::new(format!("unbalanced expression: '{s}'")));
    }

    let part = current.trim().to_string();
    if !part.is_empty() {
        parts.push(part);
    }

    Ok(parts)
}
