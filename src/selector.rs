//! The filter-expression language: keyword, parameter, platform, runtime,
//! and status predicates applied to specs before scheduling.
//!
//! ```text
//! expr    := or_expr
//! or_expr := and_expr ( "or" and_expr )*
//! and_expr:= unary ( "and" unary )*
//! unary   := "not" unary | "(" expr ")" | cmp
//! cmp     := ident cmp_op literal | ident "in" "[" literal ("," literal)* "]" | ident
//! cmp_op  := "==" | "!=" | "<" | "<=" | ">" | ">="
//! ```

use std::fmt;

use thiserror::Error;

use crate::spec::{ParamValue, TestSpec};
use crate::status::Status;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("unexpected end of filter expression")]
    UnexpectedEnd,
    #[error("unexpected token '{0}' in filter expression")]
    UnexpectedToken(String),
    #[error("ident '{0}' does not support comparison, only membership test")]
    NotComparable(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "{s}"),
            Literal::Num(n) => write!(f, "{n}"),
            Literal::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(String, CmpOp, Literal),
    In(String, Vec<Literal>),
    Membership(String),
}

/// The information a filter expression can be evaluated against: a spec and
/// (optionally) a cached status from a prior session, for rerun selection.
pub struct SelectionContext<'a> {
    pub spec: &'a TestSpec,
    pub cached_status: Option<Status>,
}

pub fn parse(input: &str) -> Result<Expr, SelectorError> {
    let tokens = tokenize(input);
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(SelectorError::UnexpectedToken(parser.tokens[parser.pos].clone()));
    }
    Ok(expr)
}

pub fn eval(expr: &Expr, ctx: &SelectionContext) -> bool {
    match expr {
        Expr::And(a, b) => eval(a, ctx) && eval(b, ctx),
        Expr::Or(a, b) => eval(a, ctx) || eval(b, ctx),
        Expr::Not(a) => !eval(a, ctx),
        Expr::Membership(ident) => ctx.spec.keywords.contains(ident),
        Expr::Cmp(ident, op, lit) => {
            let Some(value) = resolve(ident, ctx) else { return false };
            compare(&value, op, lit)
        }
        Expr::In(ident, options) => {
            let Some(value) = resolve(ident, ctx) else { return false };
            options.iter().any(|lit| compare(&value, &CmpOp::Eq, lit))
        }
    }
}

fn resolve(ident: &str, ctx: &SelectionContext) -> Option<ParamValue> {
    if let Some(name) = ident.strip_prefix("param.") {
        return ctx.spec.parameters.get(name).cloned();
    }
    match ident {
        "timeout" => Some(ParamValue::Float(ctx.spec.timeout.map(|d| d.as_secs_f64()).unwrap_or(0.0))),
        "runtime" => Some(ParamValue::Float(
            ctx.spec.runtime_estimate.map(|d| d.as_secs_f64()).unwrap_or(0.0),
        )),
        "enabled" => Some(ParamValue::Bool(ctx.spec.enabled)),
        "platform" => Some(ParamValue::String(std::env::consts::OS.to_string())),
        "status" => ctx.cached_status.map(|s| ParamValue::String(format!("{s:?}").to_lowercase())),
        _ => None,
    }
}

fn compare(value: &ParamValue, op: &CmpOp, lit: &Literal) -> bool {
    let lit_value = match lit {
        Literal::Str(s) => ParamValue::String(s.clone()),
        Literal::Num(n) => ParamValue::Float(*n),
        Literal::Bool(b) => ParamValue::Bool(*b),
    };
    let Some(ord) = value.compare(&lit_value) else { return false };
    match op {
        CmpOp::Eq => ord == std::cmp::Ordering::Equal,
        CmpOp::Ne => ord != std::cmp::Ordering::Equal,
        CmpOp::Lt => ord == std::cmp::Ordering::Less,
        CmpOp::Le => ord != std::cmp::Ordering::Greater,
        CmpOp::Gt => ord == std::cmp::Ordering::Greater,
        CmpOp::Ge => ord != std::cmp::Ordering::Less,
    }
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | '[' | ']' | ',' => {
                tokens.push(c.to_string());
                chars.next();
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                for ch in chars.by_ref() {
                    if ch == quote {
                        break;
                    }
                    s.push(ch);
                }
                tokens.push(format!("\"{s}\""));
            }
            '=' | '!' | '<' | '>' => {
                let mut op = String::new();
                op.push(c);
                chars.next();
                if chars.peek() == Some(&'=') {
                    op.push('=');
                    chars.next();
                }
                tokens.push(op);
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || "()[],=!<>\"'".contains(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(word);
            }
        }
    }
    tokens
}

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(|s| s.as_str())
    }

    fn next(&mut self) -> Result<String, SelectorError> {
        let tok = self.tokens.get(self.pos).cloned().ok_or(SelectorError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn parse_or(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.parse_and()?;
        while self.peek().map(|t| t.eq_ignore_ascii_case("or")).unwrap_or(false) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.parse_unary()?;
        while self.peek().map(|t| t.eq_ignore_ascii_case("and")).unwrap_or(false) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SelectorError> {
        match self.peek() {
            Some(t) if t.eq_ignore_ascii_case("not") => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some("(") => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.next()? {
                    tok if tok == ")" => Ok(inner),
                    tok => Err(SelectorError::UnexpectedToken(tok)),
                }
            }
            _ => self.parse_cmp(),
        }
    }

    fn parse_cmp(&mut self) -> Result<Expr, SelectorError> {
        let ident = self.next()?;

        match self.peek() {
            Some(t) if t.eq_ignore_ascii_case("in") => {
                self.pos += 1;
                match self.next()? {
                    tok if tok == "[" => {}
                    tok => return Err(SelectorError::UnexpectedToken(tok)),
                }
                let mut options = Vec::new();
                loop {
                    options.push(self.parse_literal()?);
                    match self.peek() {
                        Some(",") => {
                            self.pos += 1;
                        }
                        Some("]") => {
                            self.pos += 1;
                            break;
                        }
                        _ => return Err(SelectorError::UnexpectedEnd),
                    }
                }
                Ok(Expr::In(ident, options))
            }
            Some("==") | Some("!=") | Some("<") | Some("<=") | Some(">") | Some(">=") => {
                let op_tok = self.next()?;
                let op = match op_tok.as_str() {
                    "==" => CmpOp::Eq,
                    "!=" => CmpOp::Ne,
                    "<" => CmpOp::Lt,
                    "<=" => CmpOp::Le,
                    ">" => CmpOp::Gt,
                    ">=" => CmpOp::Ge,
                    _ => unreachable!(),
                };
                let lit = self.parse_literal()?;
                if is_bare_keyword(&ident) {
                    return Err(SelectorError::NotComparable(ident));
                }
                Ok(Expr::Cmp(ident, op, lit))
            }
            _ => Ok(Expr::Membership(ident)),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, SelectorError> {
        let tok = self.next()?;
        if let Some(s) = tok.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            return Ok(Literal::Str(s.to_string()));
        }
        if tok.eq_ignore_ascii_case("true") {
            return Ok(Literal::Bool(true));
        }
        if tok.eq_ignore_ascii_case("false") {
            return Ok(Literal::Bool(false));
        }
        if let Ok(n) = tok.parse::<f64>() {
            return Ok(Literal::Num(n));
        }
        Ok(Literal::Str(tok))
    }
}

fn is_bare_keyword(ident: &str) -> bool {
    !ident.starts_with("param.")
        && !matches!(ident, "timeout" | "runtime" | "enabled" | "platform" | "status")
}

/// Apply a filter expression to a set of specs, masking any that don't
/// match, then propagate the mask to every transitive descendant.
pub fn apply_filter(specs: &mut [TestSpec], expr: &Expr) {
    let deps: Vec<Vec<usize>> = specs
        .iter()
        .map(|s| {
            s.dependencies
                .iter()
                .filter_map(|(dep_id, _)| specs.iter().position(|s2| &s2.id == dep_id))
                .collect()
        })
        .collect();
    let graph = crate::graph::Graph::new(deps);

    let mut masked = vec![false; specs.len()];
    for (i, spec) in specs.iter().enumerate() {
        let ctx = SelectionContext {
            spec,
            cached_status: None,
        };
        if !eval(expr, &ctx) {
            masked[i] = true;
        }
    }

    for i in 0..specs.len() {
        if masked[i] {
            for d in graph.descendants(i) {
                masked[d] = true;
            }
        }
    }

    for (i, spec) in specs.iter_mut().enumerate() {
        if masked[i] && !spec.masked {
            spec.masked = true;
            spec.mask_reason = Some("dependency masked".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{EnvModifiers, ExpectedOutcome, ResultPredicate, TestSpecId, WorkingDirHints};
    use std::collections::{BTreeMap, HashMap, HashSet};

    fn spec(name: &str, keywords: &[&str]) -> TestSpec {
        TestSpec {
            id: TestSpecId(name.into()),
            name: name.into(),
            family: name.into(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            parameters: BTreeMap::new(),
            dependencies: Vec::new(),
            timeout: Some(std::time::Duration::from_secs(30)),
            runtime_estimate: None,
            resource_request: HashMap::new(),
            working_dir: WorkingDirHints::default(),
            env: EnvModifiers::default(),
            enabled: true,
            expected: ExpectedOutcome::default(),
            command: vec![],
            masked: false,
            mask_reason: None,
            is_composite_base: false,
        }
    }

    #[test]
    fn keyword_membership() {
        let s = spec("a", &["fast"]);
        let expr = parse("fast").unwrap();
        assert!(eval(&expr, &SelectionContext { spec: &s, cached_status: None }));
    }

    #[test]
    fn and_or_not_precedence() {
        let s = spec("a", &["fast"]);
        let expr = parse("not slow and (fast or unit)").unwrap();
        assert!(eval(&expr, &SelectionContext { spec: &s, cached_status: None }));
    }

    #[test]
    fn numeric_comparison_on_timeout() {
        let s = spec("a", &[]);
        let expr = parse("timeout > 10").unwrap();
        assert!(eval(&expr, &SelectionContext { spec: &s, cached_status: None }));
        let expr2 = parse("timeout < 10").unwrap();
        assert!(!eval(&expr2, &SelectionContext { spec: &s, cached_status: None }));
    }

    #[test]
    fn in_expression() {
        let s = spec("a", &[]);
        let expr = parse("param.x in [\"a\", \"b\"]").unwrap();
        let mut s2 = s.clone();
        s2.parameters.insert("x".into(), ParamValue::String("b".into()));
        assert!(eval(&expr, &SelectionContext { spec: &s2, cached_status: None }));
    }

    #[test]
    fn mask_propagates_to_descendants() {
        let a = spec("a", &["skip_me"]);
        let mut b = spec("b", &[]);
        b.dependencies.push((a.id.clone(), ResultPredicate::PassOrDiff));
        let mut specs = vec![a, b];
        let expr = parse("not skip_me").unwrap();
        apply_filter(&mut specs, &expr);
        assert!(specs[0].masked);
        assert!(specs[1].masked);
        assert_eq!(specs[1].mask_reason.as_deref(), Some("dependency masked"));
    }
}
