use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::{Error, Result};

/// Compiled form of a field-mapping expression.
///
/// The language covers what connector mappings actually use: dot/bracket
/// paths rooted at the record (`.repo.owner.login`, `.labels[0]`,
/// `.["spaced key"]`), literals, `==`/`!=` comparisons, `and`/`or`, and the
/// `//` fallback operator (left unless it is absent, null or false).
#[derive(Debug)]
pub struct CompiledExpression {
    source: String,
    ast: Expr,
}

/// Instance-scoped compile cache, keyed by the normalized expression string.
///
/// Owned by a `TransformEngine` rather than living in a module global so
/// multiple pipelines can coexist in one process without cross-contamination.
#[derive(Debug, Default)]
pub struct ExpressionCache {
    compiled: DashMap<String, Arc<CompiledExpression>>,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile once per normalized source; later calls return the cached form.
    pub fn compile(&self, source: &str) -> Result<Arc<CompiledExpression>> {
        let normalized = source.trim().to_string();
        if let Some(hit) = self.compiled.get(&normalized) {
            return Ok(hit.value().clone());
        }
        let ast = Parser::new(&normalized).parse()?;
        let compiled = Arc::new(CompiledExpression {
            source: normalized.clone(),
            ast,
        });
        self.compiled.insert(normalized, compiled.clone());
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

impl CompiledExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a record. Absent paths yield `None`.
    pub fn eval(&self, record: &Value) -> Option<Value> {
        self.ast.eval(record)
    }

    /// Boolean-typed evaluation for selectors; anything non-boolean is a
    /// typed error rather than a silent coercion.
    pub fn eval_selector(&self, record: &Value, kind: &str) -> Result<bool> {
        match self.eval(record) {
            Some(Value::Bool(b)) => Ok(b),
            other => Err(Error::SelectorNotBoolean {
                kind: kind.to_string(),
                value: other
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "absent".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    /// Bare `.`, the whole record.
    This,
    Path(Vec<PathSeg>),
    Literal(Value),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `a // b`: b when a is absent, null or false.
    Alt(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum PathSeg {
    Key(String),
    Index(usize),
}

impl Expr {
    fn eval(&self, record: &Value) -> Option<Value> {
        match self {
            Self::This => Some(record.clone()),
            Self::Path(segs) => {
                let mut cur = record;
                for seg in segs {
                    cur = match seg {
                        PathSeg::Key(k) => cur.as_object()?.get(k)?,
                        PathSeg::Index(i) => cur.as_array()?.get(*i)?,
                    };
                }
                Some(cur.clone())
            }
            Self::Literal(v) => Some(v.clone()),
            Self::Eq(a, b) => Some(Value::Bool(normalize(a.eval(record)) == normalize(b.eval(record)))),
            Self::Ne(a, b) => Some(Value::Bool(normalize(a.eval(record)) != normalize(b.eval(record)))),
            Self::And(a, b) => Some(Value::Bool(truthy(&a.eval(record)) && truthy(&b.eval(record)))),
            Self::Or(a, b) => Some(Value::Bool(truthy(&a.eval(record)) || truthy(&b.eval(record)))),
            Self::Alt(a, b) => {
                let left = a.eval(record);
                if truthy(&left) {
                    left
                } else {
                    b.eval(record)
                }
            }
        }
    }
}

/// Absent and null compare equal.
fn normalize(v: Option<Value>) -> Value {
    v.unwrap_or(Value::Null)
}

fn truthy(v: &Option<Value>) -> bool {
    !matches!(v, None | Some(Value::Null) | Some(Value::Bool(false)))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dot,
    Ident(String),
    Str(String),
    Number(serde_json::Number),
    True,
    False,
    Null,
    LBracket,
    RBracket,
    LParen,
    RParen,
    EqEq,
    NotEq,
    And,
    Or,
    Alt,
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            tokens: Vec::new(),
            pos: 0,
        }
    }

    fn err(&self, reason: impl Into<String>) -> Error {
        Error::InvalidExpression {
            expression: self.source.to_string(),
            reason: reason.into(),
        }
    }

    fn parse(mut self) -> Result<Expr> {
        self.lex()?;
        let expr = self.parse_alt()?;
        if self.pos != self.tokens.len() {
            return Err(self.err("trailing tokens"));
        }
        Ok(expr)
    }

    fn lex(&mut self) -> Result<()> {
        let chars: Vec<char> = self.source.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match c {
                ' ' | '\t' | '\n' | '\r' => i += 1,
                '.' => {
                    self.tokens.push(Token::Dot);
                    i += 1;
                }
                '[' => {
                    self.tokens.push(Token::LBracket);
                    i += 1;
                }
                ']' => {
                    self.tokens.push(Token::RBracket);
                    i += 1;
                }
                '(' => {
                    self.tokens.push(Token::LParen);
                    i += 1;
                }
                ')' => {
                    self.tokens.push(Token::RParen);
                    i += 1;
                }
                '=' if chars.get(i + 1) == Some(&'=') => {
                    self.tokens.push(Token::EqEq);
                    i += 2;
                }
                '!' if chars.get(i + 1) == Some(&'=') => {
                    self.tokens.push(Token::NotEq);
                    i += 2;
                }
                '/' if chars.get(i + 1) == Some(&'/') => {
                    self.tokens.push(Token::Alt);
                    i += 2;
                }
                '"' => {
                    let mut s = String::new();
                    i += 1;
                    loop {
                        match chars.get(i) {
                            Some('"') => {
                                i += 1;
                                break;
                            }
                            Some('\\') => {
                                let escaped = chars
                                    .get(i + 1)
                                    .ok_or_else(|| self.err("unterminated escape"))?;
                                s.push(match escaped {
                                    'n' => '\n',
                                    't' => '\t',
                                    other => *other,
                                });
                                i += 2;
                            }
                            Some(other) => {
                                s.push(*other);
                                i += 1;
                            }
                            None => return Err(self.err("unterminated string literal")),
                        }
                    }
                    self.tokens.push(Token::Str(s));
                }
                c if c.is_ascii_digit() || c == '-' => {
                    let start = i;
                    i += 1;
                    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                        // A '.' starting a new path segment ends the number.
                        if chars[i] == '.' && !chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
                        {
                            break;
                        }
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    // Keep integers integral so `.x == 1` matches a JSON 1.
                    let n = if text.contains('.') {
                        text.parse::<f64>()
                            .ok()
                            .and_then(serde_json::Number::from_f64)
                    } else {
                        text.parse::<i64>().ok().map(serde_json::Number::from)
                    }
                    .ok_or_else(|| self.err(format!("bad number '{text}'")))?;
                    self.tokens.push(Token::Number(n));
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let start = i;
                    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                    let word: String = chars[start..i].iter().collect();
                    self.tokens.push(match word.as_str() {
                        "true" => Token::True,
                        "false" => Token::False,
                        "null" => Token::Null,
                        "and" => Token::And,
                        "or" => Token::Or,
                        _ => Token::Ident(word),
                    });
                }
                other => return Err(self.err(format!("unexpected character '{other}'"))),
            }
        }
        if self.tokens.is_empty() {
            return Err(self.err("empty expression"));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Token) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_alt(&mut self) -> Result<Expr> {
        let mut left = self.parse_or()?;
        while self.eat(&Token::Alt) {
            let right = self.parse_or()?;
            left = Expr::Alt(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_cmp()?;
        while self.eat(&Token::And) {
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        if self.eat(&Token::EqEq) {
            let right = self.parse_primary()?;
            return Ok(Expr::Eq(Box::new(left), Box::new(right)));
        }
        if self.eat(&Token::NotEq) {
            let right = self.parse_primary()?;
            return Ok(Expr::Ne(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Dot) => self.parse_path(),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_alt()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.err("expected ')'"));
                }
                Ok(inner)
            }
            other => Err(self.err(format!("unexpected token {other:?}"))),
        }
    }

    /// The leading `.` is already consumed.
    fn parse_path(&mut self) -> Result<Expr> {
        let mut segs = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Ident(_)) => {
                    let Some(Token::Ident(name)) = self.bump() else {
                        unreachable!()
                    };
                    segs.push(PathSeg::Key(name));
                    if !self.eat(&Token::Dot) && self.peek() != Some(&Token::LBracket) {
                        break;
                    }
                }
                Some(Token::LBracket) => {
                    self.bump();
                    match self.bump() {
                        Some(Token::Str(key)) => segs.push(PathSeg::Key(key)),
                        Some(Token::Number(n)) if n.as_u64().is_some() => {
                            segs.push(PathSeg::Index(n.as_u64().unwrap_or_default() as usize));
                        }
                        other => {
                            return Err(self.err(format!("bad bracket segment {other:?}")));
                        }
                    }
                    if !self.eat(&Token::RBracket) {
                        return Err(self.err("expected ']'"));
                    }
                    if !self.eat(&Token::Dot) && self.peek() != Some(&Token::LBracket) {
                        break;
                    }
                }
                _ => break,
            }
        }
        if segs.is_empty() {
            Ok(Expr::This)
        } else {
            Ok(Expr::Path(segs))
        }
    }
}
