//! Filter expressions understood by the search engine
//!
//! The engine takes filters as strings such as
//! `EventType=resource_detected AND ExecutionID=general_1700000000`.
//! Queries are built as a [`Filter`] tree and rendered at the engine boundary;
//! the in-memory engine parses the string back and evaluates it per document.

use crate::storage::document::Document;
use crate::storage::error::{StorageError, StorageResult};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Boolean filter over attribute equality
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq(String, String),
    Ne(String, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Eq(attribute.into(), value.into())
    }

    pub fn ne(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Ne(attribute.into(), value.into())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Conjunction, flattening nested ANDs
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), right) => {
                left.push(right);
                Filter::And(left)
            }
            (left, right) => Filter::And(vec![left, right]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::Or(mut left), Filter::Or(right)) => {
                left.extend(right);
                Filter::Or(left)
            }
            (Filter::Or(mut left), right) => {
                left.push(right);
                Filter::Or(left)
            }
            (left, right) => Filter::Or(vec![left, right]),
        }
    }

    /// AND in caller-supplied `key=value` pairs, in key order.
    ///
    /// Keys must be plain attribute paths; anything else is an invalid query.
    pub fn and_all<'a, I>(self, pairs: I) -> StorageResult<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort();

        let mut filter = self;
        for (key, value) in pairs {
            if !is_attribute_path(key) {
                return Err(StorageError::InvalidQuery(format!(
                    "filter key {:?} is not a valid attribute",
                    key
                )));
            }
            filter = filter.and(Filter::eq(key.as_str(), value.as_str()));
        }
        Ok(filter)
    }

    /// Every attribute the filter touches
    pub fn attributes(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_attributes(&mut out);
        out
    }

    fn collect_attributes<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Filter::Eq(attr, _) | Filter::Ne(attr, _) => {
                out.insert(attr.as_str());
            }
            Filter::And(children) | Filter::Or(children) => {
                children.iter().for_each(|c| c.collect_attributes(out));
            }
            Filter::Not(inner) => inner.collect_attributes(out),
        }
    }

    /// Evaluate against a document
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(attr, value) => lookup(doc, attr).is_some_and(|v| value_equals(v, value)),
            Filter::Ne(attr, value) => !lookup(doc, attr).is_some_and(|v| value_equals(v, value)),
            Filter::And(children) => children.iter().all(|c| c.matches(doc)),
            Filter::Or(children) => children.iter().any(|c| c.matches(doc)),
            Filter::Not(inner) => !inner.matches(doc),
        }
    }

    /// Parse the engine's filter syntax
    pub fn parse(input: &str) -> StorageResult<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(StorageError::InvalidFilter(format!(
                "unexpected trailing input in {:?}",
                input
            )));
        }
        Ok(filter)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Eq(attr, value) => write!(f, "{}={}", attr, render_value(value)),
            Filter::Ne(attr, value) => write!(f, "{}!={}", attr, render_value(value)),
            Filter::And(children) => write_joined(f, children, " AND ", |c| matches!(c, Filter::Or(_))),
            Filter::Or(children) => write_joined(f, children, " OR ", |_| false),
            Filter::Not(inner) => match inner.as_ref() {
                Filter::Eq(..) | Filter::Ne(..) => write!(f, "NOT {}", inner),
                _ => write!(f, "NOT ({})", inner),
            },
        }
    }
}

fn write_joined(
    f: &mut fmt::Formatter<'_>,
    children: &[Filter],
    separator: &str,
    needs_parens: impl Fn(&Filter) -> bool,
) -> fmt::Result {
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        if needs_parens(child) {
            write!(f, "({})", child)?;
        } else {
            write!(f, "{}", child)?;
        }
    }
    Ok(())
}

/// Collapse the spaced comparison operators the engine rejects.
///
/// Quoted values are copied untouched.
pub fn normalize(filter: &str) -> String {
    let mut out = String::with_capacity(filter.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut rest = filter;

    while let Some(c) = rest.chars().next() {
        if quote.is_none() {
            if let Some(op) = [" != ", " = "].into_iter().find(|op| rest.starts_with(*op)) {
                out.push_str(op.trim());
                rest = &rest[op.len()..];
                continue;
            }
        }

        match quote {
            None if c == '"' || c == '\'' => quote = Some(c),
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            _ => {}
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

fn is_attribute_path(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && !key.ends_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

fn is_bare_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '=' | '!' | '(' | ')' | '"' | '\'')
}

fn render_value(value: &str) -> String {
    let bare = !value.is_empty()
        && value.chars().all(is_bare_char)
        && !matches!(value, "AND" | "OR" | "NOT");
    if bare {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn value_equals(actual: &Value, expected: &str) -> bool {
    match actual {
        Value::String(s) => s == expected,
        Value::Number(n) => match (n.as_f64(), expected.parse::<f64>()) {
            (Some(a), Ok(b)) => a == b,
            _ => n.to_string() == expected,
        },
        Value::Bool(b) => b.to_string() == expected,
        Value::Array(items) => items.iter().any(|item| value_equals(item, expected)),
        Value::Null | Value::Object(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Eq,
    Ne,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> StorageResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(StorageError::InvalidFilter(format!(
                        "expected '!=' in {:?}",
                        input
                    )));
                }
                tokens.push(Token::Ne);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => break,
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => value.push(ch),
                        None => {
                            return Err(StorageError::InvalidFilter(format!(
                                "unterminated quote in {:?}",
                                input
                            )))
                        }
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if !is_bare_char(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Word(w)) if w == keyword)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> StorageResult<Filter> {
        let mut filter = self.parse_and()?;
        while self.peek_keyword("OR") {
            self.pos += 1;
            filter = filter.or(self.parse_and()?);
        }
        Ok(filter)
    }

    fn parse_and(&mut self) -> StorageResult<Filter> {
        let mut filter = self.parse_not()?;
        while self.peek_keyword("AND") {
            self.pos += 1;
            filter = filter.and(self.parse_not()?);
        }
        Ok(filter)
    }

    fn parse_not(&mut self) -> StorageResult<Filter> {
        if self.peek_keyword("NOT") {
            self.pos += 1;
            return Ok(Filter::not(self.parse_not()?));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> StorageResult<Filter> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(StorageError::InvalidFilter("missing closing parenthesis".to_string())),
                }
            }
            Some(Token::Word(attribute)) => {
                let op = self.next();
                let value = match self.next() {
                    Some(Token::Word(v)) | Some(Token::Quoted(v)) => v,
                    other => {
                        return Err(StorageError::InvalidFilter(format!(
                            "expected a value after {}, found {:?}",
                            attribute, other
                        )))
                    }
                };
                match op {
                    Some(Token::Eq) => Ok(Filter::Eq(attribute, value)),
                    Some(Token::Ne) => Ok(Filter::Ne(attribute, value)),
                    other => Err(StorageError::InvalidFilter(format!(
                        "expected '=' or '!=' after {}, found {:?}",
                        attribute, other
                    ))),
                }
            }
            other => Err(StorageError::InvalidFilter(format!(
                "expected a condition, found {:?}",
                other
            ))),
        }
    }
}
