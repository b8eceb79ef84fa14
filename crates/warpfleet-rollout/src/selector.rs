//! Label selectors.
//!
//! Two input forms compile to the same [`Selector`]:
//!
//! ```text
//! tier=edge,env in (prod,staging),!legacy      expression string
//! { matchLabels: {...}, matchExpressions: [...] }   structured form
//! ```
//!
//! Supported expression forms: `key`, `!key`, `key=value`, `key==value`,
//! `key!=value`, `key in (a,b)`, `key notin (a,b)`. Requirements are ANDed;
//! an empty selector matches every label set.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use warpfleet_state::{LabelSelector, Labels, MatchSelector};

use crate::error::SelectorError;

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// Comparison applied by one requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::In => "in",
            Operator::NotIn => "notin",
            Operator::Exists => "exists",
            Operator::DoesNotExist => "!",
        };
        f.write_str(s)
    }
}

/// One `key <op> values` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => value.is_some_and(|v| self.values.contains(v)),
            // Absent keys satisfy negative set membership.
            Operator::NotEquals | Operator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

/// A compiled label selector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// A selector that matches everything.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Compile either selector form.
    pub fn compile(selector: &LabelSelector) -> Result<Self, SelectorError> {
        match selector {
            LabelSelector::Expression(expr) => Self::parse(expr),
            LabelSelector::Match(structured) => Self::from_match(structured),
        }
    }

    /// Parse the expression string form.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let syntax = LabelSyntax::get()?;
        let tokens = lex(input);
        let mut parser = Parser {
            input,
            tokens,
            pos: 0,
        };
        let mut builder = Builder::new(syntax);
        parser.parse_into(&mut builder)?;
        Ok(builder.finish())
    }

    /// Compile the structured `matchLabels` / `matchExpressions` form.
    pub fn from_match(selector: &MatchSelector) -> Result<Self, SelectorError> {
        let mut builder = Builder::new(LabelSyntax::get()?);
        for (key, value) in &selector.match_labels {
            builder.push(key, Operator::Equals, vec![value.clone()])?;
        }
        for expr in &selector.match_expressions {
            let operator = match expr.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => return Err(SelectorError::UnknownOperator(other.to_string())),
            };
            builder.push(&expr.key, operator, expr.values.clone())?;
        }
        Ok(builder.finish())
    }

    /// Whether every requirement holds for `labels`.
    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }
}

// ── Validation ────────────────────────────────────────────────────

const NAME_PATTERN: &str = r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$";
const PREFIX_PATTERN: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

static LABEL_SYNTAX: LazyLock<Result<LabelSyntax, regex::Error>> = LazyLock::new(|| {
    Ok(LabelSyntax {
        name: Regex::new(NAME_PATTERN)?,
        prefix: Regex::new(PREFIX_PATTERN)?,
    })
});

/// Label key/value syntax rules.
struct LabelSyntax {
    name: Regex,
    prefix: Regex,
}

impl LabelSyntax {
    /// Patterns are compiled once per process.
    fn get() -> Result<&'static Self, SelectorError> {
        LABEL_SYNTAX.as_ref().map_err(|e| e.clone().into())
    }

    fn valid_key(&self, key: &str) -> bool {
        let (prefix, name) = match key.split_once('/') {
            Some((prefix, name)) => (Some(prefix), name),
            None => (None, key),
        };
        let prefix_ok = prefix.is_none_or(|p| p.len() <= MAX_PREFIX_LEN && self.prefix.is_match(p));
        prefix_ok && name.len() <= MAX_NAME_LEN && self.name.is_match(name)
    }

    fn valid_value(&self, value: &str) -> bool {
        value.is_empty() || (value.len() <= MAX_NAME_LEN && self.name.is_match(value))
    }
}

struct Builder {
    syntax: &'static LabelSyntax,
    requirements: Vec<Requirement>,
}

impl Builder {
    fn new(syntax: &'static LabelSyntax) -> Self {
        Self {
            syntax,
            requirements: Vec::new(),
        }
    }

    fn push(
        &mut self,
        key: &str,
        operator: Operator,
        values: Vec<String>,
    ) -> Result<(), SelectorError> {
        if !self.syntax.valid_key(key) {
            return Err(SelectorError::InvalidKey(key.to_string()));
        }
        match operator {
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                return Err(SelectorError::UnexpectedValues {
                    key: key.to_string(),
                    operator: operator.to_string(),
                });
            }
            Operator::In | Operator::NotIn if values.is_empty() => {
                return Err(SelectorError::MissingValues {
                    key: key.to_string(),
                    operator: operator.to_string(),
                });
            }
            _ => {}
        }
        if let Some(bad) = values.iter().find(|v| !self.syntax.valid_value(v)) {
            return Err(SelectorError::InvalidValue {
                key: key.to_string(),
                value: bad.clone(),
            });
        }
        self.requirements.push(Requirement {
            key: key.to_string(),
            operator,
            values: values.into_iter().collect(),
        });
        Ok(())
    }

    fn finish(mut self) -> Selector {
        // Stable order so equal selectors compare equal.
        self.requirements.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then_with(|| a.operator.to_string().cmp(&b.operator.to_string()))
        });
        Selector {
            requirements: self.requirements,
        }
    }
}

// ── Expression lexer ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Bang,
    Eq,
    NotEq,
    LParen,
    RParen,
    Comma,
}

fn is_special(c: char) -> bool {
    matches!(c, '!' | '=' | '(' | ')' | ',') || c.is_whitespace()
}

/// Tokens paired with their byte offset in the input.
fn lex(input: &str) -> Vec<(usize, Token)> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push((offset, Token::LParen));
            }
            ')' => {
                chars.next();
                tokens.push((offset, Token::RParen));
            }
            ',' => {
                chars.next();
                tokens.push((offset, Token::Comma));
            }
            '!' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    tokens.push((offset, Token::NotEq));
                } else {
                    tokens.push((offset, Token::Bang));
                }
            }
            '=' => {
                chars.next();
                // `==` is an alias of `=`.
                chars.next_if(|&(_, c)| c == '=');
                tokens.push((offset, Token::Eq));
            }
            _ => {
                let mut ident = String::new();
                while let Some((_, c)) = chars.next_if(|&(_, c)| !is_special(c)) {
                    ident.push(c);
                }
                tokens.push((offset, Token::Ident(ident)));
            }
        }
    }
    tokens
}

// ── Expression parser ─────────────────────────────────────────────

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(self.input.len())
    }

    fn error(&self, message: impl Into<String>) -> SelectorError {
        SelectorError::Syntax {
            input: self.input.to_string(),
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, SelectorError> {
        match self.peek() {
            Some(Token::Ident(_)) => match self.next() {
                Some(Token::Ident(s)) => Ok(s),
                _ => Err(self.error(format!("expected {what}"))),
            },
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    fn parse_into(&mut self, builder: &mut Builder) -> Result<(), SelectorError> {
        if self.peek().is_none() {
            return Ok(());
        }
        loop {
            self.parse_requirement(builder)?;
            match self.next() {
                None => return Ok(()),
                Some(Token::Comma) => {}
                Some(_) => {
                    self.pos -= 1;
                    return Err(self.error("expected ',' between requirements"));
                }
            }
        }
    }

    fn parse_requirement(&mut self, builder: &mut Builder) -> Result<(), SelectorError> {
        if self.peek() == Some(&Token::Bang) {
            self.next();
            let key = self.expect_ident("label key after '!'")?;
            return builder.push(&key, Operator::DoesNotExist, Vec::new());
        }

        let key = self.expect_ident("label key")?;
        match self.peek() {
            None | Some(Token::Comma) => builder.push(&key, Operator::Exists, Vec::new()),
            Some(Token::Eq) | Some(Token::NotEq) => {
                let operator = match self.next() {
                    Some(Token::NotEq) => Operator::NotEquals,
                    _ => Operator::Equals,
                };
                // `key=` selects the empty value.
                let value = match self.peek() {
                    None | Some(Token::Comma) => String::new(),
                    _ => self.expect_ident("label value")?,
                };
                builder.push(&key, operator, vec![value])
            }
            Some(Token::Ident(word)) if word == "in" || word == "notin" => {
                let operator = if word == "in" {
                    Operator::In
                } else {
                    Operator::NotIn
                };
                self.next();
                let values = self.parse_value_set()?;
                builder.push(&key, operator, values)
            }
            Some(_) => Err(self.error(format!("expected operator after {key:?}"))),
        }
    }

    fn parse_value_set(&mut self) -> Result<Vec<String>, SelectorError> {
        if self.next() != Some(Token::LParen) {
            self.pos = self.pos.saturating_sub(1);
            return Err(self.error("expected '('"));
        }
        let mut values = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.next();
            return Ok(values);
        }
        loop {
            values.push(self.expect_ident("value")?);
            match self.next() {
                Some(Token::Comma) => {}
                Some(Token::RParen) => return Ok(values),
                _ => return Err(self.error("expected ',' or ')' in value set")),
            }
        }
    }
}
