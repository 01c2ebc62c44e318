//! Tag-membership expressions for dynamic address groups.
//!
//! A dynamic group selects its members with a boolean expression over tag
//! names, e.g. `'web' and ('prod' or 'staging')`. Besides evaluating the
//! expression, [`TagExpr::delta`] answers the question the candidate
//! resolver needs: which tags would have to be added to an object so that it
//! falls inside the group?

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A parsed boolean tag expression. `and` binds tighter than `or`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TagExpr {
    Tag(String),
    And(Vec<TagExpr>),
    Or(Vec<TagExpr>),
}

/// What is still missing for a tag set to satisfy a [`TagExpr`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TagDelta {
    /// Minimal sets of tags, any one of which completes membership. An empty
    /// alternative means the tag set already satisfies the expression.
    pub alternatives: Vec<BTreeSet<String>>,
    /// Tags present in every alternative.
    pub required: BTreeSet<String>,
    /// Tags that only some alternatives need.
    pub optional: BTreeSet<String>,
}

impl TagDelta {
    pub fn is_satisfied(&self) -> bool {
        self.alternatives.iter().any(BTreeSet::is_empty)
    }

    /// True when adding `chosen` would complete at least one alternative.
    pub fn completed_by(&self, chosen: &BTreeSet<String>) -> bool {
        self.alternatives.iter().any(|alt| alt.is_subset(chosen))
    }
}

impl TagExpr {
    pub fn evaluate(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            TagExpr::Tag(name) => tags.contains(name),
            TagExpr::And(children) => children.iter().all(|c| c.evaluate(tags)),
            TagExpr::Or(children) => children.iter().any(|c| c.evaluate(tags)),
        }
    }

    /// Every tag name mentioned anywhere in the expression.
    pub fn tags(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_tags(&mut out);
        out
    }

    fn collect_tags(&self, out: &mut BTreeSet<String>) {
        match self {
            TagExpr::Tag(name) => {
                out.insert(name.clone());
            }
            TagExpr::And(children) | TagExpr::Or(children) => {
                for child in children {
                    child.collect_tags(out);
                }
            }
        }
    }

    /// Compute the tags still needed for `tags` to satisfy this expression.
    pub fn delta(&self, tags: &BTreeSet<String>) -> TagDelta {
        let alternatives = self.additions(tags);
        if alternatives.iter().any(BTreeSet::is_empty) {
            return TagDelta {
                alternatives: vec![BTreeSet::new()],
                ..TagDelta::default()
            };
        }

        let mut required = alternatives.first().cloned().unwrap_or_default();
        for alt in alternatives.iter().skip(1) {
            required = required.intersection(alt).cloned().collect();
        }
        let optional = alternatives
            .iter()
            .flatten()
            .filter(|t| !required.contains(*t))
            .cloned()
            .collect();

        TagDelta {
            alternatives,
            required,
            optional,
        }
    }

    fn additions(&self, tags: &BTreeSet<String>) -> Vec<BTreeSet<String>> {
        match self {
            TagExpr::Tag(name) if tags.contains(name) => vec![BTreeSet::new()],
            TagExpr::Tag(name) => vec![BTreeSet::from([name.clone()])],
            TagExpr::Or(children) => {
                minimize(children.iter().flat_map(|c| c.additions(tags)).collect())
            }
            TagExpr::And(children) => {
                let mut acc = vec![BTreeSet::new()];
                for child in children {
                    let child_alts = child.additions(tags);
                    let mut next = Vec::with_capacity(acc.len() * child_alts.len());
                    for left in &acc {
                        for right in &child_alts {
                            next.push(left.union(right).cloned().collect());
                        }
                    }
                    acc = minimize(next);
                }
                acc
            }
        }
    }
}

/// Drop duplicate alternatives and any alternative that is a superset of
/// another one.
fn minimize(mut alternatives: Vec<BTreeSet<String>>) -> Vec<BTreeSet<String>> {
    alternatives.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    let mut kept: Vec<BTreeSet<String>> = Vec::new();
    for alt in alternatives {
        if !kept.iter().any(|k| k.is_subset(&alt)) {
            kept.push(alt);
        }
    }
    kept
}

// ---------------------------------------------------------------------------
// Parsing and rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Tag(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '\'' | '"' => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == ch => break,
                        Some(c) => name.push(c),
                        None => return Err(EngineError::invalid("tag expression", input)),
                    }
                }
                tokens.push(Token::Tag(name));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | '\'' | '"') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    _ => Token::Tag(word),
                };
                tokens.push(token);
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self) -> EngineError {
        EngineError::invalid("tag expression", self.input)
    }

    fn parse_or(&mut self) -> Result<TagExpr, EngineError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            terms.push(self.parse_and()?);
        }
        Ok(collapse(terms, TagExpr::Or))
    }

    fn parse_and(&mut self) -> Result<TagExpr, EngineError> {
        let mut factors = vec![self.parse_factor()?];
        while self.peek() == Some(&Token::And) {
            self.next();
            factors.push(self.parse_factor()?);
        }
        Ok(collapse(factors, TagExpr::And))
    }

    fn parse_factor(&mut self) -> Result<TagExpr, EngineError> {
        match self.next() {
            Some(Token::Tag(name)) => Ok(TagExpr::Tag(name)),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(self.error()),
                }
            }
            _ => Err(self.error()),
        }
    }
}

fn collapse(mut items: Vec<TagExpr>, wrap: fn(Vec<TagExpr>) -> TagExpr) -> TagExpr {
    if items.len() == 1 {
        items.remove(0)
    } else {
        wrap(items)
    }
}

impl FromStr for TagExpr {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            input: s,
            tokens: tokenize(s)?,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error());
        }
        Ok(expr)
    }
}

impl TryFrom<String> for TagExpr {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TagExpr> for String {
    fn from(expr: TagExpr) -> Self {
        expr.to_string()
    }
}

impl fmt::Display for TagExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagExpr::Tag(name) => write!(f, "'{name}'"),
            TagExpr::And(children) => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" and ")?;
                    }
                    match child {
                        TagExpr::Or(_) => write!(f, "({child})")?,
                        _ => write!(f, "{child}")?,
                    }
                }
                Ok(())
            }
            TagExpr::Or(children) => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" or ")?;
                    }
                    write!(f, "{child}")?;
                }
                Ok(())
            }
        }
    }
}
