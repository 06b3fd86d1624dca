//! Version ordering and advisory version predicates.
//!
//! Detected versions are dotted numeric strings with optional alphanumeric
//! suffixes (`2.3.1`, `1.2.3a`, `0.9.44.post1`). Ordering is segment-wise:
//! numeric prefixes compare numerically, suffixes compare lexicographically
//! after the numeric prefix, so `1.2.3 < 1.2.3a < 1.2.4`.
//!
//! Advisory predicates are boolean expressions over `version` and
//! `is_internal`, e.g. `version > "0" && version < "2.3.1"`. An empty rule
//! always applies.

use std::cmp::Ordering;
use std::fmt;

/// Compare two dotted version strings.
///
/// Each `.`-separated segment splits into a numeric prefix and a residual
/// suffix. Numeric prefixes compare numerically; equal prefixes fall back to
/// lexicographic suffix comparison (empty suffix orders first). A version
/// with extra trailing segments orders after its prefix.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.trim().split('.').collect();
    let right: Vec<&str> = b.trim().split('.').collect();
    let len = left.len().max(right.len());

    for i in 0..len {
        match (left.get(i), right.get(i)) {
            (Some(ls), Some(rs)) => {
                let (ln, lsuf) = split_segment(ls);
                let (rn, rsuf) = split_segment(rs);
                match ln.cmp(&rn) {
                    Ordering::Equal => {}
                    other => return other,
                }
                match lsuf.cmp(rsuf) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => break,
        }
    }
    Ordering::Equal
}

/// Split a segment into (numeric prefix value, residual suffix).
///
/// A segment with no digits gets numeric value 0 so pure suffixes like
/// `beta` still order deterministically.
fn split_segment(segment: &str) -> (u64, &str) {
    let digits_end = segment
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(segment.len());
    let value = segment[..digits_end].parse::<u64>().unwrap_or(0);
    (value, &segment[digits_end..])
}

/// Comparison operator in a version predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CmpOp {
    fn apply(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }

    /// DSL spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Parsed advisory version predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionPredicate {
    /// Empty rule; applies to every version.
    Always,
    /// `version OP "literal"`.
    Version {
        /// Comparison operator.
        op: CmpOp,
        /// Literal to compare against.
        literal: String,
    },
    /// `is_internal == true/false`.
    Internal(bool),
    /// Conjunction.
    And(Box<VersionPredicate>, Box<VersionPredicate>),
    /// Disjunction.
    Or(Box<VersionPredicate>, Box<VersionPredicate>),
}

impl VersionPredicate {
    /// Evaluate against a detected version and target locality.
    pub fn eval(&self, version: &str, is_internal: bool) -> bool {
        match self {
            Self::Always => true,
            Self::Version { op, literal } => op.apply(compare_versions(version, literal)),
            Self::Internal(expected) => is_internal == *expected,
            Self::And(lhs, rhs) => {
                lhs.eval(version, is_internal) && rhs.eval(version, is_internal)
            }
            Self::Or(lhs, rhs) => {
                lhs.eval(version, is_internal) || rhs.eval(version, is_internal)
            }
        }
    }

    /// Whether this predicate is the empty always-true rule.
    pub fn is_always(&self) -> bool {
        matches!(self, Self::Always)
    }
}

impl fmt::Display for VersionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => Ok(()),
            Self::Version { op, literal } => write!(f, "version {} \"{literal}\"", op.as_str()),
            Self::Internal(v) => write!(f, "is_internal == {v}"),
            Self::And(lhs, rhs) => write!(f, "({lhs} && {rhs})"),
            Self::Or(lhs, rhs) => write!(f, "({lhs} || {rhs})"),
        }
    }
}

/// Version predicate parse errors.
#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    /// Character outside the token alphabet.
    #[error("unexpected character {0:?} in version rule")]
    UnexpectedChar(char),
    /// String literal never closed.
    #[error("unterminated string literal in version rule")]
    UnterminatedString,
    /// Token not valid at this position.
    #[error("unexpected token {0} in version rule")]
    UnexpectedToken(String),
    /// Rule ended mid-production.
    #[error("unexpected end of version rule")]
    UnexpectedEnd,
    /// Unbalanced parentheses.
    #[error("unbalanced parentheses in version rule")]
    UnbalancedParens,
    /// Input continued past a complete predicate.
    #[error("trailing input after version rule")]
    TrailingTokens,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Version,
    Internal,
    Bool(bool),
    Str(String),
    Op(CmpOp),
    And,
    Or,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version => write!(f, "version"),
            Self::Internal => write!(f, "is_internal"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Op(op) => write!(f, "{}", op.as_str()),
            Self::And => write!(f, "&&"),
            Self::Or => write!(f, "||"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, PredicateError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i = i.saturating_add(1),
            '(' => {
                tokens.push(Token::LParen);
                i = i.saturating_add(1);
            }
            ')' => {
                tokens.push(Token::RParen);
                i = i.saturating_add(1);
            }
            '&' => {
                if chars.get(i.saturating_add(1)) == Some(&'&') {
                    tokens.push(Token::And);
                    i = i.saturating_add(2);
                } else {
                    return Err(PredicateError::UnexpectedChar('&'));
                }
            }
            '|' => {
                if chars.get(i.saturating_add(1)) == Some(&'|') {
                    tokens.push(Token::Or);
                    i = i.saturating_add(2);
                } else {
                    return Err(PredicateError::UnexpectedChar('|'));
                }
            }
            '=' => {
                if chars.get(i.saturating_add(1)) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Eq));
                    i = i.saturating_add(2);
                } else {
                    return Err(PredicateError::UnexpectedChar('='));
                }
            }
            '!' => {
                if chars.get(i.saturating_add(1)) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i = i.saturating_add(2);
                } else {
                    return Err(PredicateError::UnexpectedChar('!'));
                }
            }
            '<' => {
                if chars.get(i.saturating_add(1)) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i = i.saturating_add(2);
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i = i.saturating_add(1);
                }
            }
            '>' => {
                if chars.get(i.saturating_add(1)) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i = i.saturating_add(2);
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i = i.saturating_add(1);
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i = i.saturating_add(1);
                loop {
                    match chars.get(i) {
                        None => return Err(PredicateError::UnterminatedString),
                        Some(&ch) if ch == quote => {
                            i = i.saturating_add(1);
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i = i.saturating_add(1);
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while matches!(chars.get(i), Some('a'..='z' | 'A'..='Z' | '0'..='9' | '_')) {
                    i = i.saturating_add(1);
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "version" => tokens.push(Token::Version),
                    "is_internal" => tokens.push(Token::Internal),
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    other => {
                        return Err(PredicateError::UnexpectedToken(other.to_owned()));
                    }
                }
            }
            other => return Err(PredicateError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos = self.pos.saturating_add(1);
        }
        token
    }

    fn parse_or(&mut self) -> Result<VersionPredicate, PredicateError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = VersionPredicate::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<VersionPredicate, PredicateError> {
        let mut lhs = self.parse_primary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_primary()?;
            lhs = VersionPredicate::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<VersionPredicate, PredicateError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(PredicateError::UnexpectedToken(other.to_string())),
                    None => Err(PredicateError::UnexpectedEnd),
                }
            }
            Some(Token::Version) => {
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    Some(other) => {
                        return Err(PredicateError::UnexpectedToken(other.to_string()))
                    }
                    None => return Err(PredicateError::UnexpectedEnd),
                };
                let literal = match self.next() {
                    Some(Token::Str(s)) => s,
                    Some(other) => {
                        return Err(PredicateError::UnexpectedToken(other.to_string()))
                    }
                    None => return Err(PredicateError::UnexpectedEnd),
                };
                Ok(VersionPredicate::Version { op, literal })
            }
            Some(Token::Internal) => {
                let op = match self.next() {
                    Some(Token::Op(op @ (CmpOp::Eq | CmpOp::Ne))) => op,
                    Some(other) => {
                        return Err(PredicateError::UnexpectedToken(other.to_string()))
                    }
                    None => return Err(PredicateError::UnexpectedEnd),
                };
                let value = match self.next() {
                    Some(Token::Bool(b)) => b,
                    Some(other) => {
                        return Err(PredicateError::UnexpectedToken(other.to_string()))
                    }
                    None => return Err(PredicateError::UnexpectedEnd),
                };
                let expected = if op == CmpOp::Eq { value } else { !value };
                Ok(VersionPredicate::Internal(expected))
            }
            Some(other) => Err(PredicateError::UnexpectedToken(other.to_string())),
            None => Err(PredicateError::UnexpectedEnd),
        }
    }
}

/// Parse an advisory version rule. Empty or whitespace-only input yields
/// [`VersionPredicate::Always`].
///
/// # Errors
///
/// Returns a [`PredicateError`] on malformed rules.
pub fn parse(input: &str) -> Result<VersionPredicate, PredicateError> {
    if input.trim().is_empty() {
        return Ok(VersionPredicate::Always);
    }
    let tokens = tokenize(input)?;

    let mut depth: i64 = 0;
    for token in &tokens {
        match token {
            Token::LParen => depth = depth.saturating_add(1),
            Token::RParen => {
                depth = depth.saturating_sub(1);
                if depth < 0 {
                    return Err(PredicateError::UnbalancedParens);
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PredicateError::UnbalancedParens);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let predicate = parser.parse_or()?;
    if parser.peek().is_some() {
        return Err(PredicateError::TrailingTokens);
    }
    Ok(predicate)
}
