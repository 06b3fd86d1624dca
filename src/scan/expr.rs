//! Matcher expression DSL for fingerprint rules.
//!
//! A matcher is a boolean expression over three variables bound at
//! evaluation time: `body` (response body text), `header` (concatenated
//! header block), and `icon` (32-bit favicon hash). Examples:
//!
//! ```text
//! body="Mlflow" || header~="mlflow/(\d+)"
//! (body="gradio" && !body="wordpress") || icon==1278323681
//! ```
//!
//! Operators: `=` (substring, case-insensitive), `==` (equality; numeric for
//! `icon`), `~=` (regex), `!`, `&&`, `||`, parentheses. Parsing runs
//! tokenize → parenthesis balance check → recursive-descent tree build;
//! evaluation is a pure walk over the tree.

use std::fmt;

use regex::Regex;

/// Response part a textual matcher reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPart {
    /// Response body text.
    Body,
    /// Concatenated `"Name: value\n"` header block.
    Header,
}

impl MatchPart {
    /// DSL variable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Body => "body",
            Self::Header => "header",
        }
    }
}

/// Variables a matcher is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Response body text.
    pub body: String,
    /// Concatenated response-header block.
    pub header: String,
    /// 32-bit favicon hash; 0 when unavailable.
    pub icon: i32,
}

impl MatchContext {
    /// Select the named textual part.
    pub fn part(&self, part: MatchPart) -> &str {
        match part {
            MatchPart::Body => &self.body,
            MatchPart::Header => &self.header,
        }
    }
}

/// Parsed matcher expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Case-insensitive substring test against a textual part.
    Contains {
        /// Part to read.
        part: MatchPart,
        /// Needle.
        value: String,
    },
    /// Exact equality against a textual part.
    Equals {
        /// Part to read.
        part: MatchPart,
        /// Expected value.
        value: String,
    },
    /// Regex match against a textual part.
    Matches {
        /// Part to read.
        part: MatchPart,
        /// Compiled pattern.
        regex: Regex,
    },
    /// Favicon hash equality.
    IconHash {
        /// Expected 32-bit hash.
        hash: i32,
    },
    /// Logical negation.
    Not(Box<Expr>),
    /// Logical conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Logical disjunction.
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Evaluate the expression against bound variables.
    pub fn eval(&self, ctx: &MatchContext) -> bool {
        match self {
            Self::Contains { part, value } => ctx
                .part(*part)
                .to_lowercase()
                .contains(&value.to_lowercase()),
            Self::Equals { part, value } => ctx.part(*part) == value,
            Self::Matches { part, regex } => regex.is_match(ctx.part(*part)),
            Self::IconHash { hash } => ctx.icon == *hash,
            Self::Not(inner) => !inner.eval(ctx),
            Self::And(lhs, rhs) => lhs.eval(ctx) && rhs.eval(ctx),
            Self::Or(lhs, rhs) => lhs.eval(ctx) || rhs.eval(ctx),
        }
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Contains { part: p1, value: v1 },
                Self::Contains { part: p2, value: v2 },
            )
            | (
                Self::Equals { part: p1, value: v1 },
                Self::Equals { part: p2, value: v2 },
            ) => p1 == p2 && v1 == v2,
            (
                Self::Matches { part: p1, regex: r1 },
                Self::Matches { part: p2, regex: r2 },
            ) => p1 == p2 && r1.as_str() == r2.as_str(),
            (Self::IconHash { hash: h1 }, Self::IconHash { hash: h2 }) => h1 == h2,
            (Self::Not(a), Self::Not(b)) => a == b,
            (Self::And(a1, b1), Self::And(a2, b2))
            | (Self::Or(a1, b1), Self::Or(a2, b2)) => a1 == a2 && b1 == b2,
            _ => false,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contains { part, value } => {
                write!(f, "{}=\"{}\"", part.as_str(), escape(value))
            }
            Self::Equals { part, value } => {
                write!(f, "{}==\"{}\"", part.as_str(), escape(value))
            }
            Self::Matches { part, regex } => {
                write!(f, "{}~=\"{}\"", part.as_str(), escape(regex.as_str()))
            }
            Self::IconHash { hash } => write!(f, "icon=={hash}"),
            Self::Not(inner) => write!(f, "!{inner}"),
            Self::And(lhs, rhs) => write!(f, "({lhs} && {rhs})"),
            Self::Or(lhs, rhs) => write!(f, "({lhs} || {rhs})"),
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Matcher parse errors. A parse failure poisons only the rule that
/// contained the expression; the rest of the corpus still loads.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    /// String literal never closed.
    #[error("unterminated string literal at byte {0}")]
    UnterminatedString(usize),
    /// Character outside the token alphabet.
    #[error("unexpected character {0:?} at byte {1}")]
    UnexpectedChar(char, usize),
    /// Opening/closing parenthesis counts differ.
    #[error("unbalanced parentheses")]
    UnbalancedParens,
    /// Expression ended mid-production.
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    /// Token not valid at this position.
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    /// Variable other than body/header/icon.
    #[error("unknown variable {0:?}")]
    UnknownVariable(String),
    /// Operator not valid for the given variable.
    #[error("operator {op:?} is not valid for {var}")]
    InvalidOperator {
        /// Offending operator.
        op: String,
        /// Variable it was applied to.
        var: String,
    },
    /// Regex literal failed to compile.
    #[error("invalid regex {pattern:?}: {source}")]
    BadRegex {
        /// Pattern text.
        pattern: String,
        /// Underlying compile error.
        #[source]
        source: regex::Error,
    },
    /// Input continued past a complete expression.
    #[error("trailing input after expression")]
    TrailingTokens,
    /// Expression was empty.
    #[error("empty expression")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(i64),
    /// `=`
    Contains,
    /// `==`
    Eq,
    /// `~=`
    Regex,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "{s}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Num(n) => write!(f, "{n}"),
            Self::Contains => write!(f, "="),
            Self::Eq => write!(f, "=="),
            Self::Regex => write!(f, "~="),
            Self::And => write!(f, "&&"),
            Self::Or => write!(f, "||"),
            Self::Not => write!(f, "!"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let bytes: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i = i.saturating_add(1);
            }
            '(' => {
                tokens.push(Token::LParen);
                i = i.saturating_add(1);
            }
            ')' => {
                tokens.push(Token::RParen);
                i = i.saturating_add(1);
            }
            '!' => {
                tokens.push(Token::Not);
                i = i.saturating_add(1);
            }
            '&' => {
                if bytes.get(i.saturating_add(1)) == Some(&'&') {
                    tokens.push(Token::And);
                    i = i.saturating_add(2);
                } else {
                    return Err(ExprError::UnexpectedChar('&', i));
                }
            }
            '|' => {
                if bytes.get(i.saturating_add(1)) == Some(&'|') {
                    tokens.push(Token::Or);
                    i = i.saturating_add(2);
                } else {
                    return Err(ExprError::UnexpectedChar('|', i));
                }
            }
            '=' => {
                if bytes.get(i.saturating_add(1)) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i = i.saturating_add(2);
                } else {
                    tokens.push(Token::Contains);
                    i = i.saturating_add(1);
                }
            }
            '~' => {
                if bytes.get(i.saturating_add(1)) == Some(&'=') {
                    tokens.push(Token::Regex);
                    i = i.saturating_add(2);
                } else {
                    return Err(ExprError::UnexpectedChar('~', i));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i;
                let mut value = String::new();
                i = i.saturating_add(1);
                loop {
                    match bytes.get(i) {
                        None => return Err(ExprError::UnterminatedString(start)),
                        Some(&ch) if ch == quote => {
                            i = i.saturating_add(1);
                            break;
                        }
                        Some('\\') => {
                            match bytes.get(i.saturating_add(1)) {
                                Some(&next) if next == quote || next == '\\' => {
                                    value.push(next);
                                    i = i.saturating_add(2);
                                }
                                // Keep unrecognised escapes verbatim so regex
                                // literals like "\d+" survive.
                                _ => {
                                    value.push('\\');
                                    i = i.saturating_add(1);
                                }
                            }
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i = i.saturating_add(1);
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '-' | '0'..='9' => {
                let start = i;
                i = i.saturating_add(1);
                while matches!(bytes.get(i), Some('0'..='9')) {
                    i = i.saturating_add(1);
                }
                let text: String = bytes[start..i].iter().collect();
                let num = text
                    .parse::<i64>()
                    .map_err(|_| ExprError::UnexpectedChar(c, start))?;
                tokens.push(Token::Num(num));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while matches!(bytes.get(i), Some('a'..='z' | 'A'..='Z' | '0'..='9' | '_')) {
                    i = i.saturating_add(1);
                }
                tokens.push(Token::Ident(bytes[start..i].iter().collect()));
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

fn check_balance(tokens: &[Token]) -> Result<(), ExprError> {
    let mut depth: i64 = 0;
    for token in tokens {
        match token {
            Token::LParen => depth = depth.saturating_add(1),
            Token::RParen => {
                depth = depth.saturating_sub(1);
                if depth < 0 {
                    return Err(ExprError::UnbalancedParens);
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ExprError::UnbalancedParens);
    }
    Ok(())
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

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExprError::UnexpectedToken(other.to_string())),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(Token::Ident(name)) => self.parse_comparison(&name),
            Some(other) => Err(ExprError::UnexpectedToken(other.to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn parse_comparison(&mut self, var: &str) -> Result<Expr, ExprError> {
        let op = match self.next() {
            Some(t @ (Token::Contains | Token::Eq | Token::Regex)) => t,
            Some(other) => return Err(ExprError::UnexpectedToken(other.to_string())),
            None => return Err(ExprError::UnexpectedEnd),
        };

        if var == "icon" {
            let hash = match self.next() {
                Some(Token::Num(n)) => n,
                Some(Token::Str(s)) => s
                    .parse::<i64>()
                    .map_err(|_| ExprError::UnexpectedToken(format!("{s:?}")))?,
                Some(other) => return Err(ExprError::UnexpectedToken(other.to_string())),
                None => return Err(ExprError::UnexpectedEnd),
            };
            if op == Token::Regex {
                return Err(ExprError::InvalidOperator {
                    op: "~=".to_owned(),
                    var: "icon".to_owned(),
                });
            }
            // Hashes are stored as 32-bit signed values; wrap larger
            // literals the same way the hasher does.
            #[allow(clippy::cast_possible_truncation)]
            let hash = hash as i32;
            return Ok(Expr::IconHash { hash });
        }

        let part = match var {
            "body" => MatchPart::Body,
            "header" => MatchPart::Header,
            other => return Err(ExprError::UnknownVariable(other.to_owned())),
        };

        let value = match self.next() {
            Some(Token::Str(s)) => s,
            Some(other) => return Err(ExprError::UnexpectedToken(other.to_string())),
            None => return Err(ExprError::UnexpectedEnd),
        };

        match op {
            Token::Contains => Ok(Expr::Contains { part, value }),
            Token::Eq => Ok(Expr::Equals { part, value }),
            Token::Regex => {
                let regex = Regex::new(&value).map_err(|source| ExprError::BadRegex {
                    pattern: value.clone(),
                    source,
                })?;
                Ok(Expr::Matches { part, regex })
            }
            _ => Err(ExprError::UnexpectedToken(op.to_string())),
        }
    }
}

/// Parse a matcher expression.
///
/// # Errors
///
/// Returns an [`ExprError`] on lexical errors, unbalanced parentheses,
/// malformed productions, or uncompilable regex literals.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExprError::Empty);
    }
    check_balance(&tokens)?;

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.peek().is_some() {
        return Err(ExprError::TrailingTokens);
    }
    Ok(expr)
}
