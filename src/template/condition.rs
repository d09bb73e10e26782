//! Step conditions.
//!
//! Simplified forms are matched directly against the context:
//! `{var}`, `{!var}`, `{var==value}` and `{var!=value}`. Anything else is
//! rendered as a template and handed to a small boolean expression
//! evaluator supporting `==`, `!=`, `and`/`&&`, `or`/`||`, `not`/`!`,
//! parentheses, quoted strings and bare words.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::TemplateError;

use super::{is_truthy, lookup, render, value_to_string, RenderContext};

static SIMPLIFIED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{\s*(!)?\s*([A-Za-z0-9_.\-]+)\s*(?:(==|!=)\s*([^{}]*?))?\s*\}$")
        .expect("simplified condition pattern is valid")
});

const FALSE_WORDS: &[&str] = &["false", "no", "off", "none", "null", "0", ""];

/// Evaluates a step condition against the render context.
pub fn evaluate_condition(condition: &str, context: &RenderContext) -> Result<bool, TemplateError> {
    let condition = condition.trim();
    if let Some(result) = evaluate_simplified(condition, context) {
        return Ok(result);
    }

    let rendered = render(condition, context)?;
    evaluate_expression(&rendered)
}

fn evaluate_simplified(condition: &str, context: &RenderContext) -> Option<bool> {
    let caps = SIMPLIFIED.captures(condition)?;
    let negated = caps.get(1).is_some();
    let name = caps.get(2)?.as_str();
    let value = lookup(context, name);

    let result = match caps.get(3).map(|m| m.as_str()) {
        None => value.map_or(false, is_truthy),
        Some(op) => {
            let expected = strip_quotes(caps.get(4).map_or("", |m| m.as_str().trim()));
            let equal = value.map(|v| values_match(v, expected));
            match (op, equal) {
                ("==", Some(equal)) => equal,
                ("==", None) => false,
                (_, Some(equal)) => !equal,
                (_, None) => true,
            }
        }
    };

    Some(result != negated)
}

fn values_match(value: &serde_json::Value, expected: &str) -> bool {
    if value_to_string(value) == expected {
        return true;
    }
    match expected.to_ascii_lowercase().as_str() {
        "true" => is_truthy(value),
        "false" => !is_truthy(value),
        _ => false,
    }
}

fn strip_quotes(text: &str) -> &str {
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return &text[1..text.len() - 1];
        }
    }
    text
}

// ---------------------------------------------------------------------------
// Expression evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Word(String),
    Quoted(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Bool(bool),
    Text { text: String, quoted: bool },
}

impl Operand {
    fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Text { text, quoted: true } => !text.is_empty(),
            Self::Text { text, quoted: false } => {
                !FALSE_WORDS.contains(&text.to_ascii_lowercase().as_str())
            }
        }
    }

    fn as_bool_word(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Text { text, .. } => match text.to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
        }
    }

    fn equals(&self, other: &Operand) -> bool {
        if let (Some(a), Some(b)) = (self.as_bool_word(), other.as_bool_word()) {
            return a == b;
        }
        match (self, other) {
            (Self::Text { text: a, .. }, Self::Text { text: b, .. }) => a == b,
            _ => false,
        }
    }
}

/// Evaluates an already-rendered boolean expression.
///
/// ```
/// use reconflow::template::evaluate_expression;
///
/// assert!(evaluate_expression("fast == 'fast' and not off").unwrap());
/// assert!(!evaluate_expression("(yes && no) || none").unwrap());
/// ```
pub fn evaluate_expression(expression: &str) -> Result<bool, TemplateError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Ok(false);
    }

    let mut parser = ExpressionParser {
        tokens: &tokens,
        pos: 0,
        source: expression,
    };
    let value = parser.parse_or()?;
    if parser.pos < tokens.len() {
        return Err(parser.error(format!("unexpected token {:?}", tokens[parser.pos])));
    }
    Ok(value.truthy())
}

fn tokenize(expression: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let invalid = |reason: String| TemplateError::InvalidExpression {
        expression: expression.to_string(),
        reason,
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| invalid("unterminated string".to_string()))?;
                tokens.push(Token::Quoted(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '=' | '&' | '|' => return Err(invalid(format!("unexpected '{}'", c))),
            _ => {
                let start = i;
                while i < chars.len() && !is_delimiter(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Word(word),
                });
            }
        }
    }

    Ok(tokens)
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '!' | '=' | '&' | '|' | '"' | '\'')
}

struct ExpressionParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    source: &'a str,
}

impl ExpressionParser<'_> {
    fn error(&self, reason: String) -> TemplateError {
        TemplateError::InvalidExpression {
            expression: self.source.to_string(),
            reason,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<Operand, TemplateError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Operand::Bool(left.truthy() || right.truthy());
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Operand, TemplateError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Operand::Bool(left.truthy() && right.truthy());
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Operand, TemplateError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Operand::Bool(!inner.truthy()));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Operand, TemplateError> {
        let left = self.parse_operand()?;
        match self.peek() {
            Some(Token::Eq) => {
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Operand::Bool(left.equals(&right)))
            }
            Some(Token::Ne) => {
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Operand::Bool(!left.equals(&right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, TemplateError> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let value = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(self.error("missing ')'".to_string()));
                }
                self.pos += 1;
                Ok(value)
            }
            Some(Token::Quoted(text)) => {
                self.pos += 1;
                Ok(Operand::Text { text, quoted: true })
            }
            Some(Token::Word(first)) => {
                self.pos += 1;
                let mut words = vec![first];
                while let Some(Token::Word(next)) = self.peek() {
                    words.push(next.clone());
                    self.pos += 1;
                }
                Ok(Operand::Text {
                    text: words.join(" "),
                    quoted: false,
                })
            }
            Some(other) => Err(self.error(format!("unexpected token {:?}", other))),
            None => Err(self.error("unexpected end of expression".to_string())),
        }
    }
}
