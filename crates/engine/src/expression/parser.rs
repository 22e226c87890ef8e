//! Tokenizer and recursive-descent parser for the `${{ }}` expression
//! language.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or         := and ( "||" and )*
//! and        := equality ( "&&" equality )*
//! equality   := comparison ( ( "==" | "!=" ) comparison )*
//! comparison := additive ( ( "<" | "<=" | ">" | ">=" ) additive )*
//! additive   := unary ( "+" unary )*
//! unary      := "!" unary | postfix
//! postfix    := primary ( "." IDENT | "[" or "]" )*
//! primary    := STRING | NUMBER | true | false | null
//!             | IDENT "(" args? ")" | IDENT | "(" or ")"
//! ```
//!
//! Identifiers may contain `-` so `steps.greeting-step.outputs` is a plain
//! member chain.

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Bang,
    And,
    Or,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Str(String),
    Num(f64),
    Ident(String),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(serde_json::Value),
    /// Top-level named value such as `github` or `steps`.
    Context(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// Functions whose presence disables the implicit `success() &&` guard on
/// step conditions.
pub const STATUS_FUNCTIONS: &[&str] = &["success", "failure", "always", "cancelled"];

impl Expr {
    /// Whether the tree calls any of [`STATUS_FUNCTIONS`].
    pub fn calls_status_function(&self) -> bool {
        match self {
            Expr::Call(name, args) => {
                STATUS_FUNCTIONS.contains(&name.to_ascii_lowercase().as_str())
                    || args.iter().any(Expr::calls_status_function)
            }
            Expr::Member(inner, _) | Expr::Not(inner) => inner.calls_status_function(),
            Expr::Index(a, b) | Expr::Binary(_, a, b) => {
                a.calls_status_function() || b.calls_status_function()
            }
            Expr::Literal(_) | Expr::Context(_) => false,
        }
    }
}

/// Parse a single expression (the text between `${{` and `}}`).
pub fn parse(source: &str) -> EngineResult<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(EngineError::Expression("empty expression".to_string()));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        source,
    };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

fn tokenize(source: &str) -> EngineResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let unexpected = |c: char| {
        EngineError::Expression(format!("unexpected character '{}' in '{}'", c, source))
    };

    while i < chars.len() {
        let c = chars[i];
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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '&' | '|' | '=' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(unexpected(c));
                }
                tokens.push(match c {
                    '&' => Token::And,
                    '|' => Token::Or,
                    _ => Token::EqEq,
                });
                i += 2;
            }
            '!' | '<' | '>' => {
                let with_eq = chars.get(i + 1) == Some(&'=');
                tokens.push(match (c, with_eq) {
                    ('!', true) => Token::NotEq,
                    ('!', false) => Token::Bang,
                    ('<', true) => Token::Le,
                    ('<', false) => Token::Lt,
                    ('>', true) => Token::Ge,
                    _ => Token::Gt,
                });
                i += if with_eq { 2 } else { 1 };
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(EngineError::Expression(format!(
                                "unterminated string literal in '{}'",
                                source
                            )))
                        }
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(EngineError::Expression(format!(
                                "unterminated string literal in '{}'",
                                source
                            )))
                        }
                        Some('\\') => {
                            let escaped = chars.get(i + 1).copied().ok_or_else(|| {
                                EngineError::Expression(format!(
                                    "dangling escape in '{}'",
                                    source
                                ))
                            })?;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text.parse::<f64>().map_err(|_| {
                    EngineError::Expression(format!("invalid number '{}' in '{}'", text, source))
                })?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(unexpected(other)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> EngineError {
        EngineError::Expression(format!(
            "{} at token {} in '{}'",
            message, self.pos, self.source
        ))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> EngineResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn parse_or(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::And) {
            let right = self.parse_equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::Plus) {
            let right = self.parse_unary()?;
            left = Expr::Binary(BinaryOp::Add, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> EngineResult<Expr> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> EngineResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.next() {
                    Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                    _ => return Err(self.error("expected property name after '.'")),
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_or()?;
                self.expect(&Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> EngineResult<Expr> {
        match self.next() {
            Some(Token::Str(value)) => Ok(Expr::Literal(serde_json::Value::String(value))),
            Some(Token::Num(value)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(value)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            )),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(serde_json::Value::Bool(true))),
                "false" => Ok(Expr::Literal(serde_json::Value::Bool(false))),
                "null" => Ok(Expr::Literal(serde_json::Value::Null)),
                _ if self.eat(&Token::LParen) => {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(&Token::Comma, "',' or ')'")?;
                        }
                    }
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Context(name)),
            },
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a value"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(base: Expr, name: &str) -> Expr {
        Expr::Member(Box::new(base), name.to_string())
    }

    #[test]
    fn test_parse_member_chain_with_hyphen() {
        let expr = parse("steps.greeting-step.outputs.hello").unwrap();
        let expected = member(
            member(
                member(Expr::Context("steps".to_string()), "greeting-step"),
                "outputs",
            ),
            "hello",
        );
        assert_eq!(expr, expected);
    }

    #[test]
    fn test_parse_concatenation_left_associative() {
        let expr = parse("a + 'b' + \"c\"").unwrap();
        match expr {
            Expr::Binary(BinaryOp::Add, left, right) => {
                assert!(matches!(*left, Expr::Binary(BinaryOp::Add, _, _)));
                assert_eq!(*right, Expr::Literal(serde_json::json!("c")));
            }
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn test_precedence() {
        let expr = parse("a == 'x' || b && !c").unwrap();
        match expr {
            Expr::Binary(BinaryOp::Or, left, right) => {
                assert!(matches!(*left, Expr::Binary(BinaryOp::Eq, _, _)));
                assert!(matches!(*right, Expr::Binary(BinaryOp::And, _, _)));
            }
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn test_single_quote_escape() {
        assert_eq!(
            parse("'it''s'").unwrap(),
            Expr::Literal(serde_json::json!("it's"))
        );
    }

    #[test]
    fn test_index_and_call() {
        let expr = parse("contains(github.event.inputs['repo_name'], 'scitt')").unwrap();
        match &expr {
            Expr::Call(name, args) => {
                assert_eq!(name, "contains");
                assert_eq!(args.len(), 2);
                assert!(matches!(args[0], Expr::Index(_, _)));
            }
            other => panic!("unexpected tree {other:?}"),
        }
        assert!(!expr.calls_status_function());
        assert!(parse("always() && x").unwrap().calls_status_function());
        assert!(parse("!failure()").unwrap().calls_status_function());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("'open").is_err());
        assert!(parse("a +").is_err());
        assert!(parse("a = b").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("a.").is_err());
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse("42").unwrap(), Expr::Literal(serde_json::json!(42.0)));
        assert_eq!(parse("-1.5").unwrap(), Expr::Literal(serde_json::json!(-1.5)));
    }
}
