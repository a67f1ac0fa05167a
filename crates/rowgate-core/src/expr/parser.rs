//! Recursive descent parser for policy expressions.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! expr      := and (OR and)*
//! and       := unary (AND unary)*
//! unary     := NOT unary | predicate
//! predicate := operand [cmp operand | [NOT] IN operand | IS [NOT] NULL]
//! operand   := literal | list | reference | '(' expr ')'
//! ```

use super::ast::{CompareOp, Expr};
use super::error::{ParseError, Span};
use super::lexer::{tokenize, SpannedToken, Token};
use crate::value::Value;

/// Parse expression source into an AST.
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    Parser::new(source)?.parse_complete()
}

/// Parser for the policy expression language.
pub struct Parser<'source> {
    source: &'source str,
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl<'source> Parser<'source> {
    /// Tokenize the source and create a parser over it.
    pub fn new(source: &'source str) -> Result<Self, ParseError> {
        Ok(Self {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    /// Parse a complete expression, rejecting trailing input.
    pub fn parse_complete(&mut self) -> Result<Expr, ParseError> {
        if self.tokens.is_empty() {
            return Err(ParseError::new("empty expression", Span::new(0, 0))
                .with_hint("omit the expression instead of leaving it blank"));
        }
        let expr = self.parse_or()?;
        if let Some(tok) = self.peek() {
            return Err(ParseError::new(
                format!("unexpected {} after expression", tok.token.describe()),
                tok.span,
            ));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut items = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut items = vec![self.parse_unary()?];
        while self.eat(&Token::And) {
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::not(self.parse_unary()?));
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_operand()?;

        let Some(tok) = self.peek() else {
            return Ok(left);
        };
        let token = tok.token.clone();
        let span = tok.span;

        let op = match token {
            Token::Eq => Some(CompareOp::Eq),
            Token::Ne => Some(CompareOp::Ne),
            Token::Lt => Some(CompareOp::Lt),
            Token::Le => Some(CompareOp::Le),
            Token::Gt => Some(CompareOp::Gt),
            Token::Ge => Some(CompareOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_operand()?;
            return Ok(Expr::compare(op, left, right));
        }

        match token {
            Token::In => {
                self.advance();
                let haystack = self.parse_haystack()?;
                Ok(Expr::In {
                    needle: Box::new(left),
                    haystack: Box::new(haystack),
                    negated: false,
                })
            }
            Token::Not => {
                self.advance();
                if !self.eat(&Token::In) {
                    return Err(ParseError::new("expected IN after NOT", span)
                        .with_hint("write NOT before the whole predicate: NOT a = b"));
                }
                let haystack = self.parse_haystack()?;
                Ok(Expr::In {
                    needle: Box::new(left),
                    haystack: Box::new(haystack),
                    negated: true,
                })
            }
            Token::Is => {
                self.advance();
                let negated = self.eat(&Token::Not);
                self.expect(&Token::Null, "NULL")?;
                Ok(Expr::IsNull {
                    operand: Box::new(left),
                    negated,
                })
            }
            _ => Ok(left),
        }
    }

    /// Right side of IN: a parenthesised list is always a list, even with one item.
    fn parse_haystack(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::LParen) {
            let items = self.parse_items(&Token::RParen, ")")?;
            return Ok(Expr::List(items));
        }
        self.parse_operand()
    }

    fn parse_operand(&mut self) -> Result<Expr, ParseError> {
        let tok = self.next("an operand")?;
        match tok.token {
            Token::String(s) => Ok(Expr::lit(s)),
            Token::Int(i) => Ok(Expr::lit(i)),
            Token::Float(x) => Ok(Expr::lit(x)),
            Token::True => Ok(Expr::lit(true)),
            Token::False => Ok(Expr::lit(false)),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::LBracket => Ok(Expr::List(self.parse_items(&Token::RBracket, "]")?)),
            Token::LParen => {
                let first = self.parse_or()?;
                if self.eat(&Token::Comma) {
                    let mut items = vec![first];
                    items.extend(self.parse_items(&Token::RParen, ")")?);
                    return Ok(Expr::List(items));
                }
                self.expect(&Token::RParen, ")")?;
                Ok(first)
            }
            Token::Ident(name) => self.parse_reference(name, tok.span),
            other => Err(ParseError::new(
                format!("expected an operand, found {}", other.describe()),
                tok.span,
            )),
        }
    }

    /// Comma-separated expressions up to `close`. Allows an empty list.
    fn parse_items(&mut self, close: &Token, label: &str) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(&Token::Comma, &format!("',' or '{}'", label))?;
        }
    }

    fn parse_reference(&mut self, name: String, span: Span) -> Result<Expr, ParseError> {
        match name.to_ascii_lowercase().as_str() {
            "row" => {
                self.expect(&Token::Dot, "'.' after row")?;
                let tok = self.next("a column name")?;
                match &tok.token {
                    Token::String(column) => Ok(Expr::Column(column.clone())),
                    _ => Ok(Expr::Column(self.word(&tok)?)),
                }
            }
            "claims" => {
                self.expect(&Token::Dot, "'.' after claims")?;
                Ok(Expr::Claim(self.parse_path()?))
            }
            "auth" => {
                self.expect(&Token::Dot, "'.' after auth")?;
                let tok = self.next("auth.uid() or auth.role()")?;
                let func = self.word(&tok)?;
                self.expect(&Token::LParen, "(")?;
                self.expect(&Token::RParen, ")")?;
                match func.as_str() {
                    "uid" => Ok(Expr::PrincipalId),
                    "role" => Ok(Expr::Role),
                    _ => Err(ParseError::new(
                        format!("unknown function auth.{}()", func),
                        tok.span,
                    )
                    .with_hint("available: auth.uid(), auth.role()")),
                }
            }
            "claim" | "has_claim" => {
                self.expect(&Token::LParen, "(")?;
                let tok = self.next("a claim path string")?;
                let Token::String(path) = tok.token else {
                    return Err(ParseError::new(
                        format!("{}() takes a string literal path", name),
                        span,
                    ));
                };
                self.expect(&Token::RParen, ")")?;
                if name.eq_ignore_ascii_case("claim") {
                    Ok(Expr::Claim(path))
                } else {
                    Ok(Expr::HasClaim(path))
                }
            }
            _ => {
                if self.peek().is_some_and(|t| t.token == Token::LParen) {
                    return Err(ParseError::new(format!("unknown function {}()", name), span)
                        .with_hint("available: claim(), has_claim(), auth.uid(), auth.role()"));
                }
                Ok(Expr::Column(name))
            }
        }
    }

    /// Dotted claim path after `claims.`. Segments may be words or array indexes.
    fn parse_path(&mut self) -> Result<String, ParseError> {
        let mut segments = vec![self.path_segment()?];
        while self.eat(&Token::Dot) {
            segments.push(self.path_segment()?);
        }
        Ok(segments.join("."))
    }

    fn path_segment(&mut self) -> Result<String, ParseError> {
        let tok = self.next("a claim path segment")?;
        match tok.token {
            Token::Int(i) if i >= 0 => Ok(i.to_string()),
            // `teams.0.1` lexes the tail as a float; keep the source text.
            Token::Float(_) => Ok(self.slice(tok.span).to_string()),
            _ => self.word(&tok),
        }
    }

    /// Identifier or keyword text, for positions where keywords are plain names.
    fn word(&self, tok: &SpannedToken) -> Result<String, ParseError> {
        match &tok.token {
            Token::Ident(name) => Ok(name.clone()),
            Token::And
            | Token::Or
            | Token::Not
            | Token::In
            | Token::Is
            | Token::True
            | Token::False
            | Token::Null => {
                let text = self.slice(tok.span);
                if text.chars().all(|c| c.is_ascii_alphabetic()) {
                    Ok(text.to_string())
                } else {
                    Err(ParseError::new(
                        format!("expected a name, found '{}'", text),
                        tok.span,
                    ))
                }
            }
            other => Err(ParseError::new(
                format!("expected a name, found {}", other.describe()),
                tok.span,
            )),
        }
    }

    fn slice(&self, span: Span) -> &'source str {
        self.source.get(span.start..span.end).unwrap_or("")
    }

    fn peek(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn next(&mut self, expected: &str) -> Result<SpannedToken, ParseError> {
        match self.tokens.get(self.pos) {
            Some(tok) => {
                let tok = tok.clone();
                self.pos += 1;
                Ok(tok)
            }
            None => Err(ParseError::new(
                format!("expected {}, found end of expression", expected),
                self.end_span(),
            )),
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().is_some_and(|t| &t.token == token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, label: &str) -> Result<(), ParseError> {
        if self.eat(token) {
            return Ok(());
        }
        match self.peek() {
            Some(tok) => Err(ParseError::new(
                format!("expected {}, found {}", label, tok.token.describe()),
                tok.span,
            )),
            None => Err(ParseError::new(
                format!("expected {}, found end of expression", label),
                self.end_span(),
            )),
        }
    }

    fn end_span(&self) -> Span {
        let end = self.source.len();
        Span::new(end, end)
    }
}
