//! Lexer for the policy expression language using logos.

use logos::Logos;

use super::error::{ParseError, Span};

/// Token types for policy expressions.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    // Comparison operators
    #[token("=")]
    #[token("==")]
    Eq,
    #[token("!=")]
    #[token("<>")]
    Ne,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,

    // Logical operators
    #[token("&&")]
    #[token("and", ignore(ascii_case))]
    And,
    #[token("||")]
    #[token("or", ignore(ascii_case))]
    Or,
    #[token("!")]
    #[token("not", ignore(ascii_case))]
    Not,

    // Keyword operators
    #[token("in", ignore(ascii_case))]
    In,
    #[token("is", ignore(ascii_case))]
    Is,

    // Literals
    #[token("true", ignore(ascii_case))]
    True,
    #[token("false", ignore(ascii_case))]
    False,
    #[token("null", ignore(ascii_case))]
    Null,

    // Identifier
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // String literal (double-quoted)
    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len() - 1])
    })]
    // String literal (single-quoted)
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len() - 1])
    })]
    String(String),

    // Integer literal
    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    // Float literal
    #[regex(r"-?[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    // Punctuation
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
}

impl Token {
    /// Short description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{}'", name),
            Token::String(s) => format!("string '{}'", s),
            Token::Int(i) => format!("integer {}", i),
            Token::Float(x) => format!("number {}", x),
            other => format!("{:?}", other),
        }
    }
}

/// Unescape a string literal, handling common escape sequences.
fn unescape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('r') => result.push('\r'),
                Some('t') => result.push('\t'),
                Some('\\') => result.push('\\'),
                Some('"') => result.push('"'),
                Some('\'') => result.push('\''),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// A token with its span in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Tokenize expression source.
///
/// Unlike a query console, policy source is checked at registration time,
/// so unrecognised input is an error rather than skipped.
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, ParseError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let span: Span = lexer.span().into();
        match result {
            Ok(token) => tokens.push(SpannedToken { token, span }),
            Err(()) => {
                return Err(ParseError::new(
                    format!("unexpected input '{}'", lexer.slice()),
                    span,
                ))
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn test_comparison() {
        assert_eq!(
            kinds("owner_id = claims.sub"),
            vec![
                Token::Ident("owner_id".to_string()),
                Token::Eq,
                Token::Ident("claims".to_string()),
                Token::Dot,
                Token::Ident("sub".to_string()),
            ]
        );
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert_eq!(
            kinds("a AND b or NOT c"),
            vec![
                Token::Ident("a".to_string()),
                Token::And,
                Token::Ident("b".to_string()),
                Token::Or,
                Token::Not,
                Token::Ident("c".to_string()),
            ]
        );
        // Keywords only match whole words.
        assert_eq!(kinds("android"), vec![Token::Ident("android".to_string())]);
    }

    #[test]
    fn test_operator_aliases() {
        assert_eq!(kinds("== = != <> && ||"), vec![
            Token::Eq,
            Token::Eq,
            Token::Ne,
            Token::Ne,
            Token::And,
            Token::Or,
        ]);
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds(r#"'it\'s' "x" 42 -7 2.5 true NULL"#),
            vec![
                Token::String("it's".to_string()),
                Token::String("x".to_string()),
                Token::Int(42),
                Token::Int(-7),
                Token::Float(2.5),
                Token::True,
                Token::Null,
            ]
        );
    }

    #[test]
    fn test_invalid_input() {
        let err = tokenize("owner_id = #").unwrap_err();
        assert_eq!(err.span, Span::new(11, 12));
    }
}
