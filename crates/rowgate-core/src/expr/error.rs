//! Source spans and parse errors for policy expressions.

use thiserror::Error;

/// A byte range in expression source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// Start byte offset.
    pub start: usize,
    /// End byte offset (exclusive).
    pub end: usize,
}

impl Span {
    /// Create a new span.
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(range: std::ops::Range<usize>) -> Self {
        Span {
            start: range.start,
            end: range.end,
        }
    }
}

/// Error while lexing or parsing an expression.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ParseError {
    /// The error message.
    pub message: String,
    /// Source span where the error occurred.
    pub span: Span,
    /// Optional hint for fixing the error.
    pub hint: Option<String>,
}

impl ParseError {
    /// Create a new parse error.
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            hint: None,
        }
    }

    /// Add a hint to the error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Format the error with a caret under the offending source.
    pub fn format_with_source(&self, source: &str) -> String {
        let start = self.span.start.min(source.len());
        let width = self.span.end.saturating_sub(self.span.start).max(1);

        let mut result = format!("error: {}\n", self.message);
        result.push_str(&format!("  | {}\n  | ", source));
        let column = source.get(..start).map_or(start, |s| s.chars().count());
        result.push_str(&" ".repeat(column));
        result.push_str(&"^".repeat(width));

        if let Some(hint) = &self.hint {
            result.push_str(&format!("\n  = hint: {}", hint));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_with_source() {
        let err = ParseError::new("unexpected token", Span::new(9, 11))
            .with_hint("use = or ==");
        let formatted = err.format_with_source("owner_id => 1");
        assert!(formatted.contains("error: unexpected token"));
        assert!(formatted.contains("         ^^"));
        assert!(formatted.contains("hint: use = or =="));
    }
}
