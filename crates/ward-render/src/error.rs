//! Error types for template parsing and rendering.

use thiserror::Error;

/// Result type alias for render operations.
pub type RenderResult<T> = Result<T, RenderError>;

/// Errors that can occur while parsing or rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// The template source is malformed.
    #[error("syntax error on line {line}: {message}")]
    Syntax {
        /// 1-based line of the offending action.
        line: usize,
        /// What is wrong.
        message: String,
    },

    /// A referenced key has no value and the template is strict.
    #[error("missing key '{key}'")]
    MissingKey {
        /// The unresolved key path.
        key: String,
    },

    /// The delimiter pair is unusable.
    #[error("invalid delimiters: {0}")]
    InvalidDelimiters(String),
}

impl RenderError {
    /// Creates a syntax error.
    #[must_use]
    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = RenderError::syntax(3, "unclosed action");
        assert_eq!(err.to_string(), "syntax error on line 3: unclosed action");

        let err = RenderError::MissingKey {
            key: "config/region".to_string(),
        };
        assert_eq!(err.to_string(), "missing key 'config/region'");
    }
}
