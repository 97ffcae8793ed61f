use std::ops::Range;

use codespan_reporting::diagnostic::{Diagnostic, Label, Severity};
use promptl::{ErrorCode, ParseError};

/// Failures raised while evaluating expressions and scopes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("variable '{0}' is not declared")]
    VariableNotDeclared(String),
    #[error("type error: {0}")]
    TypeError(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("{0} is not a function")]
    NotAFunction(String),
    #[error("function '{name}' failed: {message}")]
    FunctionCall { name: String, message: String },
    #[error("cannot iterate over {0}")]
    InvalidIterable(String),
    #[error("invalid message role '{0}'")]
    InvalidMessageRole(String),
}

impl RuntimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::VariableNotDeclared(_) => ErrorCode::VariableNotDeclared,
            RuntimeError::TypeError(_) => ErrorCode::TypeError,
            RuntimeError::DivisionByZero => ErrorCode::DivisionByZero,
            RuntimeError::NotAFunction(_) => ErrorCode::NotAFunction,
            RuntimeError::FunctionCall { .. } => ErrorCode::FunctionCallError,
            RuntimeError::InvalidIterable(_) => ErrorCode::InvalidIterable,
            RuntimeError::InvalidMessageRole(_) => ErrorCode::InvalidMessageRole,
        }
    }
}

/// A runtime error with the span of the sub-expression that raised it, when known.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedError {
    pub error: RuntimeError,
    pub span: Option<Range<usize>>,
}

impl From<RuntimeError> for SpannedError {
    fn from(error: RuntimeError) -> Self {
        SpannedError { error, span: None }
    }
}

impl SpannedError {
    pub(crate) fn at(error: RuntimeError, span: &Range<usize>) -> Self {
        SpannedError {
            error,
            span: Some(span.clone()),
        }
    }
}

/// The caller-facing error. Every failure of a compile, render, or chain step ends up here.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CompileError {
    pub code: ErrorCode,
    pub message: String,
    /// Byte span in the document named by `source_path`.
    pub span: Option<Range<usize>>,
    /// Path of the document the error occurred in; `None` for an unnamed root document.
    pub source_path: Option<String>,
    pub notes: Vec<String>,
}

impl CompileError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        CompileError {
            code,
            message: message.into(),
            span: None,
            source_path: None,
            notes: Vec::new(),
        }
    }

    pub fn with_span(mut self, span: Range<usize>) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_source_path(mut self, path: Option<&str>) -> Self {
        self.source_path = path.map(str::to_string);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Attach location to a runtime error; `fallback` is the span of the enclosing node.
    pub(crate) fn runtime(err: SpannedError, fallback: &Range<usize>, path: Option<&str>) -> Self {
        CompileError::new(err.error.code(), err.error.to_string())
            .with_span(err.span.unwrap_or_else(|| fallback.clone()))
            .with_source_path(path)
    }

    /// Convert to a codespan-reporting Diagnostic. `file_id` names the file holding `source_path`.
    pub fn to_diagnostic(&self, file_id: usize) -> Diagnostic<usize> {
        let labels = match &self.span {
            Some(span) => vec![Label::primary(file_id, span.clone())],
            None => Vec::new(),
        };
        Diagnostic::new(Severity::Error)
            .with_message(&self.message)
            .with_code(self.code.as_str())
            .with_labels(labels)
            .with_notes(self.notes.clone())
    }
}

impl From<ParseError> for CompileError {
    fn from(err: ParseError) -> Self {
        CompileError {
            code: err.code,
            message: err.message,
            span: Some(err.span),
            source_path: None,
            notes: err.notes,
        }
    }
}
