//! Error taxonomy.
//!
//! Analysis never fails outright: ambiguity and empty extraction are
//! surfaced as warnings. Failures that end a job come from the sandbox
//! boundary, where everything raised by a unit is converted into a
//! `SandboxError` before it can reach the host runtime.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Engine-level conditions, including the non-fatal ones reported as
/// job warnings.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Classification ambiguous: {0}")]
    ClassificationAmbiguous(String),

    #[error("No configurable parameters found in source")]
    ParameterExtractionEmpty,

    #[error("Unit `{unit}` failed to compile: {reason}")]
    DecompositionSyntaxError { unit: String, reason: String },

    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("Scanner raised: {0}")]
    ExecutionRuntimeError(String),

    #[error("Event loop conflict: {0}")]
    EventLoopConflict(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Failures while turning unit text into a `CompiledUnit`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("Syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Cannot parse expression `{expr}`: {message}")]
    Expression { expr: String, message: String },

    #[error("Helper `{0}` is not a single-expression function")]
    UnsupportedHelper(String),

    #[error("No entry point found (expected one of: {0})")]
    NoEntryPoint(String),

    #[error("Unit defines no pattern columns")]
    NoPatterns,
}

/// Terminal outcomes of one sandboxed invocation other than success.
#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Scanner raised: {0}")]
    Runtime(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Structurally prevented; observing it means the loop-context
    /// invariant was broken.
    #[error("Event loop conflict: {0}")]
    EventLoopConflict(String),
}

impl From<SandboxError> for EngineError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout(d) => EngineError::ExecutionTimeout(d),
            SandboxError::Runtime(msg) => EngineError::ExecutionRuntimeError(msg),
            SandboxError::Compile(e) => EngineError::ExecutionRuntimeError(e.to_string()),
            SandboxError::EventLoopConflict(msg) => EngineError::EventLoopConflict(msg),
        }
    }
}
