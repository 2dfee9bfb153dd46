//! Evaluation errors and internal control signals.

use std::fmt;

use arbiter_ast::Location;

/// Error kinds surfaced by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Caller cancelled or deadline exceeded. Fatal to the query.
    Cancel,
    /// Rule conflict: complete-doc value mismatch, function value
    /// mismatch, object-key collision, or `with` merge conflict. Fatal.
    Conflict,
    /// Structural impossibility discovered at runtime. Fatal.
    Type,
    /// A call named a built-in that is not registered. Fatal.
    UnsupportedBuiltin,
    /// A lookup hit a save-set or inlining-disabled target. Not fatal in
    /// partial mode; it drives residualisation.
    UnknownValue,
    /// Reached unreachable code; indicates a bug. Fatal.
    Internal,
    /// A built-in returned an error. Accumulated per query and surfaced
    /// after the run completes.
    Builtin,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Cancel => "eval_cancel_error",
            ErrorCode::Conflict => "eval_conflict_error",
            ErrorCode::Type => "eval_type_error",
            ErrorCode::UnsupportedBuiltin => "eval_unsupported_builtin_error",
            ErrorCode::UnknownValue => "eval_unknown_value_error",
            ErrorCode::Internal => "eval_internal_error",
            ErrorCode::Builtin => "eval_builtin_error",
        };
        write!(f, "{}", s)
    }
}

/// An evaluation error with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub location: Location,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, location: Location) -> Self {
        Error {
            code,
            message: message.into(),
            location,
        }
    }

    pub fn cancel() -> Self {
        Error::new(
            ErrorCode::Cancel,
            "caller cancelled query execution",
            Location::default(),
        )
    }

    pub fn complete_doc_conflict(location: Location) -> Self {
        Error::new(
            ErrorCode::Conflict,
            "complete rules must not produce multiple outputs",
            location,
        )
    }

    pub fn function_conflict(location: Location) -> Self {
        Error::new(
            ErrorCode::Conflict,
            "functions must not produce multiple outputs for same inputs",
            location,
        )
    }

    pub fn object_key_conflict(location: Location) -> Self {
        Error::new(
            ErrorCode::Conflict,
            "object keys must be unique",
            location,
        )
    }

    pub fn merge_conflict(location: Location) -> Self {
        Error::new(
            ErrorCode::Conflict,
            "base and virtual document keys must be disjoint",
            location,
        )
    }

    pub fn with_merge_conflict(message: impl Into<String>, location: Location) -> Self {
        Error::new(ErrorCode::Conflict, message, location)
    }

    pub fn type_err(message: impl Into<String>, location: Location) -> Self {
        Error::new(ErrorCode::Type, message, location)
    }

    pub fn unsupported_builtin(name: &str, location: Location) -> Self {
        Error::new(
            ErrorCode::UnsupportedBuiltin,
            format!("unsupported built-in: {}", name),
            location,
        )
    }

    pub fn unknown_value(message: impl Into<String>) -> Self {
        Error::new(ErrorCode::UnknownValue, message, Location::default())
    }

    pub fn internal(message: impl Into<String>, location: Location) -> Self {
        Error::new(ErrorCode::Internal, message, location)
    }

    pub fn builtin(name: &str, message: impl Into<String>, location: Location) -> Self {
        Error::new(
            ErrorCode::Builtin,
            format!("{}: {}", name, message.into()),
            location,
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.code, self.message, self.location)
    }
}

impl std::error::Error for Error {}

// ──────────────────────────────────────────────
// Internal control flow
// ──────────────────────────────────────────────

/// Out-of-band signals threaded through the continuation chain. Early
/// exit variants are control flow, not failures; they are converted or
/// suppressed by the frame that requested find-one semantics.
#[derive(Debug)]
pub(crate) enum Stop {
    /// A fatal error; aborts the query.
    Fatal(Error),
    /// One solution was enough; unwind to the requesting frame.
    EarlyExit,
    /// Early exit raised below a frame that did not request find-one;
    /// unwinds only to the next frame that did.
    DeferredEarlyExit,
}

pub(crate) type EvalResult = Result<(), Stop>;

/// Strip early-exit signals, preserving fatal errors.
pub(crate) fn suppress_early_exit(res: EvalResult) -> EvalResult {
    match res {
        Err(Stop::EarlyExit) | Err(Stop::DeferredEarlyExit) => Ok(()),
        other => other,
    }
}

impl From<Error> for Stop {
    fn from(e: Error) -> Self {
        Stop::Fatal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_location() {
        let e = Error::object_key_conflict(Location::new(3, 7));
        assert_eq!(
            e.to_string(),
            "eval_conflict_error: object keys must be unique (3:7)"
        );
    }

    #[test]
    fn suppression_keeps_fatal_errors() {
        assert!(suppress_early_exit(Err(Stop::EarlyExit)).is_ok());
        assert!(suppress_early_exit(Err(Stop::DeferredEarlyExit)).is_ok());
        assert!(suppress_early_exit(Err(Stop::Fatal(Error::cancel()))).is_err());
    }
}
