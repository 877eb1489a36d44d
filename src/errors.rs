/// Quill compiler error types.
///
/// Two layers:
///   • `FatalError` — unrecoverable conditions.  These abort the whole job
///     with exit code 3 after the database lock is released.
///   • `Unwind` — the control-flow carrier used by the parser.  A `Sync`
///     unwind rewinds to the recovery anchor set before each top-level form
///     and compilation continues with the next form.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("Can't open \"{path}\": {source}")]
    OpenFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Error writing {path}")]
    WriteFailed { path: String },

    #[error("Unexpected end of input.")]
    EarlyEnd,

    #[error("Out of selector numbers!")]
    OutOfSelectors,

    #[error("Attempt to claim illegal selector {0}!")]
    IllegalSelector(i32),

    #[error("Hey! Out of class numbers!!! (Max is {0}).")]
    OutOfClassNumbers(usize),

    #[error("Access to database denied")]
    DatabaseLocked,

    #[error("Unterminated string")]
    UnterminatedString,

    #[error("{0}")]
    Message(String),
}

/// Parser control flow: either rewind to the top-level recovery anchor or
/// abort the job entirely.
#[derive(Debug)]
pub enum Unwind {
    /// Lost synchronization (mismatched parentheses and friends).  Unwinds
    /// to the enclosing top-level form.
    Sync,
    /// Unrecoverable; propagates out of the parse loop.
    Fatal(FatalError),
}

impl From<FatalError> for Unwind {
    fn from(e: FatalError) -> Self {
        Unwind::Fatal(e)
    }
}

/// Result type used throughout the parser and lowering code.
pub type PResult<T> = Result<T, Unwind>;
