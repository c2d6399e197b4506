//! Error taxonomy for the collaboration engine and its ambient stack.
//!
//! Every variant maps to exactly one of the kinds in the specification's error
//! handling design: malformed wire frames, auth/precondition failures, engine
//! rejections (which should never actually occur given the clamping rules),
//! not-found/busy replies, and I/O failures at the transport or disk boundary.

use snafu::Snafu;

use crate::{FileId, UserId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("malformed frame: {reason}"))]
    MalformedFrame { reason: String },

    #[snafu(display("authentication required before editing"))]
    AuthRequired,

    #[snafu(display("file {file_id} is not open on this session"))]
    NotOpen { file_id: FileId },

    #[snafu(display("missing or invalid argument: {field}"))]
    InvalidArguments { field: String },

    #[snafu(display("operation on file {file_id} could not be placed: {reason}"))]
    OperationRejected { file_id: FileId, reason: String },

    #[snafu(display("file {file_id} not found"))]
    NotFound { file_id: FileId },

    #[snafu(display("file {file_id} has other participants"))]
    Busy { file_id: FileId },

    #[snafu(display("invalid credentials for user {username}"))]
    InvalidCredentials { username: String },

    #[snafu(display("user {username} is already registered"))]
    AlreadyRegistered { username: String },

    #[snafu(display("i/o failure: {source}"))]
    IoFailure { source: std::io::Error },

    #[snafu(display("internal error: {message}"))]
    Internal { message: String },
}

impl EngineError {
    /// The message placed in an ERROR frame's `message` key. Never leaks
    /// internal detail beyond what the spec's taxonomy already exposes.
    pub fn wire_message(&self) -> String {
        self.to_string()
    }

    /// Whether this error should terminate the session (IoFailure) or merely
    /// produce an ERROR reply while the session survives.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::IoFailure { .. })
    }
}

impl From<std::io::Error> for EngineError {
    fn from(source: std::io::Error) -> Self {
        EngineError::IoFailure { source }
    }
}

pub(crate) fn internal(message: impl Into<String>) -> EngineError {
    EngineError::Internal {
        message: message.into(),
    }
}

pub(crate) type UserResult<T> = Result<T, EngineError>;

/// Pair an error with the acting user, for log correlation at the boundary.
pub(crate) fn log_boundary(user: Option<&UserId>, file: Option<&FileId>, err: &EngineError) {
    match err {
        EngineError::IoFailure { .. } | EngineError::Internal { .. } => {
            tracing::error!(user = ?user, file = ?file, error = %err, "session boundary error");
        }
        _ => {
            tracing::warn!(user = ?user, file = ?file, error = %err, "rejected request");
        }
    }
}
