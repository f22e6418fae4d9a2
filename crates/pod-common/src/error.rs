//! Error kinds shared across the Pod Manager workspace.

use thiserror::Error;

/// All failure modes a therapy operation or exchange can surface.
///
/// Every variant carries a human-readable message, matching the contract in
/// the command-layer specification: callers inspect `conversation.exception`
/// after an operation, they never match on a bare string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PodError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("pod state invalid for command: {0}")]
    PodStateInvalidForCommand(String),

    #[error("unexpected pod response: {0}")]
    PodResponseUnexpected(String),

    #[error("radio receive timeout: {0}")]
    RadioRecvTimeout(String),

    #[error("radio send timeout: {0}")]
    RadioSendTimeout(String),

    #[error("radio error: {0}")]
    RadioGeneric(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

pub type Result<T> = std::result::Result<T, PodError>;
