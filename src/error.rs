use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by write operations.
///
/// Reads never fail; writes return these inside the `color_eyre` report so
/// callers can `downcast_ref::<WriteError>()` to inspect a rejection.
#[derive(Debug, Error)]
pub enum WriteError {
  /// The server answered with a non-success status, usually a validation failure
  #[error("server rejected the write with status {status}")]
  Rejected { status: u16, payload: Option<Value> },

  /// The request never produced a response
  #[error("write request failed: {0}")]
  Transport(String),
}

impl WriteError {
  pub fn status(&self) -> Option<u16> {
    match self {
      WriteError::Rejected { status, .. } => Some(*status),
      WriteError::Transport(_) => None,
    }
  }

  /// Structured error body returned by the server, when there is one.
  pub fn payload(&self) -> Option<&Value> {
    match self {
      WriteError::Rejected { payload, .. } => payload.as_ref(),
      WriteError::Transport(_) => None,
    }
  }
}
