//! Error taxonomy for the question pipeline.
//!
//! Component errors stay local (parse and service failures are retried or degraded
//! inside their component). Only `CoreError` crosses the session boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unrepairable structured model output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
  #[error("model output is empty")]
  Empty,
  #[error("no structured payload found near `{fragment}`")]
  NoPayload { fragment: String },
  #[error("payload is not a JSON object near `{fragment}`")]
  NotAnObject { fragment: String },
  #[error("unrepairable payload ({reason}) near `{fragment}`")]
  Malformed { reason: String, fragment: String },
}

/// Failure of an external collaborator call.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
  #[error("{0} is not configured")]
  Unavailable(&'static str),
  #[error("{service} timed out after {after:?}")]
  Timeout { service: &'static str, after: Duration },
  #[error("{service} HTTP {status}: {body}")]
  Http { service: &'static str, status: u16, body: String },
  #[error("{service} transport error: {message}")]
  Transport { service: &'static str, message: String },
  #[error("{service} returned an unexpected response: {message}")]
  BadResponse { service: &'static str, message: String },
}

#[derive(Error, Debug, Clone)]
pub enum GenerationError {
  #[error("no valid question after {attempts} attempts (last defect: {last_defect})")]
  Exhausted { attempts: u32, last_defect: String },
}

#[derive(Error, Debug, Clone)]
pub enum VerificationError {
  #[error("oracle disagreed after {attempts} regenerations (expected {expected}, oracle said {oracle})")]
  Mismatch { attempts: u32, expected: String, oracle: String },
  #[error(transparent)]
  Generation(#[from] GenerationError),
}

/// Non-fatal quality degradations, recorded on the produced entity for auditing.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
  RetrievalDegraded,
  VerificationUnavailable,
  ForcedDuplicateHint,
}

/// Errors visible to the surrounding application.
#[derive(Error, Debug)]
pub enum CoreError {
  /// Generation exhausted, verification mismatch, or an unverified question withheld by policy.
  #[error("could not prepare a question, try again")]
  QuestionUnavailable(#[source] QuestionFailure),
  #[error("another operation is already in flight for session {0}")]
  SessionConflict(String),
  #[error("session {0} not found")]
  SessionNotFound(String),
  #[error("question {0} not found")]
  QuestionNotFound(String),
  #[error("class {0} not found")]
  ClassNotFound(String),
  #[error("invalid session parameters: {0}")]
  InvalidParams(String),
  #[error("persistence failure: {0}")]
  Persistence(String),
  #[error("internal error: {0}")]
  Internal(String),
}

/// Why `requestQuestion` produced nothing. Kept for logs, collapsed for the user.
#[derive(Error, Debug)]
pub enum QuestionFailure {
  #[error(transparent)]
  Verification(#[from] VerificationError),
  #[error("question was not verified and unverified questions are withheld")]
  WithheldUnverified,
}

impl From<VerificationError> for CoreError {
  fn from(e: VerificationError) -> Self {
    CoreError::QuestionUnavailable(QuestionFailure::Verification(e))
  }
}
