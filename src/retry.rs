//! Bounded regenerate-until-valid loop.
//!
//! Question generation, oracle verification and hint generation all follow the same shape:
//! produce a candidate, check it, and on a defect try again with a corrective note describing
//! what was wrong. `RetryPolicy::run` implements that once. Attempts are spaced by an
//! exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::BackoffCfg;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_backoff: Duration,
  pub max_backoff: Duration,
}

/// Passed to the producer on every attempt.
#[derive(Clone, Debug)]
pub struct Round {
  /// 1-based.
  pub attempt: u32,
  /// Description of the previous candidate's defect, for the corrective instruction.
  pub feedback: Option<String>,
}

/// Why the producer could not offer a candidate this round.
#[derive(Debug)]
pub enum Reject<E> {
  /// Output was unusable (unparseable, missing fields). Retried with this as feedback.
  Defect(String),
  /// A dependency failed (timeout, HTTP error). Retried without changing the feedback.
  Transient(String),
  /// Stop immediately.
  Fatal(E),
}

#[derive(Debug)]
pub struct Accepted<T> {
  pub value: T,
  pub attempts: u32,
}

#[derive(Debug)]
pub enum RetryError<T, E> {
  /// Every attempt failed. `rejected` holds the candidates the validator turned down.
  Exhausted { attempts: u32, last_defect: String, rejected: Vec<(T, String)> },
  Aborted(E),
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, backoff: &BackoffCfg) -> Self {
    Self {
      max_attempts,
      base_backoff: Duration::from_millis(backoff.base_ms),
      max_backoff: Duration::from_millis(backoff.max_ms),
    }
  }

  /// Delay before the attempt following `attempt`: base * 2^(attempt-1), capped, plus up to 25% jitter.
  pub fn delay(&self, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let exp = self.base_backoff.saturating_mul(1u32 << shift).min(self.max_backoff);
    let ms = exp.as_millis() as u64;
    if ms == 0 {
      return Duration::ZERO;
    }
    let jitter = rand::thread_rng().gen_range(0..=ms / 4);
    Duration::from_millis(ms + jitter)
  }

  pub async fn run<T, E, P, Fut, V>(
    &self,
    label: &'static str,
    mut produce: P,
    mut validate: V,
  ) -> Result<Accepted<T>, RetryError<T, E>>
  where
    P: FnMut(Round) -> Fut,
    Fut: Future<Output = Result<T, Reject<E>>>,
    V: FnMut(&T) -> Option<String>,
  {
    let max = self.max_attempts.max(1);
    let mut feedback: Option<String> = None;
    let mut last_defect = String::new();
    let mut rejected = Vec::new();

    for attempt in 1..=max {
      if attempt > 1 {
        let wait = self.delay(attempt - 1);
        debug!(label, attempt, wait_ms = wait.as_millis() as u64, "Backing off before retry");
        tokio::time::sleep(wait).await;
      }
      match produce(Round { attempt, feedback: feedback.clone() }).await {
        Ok(candidate) => match validate(&candidate) {
          None => return Ok(Accepted { value: candidate, attempts: attempt }),
          Some(defect) => {
            debug!(label, attempt, %defect, "Candidate rejected");
            feedback = Some(defect.clone());
            last_defect = defect.clone();
            rejected.push((candidate, defect));
          }
        },
        Err(Reject::Defect(defect)) => {
          debug!(label, attempt, %defect, "Unusable output");
          feedback = Some(defect.clone());
          last_defect = defect;
        }
        Err(Reject::Transient(reason)) => {
          warn!(label, attempt, %reason, "Dependency failure");
          last_defect = reason;
        }
        Err(Reject::Fatal(e)) => return Err(RetryError::Aborted(e)),
      }
    }
    warn!(label, attempts = max, %last_defect, "Retry budget exhausted");
    Err(RetryError::Exhausted { attempts: max, last_defect, rejected })
  }
}
