//! Symbolic verification: an independent check of a candidate's canonical answer.
//!
//! Three stages, each usable on its own:
//!   1) `translate`: model call turning the question into one oracle query (or declaring it
//!      not symbolically checkable), parsed through the repair parser;
//!   2) `consult`: the oracle call itself;
//!   3) `compare`: equivalence of the oracle result and the canonical answer.
//! `Verifier::produce` drives generation and verification together: a disagreement asks the
//! generator for a new question, up to `max_regenerations` times, then fails with `Mismatch`.
//! An unreachable oracle or failed translation never fails the question; it is marked
//! unverified and flagged instead.

use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::config::{BackoffCfg, Prompts, TimeoutCfg, VerificationCfg};
use crate::domain::VerificationStatus;
use crate::equivalence::{matches_oracle, Equivalence};
use crate::error::{Degradation, GenerationError, ServiceError, VerificationError};
use crate::generation::{Candidate, GenerationOrchestrator, GenerationRequest};
use crate::repair;
use crate::retry::{Reject, RetryError, RetryPolicy, Round};
use crate::services::{GenerationModel, ModelRequest, ModelTier, OracleAnswer, SymbolicOracle};
use crate::util::{fill_template, trunc_for_log, with_timeout};

/// Query translation attempts (parse defects and unparseable queries are retried).
const TRANSLATION_ATTEMPTS: u32 = 2;

#[derive(Clone, Debug, PartialEq)]
pub enum Translation {
  Query(String),
  NotCheckable(String),
}

#[derive(Debug, Deserialize)]
struct QueryOut {
  query: Option<String>,
  #[serde(default)]
  reason: String,
}

/// Result of checking one candidate.
#[derive(Clone, Debug, PartialEq)]
pub enum Check {
  Agrees { query: String, result: String, kind: Equivalence },
  Disagrees { query: String, result: String },
  Unverified { reason: String, query: Option<String>, result: Option<String> },
}

/// A candidate together with the verdict that allows it to be published.
#[derive(Clone, Debug)]
pub struct VerifiedCandidate {
  pub candidate: Candidate,
  pub status: VerificationStatus,
  pub oracle_query: Option<String>,
  pub oracle_result: Option<String>,
  pub unverified_reason: Option<String>,
  pub flags: Vec<Degradation>,
}

enum Stop {
  NotCheckable(String),
  OracleDown(ServiceError),
}

pub struct Verifier {
  model: Arc<dyn GenerationModel>,
  oracle: Arc<dyn SymbolicOracle>,
  prompts: Arc<Prompts>,
  cfg: VerificationCfg,
  backoff: BackoffCfg,
  timeouts: TimeoutCfg,
}

impl Verifier {
  pub fn new(
    model: Arc<dyn GenerationModel>,
    oracle: Arc<dyn SymbolicOracle>,
    prompts: Arc<Prompts>,
    cfg: VerificationCfg,
    backoff: BackoffCfg,
    timeouts: TimeoutCfg,
  ) -> Self {
    Self { model, oracle, prompts, cfg, backoff, timeouts }
  }

  /// Stage 1. `Err` carries a defect description (service failure or unusable output).
  #[instrument(target = "question", level = "debug", skip(self, question, corrective), fields(question_len = question.len()))]
  pub async fn translate(&self, question: &str, corrective: Option<&str>) -> Result<Translation, Reject<Infallible>> {
    let corrective = corrective
      .map(|c| format!("\nYour previous query was rejected: {c}. Return a corrected JSON object."))
      .unwrap_or_default();
    let user = fill_template(
      &self.prompts.oracle_query_user_template,
      &[("question", question), ("corrective", corrective.as_str())],
    );
    let req = ModelRequest {
      system: self.prompts.oracle_query_system.clone(),
      user,
      temperature: 0.0,
      tier: ModelTier::Fast,
      json: true,
      image: None,
    };
    let raw = with_timeout("generation model", self.timeouts.model(), self.model.complete(req))
      .await
      .map_err(|e| Reject::Transient(e.to_string()))?;
    let out: QueryOut = repair::parse_as(&raw)
      .map_err(|e| Reject::Defect(format!("the response was not the requested JSON object ({e})")))?;
    match out.query.map(|q| q.trim().to_string()).filter(|q| !q.is_empty()) {
      Some(q) => Ok(Translation::Query(q)),
      None => Ok(Translation::NotCheckable(if out.reason.is_empty() { "not symbolically checkable".into() } else { out.reason })),
    }
  }

  /// Stage 2.
  pub async fn consult(&self, query: &str) -> Result<OracleAnswer, ServiceError> {
    with_timeout("symbolic oracle", self.timeouts.oracle(), self.oracle.query(query)).await
  }

  /// Stage 3. The canonical answer is the expected side; the oracle's text may carry prose.
  pub fn compare(&self, canonical: &str, oracle_result: &str) -> Option<Equivalence> {
    matches_oracle(canonical, oracle_result, self.cfg.relative_tolerance)
  }

  /// Run the three stages for one candidate.
  #[instrument(target = "question", level = "info", skip(self, candidate), fields(answer = %candidate.canonical_answer))]
  pub async fn check(&self, candidate: &Candidate) -> Check {
    let policy = RetryPolicy::new(TRANSLATION_ATTEMPTS, &self.backoff);
    let produce = |round: Round| async move {
      let query = match self.translate(&candidate.content, round.feedback.as_deref()).await {
        Ok(Translation::Query(q)) => q,
        Ok(Translation::NotCheckable(reason)) => return Err(Reject::Fatal(Stop::NotCheckable(reason))),
        Err(Reject::Defect(d)) => return Err(Reject::Defect(d)),
        Err(Reject::Transient(t)) => return Err(Reject::Transient(t)),
        Err(Reject::Fatal(never)) => match never {},
      };
      match self.consult(&query).await {
        Ok(OracleAnswer::Result(result)) => Ok((query, result)),
        Ok(OracleAnswer::Unparseable(_)) => Err(Reject::Defect(format!(
          "the symbolic engine could not interpret `{query}`; use simpler standard syntax"
        ))),
        Err(e) => Err(Reject::Fatal(Stop::OracleDown(e))),
      }
    };

    match policy.run("oracle_query", produce, |_| None).await {
      Ok(accepted) => {
        let (query, result) = accepted.value;
        match self.compare(&candidate.canonical_answer, &result) {
          Some(kind) => {
            info!(target: "question", %query, result = %trunc_for_log(&result, 80), ?kind, "Oracle agrees");
            Check::Agrees { query, result, kind }
          }
          None => {
            warn!(target: "question", %query, result = %trunc_for_log(&result, 80), expected = %candidate.canonical_answer, "Oracle disagrees");
            Check::Disagrees { query, result }
          }
        }
      }
      Err(RetryError::Aborted(Stop::NotCheckable(reason))) => {
        info!(target: "question", %reason, "Question is not symbolically checkable");
        Check::Unverified { reason: format!("not symbolically checkable: {reason}"), query: None, result: None }
      }
      Err(RetryError::Aborted(Stop::OracleDown(e))) => {
        warn!(target: "question", error = %e, "Oracle unavailable; question left unverified");
        Check::Unverified { reason: format!("oracle unavailable: {e}"), query: None, result: None }
      }
      Err(RetryError::Exhausted { last_defect, .. }) => {
        warn!(target: "question", %last_defect, "Query translation failed; question left unverified");
        Check::Unverified { reason: format!("query translation failed: {last_defect}"), query: None, result: None }
      }
    }
  }

  /// Generate and verify, regenerating on oracle disagreement.
  #[instrument(target = "question", level = "info", skip_all, fields(max_regenerations = self.cfg.max_regenerations))]
  pub async fn produce(
    &self,
    generator: &GenerationOrchestrator,
    req: &GenerationRequest<'_>,
  ) -> Result<VerifiedCandidate, VerificationError> {
    let policy = RetryPolicy::new(self.cfg.max_regenerations.saturating_add(1), &self.backoff);
    let produce = |round: Round| async move {
      let req = GenerationRequest { verifier_feedback: round.feedback.as_deref(), ..*req };
      let candidate = generator.generate(&req).await.map_err(Reject::Fatal)?;
      let check = self.check(&candidate).await;
      Ok::<_, Reject<GenerationError>>((candidate, check))
    };
    let validate = |(candidate, check): &(Candidate, Check)| match check {
      Check::Disagrees { result, .. } => Some(format!(
        "its answer `{}` disagrees with the computed result `{}`",
        candidate.answer_text,
        trunc_for_log(result, 80)
      )),
      _ => None,
    };

    match policy.run("verification", produce, validate).await {
      Ok(accepted) => {
        let (candidate, check) = accepted.value;
        Ok(match check {
          Check::Agrees { query, result, .. } => VerifiedCandidate {
            candidate,
            status: VerificationStatus::Verified,
            oracle_query: Some(query),
            oracle_result: Some(result),
            unverified_reason: None,
            flags: Vec::new(),
          },
          Check::Unverified { reason, query, result } => VerifiedCandidate {
            candidate,
            status: VerificationStatus::Unverified,
            oracle_query: query,
            oracle_result: result,
            unverified_reason: Some(reason),
            flags: vec![Degradation::VerificationUnavailable],
          },
          // the validator rejects every disagreement
          Check::Disagrees { query, result } => VerifiedCandidate {
            candidate,
            status: VerificationStatus::Rejected,
            oracle_query: Some(query),
            oracle_result: Some(result),
            unverified_reason: None,
            flags: Vec::new(),
          },
        })
      }
      Err(RetryError::Aborted(e)) => Err(VerificationError::Generation(e)),
      Err(RetryError::Exhausted { attempts, rejected, last_defect }) => {
        let (expected, oracle) = match rejected.into_iter().last() {
          Some(((candidate, Check::Disagrees { result, .. }), _)) => (candidate.canonical_answer, result),
          _ => (String::new(), last_defect),
        };
        warn!(target: "question", attempts, %expected, %oracle, "Verification mismatch persisted");
        Err(VerificationError::Mismatch { attempts, expected, oracle })
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::context::AssembledContext;
  use crate::domain::{DifficultyState, SessionParams};
  use crate::testing::{calculus, config, question_json, translation_json, FixedOracle, ScriptedModel, QUESTION, TRANSLATE};

  fn verifier(model: Arc<ScriptedModel>, oracle: FixedOracle) -> (Verifier, GenerationOrchestrator) {
    let cfg = config();
    let prompts = Arc::new(cfg.prompts.clone());
    let generator = GenerationOrchestrator::new(
      model.clone(),
      prompts.clone(),
      cfg.generation.clone(),
      &cfg.backoff,
      cfg.timeouts.model(),
    );
    let verifier = Verifier::new(model, Arc::new(oracle), prompts, cfg.verification, cfg.backoff, cfg.timeouts);
    (verifier, generator)
  }

  fn candidate(content: &str, answer: &str) -> Candidate {
    Candidate {
      content: content.into(),
      canonical_answer: crate::equivalence::normalize_answer(answer),
      answer_text: answer.into(),
      explanation: String::new(),
      topics: vec![],
      attempts: 1,
    }
  }

  async fn run(v: &Verifier, g: &GenerationOrchestrator) -> Result<VerifiedCandidate, VerificationError> {
    let profile = calculus();
    let params = SessionParams { topics: vec!["Integrals".into()], cumulative: false, adaptive: false, custom_requests: String::new() };
    let ctx = AssembledContext::default();
    let req = GenerationRequest {
      profile: &profile,
      params: &params,
      difficulty: DifficultyState::new(0.5),
      last_attempt: None,
      history: &[],
      context: &ctx,
      verifier_feedback: None,
    };
    v.produce(g, &req).await
  }

  #[tokio::test]
  async fn translation_reads_repaired_output() {
    let model = Arc::new(ScriptedModel::new());
    model
      .push(TRANSLATE, "```json\n{\"query\": \"integrate e^x from 0 to 1\", \"reason\": \"definite integral\"\n```")
      .push(TRANSLATE, r#"{"query": null, "reason": "asks for a historical date"}"#);
    let (v, _) = verifier(model, FixedOracle::always("1"));
    assert_eq!(v.translate("q", None).await.unwrap(), Translation::Query("integrate e^x from 0 to 1".into()));
    assert_eq!(v.translate("q", None).await.unwrap(), Translation::NotCheckable("asks for a historical date".into()));
  }

  #[tokio::test]
  async fn oracle_approximation_matches_exact_answer() {
    let model = Arc::new(ScriptedModel::new());
    model.push(TRANSLATE, translation_json("integrate e^x dx from 0 to 1"));
    let (v, _) = verifier(model, FixedOracle::always("e - 1 ≈ 1.71828"));
    let check = v.check(&candidate("Evaluate $$\\int_0^1 e^x dx$$.", "e-1")).await;
    assert!(matches!(check, Check::Agrees { .. }), "{check:?}");
  }

  #[tokio::test]
  async fn coarse_oracle_decimal_is_a_disagreement() {
    let model = Arc::new(ScriptedModel::new());
    model.push(TRANSLATE, translation_json("sqrt(2)/3"));
    let (v, _) = verifier(model, FixedOracle::always("0.5"));
    let check = v.check(&candidate("Simplify $$\\frac{\\sqrt{8}}{6}$$.", "sqrt(2)/3")).await;
    assert!(matches!(check, Check::Disagrees { .. }), "{check:?}");
  }

  #[tokio::test]
  async fn unparseable_query_is_retranslated() {
    let model = Arc::new(ScriptedModel::new());
    model
      .push(TRANSLATE, translation_json("∫ weird"))
      .push(TRANSLATE, translation_json("integrate x^2 from 0 to 3"));
    let oracle = FixedOracle::sequence(vec![
      Ok(OracleAnswer::Unparseable("Wolfram|Alpha did not understand your input".into())),
      Ok(OracleAnswer::Result("9".into())),
    ]);
    let (v, _) = verifier(model.clone(), oracle);
    let check = v.check(&candidate("Evaluate $$\\int_0^3 x^2 dx$$.", "9")).await;
    assert!(matches!(check, Check::Agrees { kind: Equivalence::Textual, .. }));
    assert!(model.requests()[1].user.contains("could not interpret"));
  }

  #[tokio::test]
  async fn verified_on_first_agreement() {
    let model = Arc::new(ScriptedModel::new());
    model
      .push(QUESTION, question_json("Evaluate $$\\int_0^3 x^2 dx$$.", "9"))
      .push(TRANSLATE, translation_json("integrate x^2 from 0 to 3"));
    let (v, g) = verifier(model, FixedOracle::always("9"));
    let out = run(&v, &g).await.unwrap();
    assert_eq!(out.status, VerificationStatus::Verified);
    assert_eq!(out.oracle_query.as_deref(), Some("integrate x^2 from 0 to 3"));
    assert!(out.flags.is_empty());
  }

  #[tokio::test]
  async fn persistent_disagreement_is_a_mismatch() {
    let model = Arc::new(ScriptedModel::new());
    for n in [8, 10, 12] {
      model
        .push(QUESTION, question_json("Evaluate $$\\int_0^3 x^2 dx$$.", &n.to_string()))
        .push(TRANSLATE, translation_json("integrate x^2 from 0 to 3"));
    }
    let (v, g) = verifier(model.clone(), FixedOracle::always("9"));
    let err = run(&v, &g).await.unwrap_err();
    match err {
      VerificationError::Mismatch { attempts, expected, oracle } => {
        assert_eq!(attempts, 3);
        assert_eq!(expected, "12");
        assert_eq!(oracle, "9");
      }
      other => panic!("unexpected {other:?}"),
    }
    let question_requests: Vec<_> = model.requests().into_iter().filter(|r| r.system.contains(QUESTION)).collect();
    assert_eq!(question_requests.len(), 3);
    assert!(question_requests[1].user.contains("rejected by independent verification"));
  }

  #[tokio::test]
  async fn regeneration_recovers_after_disagreement() {
    let model = Arc::new(ScriptedModel::new());
    model
      .push(QUESTION, question_json("Evaluate $$\\int_0^3 x^2 dx$$.", "8"))
      .push(TRANSLATE, translation_json("integrate x^2 from 0 to 3"))
      .push(QUESTION, question_json("Evaluate $$\\int_0^3 x^2 dx$$.", "9"))
      .push(TRANSLATE, translation_json("integrate x^2 from 0 to 3"));
    let (v, g) = verifier(model, FixedOracle::always("9"));
    let out = run(&v, &g).await.unwrap();
    assert_eq!(out.status, VerificationStatus::Verified);
    assert_eq!(out.candidate.canonical_answer, "9");
  }

  #[tokio::test]
  async fn oracle_outage_leaves_question_unverified() {
    let model = Arc::new(ScriptedModel::new());
    model
      .push(QUESTION, question_json("Evaluate $$\\int_0^3 x^2 dx$$.", "9"))
      .push(TRANSLATE, translation_json("integrate x^2 from 0 to 3"));
    let oracle = FixedOracle::sequence(vec![Err(ServiceError::Unavailable("symbolic oracle"))]);
    let (v, g) = verifier(model, oracle);
    let out = run(&v, &g).await.unwrap();
    assert_eq!(out.status, VerificationStatus::Unverified);
    assert_eq!(out.flags, vec![Degradation::VerificationUnavailable]);
    assert!(out.unverified_reason.unwrap().contains("oracle unavailable"));
  }

  #[tokio::test]
  async fn generation_failure_aborts_verification() {
    let model = Arc::new(ScriptedModel::new());
    let (v, g) = verifier(model, FixedOracle::always("9"));
    let err = run(&v, &g).await.unwrap_err();
    assert!(matches!(err, VerificationError::Generation(GenerationError::Exhausted { .. })));
  }
}
