//! Question generation: one prompt in, one validated candidate out.
//!
//! The prompt combines the class profile (style notes, sample problems), the session scope
//! (topics, cumulative/isolated mode, custom requests), the difficulty target, recent
//! questions and the assembled course material. The raw model response goes through the
//! repair parser and is checked for the required fields and a comparable canonical answer.
//! Defects are fed back as a corrective instruction on the next attempt.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::config::{BackoffCfg, GenerationCfg, Prompts};
use crate::context::AssembledContext;
use crate::domain::{Attempt, ClassProfile, DifficultyState, Question, SessionParams};
use crate::equivalence::check_canonical;
use crate::error::GenerationError;
use crate::repair;
use crate::retry::{Reject, RetryError, RetryPolicy, Round};
use crate::services::{GenerationModel, ModelRequest, ModelTier};
use crate::util::{fill_template, trunc_for_log, with_timeout};

/// Everything the generator needs to know about the session, borrowed from the coordinator.
#[derive(Clone, Copy, Debug)]
pub struct GenerationRequest<'a> {
  pub profile: &'a ClassProfile,
  pub params: &'a SessionParams,
  pub difficulty: DifficultyState,
  pub last_attempt: Option<&'a Attempt>,
  pub history: &'a [Question],
  pub context: &'a AssembledContext,
  /// Why a previous candidate failed independent verification, if it did.
  pub verifier_feedback: Option<&'a str>,
}

/// A validated candidate. Not yet a `Question`: verification decides its status.
#[derive(Clone, Debug)]
pub struct Candidate {
  pub content: String,
  pub canonical_answer: String,
  pub answer_text: String,
  pub explanation: String,
  pub topics: Vec<String>,
  pub attempts: u32,
}

#[derive(Debug, Deserialize)]
struct Draft {
  content: String,
  answer: Value,
  explanation: String,
  #[serde(default)]
  topics: Vec<String>,
}

impl Draft {
  fn answer_text(&self) -> Option<String> {
    match &self.answer {
      Value::String(s) => Some(s.trim().to_string()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    }
  }
}

pub struct GenerationOrchestrator {
  model: Arc<dyn GenerationModel>,
  prompts: Arc<Prompts>,
  cfg: GenerationCfg,
  policy: RetryPolicy,
  timeout: Duration,
}

impl GenerationOrchestrator {
  pub fn new(
    model: Arc<dyn GenerationModel>,
    prompts: Arc<Prompts>,
    cfg: GenerationCfg,
    backoff: &BackoffCfg,
    timeout: Duration,
  ) -> Self {
    let policy = RetryPolicy::new(cfg.max_attempts, backoff);
    Self { model, prompts, cfg, policy, timeout }
  }

  #[instrument(target = "question", level = "info", skip(self, req), fields(class_id = %req.profile.id, difficulty = req.difficulty.d))]
  pub async fn generate(&self, req: &GenerationRequest<'_>) -> Result<Candidate, GenerationError> {
    let max_chars = self.cfg.max_answer_chars;
    let produce = |round: Round| {
      let user = self.user_prompt(req, round.feedback.as_deref());
      async move {
        let request = ModelRequest {
          system: self.prompts.question_system.clone(),
          user,
          temperature: self.cfg.temperature,
          tier: ModelTier::Strong,
          json: true,
          image: None,
        };
        let raw = with_timeout("generation model", self.timeout, self.model.complete(request))
          .await
          .map_err(|e| Reject::<Infallible>::Transient(e.to_string()))?;
        info!(target: "question", attempt = round.attempt, raw = %trunc_for_log(&raw, 160), "Model draft received");
        repair::parse_as::<Draft>(&raw)
          .map_err(|e| Reject::<Infallible>::Defect(format!("the response was not the requested JSON object ({e})")))
      }
    };
    let validate = |draft: &Draft| defect(draft, max_chars);

    match self.policy.run("question", produce, validate).await {
      Ok(accepted) => {
        let draft = accepted.value;
        let answer_text = draft.answer_text().unwrap_or_default();
        let canonical_answer = check_canonical(&answer_text, max_chars).unwrap_or_default();
        let topics = known_topics(req.profile, &draft.topics, &req.params.topics);
        info!(target: "question", attempts = accepted.attempts, answer = %canonical_answer, "Candidate accepted");
        Ok(Candidate {
          content: draft.content.trim().to_string(),
          canonical_answer,
          answer_text,
          explanation: draft.explanation.trim().to_string(),
          topics,
          attempts: accepted.attempts,
        })
      }
      Err(RetryError::Exhausted { attempts, last_defect, .. }) => {
        Err(GenerationError::Exhausted { attempts, last_defect })
      }
      Err(RetryError::Aborted(never)) => match never {},
    }
  }

  fn user_prompt(&self, req: &GenerationRequest<'_>, defect: Option<&str>) -> String {
    let p = req.profile;
    let topics = if req.params.topics.is_empty() {
      p.topic_names().join(", ")
    } else {
      req.params.topics.join(", ")
    };
    let mode_instruction = if req.params.cumulative {
      let background = p.background_topics(&req.params.topics);
      if background.is_empty() {
        "Cumulative mode: the question may combine any of the focus topics.".to_string()
      } else {
        format!(
          "Cumulative mode: the question may also draw on earlier material ({}), but must exercise a focus topic.",
          background.join(", ")
        )
      }
    } else {
      "Isolated mode: use ONLY the focus topics.".to_string()
    };
    let adaptive_instruction = match (req.params.adaptive, req.last_attempt) {
      (true, Some(a)) if a.correct => {
        "The student answered the previous question correctly; make this one slightly harder.".to_string()
      }
      (true, Some(_)) => {
        "The student missed the previous question; make this one slightly easier and target the same skill.".to_string()
      }
      _ => String::new(),
    };
    let history = req
      .history
      .iter()
      .rev()
      .take(self.cfg.history_window)
      .rev()
      .map(|q| format!("- {}", trunc_for_log(&q.content, 160)))
      .collect::<Vec<_>>();

    let mut corrective = String::new();
    if let Some(v) = req.verifier_feedback {
      corrective.push_str(&format!(
        "\nA previous question was rejected by independent verification: {v}. Write a different question and check its answer carefully."
      ));
    }
    if let Some(d) = defect {
      corrective.push_str(&format!(
        "\nYour previous response was rejected: {d}. Fix this and return the complete JSON object again."
      ));
    }

    let style_notes = or_none(p.style_notes.join("; "));
    let samples = or_none(p.sample_problems.iter().map(|s| format!("- {s}")).collect::<Vec<_>>().join("\n"));
    let difficulty = format!("{:.2}", req.difficulty.d);
    let level = req.difficulty.level().to_string();
    let custom = or_none(req.params.custom_requests.trim().to_string());
    let context = or_none(req.context.text.clone());
    let history = or_none(history.join("\n"));

    fill_template(
      &self.prompts.question_user_template,
      &[
        ("class_name", p.name.as_str()),
        ("style_notes", style_notes.as_str()),
        ("sample_problems", samples.as_str()),
        ("topics", topics.as_str()),
        ("mode_instruction", mode_instruction.as_str()),
        ("difficulty", difficulty.as_str()),
        ("level", level.as_str()),
        ("adaptive_instruction", adaptive_instruction.as_str()),
        ("custom_requests", custom.as_str()),
        ("context", context.as_str()),
        ("history", history.as_str()),
        ("corrective", corrective.as_str()),
      ],
    )
  }
}

fn defect(draft: &Draft, max_chars: usize) -> Option<String> {
  if draft.content.trim().is_empty() {
    return Some("`content` is empty".into());
  }
  if draft.explanation.trim().is_empty() {
    return Some("`explanation` is empty".into());
  }
  let Some(answer) = draft.answer_text() else {
    return Some("`answer` must be a string holding the final value or expression".into());
  };
  check_canonical(&answer, max_chars).err()
}

/// The claimed topics the class actually has, in the class's spelling; the session's
/// focus topics when none of them are known.
fn known_topics(profile: &ClassProfile, claimed: &[String], fallback: &[String]) -> Vec<String> {
  let names = profile.topic_names();
  let mut out: Vec<String> = Vec::new();
  for t in claimed {
    match names.iter().find(|n| n.eq_ignore_ascii_case(t.trim())) {
      Some(name) if !out.iter().any(|o| o == name) => out.push(name.to_string()),
      Some(_) => {}
      None => warn!(target: "question", class_id = %profile.id, topic = %trunc_for_log(t, 60), "Dropping topic outside the class"),
    }
  }
  if out.is_empty() { fallback.to_vec() } else { out }
}

fn or_none(s: String) -> String {
  if s.trim().is_empty() { "(none)".into() } else { s }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::equivalence::normalize_answer;
  use crate::testing::{calculus, config, question_json, ScriptedModel, QUESTION};

  fn orchestrator(model: Arc<ScriptedModel>) -> GenerationOrchestrator {
    let cfg = config();
    GenerationOrchestrator::new(model, Arc::new(cfg.prompts), cfg.generation, &cfg.backoff, Duration::from_secs(5))
  }

  fn params(cumulative: bool) -> SessionParams {
    SessionParams { topics: vec!["Chain rule".into()], cumulative, adaptive: true, custom_requests: "trig functions".into() }
  }

  #[tokio::test]
  async fn recovers_after_two_malformed_responses() {
    let model = Arc::new(ScriptedModel::new());
    model
      .push(QUESTION, "Sure! Here is a question about derivatives.")
      .push(QUESTION, r#"{"content": "Differentiate $$\sin(x^2)$$", "explanation": "chain rule"}"#)
      .push(QUESTION, question_json("Differentiate $$\\sin(x^2)$$.", "2x\\cos(x^2)"));
    let profile = calculus();
    let p = params(false);
    let ctx = AssembledContext::default();
    let req = GenerationRequest {
      profile: &profile,
      params: &p,
      difficulty: DifficultyState::new(0.5),
      last_attempt: None,
      history: &[],
      context: &ctx,
      verifier_feedback: None,
    };
    let c = orchestrator(model.clone()).generate(&req).await.unwrap();
    assert_eq!(c.attempts, 3);
    assert_eq!(c.canonical_answer, normalize_answer("2x\\cos(x^2)"));
    let requests = model.requests();
    assert!(requests[1].user.contains("Your previous response was rejected"));
    assert!(requests[2].user.contains("missing field"));
  }

  #[tokio::test]
  async fn exhaustion_raises_generation_error() {
    let model = Arc::new(ScriptedModel::new());
    for _ in 0..3 {
      model.push(QUESTION, "```json\n{\"content\": \"\", \"answer\": \"1\", \"explanation\": \"x\"}\n```");
    }
    let profile = calculus();
    let p = params(false);
    let ctx = AssembledContext::default();
    let req = GenerationRequest {
      profile: &profile,
      params: &p,
      difficulty: DifficultyState::new(0.2),
      last_attempt: None,
      history: &[],
      context: &ctx,
      verifier_feedback: None,
    };
    let err = orchestrator(model.clone()).generate(&req).await.unwrap_err();
    let GenerationError::Exhausted { attempts, last_defect } = err;
    assert_eq!(attempts, 3);
    assert!(last_defect.contains("content"));
    assert_eq!(model.calls(), 3);
  }

  #[tokio::test]
  async fn prose_answers_are_sent_back() {
    let model = Arc::new(ScriptedModel::new());
    model
      .push(QUESTION, question_json("Find the limit.", "the limit does not exist because both sides disagree"))
      .push(QUESTION, r#"{"content": "Evaluate $$\lim_{x\to0} \frac{\sin x}{x}$$", "answer": 1, "explanation": "standard limit"}"#);
    let profile = calculus();
    let p = params(false);
    let ctx = AssembledContext::default();
    let req = GenerationRequest {
      profile: &profile,
      params: &p,
      difficulty: DifficultyState::new(0.5),
      last_attempt: None,
      history: &[],
      context: &ctx,
      verifier_feedback: None,
    };
    let c = orchestrator(model.clone()).generate(&req).await.unwrap();
    assert_eq!(c.canonical_answer, "1");
    assert!(c.content.contains("\\frac"));
    assert_eq!(c.topics, vec!["Chain rule"]);
    assert!(model.requests()[1].user.contains("reads like an explanation"));
  }

  #[tokio::test]
  async fn claimed_topics_are_limited_to_the_class() {
    let model = Arc::new(ScriptedModel::new());
    let draft = |topics: serde_json::Value| {
      serde_json::json!({
        "content": "Differentiate $$\\cos(3x)$$.",
        "answer": "-3\\sin(3x)",
        "explanation": "Outer derivative times inner derivative.",
        "topics": topics,
      })
      .to_string()
    };
    model
      .push(QUESTION, draft(serde_json::json!(["Thermodynamics", "Medieval history"])))
      .push(QUESTION, draft(serde_json::json!(["chain rule", "Thermodynamics", "DERIVATIVES", "Chain Rule"])));
    let profile = calculus();
    let p = params(false);
    let ctx = AssembledContext::default();
    let req = GenerationRequest {
      profile: &profile,
      params: &p,
      difficulty: DifficultyState::new(0.5),
      last_attempt: None,
      history: &[],
      context: &ctx,
      verifier_feedback: None,
    };
    let gen = orchestrator(model);
    assert_eq!(gen.generate(&req).await.unwrap().topics, vec!["Chain rule"]);
    assert_eq!(gen.generate(&req).await.unwrap().topics, vec!["Chain rule", "Derivatives"]);
  }

  #[tokio::test]
  async fn prompt_carries_scope_mode_and_history() {
    let model = Arc::new(ScriptedModel::new());
    model.push(QUESTION, question_json("Differentiate $$e^{3x}$$.", "3e^{3x}"));
    let profile = calculus();
    let p = params(true);
    let ctx = AssembledContext { text: "[Derivatives] chain rule notes".into(), ..Default::default() };
    let last = Attempt {
      question_id: "q0".into(),
      answer: "2".into(),
      correct: false,
      feedback: String::new(),
      counted: true,
      at: chrono::Utc::now(),
    };
    let req = GenerationRequest {
      profile: &profile,
      params: &p,
      difficulty: DifficultyState::new(0.75),
      last_attempt: Some(&last),
      history: &[],
      context: &ctx,
      verifier_feedback: Some("oracle computed 6x"),
    };
    orchestrator(model.clone()).generate(&req).await.unwrap();
    let user = &model.requests()[0].user;
    assert!(user.contains("Focus topics: Chain rule"));
    assert!(user.contains("earlier material (Limits, Derivatives)"));
    assert!(user.contains("level 4 of 5"));
    assert!(user.contains("slightly easier"));
    assert!(user.contains("trig functions"));
    assert!(user.contains("chain rule notes"));
    assert!(user.contains("oracle computed 6x"));
    assert!(user.contains("Recent questions (do NOT repeat):\n(none)"));
  }
}
