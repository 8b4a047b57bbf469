//! Answer grading.
//!
//! The local equivalence check runs first; a match needs no model call. Otherwise the model
//! grades (accepting equivalent forms the local check cannot see, e.g. words vs symbols).
//! If the model is unavailable or its verdict is unreadable, the local verdict stands.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, instrument};

use crate::config::Prompts;
use crate::domain::{Feedback, Question};
use crate::equivalence::equivalent;
use crate::repair;
use crate::services::{GenerationModel, ModelRequest, ModelTier};
use crate::util::{fill_template, with_timeout};

#[derive(Debug, Deserialize)]
struct Verdict {
  correct: bool,
  #[serde(default)]
  feedback: String,
}

pub struct Grader {
  model: Arc<dyn GenerationModel>,
  prompts: Arc<Prompts>,
  relative_tolerance: f64,
  timeout: Duration,
}

impl Grader {
  pub fn new(model: Arc<dyn GenerationModel>, prompts: Arc<Prompts>, relative_tolerance: f64, timeout: Duration) -> Self {
    Self { model, prompts, relative_tolerance, timeout }
  }

  /// Returns the feedback and where the verdict came from ("local", "model", "local_fallback").
  #[instrument(level = "info", skip(self, question, answer), fields(question_id = %question.id, answer_len = answer.len()))]
  pub async fn grade(&self, question: &Question, answer: &str) -> (Feedback, &'static str) {
    let answer = answer.trim();
    if answer.is_empty() {
      return (self.feedback(question, false, "No answer was given."), "local");
    }
    if let Some(kind) = equivalent(&question.answer_text, answer, self.relative_tolerance) {
      info!(target: "session", ?kind, "Answer matched locally");
      return (self.feedback(question, true, ""), "local");
    }

    let user = fill_template(
      &self.prompts.grade_user_template,
      &[("question", question.content.as_str()), ("expected", question.answer_text.as_str()), ("answer", answer)],
    );
    let req = ModelRequest {
      system: self.prompts.grade_system.clone(),
      user,
      temperature: 0.0,
      tier: ModelTier::Strong,
      json: true,
      image: None,
    };
    let verdict = match with_timeout("generation model", self.timeout, self.model.complete(req)).await {
      Ok(raw) => repair::parse_as::<Verdict>(&raw).map_err(|e| e.to_string()),
      Err(e) => Err(e.to_string()),
    };
    match verdict {
      Ok(v) => {
        info!(target: "session", correct = v.correct, "Answer graded by model");
        (self.feedback(question, v.correct, &v.feedback), "model")
      }
      Err(e) => {
        error!(target: "session", question_id = %question.id, error = %e, "Model grading failed; using local verdict.");
        (self.feedback(question, false, ""), "local_fallback")
      }
    }
  }

  fn feedback(&self, question: &Question, is_correct: bool, note: &str) -> Feedback {
    let note = note.trim();
    let explanation = match (note.is_empty(), question.explanation.trim().is_empty()) {
      (true, _) => question.explanation.clone(),
      (false, true) => note.to_string(),
      (false, false) => format!("{note}\n\n{}", question.explanation),
    };
    Feedback { is_correct, correct_answer: question.answer_text.clone(), explanation }
  }
}
