//! Domain models: class profiles, sessions, questions, attempts, hints and difficulty state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Degradation;

pub type ClassId = String;
pub type SessionId = String;
pub type QuestionId = String;

/// One node of a course's topic hierarchy (unit -> topic -> subtopic).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TopicNode {
  pub name: String,
  #[serde(default)]
  pub children: Vec<TopicNode>,
}

/// Course-level context: read-mostly, shared by every session of the class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassProfile {
  pub id: ClassId,
  pub name: String,
  pub topics: Vec<TopicNode>,
  #[serde(default)] pub style_notes: Vec<String>,
  #[serde(default)] pub textbook: Option<String>,
  #[serde(default)] pub sample_problems: Vec<String>,
}

impl ClassProfile {
  /// All topic names in syllabus order (pre-order walk).
  pub fn topic_names(&self) -> Vec<&str> {
    fn walk<'a>(nodes: &'a [TopicNode], out: &mut Vec<&'a str>) {
      for n in nodes {
        out.push(&n.name);
        walk(&n.children, out);
      }
    }
    let mut out = Vec::new();
    walk(&self.topics, &mut out);
    out
  }

  /// Topics a cumulative session may mix in: material that comes before the selected topics
  /// in the syllabus. Falls back to every unselected topic when the selection starts the course.
  pub fn background_topics(&self, selected: &[String]) -> Vec<String> {
    let names = self.topic_names();
    let is_selected = |t: &str| selected.iter().any(|s| s.eq_ignore_ascii_case(t));
    let first = names.iter().position(|t| is_selected(t));
    let earlier: Vec<String> = match first {
      Some(idx) => names[..idx].iter().filter(|t| !is_selected(t)).map(|t| t.to_string()).collect(),
      None => Vec::new(),
    };
    if !earlier.is_empty() {
      return earlier;
    }
    names.into_iter().filter(|t| !is_selected(t)).map(str::to_string).collect()
  }
}

/// User-controlled session parameters. The difficulty scalar lives in `DifficultyState`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionParams {
  pub topics: Vec<String>,
  pub cumulative: bool,
  pub adaptive: bool,
  #[serde(default)]
  pub custom_requests: String,
}

/// Partial update; absent fields are left untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParamsUpdate {
  #[serde(default)] pub difficulty: Option<f64>,
  #[serde(default)] pub topics: Option<Vec<String>>,
  #[serde(default)] pub cumulative: Option<bool>,
  #[serde(default)] pub adaptive: Option<bool>,
  #[serde(default)] pub custom_requests: Option<String>,
}

/// Adaptive state: difficulty `d` in [0, 1], consecutive correct `c`, consecutive incorrect `w`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DifficultyState {
  pub d: f64,
  pub c: u32,
  pub w: u32,
}

impl DifficultyState {
  pub fn new(d: f64) -> Self {
    Self { d: clamp_unit(d), c: 0, w: 0 }
  }

  /// Discrete 1..=5 level, for prompts.
  pub fn level(&self) -> u8 {
    (1.0 + (self.d * 4.0).round()).clamp(1.0, 5.0) as u8
  }
}

pub fn clamp_unit(x: f64) -> f64 {
  if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
  Verified,
  Unverified,
  Rejected,
}

/// A published practice item. Immutable once it is in a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Question {
  pub id: QuestionId,
  pub session_id: SessionId,
  pub content: String,
  /// Normalized comparable form (see `equivalence::normalize_answer`).
  pub canonical_answer: String,
  /// The answer as the model wrote it, shown back to the student.
  pub answer_text: String,
  pub explanation: String,
  pub topics: Vec<String>,
  pub difficulty: f64,
  pub status: VerificationStatus,
  #[serde(default)] pub oracle_query: Option<String>,
  #[serde(default)] pub oracle_result: Option<String>,
  #[serde(default)] pub unverified_reason: Option<String>,
  #[serde(default)] pub flags: Vec<Degradation>,
  pub created_at: DateTime<Utc>,
}

impl Question {
  /// Unverified questions never feed mastery or difficulty signals.
  pub fn counts_toward_mastery(&self) -> bool {
    self.status == VerificationStatus::Verified
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attempt {
  pub question_id: QuestionId,
  pub answer: String,
  pub correct: bool,
  pub feedback: String,
  /// Whether this attempt fed the adaptive controller.
  pub counted: bool,
  pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
  pub is_correct: bool,
  pub correct_answer: String,
  pub explanation: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HintTier {
  /// Conceptual / metacognitive nudge, no procedure.
  Conceptual,
  /// One procedural step tied to a named sub-skill.
  Procedural,
  /// Near-complete scaffold stopping short of the final answer.
  Scaffold,
}

impl HintTier {
  /// Tier for the next hint given how many were already served.
  pub fn after(prior_hints: usize) -> Self {
    match prior_hints {
      0 => HintTier::Conceptual,
      1 => HintTier::Procedural,
      _ => HintTier::Scaffold,
    }
  }

  pub fn number(self) -> u8 {
    match self {
      HintTier::Conceptual => 1,
      HintTier::Procedural => 2,
      HintTier::Scaffold => 3,
    }
  }
}

/// Student work attached to a hint request.
#[derive(Clone, Debug)]
pub enum Artifact {
  Text(String),
  Image { mime: String, bytes: Vec<u8> },
}

/// Whether a hint agrees with the step the student wrote down.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepCheck {
  pub consistent: bool,
  pub explanation: String,
  #[serde(default)] pub oracle_query: Option<String>,
  #[serde(default)] pub oracle_result: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hint {
  pub question_id: QuestionId,
  pub tier: HintTier,
  pub text: String,
  #[serde(default)] pub sub_skill: Option<String>,
  pub struggle: String,
  #[serde(default)] pub artifact_ref: Option<String>,
  /// Served although it resembles an earlier hint (regeneration budget exhausted).
  #[serde(default)] pub forced_duplicate: bool,
  /// Present when the request carried the student's current step as text.
  #[serde(default)] pub step_check: Option<StepCheck>,
  #[serde(default)] pub flags: Vec<Degradation>,
  pub created_at: DateTime<Utc>,
}

/// Answer counts for one topic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicMetrics {
  pub topic: String,
  pub total_answers: u32,
  pub right_answers: u32,
}

/// One practice run. Owned and mutated only by the session coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
  pub id: SessionId,
  pub class_id: ClassId,
  pub name: String,
  pub params: SessionParams,
  pub difficulty: DifficultyState,
  pub questions: Vec<Question>,
  pub attempts: Vec<Attempt>,
  pub hints: HashMap<QuestionId, Vec<Hint>>,
  pub created_at: DateTime<Utc>,
}

impl Session {
  pub fn question(&self, id: &str) -> Option<&Question> {
    self.questions.iter().find(|q| q.id == id)
  }

  pub fn hints_for(&self, question_id: &str) -> &[Hint] {
    self.hints.get(question_id).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Answers per topic, over verified questions only. Topics appear in first-answered order.
  pub fn topic_metrics(&self) -> Vec<TopicMetrics> {
    let mut out: Vec<TopicMetrics> = Vec::new();
    for attempt in &self.attempts {
      let Some(q) = self.question(&attempt.question_id) else { continue };
      if !q.counts_toward_mastery() {
        continue;
      }
      for topic in &q.topics {
        let idx = match out.iter().position(|m| &m.topic == topic) {
          Some(i) => i,
          None => {
            out.push(TopicMetrics { topic: topic.clone(), total_answers: 0, right_answers: 0 });
            out.len() - 1
          }
        };
        out[idx].total_answers += 1;
        if attempt.correct {
          out[idx].right_answers += 1;
        }
      }
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn profile() -> ClassProfile {
    ClassProfile {
      id: "calc".into(),
      name: "Calculus".into(),
      topics: vec![
        TopicNode { name: "Limits".into(), children: vec![TopicNode { name: "Continuity".into(), children: vec![] }] },
        TopicNode { name: "Derivatives".into(), children: vec![TopicNode { name: "Chain rule".into(), children: vec![] }] },
      ],
      style_notes: vec![],
      textbook: None,
      sample_problems: vec![],
    }
  }

  #[test]
  fn background_topics_are_earlier_material() {
    let p = profile();
    assert_eq!(p.topic_names(), vec!["Limits", "Continuity", "Derivatives", "Chain rule"]);
    assert_eq!(p.background_topics(&["Chain rule".into()]), vec!["Limits", "Continuity", "Derivatives"]);
    assert_eq!(p.background_topics(&["limits".into()]), vec!["Continuity", "Derivatives", "Chain rule"]);
  }

  #[test]
  fn tiers_advance_and_cap() {
    let tiers: Vec<u8> = (0..5).map(|n| HintTier::after(n).number()).collect();
    assert_eq!(tiers, vec![1, 2, 3, 3, 3]);
  }

  fn question(id: &str, topics: &[&str], status: VerificationStatus) -> Question {
    Question {
      id: id.into(),
      session_id: "s1".into(),
      content: String::new(),
      canonical_answer: "1".into(),
      answer_text: "1".into(),
      explanation: String::new(),
      topics: topics.iter().map(|t| t.to_string()).collect(),
      difficulty: 0.5,
      status,
      oracle_query: None,
      oracle_result: None,
      unverified_reason: None,
      flags: vec![],
      created_at: Utc::now(),
    }
  }

  fn attempt(question_id: &str, correct: bool) -> Attempt {
    Attempt { question_id: question_id.into(), answer: "1".into(), correct, feedback: String::new(), counted: false, at: Utc::now() }
  }

  #[test]
  fn metrics_count_answers_on_verified_questions() {
    let session = Session {
      id: "s1".into(),
      class_id: "calc".into(),
      name: "practice".into(),
      params: SessionParams { topics: vec![], cumulative: false, adaptive: true, custom_requests: String::new() },
      difficulty: DifficultyState::new(0.5),
      questions: vec![
        question("q1", &["Derivatives", "Chain rule"], VerificationStatus::Verified),
        question("q2", &["Limits"], VerificationStatus::Verified),
        question("q3", &["Limits"], VerificationStatus::Unverified),
      ],
      attempts: vec![
        attempt("q1", false),
        attempt("q1", true),
        attempt("q2", true),
        attempt("q3", true),
        attempt("gone", true),
      ],
      hints: HashMap::new(),
      created_at: Utc::now(),
    };
    let m = session.topic_metrics();
    let row = |topic: &str, total, right| TopicMetrics { topic: topic.into(), total_answers: total, right_answers: right };
    assert_eq!(m, vec![row("Derivatives", 2, 1), row("Chain rule", 2, 1), row("Limits", 1, 1)]);
  }

  #[test]
  fn difficulty_level_mapping() {
    assert_eq!(DifficultyState::new(0.0).level(), 1);
    assert_eq!(DifficultyState::new(0.5).level(), 3);
    assert_eq!(DifficultyState::new(7.0).level(), 5);
    assert_eq!(DifficultyState::new(f64::NAN).d, 0.0);
  }
}
