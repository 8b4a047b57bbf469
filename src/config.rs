//! Loading agent configuration (prompts, pipeline tuning, class profiles) from TOML.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! See `AgentConfig` for the expected schema.

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

use crate::domain::TopicNode;

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
  pub prompts: Prompts,
  pub generation: GenerationCfg,
  pub verification: VerificationCfg,
  pub difficulty: DifficultyCfg,
  pub hints: HintCfg,
  pub context: ContextCfg,
  pub backoff: BackoffCfg,
  pub timeouts: TimeoutCfg,
  pub classes: Vec<ClassCfg>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GenerationCfg {
  /// Model calls per candidate before giving up.
  pub max_attempts: u32,
  /// Longest accepted canonical answer (normalized chars).
  pub max_answer_chars: usize,
  /// Recent questions shown to the model so it does not repeat them.
  pub history_window: usize,
  pub temperature: f32,
}

impl Default for GenerationCfg {
  fn default() -> Self {
    Self { max_attempts: 3, max_answer_chars: 200, history_window: 8, temperature: 0.4 }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VerificationCfg {
  /// Fresh candidates requested after an oracle disagreement.
  pub max_regenerations: u32,
  pub relative_tolerance: f64,
  /// Publish questions the oracle could not check.
  pub show_unverified: bool,
  /// Longest student answer accepted for grading (chars).
  pub max_student_answer_chars: usize,
}

impl Default for VerificationCfg {
  fn default() -> Self {
    Self { max_regenerations: 2, relative_tolerance: 1e-6, show_unverified: false, max_student_answer_chars: 1000 }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DifficultyCfg {
  pub correct_threshold: u32,
  pub incorrect_threshold: u32,
  pub step_up: f64,
  pub step_down: f64,
  pub initial: f64,
}

impl Default for DifficultyCfg {
  fn default() -> Self {
    Self { correct_threshold: 3, incorrect_threshold: 2, step_up: 0.1, step_down: 0.1, initial: 0.5 }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HintCfg {
  /// Embedding cosine above which a hint repeats an earlier one.
  pub semantic_threshold: f32,
  /// Lexical score above which a hint repeats an earlier one (no embeddings available).
  pub similarity_threshold: f32,
  pub max_attempts: u32,
  pub temperature: f32,
  /// Check hints against the student's written step when one is attached.
  pub check_steps: bool,
}

impl Default for HintCfg {
  fn default() -> Self {
    Self { semantic_threshold: 0.88, similarity_threshold: 0.8, max_attempts: 3, temperature: 0.5, check_steps: true }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ContextCfg {
  /// Target size of the assembled context, in estimated tokens.
  pub token_budget: usize,
  pub top_k: usize,
  /// Retrieval may pull up to `token_budget * retrieval_factor` before compression.
  pub retrieval_factor: usize,
  pub compression_aggressiveness: f32,
}

impl Default for ContextCfg {
  fn default() -> Self {
    Self { token_budget: 1200, top_k: 8, retrieval_factor: 4, compression_aggressiveness: 0.3 }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BackoffCfg {
  pub base_ms: u64,
  pub max_ms: u64,
}

impl Default for BackoffCfg {
  fn default() -> Self {
    Self { base_ms: 200, max_ms: 2000 }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutCfg {
  pub model_secs: u64,
  pub oracle_secs: u64,
  pub retrieval_secs: u64,
  pub compression_secs: u64,
}

impl Default for TimeoutCfg {
  fn default() -> Self {
    Self { model_secs: 30, oracle_secs: 15, retrieval_secs: 5, compression_secs: 5 }
  }
}

impl TimeoutCfg {
  pub fn model(&self) -> Duration { Duration::from_secs(self.model_secs) }
  pub fn oracle(&self) -> Duration { Duration::from_secs(self.oracle_secs) }
  pub fn retrieval(&self) -> Duration { Duration::from_secs(self.retrieval_secs) }
  pub fn compression(&self) -> Duration { Duration::from_secs(self.compression_secs) }
}

/// Class profile entry accepted in TOML configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ClassCfg {
  pub id: String,
  pub name: String,
  #[serde(default)] pub topics: Vec<TopicNode>,
  #[serde(default)] pub style_notes: Vec<String>,
  #[serde(default)] pub textbook: Option<String>,
  #[serde(default)] pub sample_problems: Vec<String>,
  /// Course material indexed for retrieval when no external vector store is configured.
  #[serde(default)] pub materials: Vec<MaterialCfg>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MaterialCfg {
  pub topic: String,
  pub text: String,
}

/// Prompts used against the generation model. Placeholders are `{name}` (see `util::fill_template`).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  // Question generation
  pub question_system: String,
  pub question_user_template: String,
  // Question -> oracle query translation
  pub oracle_query_system: String,
  pub oracle_query_user_template: String,
  // Answer grading
  pub grade_system: String,
  pub grade_user_template: String,
  // Hints
  pub hint_system: String,
  pub hint_user_template: String,
  // Hint vs. the student's current step
  pub step_check_system: String,
  pub step_check_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      question_system: "You generate free-response practice questions for a tutoring system. \
        Respond ONLY with one JSON object, no markdown, no code fences. \
        Use LaTeX for math delimited by $$ ... $$ and escape backslashes for JSON. \
        Match the style of the course's sample problems exactly.".into(),
      question_user_template: "Course: {class_name}\n\
        Style notes: {style_notes}\n\
        Sample problems (mimic their style):\n{sample_problems}\n\
        Focus topics: {topics}\n\
        {mode_instruction}\n\
        Target difficulty: {difficulty} on a 0-1 scale (level {level} of 5).\n\
        {adaptive_instruction}\n\
        Student requests (prioritize): {custom_requests}\n\
        Course material:\n{context}\n\
        Recent questions (do NOT repeat):\n{history}\n\
        Return JSON: {\"content\": string, \"answer\": string, \"explanation\": string, \"topics\": [string]}.\n\
        `answer` must be ONLY the final value or expression in a normalized form (e.g. \"x=7\", \"e-1\", \"5(4x-3)\"), no words.\
        {corrective}".into(),
      oracle_query_system: "You convert a practice question into ONE query for a symbolic math engine \
        (Wolfram-style natural language or Mathematica syntax). Respond ONLY with JSON.".into(),
      oracle_query_user_template: "Question: {question}\n\
        Return JSON {\"query\": string | null, \"reason\": string}. \
        The query must compute the final answer of the question, not check a given one. \
        Use null when the question is not symbolically checkable (history, definitions, proofs).\
        {corrective}".into(),
      grade_system: "You are a strict but fair grader. Reply ONLY with compact JSON.".into(),
      grade_user_template: "Question: {question}\nCorrect answer: {expected}\nStudent answer: {answer}\n\
        Return JSON {\"correct\": boolean, \"feedback\": string}. Accept equivalent forms and missing units \
        when the value is right; reject wrong units. Feedback: one or two sentences explaining what went wrong, \
        or confirming the key idea when correct.".into(),
      hint_system: "You are a tutoring hint generator. Respond ONLY with JSON. \
        Use LaTeX for math delimited by $$ ... $$. Never state the final answer.".into(),
      hint_user_template: "Problem: {question}\n\
        Student's description of where they are stuck: {struggle}\n\
        {artifact}\n\
        Relevant course material:\n{context}\n\
        Hint tier {tier} of 3. Tier policy: {tier_policy}\n\
        Hints already given (yours MUST differ from every one of them):\n{history}\n\
        Return JSON {\"text\": string, \"sub_skill\": string | null}.\
        {corrective}".into(),
      step_check_system: "You verify whether a tutoring hint is consistent with the student's current step. \
        When the key claim is mathematical, also give ONE Wolfram-style oracle query that checks it \
        (a boolean or a computation). Respond ONLY with JSON.".into(),
      step_check_user_template: "Problem: {question}\n\
        Student's current step: {step}\n\
        Hint (tier {tier}): {hint}\n\
        Return JSON {\"is_consistent\": boolean, \"oracle_query\": string | null, \"explanation\": string}. \
        A hint is inconsistent when it contradicts correct work in the step or builds on a mistake in it \
        without pointing the mistake out.".into(),
    }
  }
}

/// Attempt to load `AgentConfig` from AGENT_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_agent_config_from_env() -> Option<AgentConfig> {
  let path = std::env::var("AGENT_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<AgentConfig>(&s) {
      Ok(cfg) => {
        info!(target: "sophi_backend", %path, classes = cfg.classes.len(), "Loaded agent config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "sophi_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "sophi_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}
