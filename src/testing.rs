//! Scripted doubles for the external collaborators, shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use crate::config::AgentConfig;
use crate::domain::{ClassProfile, TopicNode};
use crate::error::ServiceError;
use crate::services::{
  ChunkQuery, Compressor, Embedder, GenerationModel, ModelRequest, OracleAnswer, ScoredChunk, SymbolicOracle,
  VectorIndex,
};

/// Markers found in the default system prompts, used to route scripted responses.
pub const QUESTION: &str = "practice questions";
pub const TRANSLATE: &str = "symbolic math engine";
pub const GRADE: &str = "grader";
pub const HINT: &str = "hint generator";
pub const STEP_CHECK: &str = "consistent with the student's current step";

/// Replays queued raw responses. Routed queues are matched against the system prompt first;
/// an exhausted script answers `Unavailable`.
#[derive(Default)]
pub struct ScriptedModel {
  routes: Mutex<Vec<(&'static str, VecDeque<Result<String, ServiceError>>)>>,
  requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&self, marker: &'static str, response: impl Into<String>) -> &Self {
    self.push_result(marker, Ok(response.into()))
  }

  pub fn push_result(&self, marker: &'static str, response: Result<String, ServiceError>) -> &Self {
    let mut routes = self.routes.lock().unwrap();
    match routes.iter_mut().find(|(m, _)| *m == marker) {
      Some((_, q)) => q.push_back(response),
      None => routes.push((marker, VecDeque::from([response]))),
    }
    self
  }

  pub fn requests(&self) -> Vec<ModelRequest> {
    self.requests.lock().unwrap().clone()
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

#[async_trait]
impl GenerationModel for ScriptedModel {
  async fn complete(&self, req: ModelRequest) -> Result<String, ServiceError> {
    let next = {
      let mut routes = self.routes.lock().unwrap();
      routes
        .iter_mut()
        .find(|(m, q)| req.system.contains(m) && !q.is_empty())
        .and_then(|(_, q)| q.pop_front())
    };
    self.requests.lock().unwrap().push(req);
    next.unwrap_or(Err(ServiceError::Unavailable("scripted model")))
  }
}

/// Delegates to a `ScriptedModel`; once armed, each call signals `entered` and waits for `release`.
#[derive(Default)]
pub struct GatedModel {
  pub inner: ScriptedModel,
  pub armed: AtomicBool,
  pub entered: Notify,
  pub release: Notify,
}

#[async_trait]
impl GenerationModel for GatedModel {
  async fn complete(&self, req: ModelRequest) -> Result<String, ServiceError> {
    if self.armed.load(Ordering::SeqCst) {
      self.entered.notify_one();
      self.release.notified().await;
    }
    self.inner.complete(req).await
  }
}

/// Answers from a sequence; the last answer repeats.
pub struct FixedOracle {
  answers: Mutex<VecDeque<Result<OracleAnswer, ServiceError>>>,
  pub queries: Mutex<Vec<String>>,
}

impl FixedOracle {
  pub fn sequence(answers: Vec<Result<OracleAnswer, ServiceError>>) -> Self {
    Self { answers: Mutex::new(answers.into()), queries: Mutex::new(Vec::new()) }
  }

  pub fn always(answer: &str) -> Self {
    Self::sequence(vec![Ok(OracleAnswer::Result(answer.into()))])
  }
}

#[async_trait]
impl SymbolicOracle for FixedOracle {
  async fn query(&self, query: &str) -> Result<OracleAnswer, ServiceError> {
    self.queries.lock().unwrap().push(query.to_string());
    let mut answers = self.answers.lock().unwrap();
    if answers.len() > 1 {
      answers.pop_front().unwrap_or(Err(ServiceError::Unavailable("oracle")))
    } else {
      answers.front().cloned().unwrap_or(Err(ServiceError::Unavailable("oracle")))
    }
  }
}

/// Embeds text as occurrence counts over groups of synonymous phrases, so paraphrases built
/// from the same groups land on the same vector. Fails when `fail` is set.
#[derive(Default)]
pub struct ConceptEmbedder {
  groups: Vec<Vec<&'static str>>,
  pub fail: AtomicBool,
  pub calls: AtomicUsize,
}

impl ConceptEmbedder {
  pub fn new(groups: &[&[&'static str]]) -> Self {
    Self { groups: groups.iter().map(|g| g.to_vec()).collect(), ..Default::default() }
  }
}

#[async_trait]
impl Embedder for ConceptEmbedder {
  async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.fail.load(Ordering::SeqCst) {
      return Err(ServiceError::Unavailable("embedding model"));
    }
    Ok(
      texts
        .iter()
        .map(|t| {
          let t = t.to_lowercase();
          self.groups.iter().map(|g| g.iter().map(|p| t.matches(p).count() as f32).sum()).collect()
        })
        .collect(),
    )
  }
}

/// Keeps the first half of the input, or fails when `fail` is set.
#[derive(Default)]
pub struct MockCompressor {
  pub fail: AtomicBool,
  pub calls: AtomicUsize,
}

#[async_trait]
impl Compressor for MockCompressor {
  async fn compress(&self, text: &str, _target_tokens: usize) -> Result<String, ServiceError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.fail.load(Ordering::SeqCst) {
      return Err(ServiceError::Transport { service: "compression service", message: "connection refused".into() });
    }
    let half: String = text.chars().take(text.chars().count() / 2).collect();
    Ok(half)
  }
}

/// Returns a fixed ranked list, or fails when `fail` is set.
#[derive(Default)]
pub struct StaticIndex {
  pub chunks: Vec<ScoredChunk>,
  pub fail: AtomicBool,
  pub calls: AtomicUsize,
}

impl StaticIndex {
  pub fn with_chunks(n: usize, chars_each: usize) -> Self {
    let chunks = (0..n)
      .map(|i| ScoredChunk {
        id: format!("chunk-{i}"),
        topic: Some("Derivatives".into()),
        text: format!("{i}:{}", "d".repeat(chars_each)),
        score: 1.0 - i as f32 * 0.05,
      })
      .collect();
    Self { chunks, ..Default::default() }
  }
}

#[async_trait]
impl VectorIndex for StaticIndex {
  async fn search(&self, query: &ChunkQuery) -> Result<Vec<ScoredChunk>, ServiceError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.fail.load(Ordering::SeqCst) {
      return Err(ServiceError::Unavailable("vector store"));
    }
    Ok(self.chunks.iter().take(query.top_k).cloned().collect())
  }
}

/// Defaults with backoff disabled so retry loops run instantly.
pub fn config() -> AgentConfig {
  let mut cfg = AgentConfig::default();
  cfg.backoff.base_ms = 0;
  cfg.backoff.max_ms = 0;
  cfg
}

pub fn calculus() -> ClassProfile {
  ClassProfile {
    id: "calc".into(),
    name: "Calculus I".into(),
    topics: vec![
      TopicNode { name: "Limits".into(), children: vec![] },
      TopicNode {
        name: "Derivatives".into(),
        children: vec![TopicNode { name: "Chain rule".into(), children: vec![] }],
      },
      TopicNode { name: "Integrals".into(), children: vec![] },
    ],
    style_notes: vec!["Use exact values".into()],
    textbook: Some("Stewart, Calculus".into()),
    sample_problems: vec!["Differentiate $$f(x)=x^2\\sin x$$.".into()],
  }
}

/// A well-formed generation response.
pub fn question_json(content: &str, answer: &str) -> String {
  json!({
    "content": content,
    "answer": answer,
    "explanation": "Apply the rule step by step.",
    "topics": ["Derivatives"],
  })
  .to_string()
}

pub fn translation_json(query: &str) -> String {
  json!({ "query": query, "reason": "closed-form computation" }).to_string()
}

pub fn hint_json(text: &str, sub_skill: Option<&str>) -> String {
  json!({ "text": text, "sub_skill": sub_skill }).to_string()
}

pub fn step_check_json(consistent: bool, oracle_query: Option<&str>, explanation: &str) -> String {
  json!({ "is_consistent": consistent, "oracle_query": oracle_query, "explanation": explanation }).to_string()
}
