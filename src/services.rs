//! Contracts of the external collaborators the pipeline depends on.
//!
//! All of them are black boxes reached over the network: implementations live in
//! `openai.rs`, `oracle.rs`, `retrieval.rs` and `store.rs`. Callers wrap every call in
//! `util::with_timeout` and treat any `ServiceError` as eligible for retry or fallback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;

/// Which configured model a request should use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelTier {
  Fast,
  Strong,
}

#[derive(Clone, Debug)]
pub struct ImagePart {
  pub mime: String,
  pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ModelRequest {
  pub system: String,
  pub user: String,
  pub temperature: f32,
  pub tier: ModelTier,
  /// Ask the provider for a JSON object response where supported.
  pub json: bool,
  pub image: Option<ImagePart>,
}

/// Generation model: prompt text in, raw text out (possibly malformed structured payload).
#[async_trait]
pub trait GenerationModel: Send + Sync {
  async fn complete(&self, req: ModelRequest) -> Result<String, ServiceError>;
}

/// Text embedding model: one vector per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
  async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

/// Symbolic oracle response. "Did not understand the query" is a valid answer, not an error.
#[derive(Clone, Debug, PartialEq)]
pub enum OracleAnswer {
  Result(String),
  Unparseable(String),
}

#[async_trait]
pub trait SymbolicOracle: Send + Sync {
  async fn query(&self, query: &str) -> Result<OracleAnswer, ServiceError>;
}

/// Prunes low-information tokens from `text` down to roughly `target_tokens`.
#[async_trait]
pub trait Compressor: Send + Sync {
  async fn compress(&self, text: &str, target_tokens: usize) -> Result<String, ServiceError>;
}

#[derive(Clone, Debug, Serialize)]
pub struct ChunkQuery {
  pub class_id: String,
  pub topics: Vec<String>,
  pub text: String,
  pub top_k: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
  pub id: String,
  #[serde(default)]
  pub topic: Option<String>,
  pub text: String,
  pub score: f32,
}

/// Similarity search over chunked course material, scoped to one class.
#[async_trait]
pub trait VectorIndex: Send + Sync {
  async fn search(&self, query: &ChunkQuery) -> Result<Vec<ScoredChunk>, ServiceError>;
}

/// Keyed document persistence (sessions, attempts, class profiles).
#[async_trait]
pub trait DocumentStore: Send + Sync {
  async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, ServiceError>;
  async fn put(&self, collection: &str, key: &str, doc: Value) -> Result<(), ServiceError>;
  async fn delete(&self, collection: &str, key: &str) -> Result<bool, ServiceError>;
}

/// Stand-in for a collaborator that has no credentials/endpoint configured.
pub struct Unconfigured(pub &'static str);

#[async_trait]
impl GenerationModel for Unconfigured {
  async fn complete(&self, _req: ModelRequest) -> Result<String, ServiceError> {
    Err(ServiceError::Unavailable(self.0))
  }
}

#[async_trait]
impl Embedder for Unconfigured {
  async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
    Err(ServiceError::Unavailable(self.0))
  }
}

#[async_trait]
impl SymbolicOracle for Unconfigured {
  async fn query(&self, _query: &str) -> Result<OracleAnswer, ServiceError> {
    Err(ServiceError::Unavailable(self.0))
  }
}

#[async_trait]
impl Compressor for Unconfigured {
  async fn compress(&self, _text: &str, _target_tokens: usize) -> Result<String, ServiceError> {
    Err(ServiceError::Unavailable(self.0))
  }
}
