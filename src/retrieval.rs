//! Course-material retrieval and compression backends.
//!
//! - `HttpVectorStore`: remote similarity store (`POST {url}/query`).
//! - `MemoryIndex`: in-process index over configured material, used when no store is configured.
//! - `HttpCompressor`: token-pruning compression service.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::ServiceError;
use crate::services::{ChunkQuery, Compressor, ScoredChunk, VectorIndex};
use crate::similarity::similarity;

const TOPIC_BOOST: f32 = 0.25;

#[derive(Clone)]
pub struct HttpVectorStore {
  client: reqwest::Client,
  url: String,
}

impl HttpVectorStore {
  pub fn from_env(timeout: Duration) -> Option<Self> {
    let url = std::env::var("VECTOR_STORE_URL").ok()?;
    let client = reqwest::Client::builder().timeout(timeout).build().ok()?;
    Some(Self { client, url })
  }
}

#[derive(Deserialize)]
struct SearchOut {
  chunks: Vec<ScoredChunk>,
}

#[async_trait]
impl VectorIndex for HttpVectorStore {
  #[instrument(level = "debug", skip(self, query), fields(class_id = %query.class_id, top_k = query.top_k))]
  async fn search(&self, query: &ChunkQuery) -> Result<Vec<ScoredChunk>, ServiceError> {
    const SERVICE: &str = "vector store";
    let res = self.client
      .post(format!("{}/query", self.url.trim_end_matches('/')))
      .json(query)
      .send()
      .await
      .map_err(|e| ServiceError::Transport { service: SERVICE, message: e.to_string() })?;
    if !res.status().is_success() {
      let status = res.status().as_u16();
      let body = res.text().await.unwrap_or_default();
      return Err(ServiceError::Http { service: SERVICE, status, body });
    }
    let out: SearchOut = res.json().await.map_err(|e| ServiceError::BadResponse {
      service: SERVICE,
      message: e.to_string(),
    })?;
    Ok(out.chunks)
  }
}

#[derive(Clone, Debug)]
pub struct MaterialChunk {
  pub id: String,
  pub topic: Option<String>,
  pub text: String,
}

/// Immutable after startup; shared by all sessions without locking.
#[derive(Default)]
pub struct MemoryIndex {
  by_class: HashMap<String, Vec<MaterialChunk>>,
}

impl MemoryIndex {
  pub fn insert(&mut self, class_id: &str, chunk: MaterialChunk) {
    self.by_class.entry(class_id.to_string()).or_default().push(chunk);
  }

  pub fn len(&self) -> usize {
    self.by_class.values().map(Vec::len).sum()
  }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
  async fn search(&self, query: &ChunkQuery) -> Result<Vec<ScoredChunk>, ServiceError> {
    let Some(chunks) = self.by_class.get(&query.class_id) else { return Ok(Vec::new()) };
    let mut scored: Vec<ScoredChunk> = chunks
      .iter()
      .map(|c| {
        let on_topic = c
          .topic
          .as_ref()
          .is_some_and(|t| query.topics.iter().any(|q| q.eq_ignore_ascii_case(t)));
        let score = similarity(&query.text, &c.text) + if on_topic { TOPIC_BOOST } else { 0.0 };
        ScoredChunk { id: c.id.clone(), topic: c.topic.clone(), text: c.text.clone(), score: score.min(1.0) }
      })
      .filter(|c| c.score > 0.0)
      .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(query.top_k);
    Ok(scored)
  }
}

#[derive(Clone)]
pub struct HttpCompressor {
  client: reqwest::Client,
  url: String,
  api_key: Option<String>,
  aggressiveness: f32,
}

impl HttpCompressor {
  pub fn from_env(timeout: Duration, aggressiveness: f32) -> Option<Self> {
    let url = std::env::var("COMPRESSION_URL").ok()?;
    let api_key = std::env::var("COMPRESSION_API_KEY").ok();
    let client = reqwest::Client::builder().timeout(timeout).build().ok()?;
    Some(Self { client, url, api_key, aggressiveness })
  }
}

#[derive(Serialize)]
struct CompressIn<'a> {
  input: &'a str,
  target_tokens: usize,
  aggressiveness: f32,
}

#[derive(Deserialize)]
struct CompressOut {
  output: String,
  #[serde(default)] original_input_tokens: Option<u64>,
  #[serde(default)] output_tokens: Option<u64>,
}

#[async_trait]
impl Compressor for HttpCompressor {
  #[instrument(level = "info", skip(self, text), fields(text_len = text.len(), target_tokens))]
  async fn compress(&self, text: &str, target_tokens: usize) -> Result<String, ServiceError> {
    const SERVICE: &str = "compression service";
    let mut req = self.client.post(&self.url).json(&CompressIn {
      input: text,
      target_tokens,
      aggressiveness: self.aggressiveness,
    });
    if let Some(key) = &self.api_key {
      req = req.header(AUTHORIZATION, format!("Bearer {key}"));
    }
    let res = req
      .send()
      .await
      .map_err(|e| ServiceError::Transport { service: SERVICE, message: e.to_string() })?;
    if !res.status().is_success() {
      let status = res.status().as_u16();
      let body = res.text().await.unwrap_or_default();
      return Err(ServiceError::Http { service: SERVICE, status, body });
    }
    let out: CompressOut = res.json().await.map_err(|e| ServiceError::BadResponse {
      service: SERVICE,
      message: e.to_string(),
    })?;
    if out.output.trim().is_empty() {
      return Err(ServiceError::BadResponse { service: SERVICE, message: "empty output".into() });
    }
    info!(original_tokens = ?out.original_input_tokens, output_tokens = ?out.output_tokens, "Context compressed");
    Ok(out.output)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn index() -> MemoryIndex {
    let mut idx = MemoryIndex::default();
    let chunks = [
      ("c1", "Chain rule", "The chain rule differentiates a composition: derivative of the outer times derivative of the inner."),
      ("c2", "Limits", "A limit describes the value a function approaches as the input approaches a point."),
      ("c3", "Integrals", "Substitution reverses the chain rule when integrating composite functions."),
    ];
    for (id, topic, text) in chunks {
      idx.insert("calc", MaterialChunk { id: id.into(), topic: Some(topic.into()), text: text.into() });
    }
    idx
  }

  #[tokio::test]
  async fn memory_index_ranks_on_topic_material_first() {
    let idx = index();
    let q = ChunkQuery { class_id: "calc".into(), topics: vec!["Chain rule".into()], text: "chain rule derivative".into(), top_k: 2 };
    let hits = idx.search(&q).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "c1");
    assert!(hits[0].score >= hits[1].score);
  }

  #[tokio::test]
  async fn memory_index_is_scoped_to_class() {
    let idx = index();
    let q = ChunkQuery { class_id: "history".into(), topics: vec![], text: "chain rule".into(), top_k: 5 };
    assert!(idx.search(&q).await.unwrap().is_empty());
    assert_eq!(idx.len(), 3);
  }
}
