//! Context assembly: course material that grounds generation and hints.
//!
//! Retrieval pulls the top-K chunks for the class and topics, capped at
//! `token_budget * retrieval_factor` tokens. Text over budget goes to the compression service;
//! text under budget is used as is. Neither dependency can block generation: a failed retrieval
//! falls back to the last good result for the same scope (or style notes only), a failed
//! compression falls back to truncation. Any fallback marks the context as degraded.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::{ContextCfg, TimeoutCfg};
use crate::domain::ClassProfile;
use crate::services::{ChunkQuery, Compressor, ScoredChunk, VectorIndex};
use crate::util::{estimate_tokens, truncate_to_tokens, with_timeout};

#[derive(Clone, Debug)]
pub struct ContextRequest<'a> {
  pub profile: &'a ClassProfile,
  pub topics: &'a [String],
  /// Extra query text, e.g. the problem statement or the student's written work.
  pub focus: Option<&'a str>,
}

#[derive(Clone, Debug, Default)]
pub struct AssembledContext {
  pub text: String,
  pub chunk_ids: Vec<String>,
  pub compressed: bool,
  /// A fallback was used (cached or no material, or truncation instead of compression).
  pub degraded: bool,
}

type ScopeKey = (String, Vec<String>);

pub struct ContextAssembler {
  index: Arc<dyn VectorIndex>,
  compressor: Arc<dyn Compressor>,
  cfg: ContextCfg,
  timeouts: TimeoutCfg,
  last_good: RwLock<HashMap<ScopeKey, Vec<ScoredChunk>>>,
}

impl ContextAssembler {
  pub fn new(
    index: Arc<dyn VectorIndex>,
    compressor: Arc<dyn Compressor>,
    cfg: ContextCfg,
    timeouts: TimeoutCfg,
  ) -> Self {
    Self { index, compressor, cfg, timeouts, last_good: RwLock::new(HashMap::new()) }
  }

  #[instrument(target = "context", level = "info", skip(self, req), fields(class_id = %req.profile.id, topics = req.topics.len()))]
  pub async fn assemble(&self, req: ContextRequest<'_>) -> AssembledContext {
    let (chunks, mut degraded) = self.retrieve(&req).await;
    let chunks = self.cap_retrieval(chunks);

    if chunks.is_empty() {
      let text = style_only(req.profile);
      info!(target: "context", degraded, "No course material available; using style notes only");
      return AssembledContext { text, degraded, ..Default::default() };
    }

    let chunk_ids = chunks.iter().map(|c| c.id.clone()).collect();
    let joined = join_chunks(&chunks);
    let budget = self.cfg.token_budget;
    let size = estimate_tokens(&joined);
    if size <= budget {
      debug!(target: "context", tokens = size, budget, "Under budget; compression skipped");
      return AssembledContext { text: joined, chunk_ids, compressed: false, degraded };
    }

    let compressed = with_timeout(
      "compression service",
      self.timeouts.compression(),
      self.compressor.compress(&joined, budget),
    )
    .await;
    let (text, compressed) = match compressed {
      Ok(out) => {
        info!(target: "context", before = size, after = estimate_tokens(&out), budget, "Context compressed");
        (truncate_to_tokens(&out, budget).to_string(), true)
      }
      Err(e) => {
        warn!(target: "context", error = %e, "Compression unavailable; truncating raw chunks to budget");
        degraded = true;
        (truncate_to_tokens(&joined, budget).to_string(), false)
      }
    };
    AssembledContext { text, chunk_ids, compressed, degraded }
  }

  async fn retrieve(&self, req: &ContextRequest<'_>) -> (Vec<ScoredChunk>, bool) {
    let key = scope_key(&req.profile.id, req.topics);
    let mut text = req.topics.join(", ");
    if let Some(focus) = req.focus {
      text.push_str(". ");
      text.push_str(focus);
    }
    let query = ChunkQuery {
      class_id: req.profile.id.clone(),
      topics: req.topics.to_vec(),
      text,
      top_k: self.cfg.top_k,
    };

    match with_timeout("vector store", self.timeouts.retrieval(), self.index.search(&query)).await {
      Ok(chunks) => {
        debug!(target: "context", hits = chunks.len(), "Retrieved course material");
        if !chunks.is_empty() {
          self.last_good.write().await.insert(key, chunks.clone());
        }
        (chunks, false)
      }
      Err(e) => {
        let cached = self.last_good.read().await.get(&key).cloned();
        warn!(target: "context", error = %e, cached = cached.is_some(), "Retrieval unavailable; falling back");
        (cached.unwrap_or_default(), true)
      }
    }
  }

  /// Keep chunks in rank order until the retrieval ceiling would be crossed. The first
  /// chunk is always kept so an oversized chunk still reaches compression or truncation.
  fn cap_retrieval(&self, chunks: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
    let ceiling = self.cfg.token_budget.saturating_mul(self.cfg.retrieval_factor.max(1));
    let mut used = 0;
    let mut kept = Vec::new();
    for chunk in chunks {
      let cost = estimate_tokens(&chunk.text);
      if !kept.is_empty() && used + cost > ceiling {
        break;
      }
      used += cost;
      kept.push(chunk);
    }
    kept
  }
}

fn scope_key(class_id: &str, topics: &[String]) -> ScopeKey {
  let mut t: Vec<String> = topics.iter().map(|s| s.to_lowercase()).collect();
  t.sort();
  (class_id.to_string(), t)
}

fn join_chunks(chunks: &[ScoredChunk]) -> String {
  chunks
    .iter()
    .map(|c| match &c.topic {
      Some(t) => format!("[{t}] {}", c.text),
      None => c.text.clone(),
    })
    .collect::<Vec<_>>()
    .join("\n\n")
}

fn style_only(profile: &ClassProfile) -> String {
  let mut out = String::new();
  if !profile.style_notes.is_empty() {
    out.push_str("Style notes: ");
    out.push_str(&profile.style_notes.join("; "));
  }
  if let Some(book) = &profile.textbook {
    if !out.is_empty() {
      out.push('\n');
    }
    out.push_str("Textbook: ");
    out.push_str(book);
  }
  out
}
