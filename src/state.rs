//! Application state: configuration, external clients and the session coordinator.
//!
//! Each external collaborator is built from the environment. A collaborator whose
//! variables are missing is replaced by a stand-in that reports it as unavailable,
//! so the pipeline degrades (unverified questions, uncompressed context, template
//! hints) instead of refusing to start.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::{load_agent_config_from_env, AgentConfig};
use crate::domain::ClassProfile;
use crate::openai::OpenAI;
use crate::oracle::HttpOracle;
use crate::retrieval::{HttpCompressor, HttpVectorStore};
use crate::seeds::class_catalog;
use crate::services::{Compressor, Embedder, GenerationModel, SymbolicOracle, Unconfigured, VectorIndex};
use crate::session::{Collaborators, SessionCoordinator};
use crate::store::MemoryStore;

/// Which collaborators are backed by real services. Reported by the health endpoint.
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Integrations {
    pub model: bool,
    pub embeddings: bool,
    pub oracle: bool,
    pub vector_store: bool,
    pub compression: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    pub integrations: Integrations,
}

impl AppState {
    /// Build state from env: load config, register classes, init clients.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let cfg = load_agent_config_from_env().unwrap_or_default();
        let (classes, memory_index) = class_catalog(&cfg.classes);
        let t = &cfg.timeouts;

        let mut integrations = Integrations::default();

        let (model, embedder): (Arc<dyn GenerationModel>, Arc<dyn Embedder>) = match OpenAI::from_env(t.model()) {
            Some(oa) => {
                info!(target: "sophi_backend", base_url = %oa.base_url, fast_model = %oa.fast_model, strong_model = %oa.strong_model, embedding_model = %oa.embedding_model, "Generation model enabled.");
                integrations.model = true;
                integrations.embeddings = true;
                (Arc::new(oa.clone()), Arc::new(oa))
            }
            None => {
                warn!(target: "sophi_backend", "OPENAI_API_KEY not set; questions cannot be generated and hints use templates.");
                (Arc::new(Unconfigured("generation model")), Arc::new(Unconfigured("embedding model")))
            }
        };

        let oracle: Arc<dyn SymbolicOracle> = match HttpOracle::from_env(t.oracle()) {
            Some(o) => {
                info!(target: "sophi_backend", "Symbolic oracle enabled.");
                integrations.oracle = true;
                Arc::new(o)
            }
            None => {
                warn!(target: "sophi_backend", "ORACLE_APP_ID not set; questions will be unverified.");
                Arc::new(Unconfigured("symbolic oracle"))
            }
        };

        let index: Arc<dyn VectorIndex> = match HttpVectorStore::from_env(t.retrieval()) {
            Some(v) => {
                info!(target: "sophi_backend", "External vector store enabled.");
                integrations.vector_store = true;
                Arc::new(v)
            }
            None => {
                info!(target: "sophi_backend", chunks = memory_index.len(), "Using in-process material index.");
                Arc::new(memory_index)
            }
        };

        let compressor: Arc<dyn Compressor> =
            match HttpCompressor::from_env(t.compression(), cfg.context.compression_aggressiveness) {
                Some(c) => {
                    info!(target: "sophi_backend", "Compression service enabled.");
                    integrations.compression = true;
                    Arc::new(c)
                }
                None => {
                    info!(target: "sophi_backend", "COMPRESSION_URL not set; oversized context is truncated.");
                    Arc::new(Unconfigured("compression service"))
                }
            };

        let state = Self::from_parts(
            &cfg,
            classes,
            Collaborators { model, embedder, oracle, index, compressor, store: Arc::new(MemoryStore::new()) },
        );
        Self { integrations, ..state }
    }

    /// Assemble state from explicit parts.
    pub fn from_parts(cfg: &AgentConfig, classes: Vec<ClassProfile>, collaborators: Collaborators) -> Self {
        let coordinator = SessionCoordinator::new(cfg, classes, collaborators);
        info!(target: "sophi_backend", classes = ?coordinator.class_ids(), "Session coordinator ready");
        Self { coordinator, integrations: Integrations::default() }
    }
}
