//! Sophi · adaptive practice-question backend
//!
//! - Axum HTTP + WebSocket API over practice sessions
//! - Questions generated by a language model and checked by a symbolic oracle
//! - Retrieval-grounded context, adaptive difficulty, tiered hints
//!
//! Important env variables:
//!   PORT                 : u16 (default 8080)
//!   OPENAI_API_KEY       : enables the generation model
//!   OPENAI_BASE_URL      : default "https://api.openai.com/v1"
//!   OPENAI_FAST_MODEL    : default "gpt-4o-mini"
//!   OPENAI_STRONG_MODEL  : default "gpt-4o"
//!   OPENAI_EMBEDDING_MODEL : default "text-embedding-3-small" (hint similarity)
//!   OPENAI_MAX_TOKENS    : completion token cap; unset leaves it to the provider
//!   ORACLE_APP_ID        : enables the symbolic oracle (ORACLE_BASE_URL overrides the endpoint)
//!   VECTOR_STORE_URL     : external vector store; the in-process material index is used otherwise
//!   COMPRESSION_URL      : context compression service (COMPRESSION_API_KEY optional)
//!   AGENT_CONFIG_PATH    : path to TOML config (prompts, tunables, classes)
//!   LOG_LEVEL            : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT           : "pretty" (default) or "json"

mod telemetry;
mod util;
mod error;
mod domain;
mod config;
mod services;
mod repair;
mod similarity;
mod equivalence;
mod retry;
mod openai;
mod oracle;
mod retrieval;
mod store;
mod context;
mod generation;
mod verifier;
mod difficulty;
mod hints;
mod grading;
mod session;
mod seeds;
mod state;
mod protocol;
mod routes;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Shared state: config, external clients, session coordinator.
  let state = Arc::new(AppState::new());

  let app = build_router(state.clone());

  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "sophi_backend", %addr, "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!(target: "sophi_backend", "Shutdown signal received");
    })
    .await?;
  Ok(())
}
