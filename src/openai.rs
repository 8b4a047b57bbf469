//! Minimal OpenAI-compatible client backing the `GenerationModel` and `Embedder` contracts.
//!
//! We call chat.completions and return the raw message text; structured output is
//! repaired and parsed by the caller (`repair.rs`), never trusted here. The embeddings
//! endpoint feeds semantic hint similarity.
//! Calls are instrumented and log model names, latencies, and response sizes (not contents).
//!
//! NOTE: We never log the API key.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::error::ServiceError;
use crate::services::{Embedder, GenerationModel, ImagePart, ModelRequest, ModelTier};

const SERVICE: &str = "generation model";
const EMBED_SERVICE: &str = "embedding model";

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub fast_model: String,
  pub strong_model: String,
  pub embedding_model: String,
  /// Completion length cap sent with every chat request (OPENAI_MAX_TOKENS); provider default when unset.
  pub max_tokens: Option<u32>,
}

impl OpenAI {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env(timeout: Duration) -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let fast_model =
      std::env::var("OPENAI_FAST_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let strong_model =
      std::env::var("OPENAI_STRONG_MODEL").unwrap_or_else(|_| "gpt-4o".into());
    let embedding_model =
      std::env::var("OPENAI_EMBEDDING_MODEL").unwrap_or_else(|_| "text-embedding-3-small".into());
    let max_tokens = std::env::var("OPENAI_MAX_TOKENS").ok().and_then(|v| v.trim().parse::<u32>().ok());

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .ok()?;

    Some(Self { client, api_key, base_url, fast_model, strong_model, embedding_model, max_tokens })
  }

  fn model_for(&self, tier: ModelTier) -> &str {
    match tier {
      ModelTier::Fast => &self.fast_model,
      ModelTier::Strong => &self.strong_model,
    }
  }

  fn chat_body(&self, req: ModelRequest) -> ChatCompletionRequest {
    ChatCompletionRequest {
      model: self.model_for(req.tier).to_string(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: Value::String(req.system) },
        ChatMessageReq { role: "user".into(), content: user_content(req.user, req.image.as_ref()) },
      ],
      temperature: req.temperature,
      response_format: req.json.then(|| ResponseFormat { r#type: "json_object".into() }),
      max_tokens: self.max_tokens,
    }
  }
}

#[async_trait]
impl GenerationModel for OpenAI {
  #[instrument(level = "info", skip(self, req), fields(model = %self.model_for(req.tier), json = req.json, has_image = req.image.is_some()))]
  async fn complete(&self, req: ModelRequest) -> Result<String, ServiceError> {
    let url = format!("{}/chat/completions", self.base_url);
    let body = self.chat_body(req);

    let start = Instant::now();
    let res = self.client.post(&url)
      .header(USER_AGENT, "sophi-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&body).send().await
      .map_err(|e| transport(SERVICE, &e))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or(body);
      warn!(%status, elapsed = ?start.elapsed(), "OpenAI call failed");
      return Err(ServiceError::Http { service: SERVICE, status: status.as_u16(), body: msg });
    }

    let body: ChatCompletionResponse = res.json().await.map_err(|e| ServiceError::BadResponse {
      service: SERVICE,
      message: e.to_string(),
    })?;
    if let Some(usage) = &body.usage {
      info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    let text = body.choices.first()
      .and_then(|c| c.message.content.clone())
      .unwrap_or_default().trim().to_string();
    info!(elapsed = ?start.elapsed(), response_len = text.len(), "Model response received");
    Ok(text)
  }
}

#[async_trait]
impl Embedder for OpenAI {
  #[instrument(level = "debug", skip(self, texts), fields(model = %self.embedding_model, inputs = texts.len()))]
  async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
    let url = format!("{}/embeddings", self.base_url);
    let body = EmbeddingRequest { model: &self.embedding_model, input: texts };

    let start = Instant::now();
    let res = self.client.post(&url)
      .header(USER_AGENT, "sophi-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&body).send().await
      .map_err(|e| transport(EMBED_SERVICE, &e))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or(body);
      warn!(%status, elapsed = ?start.elapsed(), "OpenAI embeddings call failed");
      return Err(ServiceError::Http { service: EMBED_SERVICE, status: status.as_u16(), body: msg });
    }

    let body: EmbeddingResponse = res.json().await.map_err(|e| ServiceError::BadResponse {
      service: EMBED_SERVICE,
      message: e.to_string(),
    })?;
    let vectors = in_input_order(body.data, texts.len())?;
    info!(elapsed = ?start.elapsed(), inputs = texts.len(), "Embeddings received");
    Ok(vectors)
  }
}

/// Order embeddings by their `index` and check that every input got exactly one.
fn in_input_order(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>, ServiceError> {
  data.sort_by_key(|d| d.index);
  let complete = data.len() == expected && data.iter().enumerate().all(|(i, d)| d.index == i);
  if !complete {
    return Err(ServiceError::BadResponse {
      service: EMBED_SERVICE,
      message: format!("expected {expected} embeddings, got {}", data.len()),
    });
  }
  Ok(data.into_iter().map(|d| d.embedding).collect())
}

/// Plain text, or text + inline image parts for vision-capable models.
fn user_content(text: String, image: Option<&ImagePart>) -> Value {
  match image {
    None => Value::String(text),
    Some(img) => {
      let data = base64::engine::general_purpose::STANDARD.encode(&img.bytes);
      json!([
        { "type": "text", "text": text },
        { "type": "image_url", "image_url": { "url": format!("data:{};base64,{}", img.mime, data) } },
      ])
    }
  }
}

fn transport(service: &'static str, e: &reqwest::Error) -> ServiceError {
  if e.is_timeout() {
    ServiceError::Timeout { service, after: Duration::ZERO }
  } else {
    ServiceError::Transport { service, message: e.to_string() }
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: Value }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

// --- Embedding DTOs ---

#[derive(Serialize)]
struct EmbeddingRequest<'a> { model: &'a str, input: &'a [String] }

#[derive(Deserialize)]
struct EmbeddingResponse { data: Vec<EmbeddingData> }
#[derive(Deserialize)]
struct EmbeddingData { embedding: Vec<f32>, index: usize }

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  match serde_json::from_str::<EWrap>(body) {
    Ok(w) => Some(w.error.message),
    Err(_) => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn image_parts_become_data_urls() {
    let img = ImagePart { mime: "image/png".into(), bytes: vec![1, 2, 3] };
    let v = user_content("look".into(), Some(&img));
    assert_eq!(v[0]["text"], "look");
    assert_eq!(v[1]["image_url"]["url"], "data:image/png;base64,AQID");
    assert_eq!(user_content("plain".into(), None), Value::String("plain".into()));
  }

  fn client(max_tokens: Option<u32>) -> OpenAI {
    OpenAI {
      client: reqwest::Client::new(),
      api_key: "sk-test".into(),
      base_url: "http://localhost".into(),
      fast_model: "fast".into(),
      strong_model: "strong".into(),
      embedding_model: "embed".into(),
      max_tokens,
    }
  }

  fn request() -> ModelRequest {
    ModelRequest {
      system: "sys".into(),
      user: "hi".into(),
      temperature: 0.2,
      tier: ModelTier::Fast,
      json: true,
      image: None,
    }
  }

  #[test]
  fn max_tokens_is_sent_only_when_configured() {
    let body = serde_json::to_value(client(Some(512)).chat_body(request())).unwrap();
    assert_eq!(body["max_tokens"], 512);
    assert_eq!(body["model"], "fast");
    assert_eq!(body["response_format"]["type"], "json_object");

    let body = serde_json::to_value(client(None).chat_body(request())).unwrap();
    assert!(body.get("max_tokens").is_none());
  }

  #[test]
  fn embeddings_are_returned_in_input_order() {
    let raw = r#"{"data": [{"embedding": [0.0, 1.0], "index": 1}, {"embedding": [1.0, 0.0], "index": 0}], "model": "embed"}"#;
    let body: EmbeddingResponse = serde_json::from_str(raw).unwrap();
    assert_eq!(in_input_order(body.data, 2).unwrap(), vec![vec![1.0, 0.0], vec![0.0, 1.0]]);

    let body: EmbeddingResponse = serde_json::from_str(raw).unwrap();
    assert!(matches!(in_input_order(body.data, 3), Err(ServiceError::BadResponse { .. })));
  }

  #[test]
  fn error_body_message_is_extracted() {
    let body = r#"{"error": {"message": "Rate limit reached", "type": "requests"}}"#;
    assert_eq!(extract_openai_error(body).as_deref(), Some("Rate limit reached"));
    assert_eq!(extract_openai_error("<html>"), None);
  }
}
