//! HTTP endpoint handlers. These are thin wrappers that forward to the session coordinator.
//! Each handler is instrumented with ids and sizes; payloads are not logged.

use std::sync::Arc;

use axum::{
  extract::{Path, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use tracing::{error, info, instrument, warn};

use crate::error::CoreError;
use crate::protocol::*;
use crate::state::AppState;

impl IntoResponse for CoreError {
  fn into_response(self) -> Response {
    let status = match &self {
      CoreError::QuestionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
      CoreError::SessionConflict(_) => StatusCode::CONFLICT,
      CoreError::SessionNotFound(_) | CoreError::QuestionNotFound(_) | CoreError::ClassNotFound(_) => {
        StatusCode::NOT_FOUND
      }
      CoreError::InvalidParams(_) => StatusCode::BAD_REQUEST,
      CoreError::Persistence(_) | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    match &self {
      CoreError::QuestionUnavailable(cause) => warn!(target: "session", %cause, "Question unavailable"),
      e if status.is_server_error() => error!(target: "session", error = %e, "Request failed"),
      _ => {}
    }
    (status, Json(ErrorOut { error: self.to_string(), code: error_code(&self) })).into_response()
  }
}

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(HealthOut { ok: true, classes: state.coordinator.class_ids(), integrations: state.integrations })
}

#[instrument(level = "info", skip(state, body), fields(%class_id))]
pub async fn http_create_session(
  State(state): State<Arc<AppState>>,
  Path(class_id): Path<String>,
  body: Option<Json<SessionParamsIn>>,
) -> Result<Json<CreateSessionOut>, CoreError> {
  let (name, params, difficulty) = body.map(|Json(b)| b).unwrap_or_default().into_parts();
  let session = state.coordinator.create_session(&class_id, name, params, difficulty).await?;
  info!(target: "session", %class_id, session_id = %session.id, "HTTP session created");
  Ok(Json(CreateSessionOut { session_id: session.id }))
}

#[instrument(level = "info", skip(state), fields(%session_id))]
pub async fn http_get_session_params(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
) -> Result<Json<SessionOut>, CoreError> {
  let session = state.coordinator.get_session(&session_id).await?;
  Ok(Json(SessionOut::from(&session)))
}

#[instrument(level = "info", skip(state), fields(%session_id))]
pub async fn http_request_question(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
) -> Result<Json<QuestionOut>, CoreError> {
  let question = state.coordinator.request_question(&session_id).await?;
  info!(target: "question", %session_id, question_id = %question.id, status = ?question.status, "HTTP question served");
  Ok(Json(QuestionOut::from(&question)))
}

#[instrument(level = "info", skip(state, body), fields(%question_id, answer_len = body.answer.len()))]
pub async fn http_submit_answer(
  State(state): State<Arc<AppState>>,
  Path(question_id): Path<String>,
  Json(body): Json<AnswerIn>,
) -> Result<Json<FeedbackOut>, CoreError> {
  let feedback = state.coordinator.submit_answer(&question_id, body.answer).await?;
  info!(target: "session", %question_id, correct = feedback.is_correct, "HTTP answer evaluated");
  Ok(Json(feedback.into()))
}

#[instrument(level = "info", skip(state, body), fields(%question_id, struggle_len = body.struggle.len()))]
pub async fn http_request_hint(
  State(state): State<Arc<AppState>>,
  Path(question_id): Path<String>,
  Json(body): Json<HintIn>,
) -> Result<Json<HintOut>, CoreError> {
  let artifact = body.artifact.map(ArtifactIn::decode).transpose()?;
  let hint = state.coordinator.request_hint(&question_id, body.struggle, artifact).await?;
  info!(target: "hint", %question_id, tier = hint.tier.number(), "HTTP hint served");
  Ok(Json(hint.into()))
}

#[instrument(level = "info", skip(state, body), fields(%session_id, active = body.active))]
pub async fn http_set_adaptive(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
  Json(body): Json<SetAdaptiveIn>,
) -> Result<Json<SessionOut>, CoreError> {
  let session = state.coordinator.set_adaptive(&session_id, body.active).await?;
  Ok(Json(SessionOut::from(&session)))
}

#[instrument(level = "info", skip(state, body), fields(%session_id))]
pub async fn http_update_session_params(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
  Json(body): Json<ParamsUpdateIn>,
) -> Result<Json<SessionOut>, CoreError> {
  let session = state.coordinator.update_session_params(&session_id, body.into()).await?;
  Ok(Json(SessionOut::from(&session)))
}

#[instrument(level = "info", skip(state), fields(%session_id))]
pub async fn http_delete_session(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
) -> Result<Json<DeletedOut>, CoreError> {
  state.coordinator.delete_session(&session_id).await?;
  Ok(Json(DeletedOut { deleted: true }))
}

#[instrument(level = "info", skip(state), fields(%session_id))]
pub async fn http_get_metrics(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
) -> Result<Json<MetricsOut>, CoreError> {
  let metrics = state.coordinator.metrics(&session_id).await?;
  Ok(Json(MetricsOut { session_id, metrics: metrics.into_iter().map(Into::into).collect() }))
}
