//! WebSocket upgrade + message loop. Each client message is parsed as JSON and
//! forwarded to the session coordinator. We reply with a single JSON message per request.

use std::sync::Arc;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use tracing::{debug, error, info, instrument};

use crate::error::CoreError;
use crate::protocol::{ClientWsMessage, ServerWsMessage, SessionOut, QuestionOut};
use crate::state::AppState;

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "sophi_backend", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  info!(target: "sophi_backend", "WebSocket connected");
  while let Some(Ok(msg)) = socket.recv().await {
    match msg {
      Message::Text(txt) => {
        let reply_msg = match serde_json::from_str::<ClientWsMessage>(&txt) {
          Ok(incoming) => {
            debug!(target: "sophi_backend", len = txt.len(), "WS message received");
            match handle_client_ws(incoming, &state).await {
              Ok(reply) => reply,
              Err(e) => ServerWsMessage::error(&e),
            }
          }
          Err(e) => ServerWsMessage::Error { code: "invalid_message", message: format!("Invalid JSON: {e}") },
        };

        let out = serde_json::to_string(&reply_msg).unwrap_or_else(|e| {
          serde_json::json!({ "type": "error", "code": "internal", "message": format!("Serialization error: {e}") })
            .to_string()
        });

        if let Err(e) = socket.send(Message::Text(out)).await {
          error!(target: "sophi_backend", error = %e, "WS send error");
          break;
        }
      }
      Message::Ping(payload) => {
        let _ = socket.send(Message::Pong(payload)).await;
      }
      Message::Close(_) => break,
      _ => {}
    }
  }
  info!(target: "sophi_backend", "WebSocket disconnected");
}

async fn handle_client_ws(msg: ClientWsMessage, state: &AppState) -> Result<ServerWsMessage, CoreError> {
  let coord = &state.coordinator;
  Ok(match msg {
    ClientWsMessage::Ping => ServerWsMessage::Pong,

    ClientWsMessage::CreateSession { class_id, params } => {
      let (name, params, difficulty) = params.into_parts();
      let session = coord.create_session(&class_id, name, params, difficulty).await?;
      info!(target: "session", %class_id, session_id = %session.id, "WS session created");
      ServerWsMessage::SessionCreated { session_id: session.id }
    }

    ClientWsMessage::GetSession { session_id } => {
      let session = coord.get_session(&session_id).await?;
      ServerWsMessage::Session { session: SessionOut::from(&session) }
    }

    ClientWsMessage::RequestQuestion { session_id } => {
      let question = coord.request_question(&session_id).await?;
      info!(target: "question", %session_id, question_id = %question.id, "WS question served");
      ServerWsMessage::Question { question: QuestionOut::from(&question) }
    }

    ClientWsMessage::SubmitAnswer { question_id, answer } => {
      let feedback = coord.submit_answer(&question_id, answer).await?;
      info!(target: "session", %question_id, correct = feedback.is_correct, "WS answer evaluated");
      ServerWsMessage::AnswerResult { feedback: feedback.into() }
    }

    ClientWsMessage::RequestHint { question_id, body } => {
      let artifact = body.artifact.map(|a| a.decode()).transpose()?;
      let hint = coord.request_hint(&question_id, body.struggle, artifact).await?;
      info!(target: "hint", %question_id, tier = hint.tier.number(), "WS hint served");
      ServerWsMessage::Hint { hint: hint.into() }
    }

    ClientWsMessage::SetAdaptive { session_id, active } => {
      let session = coord.set_adaptive(&session_id, active).await?;
      ServerWsMessage::Session { session: SessionOut::from(&session) }
    }

    ClientWsMessage::UpdateSessionParams { session_id, update } => {
      let session = coord.update_session_params(&session_id, update.into()).await?;
      ServerWsMessage::Session { session: SessionOut::from(&session) }
    }

    ClientWsMessage::DeleteSession { session_id } => {
      coord.delete_session(&session_id).await?;
      ServerWsMessage::SessionDeleted { session_id }
    }

    ClientWsMessage::GetMetrics { session_id } => {
      let metrics = coord.metrics(&session_id).await?;
      ServerWsMessage::Metrics { session_id, metrics: metrics.into_iter().map(Into::into).collect() }
    }
  })
}
