//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Field names are camelCase on the wire. The canonical answer of a question is only
//! ever sent back as part of answer feedback.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::domain::{
    Artifact, Feedback, Hint, ParamsUpdate, Question, Session, SessionParams, StepCheck, TopicMetrics, VerificationStatus,
};
use crate::error::{CoreError, Degradation};
use crate::state::Integrations;

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientWsMessage {
    Ping,
    CreateSession {
        class_id: String,
        #[serde(default)]
        params: SessionParamsIn,
    },
    GetSession {
        session_id: String,
    },
    RequestQuestion {
        session_id: String,
    },
    SubmitAnswer {
        question_id: String,
        answer: String,
    },
    RequestHint {
        question_id: String,
        #[serde(flatten)]
        body: HintIn,
    },
    SetAdaptive {
        session_id: String,
        #[serde(alias = "adaptive")]
        active: bool,
    },
    UpdateSessionParams {
        session_id: String,
        update: ParamsUpdateIn,
    },
    DeleteSession {
        session_id: String,
    },
    GetMetrics {
        session_id: String,
    },
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerWsMessage {
    Pong,
    SessionCreated { session_id: String },
    Session { session: SessionOut },
    Question { question: QuestionOut },
    AnswerResult { feedback: FeedbackOut },
    Hint { hint: HintOut },
    SessionDeleted { session_id: String },
    Metrics { session_id: String, metrics: Vec<TopicMetricsOut> },
    Error { code: &'static str, message: String },
}

impl ServerWsMessage {
    pub fn error(e: &CoreError) -> Self {
        ServerWsMessage::Error { code: error_code(e), message: e.to_string() }
    }
}

/// Stable machine-readable code for each error variant.
pub fn error_code(e: &CoreError) -> &'static str {
    match e {
        CoreError::QuestionUnavailable(_) => "question_unavailable",
        CoreError::SessionConflict(_) => "session_conflict",
        CoreError::SessionNotFound(_) => "session_not_found",
        CoreError::QuestionNotFound(_) => "question_not_found",
        CoreError::ClassNotFound(_) => "class_not_found",
        CoreError::InvalidParams(_) => "invalid_params",
        CoreError::Persistence(_) => "persistence",
        CoreError::Internal(_) => "internal",
    }
}

//
// HTTP request/response DTOs
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParamsIn {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub cumulative: bool,
    #[serde(default = "default_adaptive")]
    pub adaptive: bool,
    #[serde(default)]
    pub custom_requests: String,
    #[serde(default)]
    pub difficulty: Option<f64>,
}

fn default_adaptive() -> bool {
    true
}

impl Default for SessionParamsIn {
    fn default() -> Self {
        Self {
            name: None,
            topics: Vec::new(),
            cumulative: false,
            adaptive: true,
            custom_requests: String::new(),
            difficulty: None,
        }
    }
}

impl SessionParamsIn {
    pub fn into_parts(self) -> (Option<String>, SessionParams, Option<f64>) {
        let params = SessionParams {
            topics: self.topics,
            cumulative: self.cumulative,
            adaptive: self.adaptive,
            custom_requests: self.custom_requests,
        };
        (self.name, params, self.difficulty)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionOut {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOut {
    pub session_id: String,
    pub class_id: String,
    pub name: String,
    pub topics: Vec<String>,
    pub cumulative: bool,
    pub adaptive: bool,
    pub custom_requests: String,
    pub difficulty: f64,
    pub level: u8,
    pub questions: usize,
    pub attempts: usize,
}

impl From<&Session> for SessionOut {
    fn from(s: &Session) -> Self {
        SessionOut {
            session_id: s.id.clone(),
            class_id: s.class_id.clone(),
            name: s.name.clone(),
            topics: s.params.topics.clone(),
            cumulative: s.params.cumulative,
            adaptive: s.params.adaptive,
            custom_requests: s.params.custom_requests.clone(),
            difficulty: s.difficulty.d,
            level: s.difficulty.level(),
            questions: s.questions.len(),
            attempts: s.attempts.len(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionOut {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub topics: Vec<String>,
    pub difficulty: f64,
    pub verification_status: VerificationStatus,
    pub flags: Vec<Degradation>,
}

impl From<&Question> for QuestionOut {
    fn from(q: &Question) -> Self {
        QuestionOut {
            id: q.id.clone(),
            session_id: q.session_id.clone(),
            content: q.content.clone(),
            topics: q.topics.clone(),
            difficulty: q.difficulty,
            verification_status: q.status,
            flags: q.flags.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnswerIn {
    pub answer: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackOut {
    pub is_correct: bool,
    pub correct_answer: String,
    pub explanation: String,
}

impl From<Feedback> for FeedbackOut {
    fn from(f: Feedback) -> Self {
        FeedbackOut { is_correct: f.is_correct, correct_answer: f.correct_answer, explanation: f.explanation }
    }
}

/// Student work: plain text, or an image as base64 (a `data:` URL is accepted too).
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ArtifactIn {
    Text { text: String },
    Image { mime: String, data_base64: String },
}

impl ArtifactIn {
    pub fn decode(self) -> Result<Artifact, CoreError> {
        match self {
            ArtifactIn::Text { text } => Ok(Artifact::Text(text)),
            ArtifactIn::Image { mime, data_base64 } => {
                let payload = match data_base64.split_once(";base64,") {
                    Some((_, rest)) => rest,
                    None => data_base64.as_str(),
                };
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(payload.trim())
                    .map_err(|e| CoreError::InvalidParams(format!("artifact is not valid base64: {e}")))?;
                if !mime.starts_with("image/") {
                    return Err(CoreError::InvalidParams(format!("unsupported artifact type `{mime}`")));
                }
                Ok(Artifact::Image { mime, bytes })
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HintIn {
    #[serde(default)]
    pub struggle: String,
    #[serde(default)]
    pub artifact: Option<ArtifactIn>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HintOut {
    pub text: String,
    pub tier: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_skill: Option<String>,
    pub forced_duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_check: Option<StepCheckOut>,
    pub flags: Vec<Degradation>,
}

impl From<Hint> for HintOut {
    fn from(h: Hint) -> Self {
        HintOut {
            text: h.text,
            tier: h.tier.number(),
            sub_skill: h.sub_skill,
            forced_duplicate: h.forced_duplicate,
            step_check: h.step_check.map(StepCheckOut::from),
            flags: h.flags,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCheckOut {
    pub is_consistent: bool,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oracle_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oracle_result: Option<String>,
}

impl From<StepCheck> for StepCheckOut {
    fn from(c: StepCheck) -> Self {
        StepCheckOut {
            is_consistent: c.consistent,
            explanation: c.explanation,
            oracle_query: c.oracle_query,
            oracle_result: c.oracle_result,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicMetricsOut {
    pub topic: String,
    pub total_answers: u32,
    pub right_answers: u32,
}

impl From<TopicMetrics> for TopicMetricsOut {
    fn from(m: TopicMetrics) -> Self {
        TopicMetricsOut { topic: m.topic, total_answers: m.total_answers, right_answers: m.right_answers }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsOut {
    pub session_id: String,
    pub metrics: Vec<TopicMetricsOut>,
}

#[derive(Debug, Deserialize)]
pub struct SetAdaptiveIn {
    #[serde(alias = "adaptive")]
    pub active: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamsUpdateIn {
    #[serde(default)]
    pub difficulty: Option<f64>,
    #[serde(default)]
    pub topics: Option<Vec<String>>,
    #[serde(default)]
    pub cumulative: Option<bool>,
    #[serde(default)]
    pub adaptive: Option<bool>,
    #[serde(default)]
    pub custom_requests: Option<String>,
}

impl From<ParamsUpdateIn> for ParamsUpdate {
    fn from(u: ParamsUpdateIn) -> Self {
        ParamsUpdate {
            difficulty: u.difficulty,
            topics: u.topics,
            cumulative: u.cumulative,
            adaptive: u.adaptive,
            custom_requests: u.custom_requests,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedOut {
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorOut {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub classes: Vec<String>,
    pub integrations: Integrations,
}
