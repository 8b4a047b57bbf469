//! Session coordinator: the single entry point for session-scoped operations.
//!
//! Each session has an operation lock. A mutating operation takes it with `try_lock`
//! (a busy session answers `SessionConflict` instead of queueing), works on a copy of the
//! session, and commits only if every step succeeded. Work runs in a spawned task so that
//! external calls already in flight can finish when the caller goes away; a cancellation
//! token and the slot's `deleted` flag are checked at commit time and such results are
//! dropped. Commits are written through to the document store; sessions unknown in memory
//! are lazily reloaded from it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::context::{AssembledContext, ContextAssembler, ContextRequest};
use crate::difficulty::DifficultyController;
use crate::domain::{
  Artifact, Attempt, ClassProfile, Feedback, Hint, ParamsUpdate, Question, QuestionId, Session, SessionId,
  SessionParams, TopicMetrics, VerificationStatus,
};
use crate::error::{CoreError, Degradation, QuestionFailure};
use crate::generation::{GenerationOrchestrator, GenerationRequest};
use crate::grading::Grader;
use crate::hints::{HintEngine, HintRequest};
use crate::services::{Compressor, DocumentStore, Embedder, GenerationModel, SymbolicOracle, VectorIndex};
use crate::store::{QUESTIONS, SESSIONS};
use crate::verifier::Verifier;

/// External collaborators the pipeline is built on.
pub struct Collaborators {
  pub model: Arc<dyn GenerationModel>,
  pub embedder: Arc<dyn Embedder>,
  pub oracle: Arc<dyn SymbolicOracle>,
  pub index: Arc<dyn VectorIndex>,
  pub compressor: Arc<dyn Compressor>,
  pub store: Arc<dyn DocumentStore>,
}

struct SessionSlot {
  op: Arc<Mutex<()>>,
  state: RwLock<Session>,
  deleted: AtomicBool,
}

impl SessionSlot {
  fn new(session: Session) -> Arc<Self> {
    Arc::new(Self { op: Arc::new(Mutex::new(())), state: RwLock::new(session), deleted: AtomicBool::new(false) })
  }
}

pub struct SessionCoordinator {
  classes: HashMap<String, Arc<ClassProfile>>,
  context: ContextAssembler,
  generator: GenerationOrchestrator,
  verifier: Verifier,
  difficulty: DifficultyController,
  hints: HintEngine,
  grader: Grader,
  store: Arc<dyn DocumentStore>,
  show_unverified: bool,
  max_answer_chars: usize,
  sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
  question_owner: RwLock<HashMap<QuestionId, SessionId>>,
}

impl SessionCoordinator {
  pub fn new(cfg: &AgentConfig, classes: Vec<ClassProfile>, c: Collaborators) -> Arc<Self> {
    let prompts = Arc::new(cfg.prompts.clone());
    let t = &cfg.timeouts;
    Arc::new(Self {
      classes: classes.into_iter().map(|p| (p.id.clone(), Arc::new(p))).collect(),
      context: ContextAssembler::new(c.index, c.compressor, cfg.context.clone(), t.clone()),
      generator: GenerationOrchestrator::new(
        c.model.clone(),
        prompts.clone(),
        cfg.generation.clone(),
        &cfg.backoff,
        t.model(),
      ),
      verifier: Verifier::new(
        c.model.clone(),
        c.oracle.clone(),
        prompts.clone(),
        cfg.verification.clone(),
        cfg.backoff.clone(),
        t.clone(),
      ),
      difficulty: DifficultyController::new(cfg.difficulty.clone()),
      hints: HintEngine::new(
        c.model.clone(),
        c.embedder,
        c.oracle,
        prompts.clone(),
        cfg.hints.clone(),
        &cfg.backoff,
        t,
      ),
      grader: Grader::new(c.model, prompts, cfg.verification.relative_tolerance, t.model()),
      store: c.store,
      show_unverified: cfg.verification.show_unverified,
      max_answer_chars: cfg.verification.max_student_answer_chars,
      sessions: RwLock::new(HashMap::new()),
      question_owner: RwLock::new(HashMap::new()),
    })
  }

  pub fn class(&self, class_id: &str) -> Result<Arc<ClassProfile>, CoreError> {
    self.classes.get(class_id).cloned().ok_or_else(|| CoreError::ClassNotFound(class_id.to_string()))
  }

  pub fn class_ids(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.classes.keys().cloned().collect();
    ids.sort();
    ids
  }

  #[instrument(target = "session", level = "info", skip(self, params), fields(%class_id))]
  pub async fn create_session(
    &self,
    class_id: &str,
    name: Option<String>,
    params: SessionParams,
    difficulty: Option<f64>,
  ) -> Result<Session, CoreError> {
    let profile = self.class(class_id)?;
    let topics = validate_topics(&profile, &params.topics)?;
    let difficulty = match difficulty {
      Some(d) if !d.is_finite() => return Err(CoreError::InvalidParams("difficulty must be a number".into())),
      Some(d) => self.difficulty.set(d),
      None => self.difficulty.initial(),
    };
    let id = Uuid::new_v4().to_string();
    let session = Session {
      name: name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| format!("{} practice", profile.name)),
      id: id.clone(),
      class_id: profile.id.clone(),
      params: SessionParams { topics, ..params },
      difficulty,
      questions: Vec::new(),
      attempts: Vec::new(),
      hints: HashMap::new(),
      created_at: Utc::now(),
    };
    self.persist(&session).await?;
    self.sessions.write().await.insert(id.clone(), SessionSlot::new(session.clone()));
    info!(target: "session", session_id = %id, d = session.difficulty.d, "Session created");
    Ok(session)
  }

  /// Last committed state.
  pub async fn get_session(&self, session_id: &str) -> Result<Session, CoreError> {
    let slot = self.slot(session_id).await?;
    let session = slot.state.read().await.clone();
    Ok(session)
  }

  #[instrument(target = "session", level = "info", skip(self), fields(%session_id))]
  pub async fn request_question(self: &Arc<Self>, session_id: &str) -> Result<Question, CoreError> {
    self
      .exclusive(session_id, |this, mut session| async move {
        let profile = this.class(&session.class_id)?;
        let mut topics = scope_topics(&profile, &session.params);
        if session.params.cumulative {
          topics.extend(profile.background_topics(&session.params.topics));
        }
        let ctx = this.context.assemble(ContextRequest { profile: &profile, topics: &topics, focus: None }).await;
        debug!(target: "session", chunks = ctx.chunk_ids.len(), compressed = ctx.compressed, degraded = ctx.degraded, "Context assembled");

        let req = GenerationRequest {
          profile: &profile,
          params: &session.params,
          difficulty: session.difficulty,
          last_attempt: session.attempts.last(),
          history: &session.questions,
          context: &ctx,
          verifier_feedback: None,
        };
        let verified = this.verifier.produce(&this.generator, &req).await?;
        if verified.status == VerificationStatus::Unverified && !this.show_unverified {
          warn!(target: "session", reason = ?verified.unverified_reason, "Withholding unverified question");
          return Err(CoreError::QuestionUnavailable(QuestionFailure::WithheldUnverified));
        }

        let mut flags = verified.flags;
        if ctx.degraded {
          flags.push(Degradation::RetrievalDegraded);
        }
        let c = verified.candidate;
        debug!(target: "session", generation_attempts = c.attempts, "Candidate passed verification stage");
        let question = Question {
          id: Uuid::new_v4().to_string(),
          session_id: session.id.clone(),
          content: c.content,
          canonical_answer: c.canonical_answer,
          answer_text: c.answer_text,
          explanation: c.explanation,
          topics: c.topics,
          difficulty: session.difficulty.d,
          status: verified.status,
          oracle_query: verified.oracle_query,
          oracle_result: verified.oracle_result,
          unverified_reason: verified.unverified_reason,
          flags,
          created_at: Utc::now(),
        };
        info!(target: "session", question_id = %question.id, status = ?question.status, flags = ?question.flags, "Question published");
        session.questions.push(question.clone());
        Ok::<_, CoreError>((session, question))
      })
      .await
  }

  #[instrument(target = "session", level = "info", skip(self, answer), fields(%question_id, answer_len = answer.len()))]
  pub async fn submit_answer(self: &Arc<Self>, question_id: &str, answer: String) -> Result<Feedback, CoreError> {
    if answer.chars().count() > self.max_answer_chars {
      return Err(CoreError::InvalidParams(format!("answers are limited to {} characters", self.max_answer_chars)));
    }
    let session_id = self.owner(question_id).await?;
    let question_id = question_id.to_string();
    self
      .exclusive(&session_id, move |this, mut session| async move {
        let question = session.question(&question_id).cloned().ok_or(CoreError::QuestionNotFound(question_id))?;
        let (feedback, source) = this.grader.grade(&question, &answer).await;
        // Only the first graded attempt on a question counts toward mastery.
        let first_attempt = !session.attempts.iter().any(|a| a.question_id == question.id);
        let counted = first_attempt && question.counts_toward_mastery() && session.params.adaptive;
        let before = session.difficulty.d;
        session.difficulty = this.difficulty.after_attempt(session.difficulty, feedback.is_correct, counted);
        session.attempts.push(Attempt {
          question_id: question.id.clone(),
          answer,
          correct: feedback.is_correct,
          feedback: feedback.explanation.clone(),
          counted,
          at: Utc::now(),
        });
        info!(target: "session", correct = feedback.is_correct, source, counted, before, after = session.difficulty.d, "Answer recorded");
        Ok::<_, CoreError>((session, feedback))
      })
      .await
  }

  #[instrument(target = "session", level = "info", skip(self, struggle, artifact), fields(%question_id, has_artifact = artifact.is_some()))]
  pub async fn request_hint(
    self: &Arc<Self>,
    question_id: &str,
    struggle: String,
    artifact: Option<Artifact>,
  ) -> Result<Hint, CoreError> {
    let session_id = self.owner(question_id).await?;
    let question_id = question_id.to_string();
    self
      .exclusive(&session_id, move |this, mut session| async move {
        let question = session.question(&question_id).cloned().ok_or(CoreError::QuestionNotFound(question_id))?;
        let profile = this.class(&session.class_id)?;
        let focus = match &artifact {
          Some(Artifact::Text(t)) => format!("{}\n{}", question.content, t),
          _ => question.content.clone(),
        };
        let topics = if question.topics.is_empty() { scope_topics(&profile, &session.params) } else { question.topics.clone() };
        let ctx: AssembledContext =
          this.context.assemble(ContextRequest { profile: &profile, topics: &topics, focus: Some(&focus) }).await;

        let prior = session.hints_for(&question.id).to_vec();
        let mut hint = this
          .hints
          .produce(&HintRequest {
            question: &question,
            prior: &prior,
            struggle: &struggle,
            artifact: artifact.as_ref(),
            context: &ctx.text,
          })
          .await;
        if ctx.degraded {
          hint.flags.push(Degradation::RetrievalDegraded);
        }
        session.hints.entry(question.id.clone()).or_default().push(hint.clone());
        Ok::<_, CoreError>((session, hint))
      })
      .await
  }

  /// Answer counts per topic, on verified questions, in syllabus order.
  pub async fn metrics(&self, session_id: &str) -> Result<Vec<TopicMetrics>, CoreError> {
    let session = self.get_session(session_id).await?;
    let profile = self.class(&session.class_id)?;
    let order = profile.topic_names();
    let mut metrics = session.topic_metrics();
    metrics.sort_by_key(|m| order.iter().position(|n| *n == m.topic).unwrap_or(order.len()));
    Ok(metrics)
  }

  #[instrument(target = "session", level = "info", skip(self), fields(%session_id, enabled))]
  pub async fn set_adaptive(self: &Arc<Self>, session_id: &str, enabled: bool) -> Result<Session, CoreError> {
    self
      .exclusive(session_id, move |_this, mut session| async move {
        session.params.adaptive = enabled;
        Ok::<_, CoreError>((session.clone(), session))
      })
      .await
  }

  #[instrument(target = "session", level = "info", skip(self, update), fields(%session_id))]
  pub async fn update_session_params(self: &Arc<Self>, session_id: &str, update: ParamsUpdate) -> Result<Session, CoreError> {
    self
      .exclusive(session_id, move |this, mut session| async move {
        let profile = this.class(&session.class_id)?;
        if let Some(topics) = &update.topics {
          session.params.topics = validate_topics(&profile, topics)?;
        }
        if let Some(d) = update.difficulty {
          if !d.is_finite() {
            return Err(CoreError::InvalidParams("difficulty must be a number".into()));
          }
          session.difficulty = this.difficulty.set(d);
        }
        if let Some(c) = update.cumulative {
          session.params.cumulative = c;
        }
        if let Some(a) = update.adaptive {
          session.params.adaptive = a;
        }
        if let Some(r) = update.custom_requests {
          session.params.custom_requests = r;
        }
        Ok::<_, CoreError>((session.clone(), session))
      })
      .await
  }

  /// Results of operations still in flight for this session are discarded.
  #[instrument(target = "session", level = "info", skip(self), fields(%session_id))]
  pub async fn delete_session(&self, session_id: &str) -> Result<(), CoreError> {
    let slot = self.slot(session_id).await?;
    let mut sessions = self.sessions.write().await;
    slot.deleted.store(true, Ordering::SeqCst);
    sessions.remove(session_id);
    let question_ids: Vec<String> = slot.state.read().await.questions.iter().map(|q| q.id.clone()).collect();
    {
      let mut owners = self.question_owner.write().await;
      for id in &question_ids {
        owners.remove(id);
      }
    }
    for id in &question_ids {
      self.store.delete(QUESTIONS, id).await.map_err(|e| CoreError::Persistence(e.to_string()))?;
    }
    self.store.delete(SESSIONS, session_id).await.map_err(|e| CoreError::Persistence(e.to_string()))?;
    info!(target: "session", questions = question_ids.len(), "Session deleted");
    Ok(())
  }

  /// Run `op` under the session's operation lock and commit its result.
  async fn exclusive<T, F, Fut>(self: &Arc<Self>, session_id: &str, op: F) -> Result<T, CoreError>
  where
    T: Send + 'static,
    F: FnOnce(Arc<Self>, Session) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(Session, T), CoreError>> + Send + 'static,
  {
    let slot = self.slot(session_id).await?;
    let permit = slot.op.clone().try_lock_owned().map_err(|_| {
      warn!(target: "session", %session_id, "Rejected: another operation is in flight");
      CoreError::SessionConflict(session_id.to_string())
    })?;

    let token = CancellationToken::new();
    let _cancel_on_drop = token.clone().drop_guard();
    let this = Arc::clone(self);
    let task = tokio::spawn(async move {
      let _permit = permit;
      let working = slot.state.read().await.clone();
      let (updated, out) = op(this.clone(), working).await?;
      this.commit(&slot, updated, &token).await?;
      Ok::<T, CoreError>(out)
    });
    task.await.map_err(|e| CoreError::Internal(format!("session task failed: {e}")))?
  }

  async fn commit(&self, slot: &SessionSlot, updated: Session, token: &CancellationToken) -> Result<(), CoreError> {
    // shared with other commits, exclusive with delete
    let _sessions = self.sessions.read().await;
    if slot.deleted.load(Ordering::SeqCst) {
      info!(target: "session", session_id = %updated.id, "Session deleted mid-operation; result discarded");
      return Err(CoreError::SessionNotFound(updated.id));
    }
    if token.is_cancelled() {
      info!(target: "session", session_id = %updated.id, "Caller went away; result discarded");
      return Err(CoreError::Internal("request cancelled".into()));
    }
    self.persist(&updated).await?;
    *slot.state.write().await = updated;
    Ok(())
  }

  async fn persist(&self, session: &Session) -> Result<(), CoreError> {
    let doc = serde_json::to_value(session).map_err(|e| CoreError::Internal(e.to_string()))?;
    let mut owners = self.question_owner.write().await;
    for q in &session.questions {
      if !owners.contains_key(&q.id) {
        self.store
          .put(QUESTIONS, &q.id, json!({ "session_id": session.id }))
          .await
          .map_err(|e| CoreError::Persistence(e.to_string()))?;
        owners.insert(q.id.clone(), session.id.clone());
      }
    }
    self.store.put(SESSIONS, &session.id, doc).await.map_err(|e| CoreError::Persistence(e.to_string()))
  }

  async fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>, CoreError> {
    if let Some(slot) = self.sessions.read().await.get(session_id) {
      return Ok(slot.clone());
    }
    let doc = self
      .store
      .get(SESSIONS, session_id)
      .await
      .map_err(|e| CoreError::Persistence(e.to_string()))?
      .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
    let session: Session =
      serde_json::from_value(doc).map_err(|e| CoreError::Persistence(format!("corrupt session document: {e}")))?;
    {
      let mut owners = self.question_owner.write().await;
      for q in &session.questions {
        owners.insert(q.id.clone(), session.id.clone());
      }
    }
    info!(target: "session", %session_id, questions = session.questions.len(), "Session reloaded from store");
    let mut sessions = self.sessions.write().await;
    Ok(sessions.entry(session_id.to_string()).or_insert_with(|| SessionSlot::new(session)).clone())
  }

  async fn owner(&self, question_id: &str) -> Result<SessionId, CoreError> {
    if let Some(id) = self.question_owner.read().await.get(question_id) {
      return Ok(id.clone());
    }
    let doc = self
      .store
      .get(QUESTIONS, question_id)
      .await
      .map_err(|e| CoreError::Persistence(e.to_string()))?;
    match doc.as_ref().and_then(|d| d.get("session_id")).and_then(Value::as_str) {
      Some(id) => Ok(id.to_string()),
      None => Err(CoreError::QuestionNotFound(question_id.to_string())),
    }
  }
}

/// The session's focus topics, or the whole syllabus when none were chosen.
fn scope_topics(profile: &ClassProfile, params: &SessionParams) -> Vec<String> {
  if params.topics.is_empty() {
    profile.topic_names().into_iter().map(str::to_string).collect()
  } else {
    params.topics.clone()
  }
}

/// Map requested topics onto the profile's spelling; unknown topics are rejected.
fn validate_topics(profile: &ClassProfile, requested: &[String]) -> Result<Vec<String>, CoreError> {
  let names = profile.topic_names();
  let mut out: Vec<String> = Vec::new();
  for t in requested {
    let t = t.trim();
    if t.is_empty() {
      continue;
    }
    let Some(name) = names.iter().find(|n| n.eq_ignore_ascii_case(t)) else {
      return Err(CoreError::InvalidParams(format!("unknown topic `{t}` for class {}", profile.id)));
    };
    if !out.iter().any(|o| o == name) {
      out.push(name.to_string());
    }
  }
  Ok(out)
}
