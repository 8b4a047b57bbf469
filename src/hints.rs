//! Tiered, non-repeating hints.
//!
//! The tier is a function of how many hints the question already has: conceptual first,
//! then one procedural step tied to a named sub-skill, then a near-complete scaffold.
//! Every new hint is compared with all earlier hints for the question, by embedding cosine
//! when the embedding model answers and by lexical similarity otherwise; a near-duplicate is
//! regenerated with a "must differ" instruction. When the student's current step is attached
//! as text, a well-formed candidate is also checked against it (model verdict, plus an oracle
//! query for math claims) and an inconsistent one is regenerated. When the budget runs out
//! the least similar usable candidate is served and flagged as a forced duplicate.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::config::{BackoffCfg, HintCfg, Prompts, TimeoutCfg};
use crate::domain::{Artifact, Hint, HintTier, Question, StepCheck};
use crate::equivalence::normalize_answer;
use crate::error::Degradation;
use crate::repair;
use crate::retry::{Reject, RetryError, RetryPolicy, Round};
use crate::services::{Embedder, GenerationModel, ImagePart, ModelRequest, ModelTier, OracleAnswer, SymbolicOracle};
use crate::similarity::{cosine_similarity, max_similarity};
use crate::util::{fill_template, trunc_for_log, with_timeout};

#[derive(Clone, Copy, Debug)]
pub struct HintRequest<'a> {
  pub question: &'a Question,
  pub prior: &'a [Hint],
  pub struggle: &'a str,
  pub artifact: Option<&'a Artifact>,
  pub context: &'a str,
}

#[derive(Clone, Debug, Deserialize)]
struct HintOut {
  text: String,
  #[serde(default)]
  sub_skill: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StepVerdict {
  is_consistent: bool,
  #[serde(default)]
  oracle_query: Option<String>,
  #[serde(default)]
  explanation: String,
}

/// Closest resemblance to an earlier hint, and the bar for the measure that produced it.
#[derive(Clone, Copy, Debug)]
struct Resemblance {
  score: f32,
  threshold: f32,
}

impl Resemblance {
  fn too_close(&self) -> bool {
    self.score > self.threshold
  }

  fn margin(&self) -> f32 {
    self.score - self.threshold
  }
}

#[derive(Clone, Debug)]
struct Scored {
  out: HintOut,
  resemblance: Resemblance,
  step: Option<StepCheck>,
}

impl Scored {
  fn contradicts_step(&self) -> bool {
    self.step.as_ref().is_some_and(|s| !s.consistent)
  }
}

pub struct HintEngine {
  model: Arc<dyn GenerationModel>,
  embedder: Arc<dyn Embedder>,
  oracle: Arc<dyn SymbolicOracle>,
  prompts: Arc<Prompts>,
  cfg: HintCfg,
  policy: RetryPolicy,
  model_timeout: Duration,
  oracle_timeout: Duration,
}

impl HintEngine {
  pub fn new(
    model: Arc<dyn GenerationModel>,
    embedder: Arc<dyn Embedder>,
    oracle: Arc<dyn SymbolicOracle>,
    prompts: Arc<Prompts>,
    cfg: HintCfg,
    backoff: &BackoffCfg,
    timeouts: &TimeoutCfg,
  ) -> Self {
    let policy = RetryPolicy::new(cfg.max_attempts, backoff);
    Self {
      model,
      embedder,
      oracle,
      prompts,
      cfg,
      policy,
      model_timeout: timeouts.model(),
      oracle_timeout: timeouts.oracle(),
    }
  }

  #[instrument(target = "hint", level = "info", skip(self, req), fields(question_id = %req.question.id, prior = req.prior.len()))]
  pub async fn produce(&self, req: &HintRequest<'_>) -> Hint {
    let tier = HintTier::after(req.prior.len());
    let prior_texts: Vec<&str> = req.prior.iter().map(|h| h.text.as_str()).collect();
    let prior_vectors = self.embed(&prior_texts).await;
    let image = match req.artifact {
      Some(Artifact::Image { mime, bytes }) => Some(ImagePart { mime: mime.clone(), bytes: bytes.clone() }),
      _ => None,
    };
    let step = match req.artifact {
      Some(Artifact::Text(t)) if self.cfg.check_steps && !t.trim().is_empty() => Some(t.as_str()),
      _ => None,
    };
    let canonical = req.question.canonical_answer.as_str();

    let produce = |round: Round| {
      let user = self.user_prompt(req, tier, round.feedback.as_deref());
      let image = image.clone();
      let prior_texts = &prior_texts;
      let prior_vectors = prior_vectors.as_deref();
      async move {
        let request = ModelRequest {
          system: self.prompts.hint_system.clone(),
          user,
          temperature: self.cfg.temperature,
          tier: ModelTier::Fast,
          json: true,
          image,
        };
        let raw = with_timeout("generation model", self.model_timeout, self.model.complete(request))
          .await
          .map_err(|e| Reject::<Infallible>::Transient(e.to_string()))?;
        let out: HintOut = repair::parse_as(&raw)
          .map_err(|e| Reject::<Infallible>::Defect(format!("the response was not the requested JSON object ({e})")))?;
        let resemblance = self.resemblance(&out.text, prior_texts, prior_vectors).await;
        let step = match step {
          Some(step) if form_defect(&out, tier, canonical).is_none() && !resemblance.too_close() => {
            self.check_step(req.question, &out.text, tier, step).await
          }
          _ => None,
        };
        Ok::<_, Reject<Infallible>>(Scored { out, resemblance, step })
      }
    };
    let validate = |c: &Scored| {
      form_defect(&c.out, tier, canonical)
        .or_else(|| {
          c.resemblance.too_close().then(|| {
            format!(
              "the hint is too similar to one already given (similarity {:.2}); it must differ from previously given hints, take a different angle",
              c.resemblance.score
            )
          })
        })
        .or_else(|| {
          c.step.as_ref().filter(|s| !s.consistent).map(|s| {
            format!("the hint does not fit the student's current step ({}); build on what the student actually wrote", s.explanation)
          })
        })
    };

    let (out, step_check, forced_duplicate) = match self.policy.run("hint", produce, validate).await {
      Ok(accepted) => {
        let c = accepted.value;
        info!(target: "hint", tier = tier.number(), attempts = accepted.attempts, similarity = c.resemblance.score, step_checked = c.step.is_some(), "Hint accepted");
        (c.out, c.step, false)
      }
      Err(RetryError::Exhausted { rejected, last_defect, .. }) => {
        let least_similar = rejected
          .into_iter()
          .map(|(c, _)| c)
          .filter(|c| form_defect(&c.out, tier, canonical).is_none() && !c.contradicts_step())
          .min_by(|a, b| a.resemblance.margin().total_cmp(&b.resemblance.margin()));
        match least_similar {
          Some(c) => {
            warn!(target: "hint", tier = tier.number(), similarity = c.resemblance.score, "Serving forced duplicate hint");
            (c.out, c.step, true)
          }
          None => {
            warn!(target: "hint", tier = tier.number(), %last_defect, "No usable model hint; using tier template");
            let out = template(tier, req.question);
            let duplicate = self.resemblance(&out.text, &prior_texts, prior_vectors.as_deref()).await.too_close();
            (out, None, duplicate)
          }
        }
      }
      Err(RetryError::Aborted(never)) => match never {},
    };

    Hint {
      question_id: req.question.id.clone(),
      tier,
      text: out.text.trim().to_string(),
      sub_skill: out.sub_skill.filter(|s| !s.trim().is_empty()),
      struggle: req.struggle.to_string(),
      artifact_ref: req.artifact.map(artifact_ref),
      forced_duplicate,
      step_check,
      flags: if forced_duplicate { vec![Degradation::ForcedDuplicateHint] } else { Vec::new() },
      created_at: Utc::now(),
    }
  }

  /// Embeddings for `texts`, or `None` when the embedding model cannot serve them.
  async fn embed(&self, texts: &[&str]) -> Option<Vec<Vec<f32>>> {
    if texts.is_empty() {
      return Some(Vec::new());
    }
    let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
    match with_timeout("embedding model", self.model_timeout, self.embedder.embed(&owned)).await {
      Ok(v) if v.len() == texts.len() => Some(v),
      Ok(v) => {
        warn!(target: "hint", expected = texts.len(), got = v.len(), "Embedding count mismatch; using lexical similarity");
        None
      }
      Err(e) => {
        debug!(target: "hint", error = %e, "Embeddings unavailable; using lexical similarity");
        None
      }
    }
  }

  async fn resemblance(&self, text: &str, prior_texts: &[&str], prior_vectors: Option<&[Vec<f32>]>) -> Resemblance {
    if prior_texts.is_empty() {
      return Resemblance { score: 0.0, threshold: self.cfg.semantic_threshold };
    }
    if let Some(prior_vectors) = prior_vectors {
      if let Some(v) = self.embed(&[text]).await.and_then(|mut v| v.pop()) {
        let score = prior_vectors.iter().map(|p| cosine_similarity(&v, p)).fold(0.0, f32::max);
        return Resemblance { score, threshold: self.cfg.semantic_threshold };
      }
    }
    Resemblance {
      score: max_similarity(text, prior_texts.iter().copied()),
      threshold: self.cfg.similarity_threshold,
    }
  }

  /// Whether `hint` fits the step the student wrote. Math claims the model can phrase as an
  /// oracle query are also evaluated; an oracle `False` overrides a favourable verdict.
  /// `None` when the check could not run.
  async fn check_step(&self, question: &Question, hint: &str, tier: HintTier, step: &str) -> Option<StepCheck> {
    let tier_number = tier.number().to_string();
    let step = trunc_for_log(step, 2000);
    let user = fill_template(
      &self.prompts.step_check_user_template,
      &[
        ("question", question.content.as_str()),
        ("step", step.as_str()),
        ("hint", hint),
        ("tier", tier_number.as_str()),
      ],
    );
    let request = ModelRequest {
      system: self.prompts.step_check_system.clone(),
      user,
      temperature: 0.1,
      tier: ModelTier::Fast,
      json: true,
      image: None,
    };
    let verdict = match with_timeout("generation model", self.model_timeout, self.model.complete(request)).await {
      Ok(raw) => match repair::parse_as::<StepVerdict>(&raw) {
        Ok(v) => v,
        Err(e) => {
          warn!(target: "hint", error = %e, "Unreadable step check; serving the hint unchecked");
          return None;
        }
      },
      Err(e) => {
        warn!(target: "hint", error = %e, "Step check unavailable; serving the hint unchecked");
        return None;
      }
    };

    // Only questions the oracle already understood are treated as math.
    let oracle_query = verdict
      .oracle_query
      .map(|q| q.trim().to_string())
      .filter(|q| !q.is_empty() && question.oracle_query.is_some());
    let oracle_result = match &oracle_query {
      Some(q) => match with_timeout("symbolic oracle", self.oracle_timeout, self.oracle.query(q)).await {
        Ok(OracleAnswer::Result(r)) => Some(r),
        Ok(OracleAnswer::Unparseable(_)) => None,
        Err(e) => {
          warn!(target: "hint", error = %e, "Oracle unavailable for step check");
          None
        }
      },
      None => None,
    };
    let refuted = oracle_result.as_deref().is_some_and(|r| normalize_answer(r) == "false");
    let mut explanation = verdict.explanation.trim().to_string();
    if refuted {
      explanation = format!("{explanation} The oracle evaluated the claim to False.").trim().to_string();
    }
    let consistent = verdict.is_consistent && !refuted;
    info!(target: "hint", consistent, oracle = oracle_result.is_some(), "Hint checked against the student's step");
    Some(StepCheck { consistent, explanation, oracle_query, oracle_result })
  }

  fn user_prompt(&self, req: &HintRequest<'_>, tier: HintTier, defect: Option<&str>) -> String {
    let artifact = match req.artifact {
      Some(Artifact::Text(t)) => format!("Student's work so far:\n{}", trunc_for_log(t, 2000)),
      Some(Artifact::Image { .. }) => "The student's work is attached as an image.".to_string(),
      None => String::new(),
    };
    let history = if req.prior.is_empty() {
      "(none)".to_string()
    } else {
      req
        .prior
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{}. (tier {}) {}", i + 1, h.tier.number(), h.text))
        .collect::<Vec<_>>()
        .join("\n")
    };
    let corrective = defect
      .map(|d| format!("\nYour previous hint was rejected: {d}."))
      .unwrap_or_default();
    let context = if req.context.trim().is_empty() { "(none)" } else { req.context };
    let tier_number = tier.number().to_string();

    fill_template(
      &self.prompts.hint_user_template,
      &[
        ("question", req.question.content.as_str()),
        ("struggle", req.struggle),
        ("artifact", artifact.as_str()),
        ("context", context),
        ("tier", tier_number.as_str()),
        ("tier_policy", tier_policy(tier)),
        ("history", history.as_str()),
        ("corrective", corrective.as_str()),
      ],
    )
  }
}

pub fn tier_policy(tier: HintTier) -> &'static str {
  match tier {
    HintTier::Conceptual => {
      "a conceptual or metacognitive nudge only: point at the idea or question to ask oneself, no procedural steps, no formulas to apply."
    }
    HintTier::Procedural => {
      "exactly one concrete procedural step, tied to a specific named sub-skill (set `sub_skill`)."
    }
    HintTier::Scaffold => {
      "a near-complete worked scaffold that stops short of the final numeric or symbolic answer; the student performs the last step."
    }
  }
}

/// Structural problems, independent of earlier hints.
fn form_defect(out: &HintOut, tier: HintTier, canonical_answer: &str) -> Option<String> {
  if out.text.trim().is_empty() {
    return Some("`text` is empty".into());
  }
  if tier == HintTier::Procedural && out.sub_skill.as_deref().map_or(true, |s| s.trim().is_empty()) {
    return Some("a tier 2 hint must name the sub-skill it exercises in `sub_skill`".into());
  }
  if reveals_answer(&out.text, canonical_answer) {
    return Some("the hint gives away the final answer; stop one step short of it".into());
  }
  None
}

fn reveals_answer(text: &str, canonical_answer: &str) -> bool {
  if canonical_answer.is_empty() {
    return false;
  }
  let norm = normalize_answer(text);
  if canonical_answer.chars().count() >= 3 && norm.contains(canonical_answer) {
    return true;
  }
  norm.contains(&format!("={canonical_answer}")) && norm.ends_with(canonical_answer)
}

fn template(tier: HintTier, q: &Question) -> HintOut {
  let topic = q.topics.first().cloned().unwrap_or_else(|| "the main idea of this problem".into());
  match tier {
    HintTier::Conceptual => HintOut {
      text: format!(
        "Before calculating anything, restate in your own words what the problem asks for, and ask yourself how {topic} connects what you are given to what you need."
      ),
      sub_skill: None,
    },
    HintTier::Procedural => HintOut {
      text: format!("Focus on one step: write down the rule from {topic} that applies here and use it on the first part of the expression."),
      sub_skill: Some(topic),
    },
    HintTier::Scaffold => HintOut {
      text: format!(
        "Outline: list the known quantities, set up the expression using {topic}, simplify it one operation at a time, and then carry out the final computation yourself."
      ),
      sub_skill: None,
    },
  }
}

fn artifact_ref(a: &Artifact) -> String {
  match a {
    Artifact::Text(t) => format!("text ({} chars)", t.chars().count()),
    Artifact::Image { mime, bytes } => format!("{mime} ({} bytes)", bytes.len()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::VerificationStatus;
  use crate::services::Unconfigured;
  use crate::similarity::similarity;
  use crate::testing::{config, hint_json, step_check_json, ConceptEmbedder, FixedOracle, ScriptedModel, HINT, STEP_CHECK};
  use rand::rngs::StdRng;
  use rand::{Rng, SeedableRng};
  use std::collections::HashMap;
  use std::sync::atomic::Ordering;

  fn engine_with(model: Arc<ScriptedModel>, embedder: Arc<dyn Embedder>, oracle: Arc<dyn SymbolicOracle>) -> HintEngine {
    let cfg = config();
    HintEngine::new(model, embedder, oracle, Arc::new(cfg.prompts), cfg.hints, &cfg.backoff, &cfg.timeouts)
  }

  fn engine(model: Arc<ScriptedModel>) -> HintEngine {
    engine_with(model, Arc::new(Unconfigured("embedding model")), Arc::new(Unconfigured("symbolic oracle")))
  }

  fn question() -> Question {
    Question {
      id: "q1".into(),
      session_id: "s1".into(),
      content: "Differentiate $$f(x) = \\sin(x^2)$$.".into(),
      canonical_answer: normalize_answer("2x\\cos(x^2)"),
      answer_text: "2x\\cos(x^2)".into(),
      explanation: String::new(),
      topics: vec!["Chain rule".into()],
      difficulty: 0.5,
      status: VerificationStatus::Verified,
      oracle_query: None,
      oracle_result: None,
      unverified_reason: None,
      flags: vec![],
      created_at: Utc::now(),
    }
  }

  fn prior(text: &str, tier: HintTier) -> Hint {
    Hint {
      question_id: "q1".into(),
      tier,
      text: text.into(),
      sub_skill: None,
      struggle: String::new(),
      artifact_ref: None,
      forced_duplicate: false,
      step_check: None,
      flags: vec![],
      created_at: Utc::now(),
    }
  }

  const FIRST: &str = "Think about the structure of the function: is it one function plugged inside another?";

  #[tokio::test]
  async fn first_hint_is_conceptual() {
    let model = Arc::new(ScriptedModel::new());
    model.push(HINT, hint_json(FIRST, None));
    let q = question();
    let hint = engine(model.clone())
      .produce(&HintRequest { question: &q, prior: &[], struggle: "no idea where to start", artifact: None, context: "" })
      .await;
    assert_eq!(hint.tier, HintTier::Conceptual);
    assert!(!hint.forced_duplicate);
    assert!(model.requests()[0].user.contains("Hint tier 1 of 3"));
  }

  #[tokio::test]
  async fn near_duplicates_are_regenerated() {
    let model = Arc::new(ScriptedModel::new());
    let second = "Name the inner function u = x^2 and differentiate the outer sine with respect to u first.";
    model
      .push(HINT, hint_json("Think about the structure of the function: is it one function plugged inside another one?", Some("composition")))
      .push(HINT, hint_json(second, Some("chain rule")));
    let q = question();
    let prior = [prior(FIRST, HintTier::Conceptual)];
    let hint = engine(model.clone())
      .produce(&HintRequest { question: &q, prior: &prior, struggle: "still stuck", artifact: None, context: "" })
      .await;
    assert_eq!(hint.tier, HintTier::Procedural);
    assert_eq!(hint.text, second);
    assert_eq!(hint.sub_skill.as_deref(), Some("chain rule"));
    assert!(similarity(&hint.text, FIRST) <= 0.8);
    assert!(model.requests()[1].user.contains("must differ from previously given hints"));
  }

  #[tokio::test]
  async fn exhausted_budget_serves_least_similar_and_flags_it() {
    let model = Arc::new(ScriptedModel::new());
    model
      .push(HINT, hint_json(FIRST, Some("a")))
      .push(HINT, hint_json("Think about the structure of this function: is it one function plugged inside another?", Some("b")))
      .push(HINT, hint_json("Think about the structure of the function: is it one function plugged into another?", Some("c")));
    let q = question();
    let prior = [prior(FIRST, HintTier::Conceptual)];
    let hint = engine(model)
      .produce(&HintRequest { question: &q, prior: &prior, struggle: "", artifact: None, context: "" })
      .await;
    assert!(hint.forced_duplicate);
    assert_eq!(hint.flags, vec![Degradation::ForcedDuplicateHint]);
    assert_ne!(hint.text, FIRST);
  }

  #[tokio::test]
  async fn tier_rules_are_enforced() {
    let model = Arc::new(ScriptedModel::new());
    model
      .push(HINT, hint_json("Carry it through: the derivative is 2x\\cos(x^2).", None))
      .push(HINT, hint_json("Multiply the derivative of the outer function, evaluated at x^2, by the derivative of x^2.", None));
    let q = question();
    let prior = [prior(FIRST, HintTier::Conceptual), prior("Identify the inner function u = x^2 and differentiate it.", HintTier::Procedural)];
    let hint = engine(model.clone())
      .produce(&HintRequest { question: &q, prior: &prior, struggle: "", artifact: None, context: "" })
      .await;
    assert_eq!(hint.tier, HintTier::Scaffold);
    assert!(!hint.text.contains("2x\\cos"));
    assert!(model.requests()[1].user.contains("gives away the final answer"));
  }

  #[tokio::test]
  async fn unavailable_model_falls_back_to_template() {
    let model = Arc::new(ScriptedModel::new());
    let q = question();
    let prior = [prior(FIRST, HintTier::Conceptual)];
    let hint = engine(model)
      .produce(&HintRequest { question: &q, prior: &prior, struggle: "", artifact: None, context: "" })
      .await;
    assert_eq!(hint.tier, HintTier::Procedural);
    assert_eq!(hint.sub_skill.as_deref(), Some("Chain rule"));
    assert!(!hint.forced_duplicate);
  }

  #[tokio::test]
  async fn image_artifacts_are_attached() {
    let model = Arc::new(ScriptedModel::new());
    model.push(HINT, hint_json(FIRST, None));
    let q = question();
    let art = Artifact::Image { mime: "image/jpeg".into(), bytes: vec![0xff, 0xd8, 0xff] };
    let hint = engine(model.clone())
      .produce(&HintRequest { question: &q, prior: &[], struggle: "see photo", artifact: Some(&art), context: "" })
      .await;
    let req = &model.requests()[0];
    assert_eq!(req.image.as_ref().map(|i| i.bytes.len()), Some(3));
    assert!(req.user.contains("attached as an image"));
    assert_eq!(hint.artifact_ref.as_deref(), Some("image/jpeg (3 bytes)"));
  }

  const CONSTANT: &str = "Consider which quantity stays constant throughout the motion.";
  const PARAPHRASE: &str = "Think about what value does not change as the object moves.";

  fn motion_embedder() -> Arc<ConceptEmbedder> {
    Arc::new(ConceptEmbedder::new(&[
      &["quantity", "value"],
      &["stays constant", "does not change", "unchanged"],
      &["motion", "moves", "moving"],
      &["energy"],
      &["start", "end"],
    ]))
  }

  #[tokio::test]
  async fn paraphrased_hints_are_caught_semantically() {
    assert!(similarity(CONSTANT, PARAPHRASE) < 0.2);
    let model = Arc::new(ScriptedModel::new());
    let fresh = "Write the total energy at the start and at the end, then set them equal.";
    model
      .push(HINT, hint_json(PARAPHRASE, Some("conservation laws")))
      .push(HINT, hint_json(fresh, Some("energy conservation")));
    let embedder = motion_embedder();
    let q = question();
    let prior = [prior(CONSTANT, HintTier::Conceptual)];
    let hint = engine_with(model.clone(), embedder.clone(), Arc::new(Unconfigured("symbolic oracle")))
      .produce(&HintRequest { question: &q, prior: &prior, struggle: "", artifact: None, context: "" })
      .await;
    assert_eq!(hint.text, fresh);
    assert!(!hint.forced_duplicate);
    assert!(model.requests()[1].user.contains("must differ from previously given hints"));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn embedding_outage_falls_back_to_lexical_similarity() {
    let model = Arc::new(ScriptedModel::new());
    model.push(HINT, hint_json(PARAPHRASE, Some("conservation laws")));
    let embedder = motion_embedder();
    embedder.fail.store(true, Ordering::SeqCst);
    let q = question();
    let prior = [prior(CONSTANT, HintTier::Conceptual)];
    let hint = engine_with(model.clone(), embedder, Arc::new(Unconfigured("symbolic oracle")))
      .produce(&HintRequest { question: &q, prior: &prior, struggle: "", artifact: None, context: "" })
      .await;
    assert_eq!(hint.text, PARAPHRASE);
    assert_eq!(model.calls(), 1);
  }

  #[tokio::test]
  async fn hints_contradicting_the_written_step_are_regenerated() {
    let model = Arc::new(ScriptedModel::new());
    let wrong = "Your inner derivative 2x is right; now multiply it by -\\sin(x^2).";
    let right = "Check the derivative of the outer function: what is the derivative of sine?";
    model
      .push(HINT, hint_json(wrong, None))
      .push(STEP_CHECK, step_check_json(true, Some("D[Sin[u], u] == -Cos[u]"), "Matches the student's inner derivative."))
      .push(HINT, hint_json(right, None))
      .push(STEP_CHECK, step_check_json(true, None, "Points at the outer derivative the student got wrong."));
    let oracle = Arc::new(FixedOracle::always("False"));
    let mut q = question();
    q.oracle_query = Some("D[Sin[x^2], x]".into());
    let step = Artifact::Text("f'(x) = -sin(x^2) * 2x".into());
    let hint = engine_with(model.clone(), Arc::new(Unconfigured("embedding model")), oracle.clone())
      .produce(&HintRequest { question: &q, prior: &[], struggle: "is this right?", artifact: Some(&step), context: "" })
      .await;

    assert_eq!(hint.text, right);
    let check = hint.step_check.unwrap();
    assert!(check.consistent);
    assert_eq!(check.oracle_query, None);
    assert_eq!(*oracle.queries.lock().unwrap(), vec!["D[Sin[u], u] == -Cos[u]".to_string()]);
    let requests = model.requests();
    assert_eq!(requests.len(), 4);
    assert!(requests[1].user.contains("Student's current step: f'(x) = -sin(x^2) * 2x"));
    assert!(requests[2].user.contains("does not fit the student's current step"));
    assert!(requests[2].user.contains("oracle evaluated the claim to False"));
  }

  #[tokio::test]
  async fn non_math_steps_skip_the_oracle() {
    let model = Arc::new(ScriptedModel::new());
    model
      .push(HINT, hint_json(FIRST, None))
      .push(STEP_CHECK, step_check_json(true, Some("Simplify[x]"), "Fine."));
    let oracle = Arc::new(FixedOracle::always("False"));
    let q = question();
    let step = Artifact::Text("I think it is a composition".into());
    let hint = engine_with(model, Arc::new(Unconfigured("embedding model")), oracle.clone())
      .produce(&HintRequest { question: &q, prior: &[], struggle: "", artifact: Some(&step), context: "" })
      .await;
    assert_eq!(hint.step_check.map(|c| c.consistent), Some(true));
    assert!(oracle.queries.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn repeated_scaffold_template_is_a_forced_duplicate() {
    let model = Arc::new(ScriptedModel::new());
    let q = question();
    let scaffold = template(HintTier::Scaffold, &q).text;
    let prior = [
      prior(FIRST, HintTier::Conceptual),
      prior("Identify the inner function u = x^2 and differentiate it.", HintTier::Procedural),
      prior(&scaffold, HintTier::Scaffold),
    ];
    let hint = engine(model)
      .produce(&HintRequest { question: &q, prior: &prior, struggle: "", artifact: None, context: "" })
      .await;
    assert_eq!(hint.tier, HintTier::Scaffold);
    assert_eq!(hint.text, scaffold);
    assert!(hint.forced_duplicate);
    assert_eq!(hint.flags, vec![Degradation::ForcedDuplicateHint]);
  }

  #[tokio::test]
  async fn tiers_follow_request_order_for_random_streams() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let questions: Vec<Question> = (0..4)
      .map(|i| Question { id: format!("q{i}"), ..question() })
      .collect();
    let hint_engine = engine(Arc::new(ScriptedModel::new()));
    let mut history: HashMap<String, Vec<Hint>> = HashMap::new();

    for _ in 0..40 {
      let q = &questions[rng.gen_range(0..questions.len())];
      let prior = history.get(&q.id).cloned().unwrap_or_default();
      let hint = hint_engine
        .produce(&HintRequest { question: q, prior: &prior, struggle: "", artifact: None, context: "" })
        .await;
      let expected = (prior.len() + 1).min(3) as u8;
      assert_eq!(hint.tier.number(), expected, "hint {} for {}", prior.len() + 1, q.id);
      if let Some(last) = prior.last() {
        assert!(hint.tier >= last.tier);
      }
      history.entry(q.id.clone()).or_default().push(hint);
    }
    for hints in history.values() {
      let tiers: Vec<u8> = hints.iter().map(|h| h.tier.number()).collect();
      let expected: Vec<u8> = (1..=hints.len()).map(|n| n.min(3) as u8).collect();
      assert_eq!(tiers, expected);
      assert!(hints.iter().skip(3).all(|h| h.forced_duplicate));
    }
  }
}
