//! Built-in class profile and course material, merged with classes from the TOML config.

use tracing::{info, warn};

use crate::config::{ClassCfg, MaterialCfg};
use crate::domain::{ClassProfile, TopicNode};
use crate::retrieval::{MaterialChunk, MemoryIndex};

pub const DEMO_CLASS_ID: &str = "demo-math";

fn node(name: &str, children: Vec<TopicNode>) -> TopicNode {
  TopicNode { name: name.into(), children }
}

/// A small algebra/calculus course so the service is usable without any config.
pub fn demo_class() -> ClassCfg {
  ClassCfg {
    id: DEMO_CLASS_ID.into(),
    name: "Mathematics".into(),
    topics: vec![
      node("Algebra", vec![node("Linear equations", vec![]), node("Quadratic equations", vec![])]),
      node("Derivatives", vec![node("Power rule", vec![]), node("Chain rule", vec![])]),
      node("Integrals", vec![node("Definite integrals", vec![])]),
    ],
    style_notes: vec![
      "Prefer exact answers (fractions, radicals) over decimals.".into(),
      "Write all math in LaTeX between $$ delimiters.".into(),
    ],
    textbook: Some("Open course notes".into()),
    sample_problems: vec![
      "Solve $$3x - 7 = 11$$ for $$x$$.".into(),
      "Differentiate $$f(x) = (2x+1)^3$$.".into(),
      "Evaluate $$\\int_0^2 (x^2 + 1)\\,dx$$.".into(),
    ],
    materials: vec![
      MaterialCfg {
        topic: "Linear equations".into(),
        text: "A linear equation ax + b = c is solved by isolating x: subtract b from both sides, then divide by a.".into(),
      },
      MaterialCfg {
        topic: "Quadratic equations".into(),
        text: "The roots of ax^2 + bx + c = 0 are x = (-b ± sqrt(b^2 - 4ac)) / (2a). The discriminant b^2 - 4ac decides how many real roots exist.".into(),
      },
      MaterialCfg {
        topic: "Power rule".into(),
        text: "For any real n, d/dx x^n = n x^(n-1). Constants factor out of derivatives and sums differentiate term by term.".into(),
      },
      MaterialCfg {
        topic: "Chain rule".into(),
        text: "If y = f(g(x)) then dy/dx = f'(g(x)) g'(x). Identify the outer function and the inner function before differentiating.".into(),
      },
      MaterialCfg {
        topic: "Definite integrals".into(),
        text: "By the fundamental theorem of calculus, the integral of f from a to b equals F(b) - F(a) for any antiderivative F of f.".into(),
      },
    ],
  }
}

/// Class profiles plus the material index built from their chunks.
/// Configured classes replace the built-in one when ids collide.
pub fn class_catalog(configured: &[ClassCfg]) -> (Vec<ClassProfile>, MemoryIndex) {
  let mut classes: Vec<ClassCfg> = configured.to_vec();
  if !classes.iter().any(|c| c.id == DEMO_CLASS_ID) {
    classes.push(demo_class());
  }

  let mut index = MemoryIndex::default();
  let mut profiles = Vec::with_capacity(classes.len());
  for cfg in classes {
    if profiles.iter().any(|p: &ClassProfile| p.id == cfg.id) {
      warn!(target: "sophi_backend", class_id = %cfg.id, "Duplicate class id in config; keeping the first");
      continue;
    }
    for (i, m) in cfg.materials.iter().enumerate() {
      if m.text.trim().is_empty() {
        continue;
      }
      let topic = (!m.topic.trim().is_empty()).then(|| m.topic.clone());
      index.insert(&cfg.id, MaterialChunk { id: format!("{}-{i}", cfg.id), topic, text: m.text.clone() });
    }
    info!(target: "sophi_backend", class_id = %cfg.id, materials = cfg.materials.len(), "Class registered");
    profiles.push(ClassProfile {
      id: cfg.id,
      name: cfg.name,
      topics: cfg.topics,
      style_notes: cfg.style_notes,
      textbook: cfg.textbook,
      sample_problems: cfg.sample_problems,
    });
  }
  (profiles, index)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn demo_class_is_always_available() {
    let (profiles, index) = class_catalog(&[]);
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].id, DEMO_CLASS_ID);
    assert!(profiles[0].topic_names().contains(&"Chain rule"));
    assert_eq!(index.len(), 5);
  }

  #[test]
  fn configured_classes_take_precedence() {
    let mut custom = demo_class();
    custom.name = "Remedial maths".into();
    custom.materials.truncate(1);
    let other = ClassCfg { id: "stats".into(), name: "Statistics".into(), ..demo_class() };
    let (profiles, index) = class_catalog(&[custom, other]);
    assert_eq!(profiles.len(), 2);
    assert_eq!(profiles[0].name, "Remedial maths");
    assert_eq!(index.len(), 1 + 5);
  }
}
