//! Text similarity used for hint non-repetition and the in-process material index.
//!
//! `cosine_similarity` compares embedding vectors; hints are scored that way whenever an
//! embedding model answers. `similarity` is the lexical fallback: cosine over weighted
//! unigram + bigram term frequencies of normalized words. Bigrams catch reworded-but-same
//! hints ("isolate the x term" vs "try isolating the x-term"). Stopwords are dropped first.

use std::collections::HashMap;

const STOPWORDS: &[&str] = &[
  "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "for", "from", "how", "i", "if",
  "in", "is", "it", "its", "of", "on", "or", "so", "that", "the", "then", "this", "to", "try",
  "we", "what", "when", "which", "with", "you", "your",
];

const BIGRAM_WEIGHT: f32 = 0.5;

/// Cosine of two embedding vectors; 0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
  if a.len() != b.len() {
    return 0.0;
  }
  let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
  let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
  let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
  if na == 0.0 || nb == 0.0 {
    return 0.0;
  }
  dot / (na * nb)
}

/// Similarity in [0, 1]; 1 means same content words in the same order.
pub fn similarity(a: &str, b: &str) -> f32 {
  let va = term_vector(a);
  let vb = term_vector(b);
  if va.is_empty() || vb.is_empty() {
    return if va.is_empty() && vb.is_empty() { 1.0 } else { 0.0 };
  }
  let dot: f32 = va.iter().filter_map(|(k, x)| vb.get(k).map(|y| x * y)).sum();
  let na: f32 = va.values().map(|x| x * x).sum::<f32>().sqrt();
  let nb: f32 = vb.values().map(|x| x * x).sum::<f32>().sqrt();
  (dot / (na * nb)).clamp(0.0, 1.0)
}

/// Highest similarity of `candidate` against any of `others` (0 when there are none).
pub fn max_similarity<'a>(candidate: &str, others: impl IntoIterator<Item = &'a str>) -> f32 {
  others.into_iter().map(|o| similarity(candidate, o)).fold(0.0, f32::max)
}

fn term_vector(text: &str) -> HashMap<String, f32> {
  let words: Vec<String> = text
    .split(|c: char| !c.is_alphanumeric())
    .filter(|w| !w.is_empty())
    .map(|w| stem(&w.to_lowercase()))
    .filter(|w| !STOPWORDS.contains(&w.as_str()))
    .collect();

  let mut v: HashMap<String, f32> = HashMap::new();
  for w in &words {
    *v.entry(w.clone()).or_default() += 1.0;
  }
  for pair in words.windows(2) {
    *v.entry(format!("{} {}", pair[0], pair[1])).or_default() += BIGRAM_WEIGHT;
  }
  v
}

/// Crude suffix folding so "isolating"/"isolate"/"isolated" collide.
fn stem(w: &str) -> String {
  for suffix in ["ing", "ed", "es", "e", "s"] {
    if w.len() > suffix.len() + 3 && w.ends_with(suffix) {
      return w[..w.len() - suffix.len()].to_string();
    }
  }
  w.to_string()
}
