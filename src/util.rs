//! Small utility helpers used across modules.

use std::future::Future;
use std::time::Duration;

use crate::error::ServiceError;

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// This is intentionally simple (no nested/conditional logic).
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut cut = max;
  while !s.is_char_boundary(cut) { cut -= 1; }
  format!("{}… ({} bytes total)", &s[..cut], s.len())
}

/// Rough token estimate (~4 chars per token), good enough for budgeting prompts.
pub fn estimate_tokens(s: &str) -> usize {
  (s.chars().count() + 3) / 4
}

/// Cut `s` so that its estimated size fits in `tokens`. Never splits a char.
pub fn truncate_to_tokens(s: &str, tokens: usize) -> &str {
  let max_chars = tokens.saturating_mul(4);
  match s.char_indices().nth(max_chars) {
    Some((idx, _)) => &s[..idx],
    None => s,
  }
}

/// Run an external call under a deadline. Elapsed deadlines become `ServiceError::Timeout`
/// so callers apply their usual retry/fallback policy.
pub async fn with_timeout<T, F>(service: &'static str, limit: Duration, fut: F) -> Result<T, ServiceError>
where
  F: Future<Output = Result<T, ServiceError>>,
{
  match tokio::time::timeout(limit, fut).await {
    Ok(res) => res,
    Err(_) => Err(ServiceError::Timeout { service, after: limit }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn template_replaces_all_keys() {
    let out = fill_template("{a} and {b} and {a}", &[("a", "x"), ("b", "y")]);
    assert_eq!(out, "x and y and x");
  }

  #[test]
  fn truncation_respects_char_boundaries() {
    let s = "ééééé";
    let t = trunc_for_log(s, 3);
    assert!(t.starts_with('é'));
    assert_eq!(truncate_to_tokens("abcdefghij", 1), "abcd");
    assert_eq!(truncate_to_tokens("abc", 10), "abc");
  }

  #[tokio::test]
  async fn elapsed_deadline_is_a_timeout() {
    let res: Result<(), ServiceError> = with_timeout("model", Duration::from_millis(5), async {
      tokio::time::sleep(Duration::from_millis(200)).await;
      Ok(())
    })
    .await;
    assert!(matches!(res, Err(ServiceError::Timeout { service: "model", .. })));
  }
}
