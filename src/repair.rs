//! Repair parser for structured model output.
//!
//! Models wrap JSON in markdown fences, stop mid-string, forget closing brackets and
//! write LaTeX with bare backslashes (`\frac`, `\sqrt`) inside JSON strings. Every raw
//! model response goes through `parse_object`/`parse_as` before any field is trusted.
//!
//! Text that already parses (after fence stripping, or as the outermost `{...}`/`[...]`
//! span) is returned untouched. Anything else goes through a single left-to-right scan:
//!   1) strip wrapping code fences and leading prose,
//!   2) track open `{`/`[`/`"` delimiters on a stack,
//!   3) escape backslashes that do not form a JSON escape (math markup),
//!   4) close whatever is still open, innermost first,
//!   5) hand the result to serde_json.
//! A payload that still fails is a `ParseError`; a half-filled object is never returned.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::ParseError;

/// LaTeX commands whose first letter collides with a JSON escape (`\b \f \n \r \t`).
/// A backslash followed by exactly one of these letter runs is math, not an escape.
const LATEX_ESCAPE_COLLISIONS: &[&str] = &[
  "beta", "bar", "binom", "bmod", "begin", "big", "bigg", "bigl", "bigr", "boldsymbol", "boxed",
  "bot", "bullet", "backslash", "bf", "brace", "frac", "forall", "flat", "fbox", "nabla", "neq",
  "ne", "nu", "not", "ni", "neg", "newline", "nolimits", "notin", "nleq", "ngeq", "nmid",
  "right", "rho", "rangle", "rightarrow", "rfloor", "rceil", "rbrace", "rm", "root", "theta",
  "tau", "tan", "tanh", "times", "text", "textbf", "textit", "textrm", "tfrac", "to", "top",
  "triangle", "tilde", "therefore", "tt",
];

const FRAGMENT_CHARS: usize = 48;

/// Parse raw model output into a JSON object, repairing it if needed.
/// A top-level array is accepted when it holds an object (its first one is used).
pub fn parse_object(raw: &str) -> Result<Map<String, Value>, ParseError> {
  let repaired = repair(raw)?;
  let value: Value = serde_json::from_str(&repaired).map_err(|e| malformed(&repaired, &e))?;
  match value {
    Value::Object(map) => Ok(map),
    Value::Array(items) => items
      .into_iter()
      .find_map(|v| match v {
        Value::Object(map) => Some(map),
        _ => None,
      })
      .ok_or_else(|| ParseError::NotAnObject { fragment: fragment_at(&repaired, 0) }),
    _ => Err(ParseError::NotAnObject { fragment: fragment_at(&repaired, 0) }),
  }
}

/// Parse and deserialize into a typed payload. Missing or mistyped fields are parse errors.
pub fn parse_as<T: DeserializeOwned>(raw: &str) -> Result<T, ParseError> {
  let map = parse_object(raw)?;
  let value = Value::Object(map);
  serde_json::from_value(value.clone()).map_err(|e| ParseError::Malformed {
    reason: e.to_string(),
    fragment: fragment_at(&value.to_string(), 0),
  })
}

/// Produce the repaired JSON text. Already-valid JSON is returned as is.
pub fn repair(raw: &str) -> Result<String, ParseError> {
  let body = strip_fences(raw);
  if body.is_empty() {
    return Err(ParseError::Empty);
  }
  if let Some(valid) = already_valid(body) {
    return Ok(valid.to_string());
  }

  let chars: Vec<char> = body.chars().collect();
  let Some(start) = chars.iter().position(|c| *c == '{' || *c == '[') else {
    return Err(ParseError::NoPayload { fragment: fragment_at(body, 0) });
  };

  let mut out = String::with_capacity(body.len() + 8);
  let mut stack: Vec<char> = Vec::new();
  let mut in_string = false;
  let mut i = start;

  while i < chars.len() {
    let ch = chars[i];
    if in_string {
      match ch {
        '\\' => {
          i += push_escape(&chars, i, &mut out);
          continue;
        }
        '"' => {
          in_string = false;
          out.push('"');
        }
        '\n' => out.push_str("\\n"),
        '\t' => out.push_str("\\t"),
        '\r' => {}
        c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
        c => out.push(c),
      }
      i += 1;
      continue;
    }

    match ch {
      '"' => {
        in_string = true;
        out.push('"');
      }
      '{' => {
        stack.push('}');
        out.push('{');
      }
      '[' => {
        stack.push(']');
        out.push('[');
      }
      '}' | ']' => {
        // A misplaced closer closes whatever is innermost.
        if let Some(closer) = stack.pop() {
          push_closer(&mut out, closer);
        }
        if stack.is_empty() {
          break;
        }
      }
      c => out.push(c),
    }
    i += 1;
  }

  if in_string {
    out.push('"');
  }
  while let Some(closer) = stack.pop() {
    push_closer(&mut out, closer);
  }
  Ok(out)
}

/// The body itself, or its outermost bracketed span, when serde_json accepts it verbatim.
fn already_valid(body: &str) -> Option<&str> {
  let parses = |s: &str| serde_json::from_str::<Value>(s).is_ok();
  if parses(body) {
    return Some(body);
  }
  let open = body.find(|c: char| c == '{' || c == '[')?;
  let close = body.rfind(|c: char| c == '}' || c == ']')?;
  let span = body.get(open..=close)?;
  (close > open && parses(span)).then_some(span)
}

/// Remove a wrapping ```lang ... ``` fence; text without fences is only trimmed.
fn strip_fences(text: &str) -> &str {
  let s = text.trim();
  let Some(open) = s.find("```") else { return s };
  let after = &s[open + 3..];
  let tag_len = after
    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
    .unwrap_or(after.len());
  let body = &after[tag_len..];
  match body.find("```") {
    Some(close) => body[..close].trim(),
    None => body.trim(),
  }
}

/// Emit the escape starting at `chars[i] == '\\'`; returns how many chars were consumed.
fn push_escape(chars: &[char], i: usize, out: &mut String) -> usize {
  let Some(&next) = chars.get(i + 1) else {
    out.push_str("\\\\");
    return 1;
  };
  match next {
    '"' | '\\' | '/' => {
      out.push('\\');
      out.push(next);
      2
    }
    'u' if chars.get(i + 2..i + 6).is_some_and(|h| h.iter().all(|c| c.is_ascii_hexdigit())) => {
      out.push_str("\\u");
      2
    }
    'b' | 'f' | 'n' | 'r' | 't' if !is_latex_command(chars, i + 1) => {
      out.push('\\');
      out.push(next);
      2
    }
    _ => {
      // Bare backslash (math markup): escape it, the next char is scanned normally.
      out.push_str("\\\\");
      1
    }
  }
}

fn is_latex_command(chars: &[char], start: usize) -> bool {
  let run: String = chars[start..].iter().take_while(|c| c.is_ascii_alphabetic()).collect();
  LATEX_ESCAPE_COLLISIONS.contains(&run.as_str())
}

fn push_closer(out: &mut String, closer: char) {
  let kept = out.trim_end();
  if kept.ends_with(',') {
    let cut = kept.len() - 1;
    out.truncate(cut);
  }
  out.push(closer);
}

fn malformed(repaired: &str, e: &serde_json::Error) -> ParseError {
  let offset: usize = repaired
    .split_inclusive('\n')
    .take(e.line().saturating_sub(1))
    .map(str::len)
    .sum::<usize>()
    + e.column().saturating_sub(1);
  ParseError::Malformed { reason: e.to_string(), fragment: fragment_at(repaired, offset) }
}

/// A short window of `text` around byte `offset`, for diagnostics.
fn fragment_at(text: &str, offset: usize) -> String {
  let mut start = offset.min(text.len()).saturating_sub(FRAGMENT_CHARS / 2);
  while !text.is_char_boundary(start) {
    start -= 1;
  }
  text[start..].chars().take(FRAGMENT_CHARS).collect()
}
