//! Answer normalization and equivalence checking.
//!
//! Policy, in order:
//!   1. textual: normalized forms are identical (math delimiters, LaTeX spellings, spacing,
//!      case and a leading `x =` are normalized away);
//!   2. symbolic: both sides parse as expressions and agree at fixed sample points of
//!      their free variables, within the relative tolerance;
//!   3. numeric: a constant value read from the other side (e.g. an oracle's `≈ 1.71828`)
//!      matches within the relative tolerance (absolute below magnitude 1).
//! Comma-separated answers (roots, tuples) are compared element-wise, order-insensitive.
//!
//! `matches_oracle` additionally accepts an oracle decimal rounded to its printed precision
//! (half a unit in the last place), but only when it carries at least `MIN_PRINTED_DIGITS`
//! significant digits. Student answers never get that allowance.
//!
//! Inputs longer than `MAX_COMPARABLE_CHARS` are compared textually only, and expressions or
//! LaTeX groups nested deeper than `MAX_NESTING` do not parse.

use std::collections::{BTreeSet, HashMap};

const SAMPLE_POINTS: &[f64] = &[0.37, 1.3, 2.71, -0.83, 3.14, 0.61];
const MIN_SAMPLES: usize = 3;
const PROSE_WORD_LIMIT: usize = 4;
const MAX_COMPARABLE_CHARS: usize = 2000;
const MAX_NESTING: usize = 64;
const MIN_PRINTED_DIGITS: usize = 4;
const FUNCTIONS: &[&str] = &["sqrt", "asin", "acos", "atan", "sinh", "cosh", "tanh", "sin", "cos", "tan", "exp", "abs", "ln", "log"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Equivalence {
  Textual,
  Symbolic,
  Numeric,
}

/// Normalize an answer into its comparable form.
pub fn normalize_answer(raw: &str) -> String {
  let mut s = raw.trim().to_string();
  for delim in ["$$", "$", "\\(", "\\)", "\\[", "\\]"] {
    s = s.replace(delim, "");
  }
  let s = s
    .replace('π', "pi")
    .replace(['·', '×', '⋅'], "*")
    .replace('÷', "/")
    .replace(['−', '–'], "-")
    .replace('√', "sqrt");
  let s = expand_latex(&s, 0);
  let s: String = s.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
  let s = s.trim_end_matches('.').to_string();
  strip_assignment(&s).to_string()
}

/// Validate that a model-supplied canonical answer is in a comparable form.
/// Returns the normalized answer or a description of the defect.
pub fn check_canonical(raw: &str, max_chars: usize) -> Result<String, String> {
  let norm = normalize_answer(raw);
  if norm.is_empty() {
    return Err("the canonical answer is empty; give the final value or expression".into());
  }
  if !balanced(&norm) {
    return Err(format!("the canonical answer `{}` has unbalanced brackets", raw.trim()));
  }
  if norm.chars().count() > max_chars {
    return Err(format!(
      "the canonical answer is {} characters long; give only the final expression (at most {max_chars})",
      norm.chars().count()
    ));
  }
  let prose_words = raw
    .split(|c: char| !c.is_alphabetic())
    .filter(|w| w.len() >= 4 && !FUNCTIONS.contains(&w.to_lowercase().as_str()) && !w.starts_with("frac"))
    .count();
  if prose_words > PROSE_WORD_LIMIT {
    return Err("the canonical answer reads like an explanation; put reasoning in `explanation` and only the final result in `answer`".into());
  }
  Ok(norm)
}

/// Compare two answers; `None` means not equivalent under the policy above.
pub fn equivalent(expected: &str, actual: &str, rel_tol: f64) -> Option<Equivalence> {
  compare(expected, actual, rel_tol, false)
}

/// Compare a canonical answer with oracle output, which may print rounded decimals.
pub fn matches_oracle(canonical: &str, oracle_output: &str, rel_tol: f64) -> Option<Equivalence> {
  compare(canonical, oracle_output, rel_tol, true)
}

fn compare(expected: &str, actual: &str, rel_tol: f64, rounded: bool) -> Option<Equivalence> {
  if expected.len() > MAX_COMPARABLE_CHARS || actual.len() > MAX_COMPARABLE_CHARS {
    let (e, a) = (expected.trim(), actual.trim());
    return (!e.is_empty() && e == a).then_some(Equivalence::Textual);
  }
  let ne = normalize_answer(expected);
  let na = normalize_answer(actual);
  if ne.is_empty() || na.is_empty() {
    return None;
  }
  if ne == na {
    return Some(Equivalence::Textual);
  }

  let le = split_top_level(&ne);
  let la = split_top_level(&na);
  if le.len() > 1 || la.len() > 1 {
    return compare_lists(&le, &la, rel_tol, rounded);
  }

  if let (Some(e), Some(a)) = (Expr::parse(&ne), Expr::parse(&na)) {
    if let Some(kind) = compare_exprs(&e, &a, rel_tol) {
      return Some(kind);
    }
  }

  numeric_fallback(&ne, actual, rel_tol, rounded)
}

fn compare_lists(expected: &[&str], actual: &[&str], rel_tol: f64, rounded: bool) -> Option<Equivalence> {
  if expected.len() != actual.len() {
    return None;
  }
  let mut used = vec![false; actual.len()];
  let mut weakest = Equivalence::Textual;
  for e in expected {
    let e = strip_assignment(e);
    let hit = actual.iter().enumerate().find_map(|(i, a)| {
      if used[i] {
        return None;
      }
      compare(e, strip_assignment(a), rel_tol, rounded).map(|k| (i, k))
    });
    let (i, kind) = hit?;
    used[i] = true;
    if kind != Equivalence::Textual {
      weakest = kind;
    }
  }
  Some(weakest)
}

fn compare_exprs(e: &Expr, a: &Expr, rel_tol: f64) -> Option<Equivalence> {
  let mut vars = e.free_vars();
  vars.extend(a.free_vars());
  if vars.is_empty() {
    let (x, y) = (e.eval(&HashMap::new()), a.eval(&HashMap::new()));
    return close(x, y, rel_tol, 0.0).then_some(Equivalence::Numeric);
  }

  let mut compared = 0;
  for (round, _) in SAMPLE_POINTS.iter().enumerate() {
    let env: HashMap<char, f64> = vars
      .iter()
      .enumerate()
      .map(|(k, v)| (*v, SAMPLE_POINTS[(round + k) % SAMPLE_POINTS.len()]))
      .collect();
    let (x, y) = (e.eval(&env), a.eval(&env));
    if !x.is_finite() || !y.is_finite() {
      continue;
    }
    if !close(x, y, rel_tol, 0.0) {
      return None;
    }
    compared += 1;
  }
  (compared >= MIN_SAMPLES).then_some(Equivalence::Symbolic)
}

/// Read constant values out of free-form text (oracle output) and compare them.
fn numeric_fallback(expected_norm: &str, actual_raw: &str, rel_tol: f64, rounded: bool) -> Option<Equivalence> {
  let expected = Expr::parse(expected_norm)?;
  if !expected.free_vars().is_empty() {
    return None;
  }
  let target = expected.eval(&HashMap::new());
  if !target.is_finite() {
    return None;
  }

  let cleaned = actual_raw.replace("approximately", "=").replace("about", "=");
  for segment in cleaned.split(['=', '≈', '~']) {
    let norm = normalize_answer(segment);
    if norm.is_empty() {
      continue;
    }
    let Some(expr) = Expr::parse(&norm) else { continue };
    if !expr.free_vars().is_empty() {
      continue;
    }
    let value = expr.eval(&HashMap::new());
    let printed = if rounded { printed_precision(&norm) } else { 0.0 };
    if close(target, value, rel_tol, printed) {
      return Some(Equivalence::Numeric);
    }
  }
  None
}

/// Half a unit in the last decimal place of a plain decimal literal with enough
/// significant digits, else 0.
fn printed_precision(norm: &str) -> f64 {
  let digits = norm.trim_start_matches('-');
  if !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
    return 0.0;
  }
  let significant = digits.chars().filter(char::is_ascii_digit).skip_while(|c| *c == '0').count();
  if significant < MIN_PRINTED_DIGITS {
    return 0.0;
  }
  match digits.split_once('.') {
    Some((_, frac)) if !frac.is_empty() => 0.5 * 10f64.powi(-(frac.len() as i32)),
    _ => 0.0,
  }
}

fn close(x: f64, y: f64, rel_tol: f64, abs_floor: f64) -> bool {
  if !x.is_finite() || !y.is_finite() {
    return false;
  }
  let scale = x.abs().max(y.abs()).max(1.0);
  (x - y).abs() <= (rel_tol * scale).max(abs_floor)
}

fn balanced(s: &str) -> bool {
  let mut depth: i32 = 0;
  for c in s.chars() {
    match c {
      '(' | '[' => depth += 1,
      ')' | ']' => {
        depth -= 1;
        if depth < 0 {
          return false;
        }
      }
      _ => {}
    }
  }
  depth == 0
}

fn split_top_level(s: &str) -> Vec<&str> {
  let mut parts = Vec::new();
  let mut depth = 0i32;
  let mut start = 0;
  for (i, c) in s.char_indices() {
    match c {
      '(' | '[' => depth += 1,
      ')' | ']' => depth -= 1,
      ',' | ';' if depth == 0 => {
        parts.push(&s[start..i]);
        start = i + 1;
      }
      _ => {}
    }
  }
  parts.push(&s[start..]);
  parts.into_iter().filter(|p| !p.is_empty()).collect()
}

/// Drop a leading `x=`/`f'(x)=` so `x=4` compares equal to `4`.
fn strip_assignment(s: &str) -> &str {
  let mut pieces = s.splitn(3, '=');
  let (Some(lhs), Some(rhs), None) = (pieces.next(), pieces.next(), pieces.next()) else { return s };
  let simple_lhs = lhs.chars().next().is_some_and(|c| c.is_alphabetic())
    && lhs.chars().all(|c| c.is_alphanumeric() || matches!(c, '\'' | '(' | ')' | '_'));
  if simple_lhs && !rhs.is_empty() { rhs } else { s }
}

/// Rewrite the LaTeX subset models use in answers into plain infix.
/// Groups nested deeper than `MAX_NESTING` are left as written.
fn expand_latex(s: &str, depth: usize) -> String {
  if depth >= MAX_NESTING {
    return s.to_string();
  }
  let chars: Vec<char> = s.chars().collect();
  let mut out = String::with_capacity(s.len());
  let mut i = 0;
  while i < chars.len() {
    match chars[i] {
      '\\' => {
        let name: String = chars[i + 1..].iter().take_while(|c| c.is_ascii_alphabetic()).collect();
        i += 1 + name.len();
        if name.is_empty() {
          // `\,` `\;` `\!` `\ ` spacing, or an escaped symbol.
          if let Some(&c) = chars.get(i) {
            if !matches!(c, ',' | ';' | '!' | ' ' | ':') {
              out.push(c);
            }
            i += 1;
          }
          continue;
        }
        match name.as_str() {
          "frac" | "dfrac" | "tfrac" => {
            let (num, next) = brace_group(&chars, i);
            let (den, next) = brace_group(&chars, next);
            i = next;
            out.push_str(&format!("(({})/({}))", expand_latex(&num, depth + 1), expand_latex(&den, depth + 1)));
          }
          "sqrt" => {
            let (arg, next) = brace_group(&chars, i);
            i = next;
            out.push_str(&format!("sqrt({})", expand_latex(&arg, depth + 1)));
          }
          "text" | "mathrm" | "operatorname" | "mathbf" => {
            let (arg, next) = brace_group(&chars, i);
            i = next;
            out.push_str(&expand_latex(&arg, depth + 1));
          }
          "cdot" | "times" => out.push('*'),
          "div" => out.push('/'),
          "left" | "right" | "displaystyle" | "quad" | "qquad" => {}
          "infty" => out.push_str("inf"),
          other => out.push_str(other),
        }
      }
      '{' => {
        out.push('(');
        i += 1;
      }
      '}' => {
        out.push(')');
        i += 1;
      }
      c => {
        out.push(c);
        i += 1;
      }
    }
  }
  out
}

/// Read `{...}` starting at `i` (skipping spaces). A bare token counts as a group of one char.
fn brace_group(chars: &[char], mut i: usize) -> (String, usize) {
  while chars.get(i).is_some_and(|c| c.is_whitespace()) {
    i += 1;
  }
  match chars.get(i) {
    Some('{') => {
      let mut depth = 0;
      let mut out = String::new();
      for (k, &c) in chars[i..].iter().enumerate() {
        match c {
          '{' => {
            depth += 1;
            if depth == 1 {
              continue;
            }
          }
          '}' => {
            depth -= 1;
            if depth == 0 {
              return (out, i + k + 1);
            }
          }
          _ => {}
        }
        out.push(c);
      }
      (out, chars.len())
    }
    Some(&c) => (c.to_string(), i + 1),
    None => (String::new(), i),
  }
}

// ---------- Expressions ----------

#[derive(Clone, Copy, Debug, PartialEq)]
enum Op {
  Add,
  Sub,
  Mul,
  Div,
  Pow,
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
  Num(f64),
  Var(char),
  Neg(Box<Expr>),
  Bin(Op, Box<Expr>, Box<Expr>),
  Call(&'static str, Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
enum Tok {
  Num(f64),
  Var(char),
  Const(f64),
  Func(&'static str),
  Op(char),
  Open,
  Close,
}

impl Expr {
  /// Parse a normalized answer. `None` when it is not a plain arithmetic expression.
  fn parse(s: &str) -> Option<Expr> {
    let toks = tokenize(s)?;
    let mut p = Parser { toks, pos: 0, depth: 0 };
    let e = p.expr()?;
    (p.pos == p.toks.len()).then_some(e)
  }

  fn free_vars(&self) -> BTreeSet<char> {
    let mut out = BTreeSet::new();
    self.collect_vars(&mut out);
    out
  }

  fn collect_vars(&self, out: &mut BTreeSet<char>) {
    match self {
      Expr::Num(_) => {}
      Expr::Var(v) => {
        out.insert(*v);
      }
      Expr::Neg(e) | Expr::Call(_, e) => e.collect_vars(out),
      Expr::Bin(_, a, b) => {
        a.collect_vars(out);
        b.collect_vars(out);
      }
    }
  }

  fn eval(&self, env: &HashMap<char, f64>) -> f64 {
    match self {
      Expr::Num(n) => *n,
      Expr::Var(v) => env.get(v).copied().unwrap_or(f64::NAN),
      Expr::Neg(e) => -e.eval(env),
      Expr::Bin(op, a, b) => {
        let (x, y) = (a.eval(env), b.eval(env));
        match op {
          Op::Add => x + y,
          Op::Sub => x - y,
          Op::Mul => x * y,
          Op::Div => x / y,
          Op::Pow => x.powf(y),
        }
      }
      Expr::Call(f, e) => {
        let x = e.eval(env);
        match *f {
          "sqrt" => x.sqrt(),
          "sin" => x.sin(),
          "cos" => x.cos(),
          "tan" => x.tan(),
          "asin" => x.asin(),
          "acos" => x.acos(),
          "atan" => x.atan(),
          "sinh" => x.sinh(),
          "cosh" => x.cosh(),
          "tanh" => x.tanh(),
          "exp" => x.exp(),
          "abs" => x.abs(),
          "ln" => x.ln(),
          "log" => x.log10(),
          _ => f64::NAN,
        }
      }
    }
  }
}

fn tokenize(s: &str) -> Option<Vec<Tok>> {
  let chars: Vec<char> = s.chars().collect();
  let mut toks = Vec::new();
  let mut i = 0;
  while i < chars.len() {
    let c = chars[i];
    if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
      let start = i;
      while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
      }
      let lit: String = chars[start..i].iter().collect();
      toks.push(Tok::Num(lit.parse().ok()?));
      continue;
    }
    if c.is_ascii_alphabetic() {
      let rest: String = chars[i..].iter().take_while(|c| c.is_ascii_alphabetic()).collect();
      if let Some(f) = FUNCTIONS.iter().find(|f| rest.starts_with(**f)) {
        toks.push(Tok::Func(*f));
        i += f.len();
      } else if rest.starts_with("pi") {
        toks.push(Tok::Const(std::f64::consts::PI));
        i += 2;
      } else if rest.starts_with("inf") {
        return None;
      } else if c == 'e' {
        toks.push(Tok::Const(std::f64::consts::E));
        i += 1;
      } else {
        toks.push(Tok::Var(c));
        i += 1;
      }
      continue;
    }
    match c {
      '+' | '-' | '*' | '/' | '^' => toks.push(Tok::Op(c)),
      '(' | '[' => toks.push(Tok::Open),
      ')' | ']' => toks.push(Tok::Close),
      _ => return None,
    }
    i += 1;
  }
  Some(toks)
}

struct Parser {
  toks: Vec<Tok>,
  pos: usize,
  depth: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Tok> {
    self.toks.get(self.pos)
  }

  fn eat_op(&mut self, ops: &[char]) -> Option<char> {
    match self.peek() {
      Some(Tok::Op(c)) if ops.contains(c) => {
        let c = *c;
        self.pos += 1;
        Some(c)
      }
      _ => None,
    }
  }

  /// Run one level of recursive descent; fails once nesting exceeds `MAX_NESTING`.
  fn nested(&mut self, rule: impl FnOnce(&mut Self) -> Option<Expr>) -> Option<Expr> {
    if self.depth >= MAX_NESTING {
      return None;
    }
    self.depth += 1;
    let out = rule(self);
    self.depth -= 1;
    out
  }

  fn expr(&mut self) -> Option<Expr> {
    let mut lhs = self.term()?;
    while let Some(op) = self.eat_op(&['+', '-']) {
      let rhs = self.term()?;
      let op = if op == '+' { Op::Add } else { Op::Sub };
      lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
    }
    Some(lhs)
  }

  fn term(&mut self) -> Option<Expr> {
    let mut lhs = self.unary()?;
    loop {
      if let Some(op) = self.eat_op(&['*', '/']) {
        let rhs = self.unary()?;
        let op = if op == '*' { Op::Mul } else { Op::Div };
        lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        continue;
      }
      // Implicit multiplication: `2x`, `3(x+1)`, `(a)(b)`.
      match self.peek() {
        Some(Tok::Num(_) | Tok::Var(_) | Tok::Const(_) | Tok::Func(_) | Tok::Open) => {
          let rhs = self.power()?;
          lhs = Expr::Bin(Op::Mul, Box::new(lhs), Box::new(rhs));
        }
        _ => return Some(lhs),
      }
    }
  }

  fn unary(&mut self) -> Option<Expr> {
    self.nested(|p| match p.eat_op(&['-', '+']) {
      Some('-') => Some(Expr::Neg(Box::new(p.unary()?))),
      Some(_) => p.unary(),
      None => p.power(),
    })
  }

  fn power(&mut self) -> Option<Expr> {
    let base = self.atom()?;
    if self.eat_op(&['^']).is_some() {
      let exp = self.unary()?;
      return Some(Expr::Bin(Op::Pow, Box::new(base), Box::new(exp)));
    }
    Some(base)
  }

  fn atom(&mut self) -> Option<Expr> {
    let tok = self.peek()?.clone();
    self.pos += 1;
    self.nested(|p| match tok {
      Tok::Num(n) | Tok::Const(n) => Some(Expr::Num(n)),
      Tok::Var(v) => Some(Expr::Var(v)),
      Tok::Func(f) => Some(Expr::Call(f, Box::new(p.power()?))),
      Tok::Open => {
        let e = p.expr()?;
        match p.peek() {
          Some(Tok::Close) => {
            p.pos += 1;
            Some(e)
          }
          _ => None,
        }
      }
      Tok::Op(_) | Tok::Close => None,
    })
  }
}
