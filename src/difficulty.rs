//! Adaptive difficulty: a small state machine over (d, c, w).
//!
//! correct   => c += 1, w = 0; at `correct_threshold`, d += step_up and c = 0
//! incorrect => w += 1, c = 0; at `incorrect_threshold`, d -= step_down and w = 0
//! d is clamped to [0, 1] after every change. Manual overrides replace d and reset both counters.

use tracing::debug;

use crate::config::DifficultyCfg;
use crate::domain::{clamp_unit, DifficultyState};

#[derive(Clone, Debug)]
pub struct DifficultyController {
  cfg: DifficultyCfg,
}

impl DifficultyController {
  pub fn new(cfg: DifficultyCfg) -> Self {
    Self { cfg }
  }

  pub fn initial(&self) -> DifficultyState {
    DifficultyState::new(self.cfg.initial)
  }

  /// Next state after a graded attempt. With adaptive mode off the state is returned unchanged.
  pub fn after_attempt(&self, state: DifficultyState, correct: bool, adaptive: bool) -> DifficultyState {
    if !adaptive {
      return state;
    }
    let mut next = state;
    if correct {
      next.c += 1;
      next.w = 0;
      if next.c >= self.cfg.correct_threshold.max(1) {
        next.d = clamp_unit(next.d + self.cfg.step_up);
        next.c = 0;
      }
    } else {
      next.w += 1;
      next.c = 0;
      if next.w >= self.cfg.incorrect_threshold.max(1) {
        next.d = clamp_unit(next.d - self.cfg.step_down);
        next.w = 0;
      }
    }
    if next.d != state.d {
      debug!(target: "session", from = state.d, to = next.d, correct, "Difficulty adjusted");
    }
    next
  }

  /// Manual override, applied regardless of adaptive mode.
  pub fn set(&self, d: f64) -> DifficultyState {
    DifficultyState::new(d)
  }
}
