use std::time::Duration;

use shared::domain::{Position, Routine, DEFAULT_STEP_DELAY_MS};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("sequence has no steps")]
    Empty,
    #[error("sequence name must not be empty")]
    EmptyName,
}

/// What the player runs: an ordered list of positions and the pause after
/// each one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRun {
    pub name: String,
    pub steps: Vec<Position>,
    pub step_delay: Duration,
}

impl SequenceRun {
    pub fn new(name: impl Into<String>, steps: Vec<Position>, step_delay: Duration) -> Self {
        Self {
            name: name.into(),
            steps,
            step_delay,
        }
    }
}

impl From<&Routine> for SequenceRun {
    fn from(routine: &Routine) -> Self {
        Self::new(routine.name.clone(), routine.steps.clone(), routine.step_delay())
    }
}

/// Editable sequence of steps that can be played directly or saved as a
/// routine. Steps are copies, so later edits to a library position do not
/// reach a sequence already built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceBuilder {
    steps: Vec<Position>,
    step_delay_ms: u64,
}

impl Default for SequenceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceBuilder {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            step_delay_ms: DEFAULT_STEP_DELAY_MS,
        }
    }

    pub fn from_routine(routine: &Routine) -> Self {
        let mut builder = Self::new();
        builder.load_routine(routine);
        builder
    }

    pub fn push(&mut self, position: Position) {
        self.steps.push(position);
    }

    pub fn remove(&mut self, index: usize) -> Option<Position> {
        (index < self.steps.len()).then(|| self.steps.remove(index))
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Replaces the current steps and delay with those of `routine`.
    pub fn load_routine(&mut self, routine: &Routine) {
        self.steps = routine.steps.clone();
        self.step_delay_ms = routine.step_delay_ms;
    }

    pub fn steps(&self) -> &[Position] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_delay_ms(&self) -> u64 {
        self.step_delay_ms
    }

    pub fn set_step_delay_ms(&mut self, step_delay_ms: u64) {
        self.step_delay_ms = step_delay_ms;
    }

    /// Parses operator input for the step delay; anything that is not a
    /// whole number of milliseconds falls back to the default.
    pub fn set_step_delay_text(&mut self, raw: &str) -> u64 {
        self.step_delay_ms = raw.trim().parse().unwrap_or(DEFAULT_STEP_DELAY_MS);
        self.step_delay_ms
    }

    pub fn to_routine(&self, name: &str) -> Result<Routine, SequenceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SequenceError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(SequenceError::Empty);
        }
        Ok(Routine::new(name, self.steps.clone(), self.step_delay_ms))
    }

    pub fn to_run(&self, name: impl Into<String>) -> SequenceRun {
        SequenceRun::new(
            name,
            self.steps.clone(),
            Duration::from_millis(self.step_delay_ms),
        )
    }
}
