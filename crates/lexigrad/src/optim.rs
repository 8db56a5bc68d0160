//! Optimizer contract.
//!
//! An optimizer owns a set of parameter Variables: leaves that require
//! feedback. After a backward pass it reads the feedback accumulated on each
//! parameter and writes back revised data. The update rule itself, typically a
//! call into a language model, is left to implementations.

use crate::autodiff::{Feedback, Variable, VariableData, VariableId};
use crate::error::{GraphError, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

/// Revises parameter Variables from their accumulated feedback.
pub trait Optimizer {
    /// Parameters updated by [`step`](Optimizer::step).
    fn parameters(&self) -> &[Variable];

    /// Apply one update to every parameter.
    fn step(&mut self) -> Result<()>;

    /// Clear the feedback of every parameter before the next pass.
    fn zero_feedback(&self) {
        for parameter in self.parameters() {
            parameter.clear_feedback();
        }
    }
}

/// Check that `parameters` can be optimized.
///
/// Every parameter must be a leaf that requires feedback, and appear once.
pub fn check_parameters(parameters: &[Variable]) -> Result<()> {
    let mut seen = HashSet::new();
    for parameter in parameters {
        if !parameter.is_leaf() {
            return Err(GraphError::InvalidInput(format!(
                "parameter {} is not a leaf",
                parameter.id()
            )));
        }
        if !parameter.requires_feedback() {
            return Err(GraphError::NoFeedbackRequired {
                variable: parameter.label(),
            });
        }
        if !seen.insert(parameter.id()) {
            return Err(GraphError::InvalidInput(format!(
                "parameter {} listed more than once",
                parameter.id()
            )));
        }
    }
    Ok(())
}

/// A parameter's value and feedback at one optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MomentumEntry {
    pub data: VariableData,
    pub feedback: Vec<Feedback>,
}

/// Sliding window of past values and feedback per parameter.
#[derive(Debug, Clone)]
pub struct FeedbackMomentum {
    window: usize,
    history: HashMap<VariableId, VecDeque<MomentumEntry>>,
}

impl FeedbackMomentum {
    /// Keep the last `window` entries per parameter.
    ///
    /// # Errors
    /// Returns [`GraphError::Config`] if `window` is zero.
    pub fn new(window: usize) -> Result<Self> {
        if window == 0 {
            return Err(GraphError::Config("momentum window must be at least 1".into()));
        }
        Ok(Self {
            window,
            history: HashMap::new(),
        })
    }

    /// Maximum number of entries kept per parameter.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Snapshot the current data and feedback of each parameter.
    pub fn record(&mut self, parameters: &[Variable]) {
        for parameter in parameters {
            let entries = self.history.entry(parameter.id()).or_default();
            if entries.len() == self.window {
                entries.pop_front();
            }
            entries.push_back(MomentumEntry {
                data: parameter.data(),
                feedback: parameter.feedback(),
            });
        }
    }

    /// Entries for `id`, oldest first.
    pub fn history(&self, id: VariableId) -> Vec<MomentumEntry> {
        self.history
            .get(&id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the history of every parameter.
    pub fn clear(&mut self) {
        self.history.clear();
    }
}
