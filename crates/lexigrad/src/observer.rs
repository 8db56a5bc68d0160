//! Notification hooks for graph construction and traversal.
//!
//! An observer is passed explicitly to a [`GraphBuilder`](crate::autodiff::GraphBuilder)
//! or a [`BackwardEngine`](crate::autodiff::BackwardEngine). Nothing in the
//! engine depends on an observer being present.

use crate::autodiff::{Feedback, Function, FunctionId, Variable, VariableId};
use crate::error::{GraphError, Result};
use serde::Serialize;
use std::cell::RefCell;

/// Which pass executed a Function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Forward,
    Backward,
}

/// Receives graph events. Every method defaults to a no-op.
pub trait GraphObserver {
    /// A Variable was created through a graph builder.
    fn variable_created(&self, _variable: &Variable) {}

    /// A Function ran its forward or backward step.
    fn function_executed(&self, _function: &Function, _phase: Phase) {}

    /// A feedback contribution was appended to a Variable.
    fn feedback_accumulated(&self, _variable: &Variable, _feedback: &Feedback) {}
}

/// Serializable record of one notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GraphEvent {
    VariableCreated {
        variable: VariableId,
        role: String,
        requires_feedback: bool,
        creator: Option<FunctionId>,
    },
    FunctionExecuted {
        function: FunctionId,
        name: String,
        phase: Phase,
    },
    FeedbackAccumulated {
        variable: VariableId,
        content: String,
        role: String,
    },
}

/// Observer that keeps every event in memory, e.g. for replay by a tracking
/// client.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: RefCell<Vec<GraphEvent>>,
}

impl EventRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the recorded events, oldest first.
    pub fn events(&self) -> Vec<GraphEvent> {
        self.events.borrow().clone()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    /// Whether nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    /// Forget every recorded event.
    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    /// Render the events as newline-delimited JSON.
    pub fn to_json_lines(&self) -> Result<String> {
        let mut out = String::new();
        for event in self.events.borrow().iter() {
            let line = serde_json::to_string(event)
                .map_err(|e| GraphError::InvalidInput(format!("cannot serialize event: {e}")))?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    fn push(&self, event: GraphEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl GraphObserver for EventRecorder {
    fn variable_created(&self, variable: &Variable) {
        self.push(GraphEvent::VariableCreated {
            variable: variable.id(),
            role: variable.role(),
            requires_feedback: variable.requires_feedback(),
            creator: variable.creator().map(|f| f.id()),
        });
    }

    fn function_executed(&self, function: &Function, phase: Phase) {
        self.push(GraphEvent::FunctionExecuted {
            function: function.id(),
            name: function.name().to_string(),
            phase,
        });
    }

    fn feedback_accumulated(&self, variable: &Variable, feedback: &Feedback) {
        self.push(GraphEvent::FeedbackAccumulated {
            variable: variable.id(),
            content: feedback.content().to_string(),
            role: feedback.role().to_string(),
        });
    }
}
