//! Error types for lexigrad.

use crate::autodiff::{FunctionId, VariableId};
use std::fmt;
use thiserror::Error;

/// Label identifying a Variable in error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableLabel {
    pub id: VariableId,
    pub role: String,
}

impl fmt::Display for VariableLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.id, self.role)
    }
}

/// Why a forward call was refused during graph construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureViolation {
    /// An output is one of the Function's own inputs.
    SelfReference,
    /// An output is an ancestor of one of the inputs.
    Cycle,
    /// An output was already produced by another Function.
    CreatorAlreadySet,
    /// The same Variable appears twice in the output list.
    DuplicateOutput,
}

impl fmt::Display for StructureViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::SelfReference => "output is one of its own inputs",
            Self::Cycle => "output is an ancestor of an input",
            Self::CreatorAlreadySet => "output already has a creator",
            Self::DuplicateOutput => "output listed more than once",
        };
        f.write_str(text)
    }
}

/// Failure reported by a concrete operation.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The operation failed with a message.
    #[error("{0}")]
    Failed(String),

    /// The operation failed because of an external collaborator.
    #[error(transparent)]
    External(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<GraphError> for OperationError {
    fn from(err: GraphError) -> Self {
        Self::External(Box::new(err))
    }
}

impl OperationError {
    /// Shorthand for [`OperationError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors that can occur while building or traversing a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Self-referential or cyclic construction attempt.
    #[error("graph structure error in {name} ({function}): {kind}, offending variable {variable}")]
    GraphStructure {
        function: FunctionId,
        name: String,
        variable: VariableLabel,
        kind: StructureViolation,
    },

    /// An operation's forward step failed. Nothing was wired.
    #[error("forward of {kind} failed: {source}")]
    ForwardComputation {
        kind: String,
        #[source]
        source: OperationError,
    },

    /// A Function's backward step failed.
    #[error("backward of {name} ({function}) failed while processing [{}]: {source}", join_labels(.outputs))]
    BackwardComputation {
        function: FunctionId,
        name: String,
        outputs: Vec<VariableLabel>,
        #[source]
        source: OperationError,
    },

    /// A Function was scheduled before all of its consumers ran.
    #[error("{name} ({function}) scheduled with {pending} consumer(s) still pending")]
    IncompleteFeedback {
        function: FunctionId,
        name: String,
        pending: usize,
    },

    /// An operation broke the forward/backward contract.
    #[error("{name} ({function}) violated the operation contract: {message}")]
    ContractViolation {
        function: FunctionId,
        name: String,
        message: String,
    },

    /// Traversal reached a Function whose wiring was already released.
    #[error(
        "{name} ({function}) was released after a previous backward pass; \
         pass retain_graph to traverse a graph more than once"
    )]
    GraphReleased { function: FunctionId, name: String },

    /// Backward was started from a Variable that does not require feedback.
    #[error("variable {variable} does not require feedback")]
    NoFeedbackRequired { variable: VariableLabel },

    /// Invalid argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
}

fn join_labels(labels: &[VariableLabel]) -> String {
    labels
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, GraphError>;
