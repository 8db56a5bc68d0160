//! Reverse-mode differentiation over textual computation graphs.
//!
//! Variables carry text (or other [`VariableData`]) together with a role that
//! explains what they are. Applying an [`Operation`] through a
//! [`GraphBuilder`] produces output Variables wired to a [`Function`] that
//! remembers the inputs. Calling [`Variable::backward`] propagates textual
//! [`Feedback`] from an output back to every Variable that contributed to it.
//!
//! # Architecture
//!
//! ```text
//! Variable ──creator──► Function ──inputs──► Variable ──creator──► ...
//!    ▲                     │
//!    └────weak outputs─────┘
//!
//! BackwardEngine
//!   discover   BFS over creators into a petgraph DiGraph
//!   schedule   Kahn's algorithm, ties broken by discovery order
//!   execute    Operation::backward once per Function, per-run feedback map
//!   release    drop input references unless retain_graph
//! ```
//!
//! # Example
//!
//! ```ignore
//! use lexigrad::autodiff::{GraphBuilder, Variable, ops::Add};
//!
//! let builder = GraphBuilder::new();
//! let prompt = Variable::text("Answer briefly.", "system prompt", true);
//! let question = Variable::text(" What is 2+2?", "question", false);
//!
//! let full = builder.apply_one(Add, &[prompt.clone(), question])?;
//! full.backward("the answer should be a single digit")?;
//!
//! for feedback in prompt.feedback() {
//!     println!("{}: {}", feedback.role(), feedback.content());
//! }
//! ```
//!
//! # Design Notes
//!
//! - Single-threaded: nodes are `Rc<RefCell<_>>`, ids come from thread-local
//!   counters
//! - Outputs own their creator, a Function owns its inputs and only weakly
//!   refers to its outputs, so graphs never form `Rc` cycles
//! - Variables are append-only feedback buffers; the engine never merges
//!   contributions

mod backward;
pub mod feedback;
mod function;
mod graph;
mod lifecycle;
pub mod ops;
mod variable;

pub use backward::{BackwardEngine, BackwardOptions, BackwardReport, FailurePolicy, ScheduledFunction};
pub use feedback::Feedback;
pub use function::{BackwardContext, Function, FunctionId, NextFunction, Operation};
pub use graph::GraphBuilder;
pub use lifecycle::{GraphStats, ancestry, clear_graph_feedback, graph_stats, release_graph};
pub use variable::{Variable, VariableData, VariableId};
