//! lexigrad - automatic differentiation over textual computation graphs
//!
//! Instead of tensors flowing through arithmetic, Variables carrying text flow
//! through operations (typically calls into a language model). A reverse-mode
//! traversal then propagates textual feedback, the analogue of a gradient,
//! from a final output back to every Variable that contributed to it. An
//! optimizer consumes that feedback to revise its parameters.
//!
//! # Modules
//!
//! ```text
//! autodiff   Variables, Functions, graph building, backward traversal
//! observer   hooks notified of graph events, JSON-lines export
//! optim      optimizer contract and feedback history
//! error      GraphError taxonomy
//! ```
//!
//! # Example
//!
//! ```
//! use lexigrad::autodiff::ops::Add;
//! use lexigrad::{GraphBuilder, Variable};
//!
//! let builder = GraphBuilder::new();
//! let a = Variable::text("Hello", "greeting", true);
//! let b = Variable::text(", world", "addressee", false);
//!
//! let c = builder.apply_one(Add, &[a.clone(), b.clone()]).unwrap();
//! assert_eq!(c.text_content(), "Hello, world");
//! assert_eq!(c.creator().unwrap().name(), "AddBackward0");
//!
//! c.backward("too generic").unwrap();
//! assert_eq!(a.feedback().len(), 1);
//! assert!(b.feedback().is_empty());
//! ```

pub mod autodiff;
pub mod error;
pub mod observer;
pub mod optim;

pub use autodiff::{BackwardEngine, BackwardOptions, Feedback, GraphBuilder, Variable};
pub use error::{GraphError, OperationError, Result};
pub use observer::{EventRecorder, GraphEvent, GraphObserver};
pub use optim::Optimizer;
