//! Reference operations.
//!
//! These are deterministic, local operations: they show how to implement
//! [`Operation`](super::Operation) and serve as building blocks in tests.
//! Operations calling a language model live outside this crate and plug in
//! through the same trait.

mod add;
mod evaluator;
mod split;

pub use add::{Add, Sum};
pub use evaluator::DeterministicEvaluator;
pub use split::Split;

use super::feedback::Feedback;

/// Feedback for an input from everything its Function's outputs received.
pub(crate) fn combined_feedback(role: &str, received: &str) -> Feedback {
    Feedback::new(
        format!("Here is the combined feedback we got for this specific {role} and other variables: {received}"),
        format!("feedback to {role}"),
    )
}

pub(crate) fn join_contents<'a>(feedback: impl IntoIterator<Item = &'a Feedback>) -> String {
    feedback
        .into_iter()
        .map(Feedback::content)
        .collect::<Vec<_>>()
        .join(" ")
}
