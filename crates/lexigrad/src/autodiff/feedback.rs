//! Textual feedback contributions.
//!
//! A [`Feedback`] is the textual analogue of a gradient. Variables keep every
//! contribution they receive; merging several contributions into one is left to
//! whoever consumes them (an operation's backward step or an optimizer), using
//! the helpers in this module or their own policy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One feedback contribution received during a backward pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Feedback {
    content: String,
    role: String,
}

impl Feedback {
    /// Create a contribution with explicit content and role.
    pub fn new(content: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role: role.into(),
        }
    }

    /// The feedback text.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// What this feedback is about, e.g. "feedback to system prompt".
    pub fn role(&self) -> &str {
        &self.role
    }
}

impl From<&str> for Feedback {
    fn from(content: &str) -> Self {
        Self::new(content, "feedback")
    }
}

impl From<String> for Feedback {
    fn from(content: String) -> Self {
        Self::new(content, "feedback")
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

/// Join several contributions into a single one.
///
/// The role of the first contribution is kept. Returns `None` for an empty
/// slice.
pub fn concat(items: &[Feedback], separator: &str) -> Option<Feedback> {
    let first = items.first()?;
    let content = items
        .iter()
        .map(Feedback::content)
        .collect::<Vec<_>>()
        .join(separator);
    Some(Feedback::new(content, first.role.clone()))
}

/// The most recent contribution, if any.
pub fn latest(items: &[Feedback]) -> Option<&Feedback> {
    items.last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_from_str_uses_default_role() {
        let fb = Feedback::from("too long");
        assert_eq!(fb.content(), "too long");
        assert_eq!(fb.role(), "feedback");
        assert_eq!(fb.to_string(), "too long");
    }

    #[test]
    fn test_concat_keeps_order_and_first_role() {
        let items = vec![
            Feedback::new("be shorter", "feedback to answer"),
            Feedback::new("cite a source", "feedback to answer (path 2)"),
        ];

        let merged = concat(&items, "\n").unwrap();
        assert_eq!(merged.content(), "be shorter\ncite a source");
        assert_eq!(merged.role(), "feedback to answer");
    }

    #[test]
    fn test_concat_empty() {
        assert!(concat(&[], " ").is_none());
    }

    #[test]
    fn test_latest() {
        let items = vec![Feedback::from("a"), Feedback::from("b")];
        assert_eq!(latest(&items).unwrap().content(), "b");
        assert!(latest(&[]).is_none());
    }
}
