//! Multi-output split.

use super::{combined_feedback, join_contents};
use crate::autodiff::feedback::Feedback;
use crate::autodiff::function::{BackwardContext, Operation};
use crate::autodiff::variable::Variable;
use crate::error::OperationError;

/// Splits a text Variable into one output per part.
///
/// With no separator the text is split on whitespace. `max_splits` limits the
/// number of splits, leaving the remainder in the last part.
#[derive(Debug, Clone, Default)]
pub struct Split {
    separator: Option<String>,
    max_splits: Option<usize>,
}

impl Split {
    /// Split on runs of whitespace.
    pub fn whitespace() -> Self {
        Self::default()
    }

    /// Split on `separator`.
    pub fn on(separator: impl Into<String>) -> Self {
        Self {
            separator: Some(separator.into()),
            max_splits: None,
        }
    }

    /// Split at most `max_splits` times.
    pub fn with_max_splits(mut self, max_splits: usize) -> Self {
        self.max_splits = Some(max_splits);
        self
    }

    fn parts(&self, text: &str) -> Vec<String> {
        let limit = self.max_splits.map_or(usize::MAX, |n| n.saturating_add(1));
        match &self.separator {
            Some(sep) => text.splitn(limit, sep.as_str()).map(str::to_string).collect(),
            None => {
                let mut parts = Vec::new();
                let mut rest = text.trim_start();
                while !rest.is_empty() {
                    if parts.len() + 1 == limit {
                        parts.push(rest.trim_end().to_string());
                        break;
                    }
                    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                    parts.push(rest[..end].to_string());
                    rest = rest[end..].trim_start();
                }
                parts
            }
        }
    }
}

impl Operation for Split {
    fn kind(&self) -> &str {
        "Split"
    }

    fn forward(&mut self, inputs: &[Variable]) -> Result<Vec<Variable>, OperationError> {
        let [input] = inputs else {
            return Err(OperationError::failed(format!(
                "Split expects 1 input, got {}",
                inputs.len()
            )));
        };
        if let Some("") = self.separator.as_deref() {
            return Err(OperationError::failed("Split separator must not be empty"));
        }
        let data = input.data();
        let text = data
            .as_text()
            .ok_or_else(|| OperationError::failed(format!("Split expects text data, got {data}")))?;
        let role = input.role();
        Ok(self
            .parts(text)
            .into_iter()
            .enumerate()
            .map(|(i, part)| Variable::text(part, format!("split part {i} of {role}"), true))
            .collect())
    }

    fn backward(&self, ctx: &BackwardContext<'_>) -> Result<Vec<Option<Feedback>>, OperationError> {
        if !ctx.needs_input_feedback(0) {
            return Ok(vec![None]);
        }
        let role = ctx.inputs()[0].role();
        // Outputs not reached in this pass have nothing to report
        let per_part = (0..ctx.outputs().len())
            .filter(|&i| !ctx.output_feedback(i).is_empty())
            .map(|i| format!("[part {i}] {}", join_contents(ctx.output_feedback(i))))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(vec![Some(combined_feedback(&role, &per_part))])
    }
}
