//! Concatenation operations.

use super::{combined_feedback, join_contents};
use crate::autodiff::feedback::Feedback;
use crate::autodiff::function::{BackwardContext, Operation};
use crate::autodiff::variable::{Variable, VariableData};
use crate::error::OperationError;

/// Joins two Variables: texts and lists are concatenated, numbers added.
/// Mixed kinds are concatenated as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Add;

impl Operation for Add {
    fn kind(&self) -> &str {
        "Add"
    }

    fn forward(&mut self, inputs: &[Variable]) -> Result<Vec<Variable>, OperationError> {
        let [a, b] = inputs else {
            return Err(OperationError::failed(format!(
                "Add expects 2 inputs, got {}",
                inputs.len()
            )));
        };
        let data = match (a.data(), b.data()) {
            (VariableData::Number(x), VariableData::Number(y)) => VariableData::Number(x + y),
            (VariableData::List(mut x), VariableData::List(y)) => {
                x.extend(y);
                VariableData::List(x)
            }
            (x, y) => VariableData::Text(format!("{x}{y}")),
        };
        let role = format!("{} and {}", a.role(), b.role());
        Ok(vec![Variable::new(data, role, true)?])
    }

    fn backward(&self, ctx: &BackwardContext<'_>) -> Result<Vec<Option<Feedback>>, OperationError> {
        Ok(per_input_feedback(ctx))
    }
}

/// Joins any number of Variables as text, separated by newlines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Operation for Sum {
    fn kind(&self) -> &str {
        "Sum"
    }

    fn forward(&mut self, inputs: &[Variable]) -> Result<Vec<Variable>, OperationError> {
        if inputs.is_empty() {
            return Err(OperationError::failed("Sum expects at least one input"));
        }
        let text = inputs
            .iter()
            .map(Variable::text_content)
            .collect::<Vec<_>>()
            .join("\n");
        let roles = inputs.iter().map(Variable::role).collect::<Vec<_>>().join(" and ");
        Ok(vec![Variable::text(text, format!("summation of {roles}"), true)])
    }

    fn backward(&self, ctx: &BackwardContext<'_>) -> Result<Vec<Option<Feedback>>, OperationError> {
        Ok(per_input_feedback(ctx))
    }
}

fn per_input_feedback(ctx: &BackwardContext<'_>) -> Vec<Option<Feedback>> {
    let received = join_contents(ctx.all_output_feedback());
    ctx.inputs()
        .iter()
        .enumerate()
        .map(|(i, input)| {
            ctx.needs_input_feedback(i)
                .then(|| combined_feedback(&input.role(), &received))
        })
        .collect()
}
