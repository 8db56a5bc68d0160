//! Scoring a prediction against a target.

use super::{combined_feedback, join_contents};
use crate::autodiff::feedback::Feedback;
use crate::autodiff::function::{BackwardContext, Operation};
use crate::autodiff::variable::{Variable, VariableData};
use crate::error::OperationError;
use std::fmt;

type ScoreFn = Box<dyn Fn(&VariableData, &VariableData) -> f64>;

/// Scores a predicted Variable against a target with a plain function.
///
/// Inputs are `[prediction, target]`. Outputs are the numeric score and a
/// text explanation of how it was obtained. Backward sends the feedback on
/// both outputs to the prediction; the target only receives feedback if it
/// asks for it.
///
/// # Example
///
/// ```ignore
/// let exact = DeterministicEvaluator::new("exact match", |p, t| f64::from(u8::from(p == t)));
/// let out = builder.apply(exact, &[prediction, target])?;
/// ```
pub struct DeterministicEvaluator {
    purpose: String,
    score: ScoreFn,
}

impl DeterministicEvaluator {
    /// Evaluator described by `purpose` that scores a prediction against a
    /// target with `score`.
    pub fn new(purpose: impl Into<String>, score: impl Fn(&VariableData, &VariableData) -> f64 + 'static) -> Self {
        Self {
            purpose: purpose.into(),
            score: Box::new(score),
        }
    }

    /// What the evaluation checks, e.g. `"exact match"`.
    pub fn purpose(&self) -> &str {
        &self.purpose
    }
}

impl fmt::Debug for DeterministicEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterministicEvaluator")
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

impl Operation for DeterministicEvaluator {
    fn kind(&self) -> &str {
        "DeterministicEvaluator"
    }

    fn forward(&mut self, inputs: &[Variable]) -> Result<Vec<Variable>, OperationError> {
        let [prediction, target] = inputs else {
            return Err(OperationError::failed(format!(
                "DeterministicEvaluator expects 2 inputs, got {}",
                inputs.len()
            )));
        };
        let (predicted, expected) = (prediction.data(), target.data());
        let score = (self.score)(&predicted, &expected);
        if !score.is_finite() {
            return Err(OperationError::failed(format!(
                "score function for '{}' returned {score}",
                self.purpose
            )));
        }

        let role = prediction.role();
        let score_var = Variable::new(score, format!("Evaluation result score of {role}"), true)?;
        let explanation = format!(
            "The evaluation function, designed for '{}', compared the <DATA> field of the predicted \
             variable ('{predicted}') with the <DATA> field of the target variable ('{expected}'), \
             resulting in a score: {}.",
            self.purpose,
            VariableData::Number(score),
        );
        let explanation_var = Variable::text(explanation, format!("Evaluation result explanation of {role}"), true);
        Ok(vec![score_var, explanation_var])
    }

    fn backward(&self, ctx: &BackwardContext<'_>) -> Result<Vec<Option<Feedback>>, OperationError> {
        let received = join_contents(ctx.all_output_feedback());
        Ok(ctx
            .inputs()
            .iter()
            .enumerate()
            .map(|(i, input)| ctx.needs_input_feedback(i).then(|| combined_feedback(&input.role(), &received)))
            .collect())
    }
}
