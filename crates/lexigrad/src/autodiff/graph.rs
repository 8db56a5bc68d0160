//! Define-by-run graph construction.
//!
//! The graph is never declared up front: each [`GraphBuilder::apply`] runs an
//! operation and wires its outputs to a new [`Function`] that holds the inputs.
//! The graph of a Variable is whatever can be reached by following creators
//! backwards from it.

use super::function::{Function, FunctionId, Operation};
use super::variable::{Variable, VariableData, VariableId};
use crate::error::{GraphError, Result, StructureViolation};
use crate::observer::{GraphObserver, Phase};
use log::trace;
use smallvec::SmallVec;
use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// Entry point for building graphs.
///
/// Carries the optional observer and the recording mode. Builders are cheap;
/// graphs built by different builders can be mixed freely.
///
/// # Example
///
/// ```ignore
/// use lexigrad::autodiff::{GraphBuilder, ops::Add};
///
/// let builder = GraphBuilder::new();
/// let x = builder.variable("abc", "first input", true).unwrap();
/// let y = builder.variable("def", "second input", false).unwrap();
///
/// let sum = builder.apply_one(Add, &[x, y]).unwrap();
/// assert_eq!(sum.text_content(), "abcdef");
/// assert_eq!(sum.creator().unwrap().name(), "AddBackward0");
/// ```
#[derive(Default)]
pub struct GraphBuilder {
    observer: Option<Rc<dyn GraphObserver>>,
    paused: Cell<bool>,
}

impl GraphBuilder {
    /// Builder without an observer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder that reports construction events to `observer`.
    pub fn with_observer(observer: Rc<dyn GraphObserver>) -> Self {
        Self {
            observer: Some(observer),
            paused: Cell::new(false),
        }
    }

    /// The observer this builder reports to, if any.
    pub fn observer(&self) -> Option<&Rc<dyn GraphObserver>> {
        self.observer.as_ref()
    }

    /// Whether forward calls are currently recorded.
    pub fn is_recording(&self) -> bool {
        !self.paused.get()
    }

    /// Run `f` with recording disabled.
    ///
    /// Outputs produced inside are plain leaves that require no feedback. The
    /// previous mode is restored when `f` returns or unwinds.
    pub fn no_feedback<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = PauseGuard::new(&self.paused);
        f()
    }

    /// Create a leaf Variable and report it to the observer.
    pub fn variable(
        &self,
        data: impl Into<VariableData>,
        role: impl Into<String>,
        requires_feedback: bool,
    ) -> Result<Variable> {
        let variable = Variable::new(data, role, requires_feedback)?;
        if let Some(observer) = &self.observer {
            observer.variable_created(&variable);
        }
        Ok(variable)
    }

    /// Run `op` on `inputs` and wire the outputs into the graph.
    ///
    /// The outputs require feedback iff recording is enabled and at least one
    /// input requires feedback; only then is a Function recorded. Untracked
    /// calls reset the flags of Variables created by `op`, and leave any
    /// pre-existing Variable the operation hands back as it was.
    ///
    /// # Errors
    /// - [`GraphError::ForwardComputation`] if the operation fails.
    /// - [`GraphError::GraphStructure`] if an output is an input, an ancestor
    ///   of an input, an output of another Function, or listed twice. Nothing
    ///   is wired in that case.
    pub fn apply<O: Operation + 'static>(&self, mut op: O, inputs: &[Variable]) -> Result<Vec<Variable>> {
        let id = FunctionId::next();
        let first_new = VariableId::watermark();
        let outputs = op
            .forward(inputs)
            .map_err(|source| GraphError::ForwardComputation {
                kind: op.kind().to_string(),
                source,
            })?;

        check_structure(id, op.kind(), inputs, &outputs)?;

        let tracked = self.is_recording() && inputs.iter().any(Variable::requires_feedback);
        if tracked {
            for input in inputs {
                input.mark_consumed();
            }
            let inputs: SmallVec<[Variable; 4]> = inputs.iter().cloned().collect();
            let function = Function::new(id, Box::new(op), inputs);
            for (nr, output) in outputs.iter().enumerate() {
                // check_structure guarantees no creator is set yet
                output.attach_creator(function.clone(), nr);
            }
            function.set_outputs(&outputs);
            trace!("recorded {function:?} with {} output(s)", outputs.len());
            if let Some(observer) = &self.observer {
                observer.function_executed(&function, Phase::Forward);
            }
        } else {
            for (nr, output) in outputs.iter().enumerate() {
                if output.id() >= first_new {
                    output.mark_untracked(nr);
                }
            }
        }

        if let Some(observer) = &self.observer {
            for output in &outputs {
                observer.variable_created(output);
            }
        }
        Ok(outputs)
    }

    /// Like [`apply`](Self::apply) for operations with exactly one output.
    pub fn apply_one<O: Operation + 'static>(&self, op: O, inputs: &[Variable]) -> Result<Variable> {
        let kind = op.kind().to_string();
        let mut outputs = self.apply(op, inputs)?;
        if outputs.len() != 1 {
            return Err(GraphError::InvalidInput(format!(
                "{kind} produced {} outputs, expected exactly one",
                outputs.len()
            )));
        }
        Ok(outputs.remove(0))
    }
}

impl fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("has_observer", &self.observer.is_some())
            .field("recording", &self.is_recording())
            .finish()
    }
}

struct PauseGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> PauseGuard<'a> {
    fn new(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(true);
        Self { flag, previous }
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

fn check_structure(id: FunctionId, op_kind: &str, inputs: &[Variable], outputs: &[Variable]) -> Result<()> {
    let violation = |variable: &Variable, kind: StructureViolation| GraphError::GraphStructure {
        function: id,
        name: format!("{op_kind}Backward0"),
        variable: variable.label(),
        kind,
    };

    let mut ancestors: Option<HashSet<VariableId>> = None;
    for (i, output) in outputs.iter().enumerate() {
        if outputs[..i].iter().any(|earlier| earlier.ptr_eq(output)) {
            return Err(violation(output, StructureViolation::DuplicateOutput));
        }
        if inputs.iter().any(|input| input.ptr_eq(output)) {
            return Err(violation(output, StructureViolation::SelfReference));
        }
        if output.creator().is_some() {
            return Err(violation(output, StructureViolation::CreatorAlreadySet));
        }
        // Every strict ancestor of an input is the input of some recorded
        // Function, so an output nothing consumes cannot close a cycle.
        if !output.is_consumed() {
            continue;
        }
        let ancestors = ancestors.get_or_insert_with(|| ancestor_ids(inputs));
        if ancestors.contains(&output.id()) {
            return Err(violation(output, StructureViolation::Cycle));
        }
    }
    Ok(())
}

/// Ids of every Variable reachable backwards from `inputs`, inputs included.
///
/// Released Functions contribute no further ancestors.
fn ancestor_ids(inputs: &[Variable]) -> HashSet<VariableId> {
    let mut seen = HashSet::new();
    let mut visited_functions = HashSet::new();
    let mut stack: Vec<Variable> = inputs.to_vec();

    while let Some(variable) = stack.pop() {
        if !seen.insert(variable.id()) {
            continue;
        }
        if let Some(creator) = variable.creator() {
            if visited_functions.insert(creator.id()) {
                if let Ok(parents) = creator.wired_inputs() {
                    stack.extend(parents);
                }
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::feedback::Feedback;
    use crate::autodiff::function::BackwardContext;
    use crate::error::OperationError;
    use crate::observer::{EventRecorder, GraphEvent};

    type OpResult<T> = std::result::Result<T, OperationError>;

    #[derive(Debug)]
    struct Upper;

    impl Operation for Upper {
        fn kind(&self) -> &str {
            "Upper"
        }

        fn forward(&mut self, inputs: &[Variable]) -> OpResult<Vec<Variable>> {
            Ok(vec![Variable::text(
                inputs[0].text_content().to_uppercase(),
                format!("upper-cased {}", inputs[0].role()),
                false,
            )])
        }

        fn backward(&self, ctx: &BackwardContext<'_>) -> OpResult<Vec<Option<Feedback>>> {
            Ok(ctx.inputs().iter().map(|_| None).collect())
        }
    }

    /// Returns a Variable it was handed at construction.
    #[derive(Debug)]
    struct ReturnExisting(Variable);

    impl Operation for ReturnExisting {
        fn kind(&self) -> &str {
            "ReturnExisting"
        }

        fn forward(&mut self, _inputs: &[Variable]) -> OpResult<Vec<Variable>> {
            Ok(vec![self.0.clone()])
        }

        fn backward(&self, ctx: &BackwardContext<'_>) -> OpResult<Vec<Option<Feedback>>> {
            Ok(ctx.inputs().iter().map(|_| None).collect())
        }
    }

    #[derive(Debug)]
    struct Duplicate;

    impl Operation for Duplicate {
        fn kind(&self) -> &str {
            "Duplicate"
        }

        fn forward(&mut self, _inputs: &[Variable]) -> OpResult<Vec<Variable>> {
            let out = Variable::text("twice", "twice", true);
            Ok(vec![out.clone(), out])
        }

        fn backward(&self, ctx: &BackwardContext<'_>) -> OpResult<Vec<Option<Feedback>>> {
            Ok(ctx.inputs().iter().map(|_| None).collect())
        }
    }

    /// Two fresh outputs that both claim to require feedback.
    #[derive(Debug)]
    struct Split2;

    impl Operation for Split2 {
        fn kind(&self) -> &str {
            "Split2"
        }

        fn forward(&mut self, inputs: &[Variable]) -> OpResult<Vec<Variable>> {
            let text = inputs[0].text_content();
            Ok(vec![
                Variable::text(text.clone(), "left", true),
                Variable::text(text, "right", true),
            ])
        }

        fn backward(&self, ctx: &BackwardContext<'_>) -> OpResult<Vec<Option<Feedback>>> {
            Ok(ctx.inputs().iter().map(|_| None).collect())
        }
    }

    #[derive(Debug)]
    struct Failing;

    impl Operation for Failing {
        fn kind(&self) -> &str {
            "Failing"
        }

        fn forward(&mut self, _inputs: &[Variable]) -> OpResult<Vec<Variable>> {
            Err(OperationError::failed("model unavailable"))
        }

        fn backward(&self, _ctx: &BackwardContext<'_>) -> OpResult<Vec<Option<Feedback>>> {
            Ok(vec![])
        }
    }

    fn structure_kind(err: GraphError) -> StructureViolation {
        match err {
            GraphError::GraphStructure { kind, .. } => kind,
            other => panic!("expected structure error, got {other:?}"),
        }
    }

    #[test]
    fn test_apply_wires_outputs() {
        let builder = GraphBuilder::new();
        let x = builder.variable("hello", "greeting", true).unwrap();

        let y = builder.apply_one(Upper, &[x.clone()]).unwrap();

        assert_eq!(y.text_content(), "HELLO");
        assert!(y.requires_feedback());
        assert!(!y.is_leaf());
        assert_eq!(y.output_nr(), 0);

        let creator = y.creator().unwrap();
        assert_eq!(creator.name(), "UpperBackward0");
        assert!(creator.inputs().unwrap()[0].ptr_eq(&x));
    }

    #[test]
    fn test_apply_without_feedback_inputs_creates_leaf() {
        let builder = GraphBuilder::new();
        let x = builder.variable("hello", "greeting", false).unwrap();

        let y = builder.apply_one(Upper, &[x]).unwrap();

        assert!(y.is_leaf());
        assert!(!y.requires_feedback());
    }

    #[test]
    fn test_no_feedback_scope() {
        let builder = GraphBuilder::new();
        let x = builder.variable("hello", "greeting", true).unwrap();

        let y = builder.no_feedback(|| {
            assert!(!builder.is_recording());
            builder.apply_one(Upper, &[x.clone()]).unwrap()
        });

        assert!(builder.is_recording());
        assert!(y.is_leaf());
        assert!(!y.requires_feedback());
    }

    #[test]
    fn test_no_feedback_scope_nests() {
        let builder = GraphBuilder::new();
        builder.no_feedback(|| {
            builder.no_feedback(|| assert!(!builder.is_recording()));
            assert!(!builder.is_recording());
        });
        assert!(builder.is_recording());
    }

    #[test]
    fn test_self_reference_rejected() {
        let builder = GraphBuilder::new();
        let x = builder.variable("x", "x", true).unwrap();

        let err = builder.apply(ReturnExisting(x.clone()), &[x.clone()]).unwrap_err();

        assert_eq!(structure_kind(err), StructureViolation::SelfReference);
        assert!(x.is_leaf());
    }

    #[test]
    fn test_transitive_cycle_rejected() {
        let builder = GraphBuilder::new();
        let x = builder.variable("x", "x", true).unwrap();
        let y = builder.apply_one(Upper, &[x.clone()]).unwrap();
        let z = builder.apply_one(Upper, &[y]).unwrap();

        // A function consuming z may not output x, which z descends from
        let err = builder.apply(ReturnExisting(x.clone()), &[z]).unwrap_err();

        assert_eq!(structure_kind(err), StructureViolation::Cycle);
        assert!(x.is_leaf());
    }

    #[test]
    fn test_creator_already_set_rejected() {
        let builder = GraphBuilder::new();
        let x = builder.variable("x", "x", true).unwrap();
        let other = builder.variable("o", "o", true).unwrap();
        let y = builder.apply_one(Upper, &[x]).unwrap();
        let original = y.creator().unwrap();

        let err = builder.apply(ReturnExisting(y.clone()), &[other]).unwrap_err();

        assert_eq!(structure_kind(err), StructureViolation::CreatorAlreadySet);
        assert!(y.creator().unwrap().ptr_eq(&original));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let builder = GraphBuilder::new();
        let x = builder.variable("x", "x", true).unwrap();

        let err = builder.apply(Duplicate, &[x]).unwrap_err();
        assert_eq!(structure_kind(err), StructureViolation::DuplicateOutput);
    }

    #[test]
    fn test_unrelated_fresh_leaf_is_adopted() {
        let builder = GraphBuilder::new();
        let x = builder.variable("x", "x", true).unwrap();
        let fresh = Variable::text("made elsewhere", "fresh", false);

        let out = builder.apply_one(ReturnExisting(fresh.clone()), &[x]).unwrap();

        assert!(out.ptr_eq(&fresh));
        assert!(fresh.requires_feedback());
        assert_eq!(fresh.creator().unwrap().name(), "ReturnExistingBackward0");
    }

    #[test]
    fn test_untracked_call_leaves_existing_output_alone() {
        let builder = GraphBuilder::new();
        let frozen = builder.variable("x", "x", false).unwrap();
        let parts = builder.apply(Split2, &[Variable::text("p", "p", true)]).unwrap();
        let parameter = parts[1].clone();

        let out = builder.apply_one(ReturnExisting(parameter.clone()), &[frozen]).unwrap();

        assert!(out.ptr_eq(&parameter));
        assert!(parameter.requires_feedback());
        assert_eq!(parameter.output_nr(), 1);
        assert_eq!(parameter.creator().unwrap().name(), "Split2Backward0");
    }

    #[test]
    fn test_untracked_call_resets_fresh_outputs() {
        let builder = GraphBuilder::new();
        let frozen = builder.variable("x", "x", false).unwrap();

        // Split2 creates outputs flagged as requiring feedback at positions 0 and 1
        let outputs = builder.apply(Split2, &[frozen]).unwrap();

        assert!(outputs.iter().all(|o| !o.requires_feedback() && o.is_leaf()));
        assert_eq!(outputs[1].output_nr(), 1);
    }

    #[test]
    fn test_consumed_flag() {
        let builder = GraphBuilder::new();
        let x = builder.variable("x", "x", true).unwrap();
        let frozen = builder.variable("f", "f", false).unwrap();
        assert!(!x.is_consumed());

        let y = builder.apply_one(Upper, &[x.clone()]).unwrap();
        assert!(x.is_consumed());
        assert!(!y.is_consumed());

        // untracked calls record no Function, so nothing is consumed
        builder.apply_one(Upper, &[frozen.clone()]).unwrap();
        assert!(!frozen.is_consumed());
    }

    #[test]
    fn test_forward_failure() {
        let builder = GraphBuilder::new();
        let x = builder.variable("x", "x", true).unwrap();

        let err = builder.apply(Failing, &[x]).unwrap_err();
        assert!(matches!(err, GraphError::ForwardComputation { ref kind, .. } if kind == "Failing"));
    }

    #[test]
    fn test_apply_one_rejects_multiple_outputs() {
        #[derive(Debug)]
        struct Two;
        impl Operation for Two {
            fn kind(&self) -> &str {
                "Two"
            }
            fn forward(&mut self, _inputs: &[Variable]) -> OpResult<Vec<Variable>> {
                Ok(vec![Variable::text("a", "a", true), Variable::text("b", "b", true)])
            }
            fn backward(&self, ctx: &BackwardContext<'_>) -> OpResult<Vec<Option<Feedback>>> {
                Ok(ctx.inputs().iter().map(|_| None).collect())
            }
        }

        let builder = GraphBuilder::new();
        let x = builder.variable("x", "x", true).unwrap();
        assert!(matches!(
            builder.apply_one(Two, &[x]),
            Err(GraphError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_observer_sees_construction() {
        let recorder = Rc::new(EventRecorder::new());
        let builder = GraphBuilder::with_observer(recorder.clone());
        let x = builder.variable("x", "x", true).unwrap();
        let y = builder.apply_one(Upper, &[x.clone()]).unwrap();

        let events = recorder.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], GraphEvent::VariableCreated { variable, .. } if *variable == x.id()));
        assert!(matches!(
            &events[1],
            GraphEvent::FunctionExecuted { name, phase: Phase::Forward, .. } if name == "UpperBackward0"
        ));
        assert!(matches!(
            &events[2],
            GraphEvent::VariableCreated { variable, creator: Some(_), .. } if *variable == y.id()
        ));
    }
}
