//! Functions: the operation nodes of the computation graph.

use super::feedback::Feedback;
use super::variable::{Variable, WeakVariable};
use crate::error::{GraphError, OperationError, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Unique identifier of a Function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(usize);

impl FunctionId {
    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }

    pub(crate) fn next() -> Self {
        NEXT_FUNCTION_ID.with(|id| {
            let current = id.get();
            id.set(current + 1);
            Self(current)
        })
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

thread_local! {
    static NEXT_FUNCTION_ID: Cell<usize> = const { Cell::new(0) };
}

/// A cognitive operation: the extension point for concrete operations.
///
/// `forward` computes the outputs; `backward` turns the feedback received by
/// those outputs into one feedback slot per input. The engine treats both as
/// opaque and never inspects the text they produce.
///
/// # Example
///
/// ```ignore
/// use lexigrad::autodiff::{BackwardContext, Feedback, Operation, Variable};
/// use lexigrad::OperationError;
///
/// #[derive(Debug)]
/// struct Reverse;
///
/// impl Operation for Reverse {
///     fn kind(&self) -> &str {
///         "Reverse"
///     }
///
///     fn forward(&mut self, inputs: &[Variable]) -> Result<Vec<Variable>, OperationError> {
///         let reversed: String = inputs[0].text_content().chars().rev().collect();
///         Ok(vec![Variable::text(reversed, inputs[0].role(), true)])
///     }
///
///     fn backward(&self, ctx: &BackwardContext<'_>) -> Result<Vec<Option<Feedback>>, OperationError> {
///         let text = ctx.output_feedback(0).iter().map(Feedback::content).collect::<Vec<_>>();
///         Ok(vec![Some(Feedback::new(text.join(" "), "feedback to input"))])
///     }
/// }
/// ```
pub trait Operation: fmt::Debug {
    /// Operation kind, e.g. `"Add"`. Function names are derived from it.
    fn kind(&self) -> &str;

    /// Compute the outputs for `inputs`.
    ///
    /// Outputs must be Variables created by this call; returning an input, an
    /// ancestor of an input, or a Variable produced by another Function is
    /// rejected by the graph builder.
    fn forward(&mut self, inputs: &[Variable]) -> std::result::Result<Vec<Variable>, OperationError>;

    /// Compute feedback for each input.
    ///
    /// Must return exactly one slot per recorded input, in input order. `None`
    /// means "no feedback for this input".
    fn backward(
        &self,
        ctx: &BackwardContext<'_>,
    ) -> std::result::Result<Vec<Option<Feedback>>, OperationError>;
}

/// Everything an operation's backward step can look at.
#[derive(Debug)]
pub struct BackwardContext<'a> {
    name: &'a str,
    inputs: &'a [Variable],
    outputs: &'a [Option<Variable>],
    output_feedback: &'a [Vec<Feedback>],
    needs_input_feedback: &'a [bool],
}

impl<'a> BackwardContext<'a> {
    /// Name of the Function being differentiated.
    pub fn function_name(&self) -> &str {
        self.name
    }

    /// Recorded inputs, including repeats and inputs that need no feedback.
    pub fn inputs(&self) -> &'a [Variable] {
        self.inputs
    }

    /// Output Variables; `None` for outputs that were already dropped.
    pub fn outputs(&self) -> &'a [Option<Variable>] {
        self.outputs
    }

    /// Feedback received by output `index` during this pass.
    ///
    /// Empty for outputs that were not reached from the backward root.
    pub fn output_feedback(&self, index: usize) -> &'a [Feedback] {
        self.output_feedback
            .get(index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Feedback of every output, in output order.
    pub fn all_output_feedback(&self) -> impl Iterator<Item = &'a Feedback> + 'a {
        self.output_feedback.iter().flatten()
    }

    /// Whether input `index` wants feedback.
    pub fn needs_input_feedback(&self, index: usize) -> bool {
        self.needs_input_feedback.get(index).copied().unwrap_or(false)
    }
}

/// Edge from a Function to the producer of one of its inputs.
#[derive(Debug, Clone)]
pub enum NextFunction {
    /// The input was produced by `function` at position `output_nr`.
    Function { function: Function, output_nr: usize },
    /// The input is a leaf that accumulates feedback.
    Accumulate(Variable),
    /// The input needs no feedback.
    None,
}

/// Forward-pass state released after backward.
struct Wiring {
    op: Box<dyn Operation>,
    inputs: SmallVec<[Variable; 4]>,
}

impl Drop for Wiring {
    /// Tear the ancestry down with a worklist. Dropping the inputs directly
    /// would recurse once per graph level and overflow the stack on deep
    /// chains.
    fn drop(&mut self) {
        let mut pending: Vec<Variable> = self.inputs.drain(..).collect();
        while let Some(variable) = pending.pop() {
            let Some(creator) = variable.take_creator_if_unshared() else {
                continue;
            };
            if Rc::strong_count(&creator.node) != 1 {
                continue;
            }
            let taken = creator.node.wiring.borrow_mut().take();
            if let Some(mut wiring) = taken {
                pending.extend(wiring.inputs.drain(..));
            }
        }
    }
}

struct FunctionNode {
    id: FunctionId,
    name: String,
    wiring: RefCell<Option<Wiring>>,
    outputs: OnceCell<SmallVec<[WeakVariable; 2]>>,
}

/// Handle to one recorded operation.
///
/// Inputs are held strongly, outputs weakly, so the graph contains no
/// reference cycles and is reclaimed once the last Variable referencing it
/// goes away.
#[derive(Clone)]
pub struct Function {
    node: Rc<FunctionNode>,
}

impl Function {
    pub(crate) fn new(id: FunctionId, op: Box<dyn Operation>, inputs: SmallVec<[Variable; 4]>) -> Self {
        let name = format!("{}Backward0", op.kind());
        Self {
            node: Rc::new(FunctionNode {
                id,
                name,
                wiring: RefCell::new(Some(Wiring { op, inputs })),
                outputs: OnceCell::new(),
            }),
        }
    }

    /// Record the outputs. Only the first call has an effect.
    pub(crate) fn set_outputs(&self, outputs: &[Variable]) {
        let weak = outputs.iter().map(Variable::downgrade).collect();
        let _ = self.node.outputs.set(weak);
    }

    /// Get the Function id.
    pub fn id(&self) -> FunctionId {
        self.node.id
    }

    /// Display name, e.g. `AddBackward0`.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Recorded inputs.
    ///
    /// # Errors
    /// Returns [`GraphError::GraphReleased`] once the Function was released.
    pub fn inputs(&self) -> Result<Vec<Variable>> {
        self.wired_inputs().map(SmallVec::into_vec)
    }

    /// Number of recorded outputs.
    pub fn num_outputs(&self) -> usize {
        self.node.outputs.get().map_or(0, SmallVec::len)
    }

    /// Output Variables that are still alive, by position.
    pub fn outputs(&self) -> Vec<Option<Variable>> {
        self.node
            .outputs
            .get()
            .map(|outs| outs.iter().map(WeakVariable::upgrade).collect())
            .unwrap_or_default()
    }

    /// One edge per recorded input.
    pub fn next_functions(&self) -> Result<Vec<NextFunction>> {
        let inputs = self.wired_inputs()?;
        Ok(inputs
            .into_iter()
            .map(|input| match input.creator() {
                Some(function) => NextFunction::Function {
                    function,
                    output_nr: input.output_nr(),
                },
                None if input.requires_feedback() => NextFunction::Accumulate(input),
                None => NextFunction::None,
            })
            .collect())
    }

    /// Whether the forward wiring was dropped.
    pub fn is_released(&self) -> bool {
        self.node.wiring.borrow().is_none()
    }

    /// Drop the input references and operation state.
    ///
    /// Returns true if this call released the Function.
    pub fn release(&self) -> bool {
        // Take first so dropping inputs (and maybe their creators) happens
        // outside the borrow.
        let taken = self.node.wiring.borrow_mut().take();
        taken.is_some()
    }

    /// Check whether two handles refer to the same Function.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    pub(crate) fn released_error(&self) -> GraphError {
        GraphError::GraphReleased {
            function: self.id(),
            name: self.name().to_string(),
        }
    }

    pub(crate) fn wired_inputs(&self) -> Result<SmallVec<[Variable; 4]>> {
        self.node
            .wiring
            .borrow()
            .as_ref()
            .map(|w| w.inputs.clone())
            .ok_or_else(|| self.released_error())
    }

    /// Invoke the operation's backward step.
    ///
    /// Returns one slot per input, or an error attributed to this Function.
    pub(crate) fn call_backward(&self, output_feedback: &[Vec<Feedback>]) -> Result<Vec<Option<Feedback>>> {
        let wiring = self.node.wiring.borrow();
        let wiring = wiring.as_ref().ok_or_else(|| self.released_error())?;
        let outputs = self.outputs();
        let needs: SmallVec<[bool; 4]> = wiring.inputs.iter().map(Variable::requires_feedback).collect();

        let ctx = BackwardContext {
            name: self.name(),
            inputs: &wiring.inputs,
            outputs: &outputs,
            output_feedback,
            needs_input_feedback: &needs,
        };

        let slots = wiring
            .op
            .backward(&ctx)
            .map_err(|source| GraphError::BackwardComputation {
                function: self.id(),
                name: self.name().to_string(),
                outputs: outputs.iter().flatten().map(Variable::label).collect(),
                source,
            })?;

        if slots.len() != wiring.inputs.len() {
            return Err(GraphError::ContractViolation {
                function: self.id(),
                name: self.name().to_string(),
                message: format!(
                    "backward returned {} feedback slot(s) for {} input(s)",
                    slots.len(),
                    wiring.inputs.len()
                ),
            });
        }
        Ok(slots)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.name(), self.id())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    // Passes the joined output feedback to every input
    #[derive(Debug)]
    struct Echo;

    impl Operation for Echo {
        fn kind(&self) -> &str {
            "Echo"
        }

        fn forward(&mut self, inputs: &[Variable]) -> std::result::Result<Vec<Variable>, OperationError> {
            Ok(vec![Variable::text(inputs[0].text_content(), "echo", true)])
        }

        fn backward(
            &self,
            ctx: &BackwardContext<'_>,
        ) -> std::result::Result<Vec<Option<Feedback>>, OperationError> {
            let joined = ctx.all_output_feedback().map(Feedback::content).collect::<Vec<_>>();
            Ok(ctx
                .inputs()
                .iter()
                .map(|_| Some(Feedback::from(joined.join("|"))))
                .collect())
        }
    }

    // Returns the wrong number of slots
    #[derive(Debug)]
    struct Short;

    impl Operation for Short {
        fn kind(&self) -> &str {
            "Short"
        }

        fn forward(&mut self, _inputs: &[Variable]) -> std::result::Result<Vec<Variable>, OperationError> {
            Ok(vec![])
        }

        fn backward(
            &self,
            _ctx: &BackwardContext<'_>,
        ) -> std::result::Result<Vec<Option<Feedback>>, OperationError> {
            Ok(vec![])
        }
    }

    fn wire(op: Box<dyn Operation>, inputs: &[Variable]) -> (Function, Variable) {
        let function = Function::new(FunctionId::next(), op, inputs.iter().cloned().collect());
        let out = Variable::text("out", "out", true);
        assert!(out.attach_creator(function.clone(), 0));
        function.set_outputs(std::slice::from_ref(&out));
        (function, out)
    }

    #[test]
    fn test_function_name_and_edges() {
        let a = Variable::text("a", "a", true);
        let b = Variable::text("b", "b", false);
        let (f, out) = wire(Box::new(Echo), &[a.clone(), b.clone()]);

        assert_eq!(f.name(), "EchoBackward0");
        assert_eq!(f.num_outputs(), 1);
        assert!(f.outputs()[0].as_ref().unwrap().ptr_eq(&out));
        assert!(out.creator().unwrap().ptr_eq(&f));
        assert!(!out.is_leaf());

        let edges = f.next_functions().unwrap();
        assert_eq!(edges.len(), 2);
        assert!(matches!(&edges[0], NextFunction::Accumulate(v) if v.ptr_eq(&a)));
        assert!(matches!(edges[1], NextFunction::None));
    }

    #[test]
    fn test_next_functions_points_to_creator() {
        let a = Variable::text("a", "a", true);
        let (f1, mid) = wire(Box::new(Echo), &[a]);
        let (f2, _out) = wire(Box::new(Echo), &[mid]);

        match &f2.next_functions().unwrap()[0] {
            NextFunction::Function { function, output_nr } => {
                assert!(function.ptr_eq(&f1));
                assert_eq!(*output_nr, 0);
            }
            other => panic!("unexpected edge {other:?}"),
        }
    }

    #[test]
    fn test_creator_is_set_once() {
        let a = Variable::text("a", "a", true);
        let (f, out) = wire(Box::new(Echo), &[a.clone()]);
        let (other, _) = wire(Box::new(Echo), &[a]);

        assert!(!out.attach_creator(other, 0));
        assert!(out.creator().unwrap().ptr_eq(&f));
    }

    #[test]
    fn test_outputs_are_weak() {
        let a = Variable::text("a", "a", true);
        let (f, out) = wire(Box::new(Echo), &[a]);
        drop(out);
        assert!(f.outputs()[0].is_none());
        assert_eq!(f.num_outputs(), 1);
    }

    #[test]
    fn test_call_backward() {
        let a = Variable::text("a", "a", true);
        let (f, _out) = wire(Box::new(Echo), &[a.clone(), a]);

        let slots = f
            .call_backward(&[vec![Feedback::from("x"), Feedback::from("y")]])
            .unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].as_ref().unwrap().content(), "x|y");
    }

    #[test]
    fn test_call_backward_wrong_slot_count() {
        let a = Variable::text("a", "a", true);
        let f = Function::new(FunctionId::next(), Box::new(Short), smallvec![a]);

        let err = f.call_backward(&[]).unwrap_err();
        assert!(matches!(err, GraphError::ContractViolation { .. }));
    }

    #[test]
    fn test_release() {
        let a = Variable::text("a", "a", true);
        let (f, _out) = wire(Box::new(Echo), &[a]);

        assert!(!f.is_released());
        assert!(f.release());
        assert!(f.is_released());
        assert!(!f.release());
        assert!(matches!(f.inputs(), Err(GraphError::GraphReleased { .. })));
        assert!(matches!(
            f.call_backward(&[vec![]]),
            Err(GraphError::GraphReleased { .. })
        ));
    }

    #[test]
    fn test_drop_deep_chain() {
        let leaf = Variable::text("x", "x", true);
        let weak_leaf = leaf.downgrade();
        let mut tip = leaf;
        for _ in 0..50_000 {
            let (_f, out) = wire(Box::new(Echo), &[tip]);
            tip = out;
        }

        drop(tip);
        assert!(weak_leaf.upgrade().is_none());
    }

    #[test]
    fn test_drop_keeps_shared_ancestry() {
        let a = Variable::text("a", "a", true);
        let (_f1, mid) = wire(Box::new(Echo), &[a]);
        let (f2, out) = wire(Box::new(Echo), &[mid.clone()]);

        drop(out);
        drop(f2);

        // mid is still held here, so its creator survives the teardown
        assert!(mid.creator().is_some());
        assert!(!mid.creator().unwrap().is_released());
    }

    #[test]
    fn test_context_defaults_for_missing_output() {
        let inputs = [Variable::text("a", "a", true)];
        let outputs = [None];
        let feedback = [vec![]];
        let needs = [true];
        let ctx = BackwardContext {
            name: "TestBackward0",
            inputs: &inputs,
            outputs: &outputs,
            output_feedback: &feedback,
            needs_input_feedback: &needs,
        };

        assert!(ctx.output_feedback(0).is_empty());
        assert!(ctx.output_feedback(5).is_empty());
        assert!(ctx.needs_input_feedback(0));
        assert!(!ctx.needs_input_feedback(1));
        assert_eq!(ctx.function_name(), "TestBackward0");
    }
}
