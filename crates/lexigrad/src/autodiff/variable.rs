//! Variable - a textual value tracked in the computation graph.

use super::backward::{BackwardEngine, BackwardReport};
use super::feedback::Feedback;
use super::function::Function;
use crate::error::{GraphError, Result, VariableLabel};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Unique identifier of a Variable.
///
/// Ids increase monotonically within a thread, so they also record creation
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableId(usize);

impl VariableId {
    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }

    fn next() -> Self {
        NEXT_VARIABLE_ID.with(|id| {
            let current = id.get();
            id.set(current + 1);
            Self(current)
        })
    }

    /// The id the next Variable created on this thread will get. Every
    /// Variable that already exists has a smaller id.
    pub(crate) fn watermark() -> Self {
        NEXT_VARIABLE_ID.with(|id| Self(id.get()))
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

thread_local! {
    static NEXT_VARIABLE_ID: Cell<usize> = const { Cell::new(0) };
}

/// Payload carried by a Variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableData {
    Text(String),
    Number(f64),
    List(Vec<VariableData>),
}

impl VariableData {
    /// Text payload, if this is [`VariableData::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric payload, if this is [`VariableData::Number`].
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(x) => Some(*x),
            _ => None,
        }
    }

    /// Check that the payload can be rendered as text.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Text(_) => Ok(()),
            Self::Number(x) if x.is_finite() => Ok(()),
            Self::Number(x) => Err(GraphError::InvalidInput(format!(
                "variable data must be a finite number, got {x}"
            ))),
            Self::List(items) => items.iter().try_for_each(Self::validate),
        }
    }
}

impl fmt::Display for VariableData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(x) => write!(f, "{x}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for VariableData {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for VariableData {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for VariableData {
    fn from(x: f64) -> Self {
        Self::Number(x)
    }
}

impl From<i64> for VariableData {
    fn from(x: i64) -> Self {
        Self::Number(x as f64)
    }
}

impl<T: Into<VariableData>> From<Vec<T>> for VariableData {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

struct VariableInner {
    id: VariableId,
    data: VariableData,
    role: String,
    requires_feedback: bool,
    feedback: Vec<Feedback>,
    /// Set once, when a Function adopts this Variable as an output.
    creator: Option<Function>,
    output_nr: usize,
    /// Set once a recorded Function holds this Variable as an input.
    consumed: bool,
}

/// A node of the computation graph carrying text, a role and feedback.
///
/// `Variable` is a shared handle: clones refer to the same node. A Variable
/// keeps its creator Function alive, and the creator keeps its inputs alive,
/// so holding any Variable keeps its whole ancestry reachable until the graph
/// is released.
///
/// # Example
///
/// ```ignore
/// use lexigrad::autodiff::Variable;
///
/// let prompt = Variable::new("Answer briefly.", "system prompt", true).unwrap();
/// assert!(prompt.is_leaf());
/// assert!(prompt.feedback().is_empty());
/// ```
#[derive(Clone)]
pub struct Variable {
    inner: Rc<RefCell<VariableInner>>,
}

impl Variable {
    /// Create a leaf Variable.
    ///
    /// # Errors
    /// Returns [`GraphError::InvalidInput`] if `data` contains a non-finite
    /// number.
    pub fn new(
        data: impl Into<VariableData>,
        role: impl Into<String>,
        requires_feedback: bool,
    ) -> Result<Self> {
        let data = data.into();
        data.validate()?;
        Ok(Self::from_parts(data, role.into(), requires_feedback))
    }

    /// Create a leaf Variable holding text. Text is always valid data.
    pub fn text(content: impl Into<String>, role: impl Into<String>, requires_feedback: bool) -> Self {
        Self::from_parts(VariableData::Text(content.into()), role.into(), requires_feedback)
    }

    fn from_parts(data: VariableData, role: String, requires_feedback: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(VariableInner {
                id: VariableId::next(),
                data,
                role,
                requires_feedback,
                feedback: Vec::new(),
                creator: None,
                output_nr: 0,
                consumed: false,
            })),
        }
    }

    /// Get the Variable id.
    pub fn id(&self) -> VariableId {
        self.inner.borrow().id
    }

    /// Get a copy of the payload.
    pub fn data(&self) -> VariableData {
        self.inner.borrow().data.clone()
    }

    /// Payload rendered as text.
    pub fn text_content(&self) -> String {
        self.inner.borrow().data.to_string()
    }

    /// Replace the payload, e.g. with a value proposed by an optimizer.
    pub fn set_data(&self, data: impl Into<VariableData>) -> Result<()> {
        let data = data.into();
        data.validate()?;
        self.inner.borrow_mut().data = data;
        Ok(())
    }

    /// Semantic role of this Variable.
    pub fn role(&self) -> String {
        self.inner.borrow().role.clone()
    }

    /// Replace the role.
    pub fn set_role(&self, role: impl Into<String>) {
        self.inner.borrow_mut().role = role.into();
    }

    /// Whether this Variable accumulates feedback.
    pub fn requires_feedback(&self) -> bool {
        self.inner.borrow().requires_feedback
    }

    /// Change the `requires_feedback` flag.
    ///
    /// # Errors
    /// Only leaves can change the flag; for Variables produced by a Function
    /// it is derived from the inputs.
    pub fn set_requires_feedback(&self, requires_feedback: bool) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.creator.is_some() {
            return Err(GraphError::InvalidInput(format!(
                "requires_feedback can only be changed on leaf variables, {} is not a leaf",
                inner.id
            )));
        }
        inner.requires_feedback = requires_feedback;
        Ok(())
    }

    /// Snapshot of the accumulated feedback, in arrival order.
    pub fn feedback(&self) -> Vec<Feedback> {
        self.inner.borrow().feedback.clone()
    }

    /// Borrow the accumulated feedback without copying.
    pub fn feedback_ref(&self) -> Ref<'_, [Feedback]> {
        Ref::map(self.inner.borrow(), |inner| inner.feedback.as_slice())
    }

    /// Append one contribution. Earlier contributions are kept.
    pub fn accumulate_feedback(&self, contribution: Feedback) {
        self.inner.borrow_mut().feedback.push(contribution);
    }

    /// Drop all accumulated feedback.
    pub fn clear_feedback(&self) {
        self.inner.borrow_mut().feedback.clear();
    }

    /// The Function that produced this Variable, if any.
    pub fn creator(&self) -> Option<Function> {
        self.inner.borrow().creator.clone()
    }

    /// True if this Variable was not produced by a recorded Function.
    pub fn is_leaf(&self) -> bool {
        self.inner.borrow().creator.is_none()
    }

    /// Position of this Variable in its creator's outputs (0 for leaves).
    pub fn output_nr(&self) -> usize {
        self.inner.borrow().output_nr
    }

    /// Detach from the computation graph.
    ///
    /// Returns a new leaf with the same data and role that doesn't require
    /// feedback and holds no reference to this Variable's ancestry.
    pub fn detach(&self) -> Self {
        let inner = self.inner.borrow();
        Self::from_parts(inner.data.clone(), inner.role.clone(), false)
    }

    /// Run a backward pass from this Variable with default options.
    ///
    /// See [`BackwardEngine::run`].
    pub fn backward(&self, initial_feedback: impl Into<Feedback>) -> Result<BackwardReport> {
        BackwardEngine::default().run(self, initial_feedback.into())
    }

    /// Check whether two handles refer to the same node.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn label(&self) -> VariableLabel {
        let inner = self.inner.borrow();
        VariableLabel {
            id: inner.id,
            role: inner.role.clone(),
        }
    }

    /// Record `creator` as the producer of this Variable.
    ///
    /// Returns false, leaving the Variable unchanged, if a creator is already
    /// set.
    pub(crate) fn attach_creator(&self, creator: Function, output_nr: usize) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.creator.is_some() {
            return false;
        }
        inner.creator = Some(creator);
        inner.output_nr = output_nr;
        inner.requires_feedback = true;
        true
    }

    /// Mark a forward output that was not recorded in the graph.
    pub(crate) fn mark_untracked(&self, output_nr: usize) {
        let mut inner = self.inner.borrow_mut();
        inner.requires_feedback = false;
        inner.output_nr = output_nr;
    }

    /// Whether some recorded Function holds this Variable as an input.
    pub(crate) fn is_consumed(&self) -> bool {
        self.inner.borrow().consumed
    }

    pub(crate) fn mark_consumed(&self) {
        self.inner.borrow_mut().consumed = true;
    }

    /// Detach the creator if this handle is the last strong reference, so
    /// dropping the Variable afterwards does not recurse into its ancestry.
    pub(crate) fn take_creator_if_unshared(&self) -> Option<Function> {
        if Rc::strong_count(&self.inner) != 1 {
            return None;
        }
        self.inner.borrow_mut().creator.take()
    }

    pub(crate) fn downgrade(&self) -> WeakVariable {
        WeakVariable(Rc::downgrade(&self.inner))
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Variable")
            .field("id", &inner.id)
            .field("data", &inner.data)
            .field("role", &inner.role)
            .field("requires_feedback", &inner.requires_feedback)
            .field("feedback", &inner.feedback.len())
            .field("creator", &inner.creator.as_ref().map(Function::name))
            .finish()
    }
}

/// Non-owning reference to a Variable, held by its creator.
#[derive(Clone)]
pub(crate) struct WeakVariable(Weak<RefCell<VariableInner>>);

impl WeakVariable {
    pub(crate) fn upgrade(&self) -> Option<Variable> {
        self.0.upgrade().map(|inner| Variable { inner })
    }
}

impl fmt::Debug for WeakVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(v) => write!(f, "WeakVariable({})", v.id()),
            None => f.write_str("WeakVariable(dropped)"),
        }
    }
}
