//! Backward pass execution for textual reverse-mode differentiation.

use super::feedback::Feedback;
use super::function::{Function, FunctionId};
use super::variable::{Variable, VariableId};
use crate::error::{GraphError, Result};
use crate::observer::{GraphObserver, Phase};
use log::{debug, trace, warn};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

/// What to do when a Function's backward step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop scheduling and return the error (default).
    #[default]
    Abort,
    /// Record the error, give the failed Function's inputs nothing, and keep
    /// going with the remaining Functions.
    Continue,
}

/// Options for one backward traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackwardOptions {
    /// Keep the forward wiring so the graph can be traversed again.
    pub retain_graph: bool,

    /// Failure handling for backward steps.
    pub on_failure: FailurePolicy,

    /// Skip inputs with `requires_feedback == false`: they get no feedback
    /// and their ancestry is not visited.
    pub skip_frozen_inputs: bool,

    /// Refuse traversals reaching more Functions than this.
    pub max_functions: Option<usize>,
}

impl Default for BackwardOptions {
    fn default() -> Self {
        Self {
            retain_graph: false,
            on_failure: FailurePolicy::Abort,
            skip_frozen_inputs: true,
            max_functions: None,
        }
    }
}

impl BackwardOptions {
    /// Set `retain_graph`.
    pub fn with_retain_graph(mut self, retain_graph: bool) -> Self {
        self.retain_graph = retain_graph;
        self
    }

    /// Set the failure policy.
    pub fn with_failure_policy(mut self, on_failure: FailurePolicy) -> Self {
        self.on_failure = on_failure;
        self
    }

    /// Set the Function limit.
    pub fn with_max_functions(mut self, max_functions: usize) -> Self {
        self.max_functions = Some(max_functions);
        self
    }

    /// Validate option values.
    pub fn validate(&self) -> Result<()> {
        if self.max_functions == Some(0) {
            return Err(GraphError::Config("max_functions must be >= 1".to_string()));
        }
        Ok(())
    }

    /// Load from a JSON string. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| GraphError::Config(format!("JSON parse error: {e}")))?;
        options.validate()?;
        Ok(options)
    }
}

/// A Function as seen by one traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledFunction {
    pub id: FunctionId,
    pub name: String,
}

impl From<&Function> for ScheduledFunction {
    fn from(function: &Function) -> Self {
        Self {
            id: function.id(),
            name: function.name().to_string(),
        }
    }
}

/// Outcome of a traversal.
#[derive(Debug, Default)]
pub struct BackwardReport {
    /// Functions whose backward step was invoked, in scheduling order.
    pub executed: Vec<ScheduledFunction>,
    /// Functions none of whose outputs received feedback.
    pub skipped: Vec<ScheduledFunction>,
    /// Failed backward steps ([`FailurePolicy::Continue`] only).
    pub failures: Vec<GraphError>,
    /// Whether the traversed wiring was released afterwards.
    pub released: bool,
}

impl BackwardReport {
    /// Names of executed Functions, in scheduling order.
    pub fn executed_names(&self) -> Vec<&str> {
        self.executed.iter().map(|f| f.name.as_str()).collect()
    }

    /// True if no backward step failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reverse-topological executor for backward passes.
///
/// A Function runs only after every Function consuming one of its outputs
/// (within the traversed subgraph) has run, so all feedback for its outputs
/// is present. Ties are broken by discovery order, which makes the schedule
/// identical across runs on the same graph.
///
/// # Example
///
/// ```ignore
/// use lexigrad::autodiff::{BackwardEngine, BackwardOptions, Feedback};
///
/// let engine = BackwardEngine::new(BackwardOptions::default().with_retain_graph(true));
/// let report = engine.run(&loss, Feedback::from("target was 24")).unwrap();
/// println!("{:?}", report.executed_names());
/// ```
#[derive(Default)]
pub struct BackwardEngine {
    options: BackwardOptions,
    observer: Option<Rc<dyn GraphObserver>>,
}

impl BackwardEngine {
    /// Engine with `options` and no observer.
    pub fn new(options: BackwardOptions) -> Self {
        Self {
            options,
            observer: None,
        }
    }

    /// Report traversal events to `observer`.
    pub fn with_observer(mut self, observer: Rc<dyn GraphObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Options this engine runs with.
    pub fn options(&self) -> &BackwardOptions {
        &self.options
    }

    /// Propagate `initial_feedback` from `root` to all of its ancestors.
    ///
    /// # Errors
    /// - [`GraphError::NoFeedbackRequired`] if `root` does not require feedback.
    /// - [`GraphError::GraphReleased`] if the graph was released by an earlier
    ///   pass. Nothing is accumulated in that case.
    /// - [`GraphError::BackwardComputation`] / [`GraphError::ContractViolation`]
    ///   from a failing step under [`FailurePolicy::Abort`]. Feedback applied
    ///   before the failing step stays; the failing step contributes nothing.
    /// - [`GraphError::IncompleteFeedback`] if the schedule could not order
    ///   every Function.
    pub fn run(&self, root: &Variable, initial_feedback: Feedback) -> Result<BackwardReport> {
        self.run_many(&[(root.clone(), initial_feedback)])
    }

    /// Traverse the joint ancestry of several roots in one pass.
    pub fn run_many(&self, roots: &[(Variable, Feedback)]) -> Result<BackwardReport> {
        self.options.validate()?;
        if roots.is_empty() {
            return Err(GraphError::InvalidInput(
                "backward requires at least one root".to_string(),
            ));
        }
        for (root, _) in roots {
            if !root.requires_feedback() {
                return Err(GraphError::NoFeedbackRequired {
                    variable: root.label(),
                });
            }
        }

        let plan = self.discover(roots)?;
        debug!(
            "backward from {} root(s): {} function(s) reachable",
            roots.len(),
            plan.graph.node_count()
        );

        // Contributions produced during this run, handed to creators.
        let mut pending_feedback: HashMap<VariableId, Vec<Feedback>> = HashMap::new();
        for (root, feedback) in roots {
            self.accumulate(root, feedback.clone(), &mut pending_feedback);
        }

        let mut report = BackwardReport::default();
        let mut remaining = plan.consumer_counts();
        let mut ready: BTreeSet<NodeIndex> = plan
            .graph
            .node_indices()
            .filter(|idx| remaining[idx.index()] == 0)
            .collect();

        while let Some(idx) = ready.pop_first() {
            let function = plan.graph[idx].clone();
            self.process(&function, &mut pending_feedback, &mut report)?;

            for producer in plan.graph.neighbors_directed(idx, Direction::Outgoing) {
                let count = &mut remaining[producer.index()];
                *count -= 1;
                if *count == 0 {
                    ready.insert(producer);
                }
            }
        }

        // a Function left with consumers means the schedule never reached it
        if let Some(idx) = plan.graph.node_indices().find(|idx| remaining[idx.index()] != 0) {
            let function = &plan.graph[idx];
            return Err(GraphError::IncompleteFeedback {
                function: function.id(),
                name: function.name().to_string(),
                pending: remaining[idx.index()],
            });
        }

        if !self.options.retain_graph && report.is_complete() {
            for function in plan.graph.node_weights() {
                function.release();
            }
            report.released = true;
            debug!("released {} function(s)", plan.graph.node_count());
        }

        debug!(
            "backward finished: {} executed, {} skipped, {} failed",
            report.executed.len(),
            report.skipped.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Run one Function's backward step and apply its contributions.
    fn process(
        &self,
        function: &Function,
        pending_feedback: &mut HashMap<VariableId, Vec<Feedback>>,
        report: &mut BackwardReport,
    ) -> Result<()> {
        let output_feedback: Vec<Vec<Feedback>> = function
            .outputs()
            .iter()
            .map(|output| {
                output
                    .as_ref()
                    .and_then(|v| pending_feedback.remove(&v.id()))
                    .unwrap_or_default()
            })
            .collect();

        if output_feedback.iter().all(Vec::is_empty) {
            trace!("skipping {function:?}: no feedback reached its outputs");
            report.skipped.push(function.into());
            return Ok(());
        }

        trace!("running {function:?}");
        report.executed.push(function.into());

        let slots = match function.call_backward(&output_feedback) {
            Ok(slots) => slots,
            Err(err) => match self.options.on_failure {
                FailurePolicy::Abort => return Err(err),
                FailurePolicy::Continue => {
                    warn!("{err}; continuing with the remaining functions");
                    report.failures.push(err);
                    return Ok(());
                }
            },
        };
        if let Some(observer) = &self.observer {
            observer.function_executed(function, Phase::Backward);
        }

        let inputs = function.wired_inputs()?;
        for (input, slot) in inputs.iter().zip(slots) {
            let Some(feedback) = slot else { continue };
            if self.options.skip_frozen_inputs && !input.requires_feedback() {
                trace!("dropping feedback for frozen input {}", input.id());
                continue;
            }
            self.accumulate(input, feedback, pending_feedback);
        }
        Ok(())
    }

    fn accumulate(
        &self,
        variable: &Variable,
        feedback: Feedback,
        pending_feedback: &mut HashMap<VariableId, Vec<Feedback>>,
    ) {
        trace!("feedback for {}: {:?}", variable.id(), feedback.content());
        if let Some(observer) = &self.observer {
            observer.feedback_accumulated(variable, &feedback);
        }
        variable.accumulate_feedback(feedback.clone());
        pending_feedback
            .entry(variable.id())
            .or_default()
            .push(feedback);
    }

    /// Collect the Functions reachable from the roots.
    ///
    /// Node indices follow breadth-first discovery order. Edges point from a
    /// consumer to the producer of one of its inputs.
    fn discover(&self, roots: &[(Variable, Feedback)]) -> Result<Plan> {
        let mut plan = Plan::default();
        let mut queue = VecDeque::new();

        for (root, _) in roots {
            if let Some(creator) = root.creator() {
                if let Some(idx) = plan.insert(creator, self.options.max_functions)? {
                    queue.push_back(idx);
                }
            }
        }

        while let Some(idx) = queue.pop_front() {
            let inputs = plan.graph[idx].wired_inputs()?;
            for input in inputs {
                if self.options.skip_frozen_inputs && !input.requires_feedback() {
                    continue;
                }
                let Some(producer) = input.creator() else {
                    continue;
                };
                let producer_id = producer.id();
                if let Some(new_idx) = plan.insert(producer, self.options.max_functions)? {
                    queue.push_back(new_idx);
                }
                let producer_idx = plan.index[&producer_id];
                plan.graph.update_edge(idx, producer_idx, ());
            }
        }
        Ok(plan)
    }
}

impl fmt::Debug for BackwardEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackwardEngine")
            .field("options", &self.options)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Plan {
    graph: DiGraph<Function, ()>,
    index: HashMap<FunctionId, NodeIndex>,
}

impl Plan {
    /// Add `function` unless already present; returns the new index.
    fn insert(&mut self, function: Function, limit: Option<usize>) -> Result<Option<NodeIndex>> {
        if self.index.contains_key(&function.id()) {
            return Ok(None);
        }
        if let Some(limit) = limit {
            if self.graph.node_count() >= limit {
                return Err(GraphError::InvalidInput(format!(
                    "backward reaches more than {limit} functions"
                )));
            }
        }
        let id = function.id();
        let idx = self.graph.add_node(function);
        self.index.insert(id, idx);
        Ok(Some(idx))
    }

    /// Number of distinct traversed consumers of each Function.
    fn consumer_counts(&self) -> Vec<usize> {
        self.graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect()
    }
}
