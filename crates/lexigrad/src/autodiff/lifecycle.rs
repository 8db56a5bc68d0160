//! Graph retention and release.
//!
//! A graph lives as long as some Variable references it: outputs own their
//! creator and a Function owns its inputs. Releasing a Function drops the
//! inputs it holds, so the part of the graph only reachable through it is
//! reclaimed as soon as the caller lets go of those Variables. A backward pass
//! releases what it traversed unless `retain_graph` is set; [`release_graph`]
//! does the same on demand for retained graphs.

use super::function::{Function, FunctionId};
use super::variable::{Variable, VariableId};
use log::debug;
use std::collections::{HashSet, VecDeque};

/// Counts describing the graph reachable from a Variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    /// Functions reachable through creator links.
    pub functions: usize,
    /// Of those, Functions whose wiring was released.
    pub released: usize,
    /// Distinct Variables reachable, the root included.
    pub variables: usize,
    /// Of those, leaves.
    pub leaves: usize,
}

/// Functions reachable from `root`, in breadth-first discovery order.
///
/// A released Function is listed but not expanded further.
pub fn ancestry(root: &Variable) -> Vec<Function> {
    walk(root).0
}

/// Count the Functions and Variables reachable from `root`.
pub fn graph_stats(root: &Variable) -> GraphStats {
    let (functions, variables) = walk(root);
    GraphStats {
        functions: functions.len(),
        released: functions.iter().filter(|f| f.is_released()).count(),
        variables: variables.len(),
        leaves: variables.iter().filter(|v| v.is_leaf()).count(),
    }
}

/// Release every Function reachable from `root`.
///
/// Returns the number of Functions released by this call. Any later backward
/// pass reaching one of them fails with
/// [`GraphError::GraphReleased`](crate::error::GraphError::GraphReleased).
pub fn release_graph(root: &Variable) -> usize {
    let functions = ancestry(root);
    let released = functions.iter().filter(|f| f.release()).count();
    debug!("released {released} of {} function(s) from {}", functions.len(), root.id());
    released
}

/// Clear the feedback buffer of every Variable reachable from `root`, the
/// root included.
///
/// Use it to discard the partial feedback of an aborted pass before running
/// the graph again. Returns the number of Variables cleared.
pub fn clear_graph_feedback(root: &Variable) -> usize {
    let (_, variables) = walk(root);
    for variable in &variables {
        variable.clear_feedback();
    }
    debug!("cleared feedback of {} variable(s) from {}", variables.len(), root.id());
    variables.len()
}

fn walk(root: &Variable) -> (Vec<Function>, Vec<Variable>) {
    let mut functions = Vec::new();
    let mut variables = Vec::new();
    let mut seen_functions: HashSet<FunctionId> = HashSet::new();
    let mut seen_variables: HashSet<VariableId> = HashSet::new();
    let mut queue = VecDeque::from([root.clone()]);

    while let Some(variable) = queue.pop_front() {
        if !seen_variables.insert(variable.id()) {
            continue;
        }
        if let Some(creator) = variable.creator() {
            if seen_functions.insert(creator.id()) {
                if let Ok(inputs) = creator.wired_inputs() {
                    queue.extend(inputs);
                }
                functions.push(creator);
            }
        }
        variables.push(variable);
    }
    (functions, variables)
}
