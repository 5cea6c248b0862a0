//! Dependency graph utility shared by the queue manager and the orchestrator.
//!
//! Both callers validate a directed graph of "depends on" edges before
//! admitting new state: the orchestrator at workflow registration, the queue
//! manager at every `enqueue` that introduces a dependency set. `assert_acyclic`
//! is the single place that algorithm lives.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

/// A cycle was found while validating a dependency graph.
///
/// `node` is the identifier at which the back-edge was observed; `context`
/// is the caller-supplied string identifying which graph was being checked
/// (a workflow id, or "enqueue <job_id>").
#[derive(Debug, Clone, thiserror::Error)]
#[error("cycle detected at node {node:?} while validating {context}")]
pub struct CycleError {
    pub node: String,
    pub context: String,
}

/// Depth-first cycle detection over an adjacency mapping of node -> the set
/// of nodes it depends on (edges point from a node to its predecessors).
///
/// Uses the classic three-color scheme: a node is either unvisited, on the
/// current recursion stack ("gray"), or fully explored ("black"). An edge
/// into a gray node is a back-edge and signals a cycle. `O(V+E)`: each node
/// is pushed and popped from the recursion stack exactly once, and each edge
/// is examined exactly once.
pub fn assert_acyclic<N>(
    graph: &HashMap<N, Vec<N>>,
    context: impl Into<String>,
) -> Result<(), CycleError>
where
    N: Eq + Hash + Clone + Debug,
{
    let context = context.into();
    let mut state: HashMap<&N, Color> = HashMap::with_capacity(graph.len());

    for start in graph.keys() {
        if matches!(state.get(start), Some(Color::Black)) {
            continue;
        }
        visit(graph, start, &mut state, &context)?;
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

fn visit<'a, N>(
    graph: &'a HashMap<N, Vec<N>>,
    node: &'a N,
    state: &mut HashMap<&'a N, Color>,
    context: &str,
) -> Result<(), CycleError>
where
    N: Eq + Hash + Clone + Debug,
{
    match state.get(node) {
        Some(Color::Gray) => {
            return Err(CycleError {
                node: format!("{node:?}"),
                context: context.to_string(),
            })
        }
        Some(Color::Black) => return Ok(()),
        None => {}
    }

    state.insert(node, Color::Gray);
    if let Some(deps) = graph.get(node) {
        for dep in deps {
            visit(graph, dep, state, context)?;
        }
    }
    state.insert(node, Color::Black);
    Ok(())
}

/// Convenience wrapper: checks that adding `new_edges` (a node's dependency
/// list) to `existing` would not introduce a cycle, without mutating either
/// map. Used by `QueueManager::enqueue` and `WorkflowOrchestrator::register_workflow`
/// so callers don't have to clone the whole graph just to probe one insertion.
pub fn assert_acyclic_with_addition<N>(
    existing: &HashMap<N, Vec<N>>,
    node: N,
    new_edges: Vec<N>,
    context: impl Into<String>,
) -> Result<(), CycleError>
where
    N: Eq + Hash + Clone + Debug,
{
    let mut probe = existing.clone();
    probe.insert(node, new_edges);
    assert_acyclic(&probe, context)
}

/// Nodes reachable from `start` by following forward edges (successor lists),
/// inclusive of `start` itself. Used by the orchestrator's skip cascade to
/// find every descendant of a failed or skipped node that must itself be
/// marked `SKIPPED`.
pub fn reachable_from<N>(forward_edges: &HashMap<N, Vec<N>>, start: &N) -> HashSet<N>
where
    N: Eq + Hash + Clone,
{
    let mut seen: HashSet<N> = HashSet::new();
    let mut stack = vec![start.clone()];
    while let Some(n) = stack.pop() {
        if !seen.insert(n.clone()) {
            continue;
        }
        if let Some(successors) = forward_edges.get(&n) {
            for s in successors {
                if !seen.contains(s) {
                    stack.push(s.clone());
                }
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn accepts_dag() {
        let g = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        assert!(assert_acyclic(&g, "test").is_ok());
    }

    #[test]
    fn rejects_direct_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let err = assert_acyclic(&g, "wf-1").unwrap_err();
        assert_eq!(err.context, "wf-1");
    }

    #[test]
    fn rejects_self_loop() {
        let g = graph(&[("a", &["a"])]);
        assert!(assert_acyclic(&g, "test").is_err());
    }

    #[test]
    fn rejects_longer_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        assert!(assert_acyclic(&g, "test").is_err());
    }

    #[test]
    fn probing_addition_does_not_mutate_existing() {
        let existing = graph(&[("b", &["a"]), ("a", &[])]);
        let before = existing.clone();
        let result = assert_acyclic_with_addition(
            &existing,
            "c".to_string(),
            vec!["b".to_string()],
            "enqueue c",
        );
        assert!(result.is_ok());
        assert_eq!(existing, before);
    }

    #[test]
    fn probing_addition_detects_new_cycle() {
        let existing = graph(&[("b", &["a"])]);
        let result = assert_acyclic_with_addition(
            &existing,
            "a".to_string(),
            vec!["b".to_string()],
            "enqueue a",
        );
        assert!(result.is_err());
    }

    #[test]
    fn reachable_includes_start_and_transitive_successors() {
        let forward = graph(&[("a", &["b", "c"]), ("b", &["d"]), ("c", &[]), ("d", &[])]);
        let got = reachable_from(&forward, &"a".to_string());
        assert_eq!(
            got,
            ["a", "b", "c", "d"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        );
    }
}
