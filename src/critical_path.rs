//! Critical path analysis over an assembled span forest
//!
//! The **critical path** is the root-to-leaf chain with the largest summed span
//! duration. On a heterogeneous trace it shows which CPU call and which device
//! operation beneath it dominate.
//!
//! # Algorithm: Longest Path via Dynamic Programming
//!
//! The forest is a DAG (every node has at most one parent), so one pass in
//! topological order suffices:
//!
//! ```text
//! 1. Topological order: iterative DFS from every root
//! 2. For each node v in that order:
//!    dist[v] = dist[parent(v)] + duration(v)
//! 3. Critical path = chain ending at the node with maximum dist
//! ```
//!
//! # Example Trace
//!
//! ```text
//! hipLaunchKernel (1000ns)
//! ├─ vector_add lap 1 (500ns)    ← Not on critical path
//! └─ vector_add lap 2 (2000ns)   ← On critical path
//!
//! Critical path: hipLaunchKernel → vector_add lap 2
//! Total duration: 1000 + 2000 = 3000ns
//! ```
//!
//! # Example
//!
//! ```
//! use hetrace::critical_path::find_critical_path;
//! use hetrace::critical_trace::{CriticalEntry, CriticalTrace};
//! use hetrace::span_id::{SpanId, SpanIdentity};
//!
//! # fn main() -> anyhow::Result<()> {
//! let trace = CriticalTrace::new();
//! let launch = SpanIdentity::root(SpanId::from_raw(1));
//! trace.push("hipLaunchKernel", CriticalEntry::cpu_begin("hipLaunchKernel", 0, launch, Some(42), 0, None));
//! trace.push("hipLaunchKernel", CriticalEntry::cpu_end("hipLaunchKernel", 0, launch, 1000));
//! trace.push("vector_add", CriticalEntry::gpu_delta("vector_add", 0, launch, 42, 1000, 3000, 0, 1));
//!
//! let result = find_critical_path(&trace.assemble())?;
//! assert_eq!(result.total_duration, 3000);
//! assert_eq!(result.span_names, vec!["hipLaunchKernel", "vector_add"]);
//! # Ok(())
//! # }
//! ```

use crate::critical_trace::{NodeIndex, SpanForest};
use anyhow::{Context, Result};
use std::collections::HashMap;

/// Result of critical path analysis
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalPathResult {
    /// Nodes on the critical path (in order from root to leaf)
    pub path: Vec<NodeIndex>,

    /// Total duration of the critical path (nanoseconds)
    pub total_duration: u64,

    /// Per-node durations on the critical path
    pub node_durations: HashMap<NodeIndex, u64>,

    /// Span names on the critical path
    pub span_names: Vec<String>,
}

impl CriticalPathResult {
    /// Percentage (0.0 to 100.0) of `total_trace_duration` on the critical path
    pub fn critical_path_percentage(&self, total_trace_duration: u64) -> f64 {
        if total_trace_duration == 0 {
            return 0.0;
        }
        (self.total_duration as f64 / total_trace_duration as f64) * 100.0
    }

    /// Get the longest span on the critical path (biggest bottleneck)
    pub fn longest_span(&self) -> Option<(NodeIndex, u64)> {
        self.node_durations
            .iter()
            .max_by_key(|(&node, &duration)| (duration, std::cmp::Reverse(node)))
            .map(|(&node, &duration)| (node, duration))
    }

    pub fn is_on_critical_path(&self, node: NodeIndex) -> bool {
        self.path.contains(&node)
    }
}

/// Find the critical path (longest root-to-leaf chain) through the forest
///
/// # Performance
///
/// - Time complexity: O(V)
/// - Space complexity: O(V)
pub fn find_critical_path(forest: &SpanForest) -> Result<CriticalPathResult> {
    if forest.is_empty() {
        return Ok(CriticalPathResult {
            path: Vec::new(),
            total_duration: 0,
            node_durations: HashMap::new(),
            span_names: Vec::new(),
        });
    }

    let topo_order = topological_order(forest)?;

    let mut dist: HashMap<NodeIndex, u64> = HashMap::new();
    let mut parent: HashMap<NodeIndex, Option<NodeIndex>> = HashMap::new();

    for &node in &topo_order {
        let span = forest
            .node(node)
            .context("Span not found in forest")?;
        let inherited = span
            .parent
            .and_then(|p| dist.get(&p).copied())
            .unwrap_or(0);
        dist.insert(node, inherited + span.duration_ns());
        parent.insert(node, span.parent.filter(|p| dist.contains_key(p)));
    }

    // earliest node wins ties so the result is deterministic
    let (&critical_end, &total_duration) = topo_order
        .iter()
        .filter_map(|n| dist.get_key_value(n))
        .fold(None, |best: Option<(&NodeIndex, &u64)>, cur| match best {
            Some(b) if *b.1 >= *cur.1 => Some(b),
            _ => Some(cur),
        })
        .context("No paths found in forest")?;

    let mut path = Vec::new();
    let mut node_durations = HashMap::new();
    let mut span_names = Vec::new();
    let mut current = critical_end;

    loop {
        path.push(current);
        if let Some(span) = forest.node(current) {
            node_durations.insert(current, span.duration_ns());
            span_names.push(span.name.clone());
        }

        match parent.get(&current) {
            Some(Some(p)) => current = *p,
            _ => break,
        }
    }

    path.reverse();
    span_names.reverse();

    Ok(CriticalPathResult {
        path,
        total_duration,
        node_durations,
        span_names,
    })
}

/// Parents before children, roots in forest order
fn topological_order(forest: &SpanForest) -> Result<Vec<NodeIndex>> {
    let mut visited = vec![false; forest.len()];
    let mut order = Vec::with_capacity(forest.len());
    let mut stack: Vec<NodeIndex> = forest.roots.iter().rev().copied().collect();

    while let Some(node) = stack.pop() {
        let seen = visited
            .get_mut(node)
            .with_context(|| format!("Node {} out of range", node))?;
        if *seen {
            anyhow::bail!("Forest contains a cycle at node {}", node);
        }
        *seen = true;
        order.push(node);
        stack.extend(forest.children(node).iter().rev().copied());
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critical_trace::{CriticalEntry, CriticalTrace};
    use crate::span_id::{SpanId, SpanIdentity};

    fn create_span(
        trace: &CriticalTrace,
        span_id: u64,
        parent: Option<SpanIdentity>,
        begin: u64,
        duration: u64,
    ) -> SpanIdentity {
        let id = SpanId::from_raw(span_id);
        let identity = match parent {
            Some(p) => SpanIdentity::child_of(id, &p),
            None => SpanIdentity::root(id),
        };
        let name = format!("span_{}", span_id);
        trace.push(&name, CriticalEntry::cpu_begin(&name, 0, identity, None, begin, None));
        trace.push(&name, CriticalEntry::cpu_end(&name, 0, identity, begin + duration));
        identity
    }

    #[test]
    fn test_empty_forest() {
        let result = find_critical_path(&SpanForest::default()).unwrap();
        assert_eq!(result.path.len(), 0);
        assert_eq!(result.total_duration, 0);
    }

    #[test]
    fn test_single_span() {
        let trace = CriticalTrace::new();
        create_span(&trace, 1, None, 0, 1000);

        let result = find_critical_path(&trace.assemble()).unwrap();
        assert_eq!(result.path.len(), 1);
        assert_eq!(result.total_duration, 1000);
        assert_eq!(result.span_names, vec!["span_1"]);
    }

    #[test]
    fn test_linear_path() {
        let trace = CriticalTrace::new();
        let root = create_span(&trace, 1, None, 0, 1000);
        let child = create_span(&trace, 2, Some(root), 10, 500);
        create_span(&trace, 3, Some(child), 20, 700);

        let result = find_critical_path(&trace.assemble()).unwrap();
        assert_eq!(result.path.len(), 3);
        assert_eq!(result.total_duration, 1000 + 500 + 700);
        assert_eq!(result.span_names, vec!["span_1", "span_2", "span_3"]);
    }

    #[test]
    fn test_branching_path() {
        let trace = CriticalTrace::new();
        let root = create_span(&trace, 1, None, 0, 1000);
        create_span(&trace, 2, Some(root), 10, 500);
        create_span(&trace, 3, Some(root), 20, 2000);

        let result = find_critical_path(&trace.assemble()).unwrap();
        assert_eq!(result.path.len(), 2);
        assert_eq!(result.total_duration, 1000 + 2000);
        assert_eq!(result.span_names, vec!["span_1", "span_3"]);
    }

    #[test]
    fn test_device_lap_on_critical_path() {
        let trace = CriticalTrace::new();
        let launch = create_span(&trace, 1, None, 0, 100);
        trace.push("k", CriticalEntry::gpu_delta("k", 0, launch, 42, 100, 150, 0, 1));
        trace.push("k", CriticalEntry::gpu_delta("k", 0, launch, 42, 150, 400, 0, 2));

        let forest = trace.assemble();
        let result = find_critical_path(&forest).unwrap();
        assert_eq!(result.total_duration, 100 + 250);
        let leaf = *result.path.last().unwrap();
        assert_eq!(forest.nodes[leaf].priority, 2);
    }

    #[test]
    fn test_longest_span_and_membership() {
        let trace = CriticalTrace::new();
        let root = create_span(&trace, 1, None, 0, 500);
        let child = create_span(&trace, 2, Some(root), 10, 2000);
        create_span(&trace, 3, Some(child), 20, 300);
        create_span(&trace, 4, Some(root), 30, 10);

        let forest = trace.assemble();
        let result = find_critical_path(&forest).unwrap();

        let (longest_node, duration) = result.longest_span().unwrap();
        assert_eq!(duration, 2000);
        assert_eq!(forest.nodes[longest_node].name, "span_2");
        let short = forest.find_cpu(SpanId::from_raw(4)).unwrap();
        assert!(!result.is_on_critical_path(short));
    }

    #[test]
    fn test_critical_path_percentage() {
        let trace = CriticalTrace::new();
        let root = create_span(&trace, 1, None, 0, 1000);
        create_span(&trace, 2, Some(root), 10, 2000);

        let result = find_critical_path(&trace.assemble()).unwrap();
        assert_eq!(result.critical_path_percentage(5000), 60.0);
        assert_eq!(result.critical_path_percentage(0), 0.0);
    }
}
