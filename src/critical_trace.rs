//! Critical-trace collection and span forest assembly
//!
//! While a session runs, the CPU handler and device drainer push compact
//! [`CriticalEntry`] values into a [`CriticalTrace`]:
//!
//! ```text
//! CPU enter  -> Cpu Begin  {span, parent, depth, begin}
//! CPU exit   -> Cpu End    {span, end}
//! device rec -> Gpu Delta  {parent = CPU span, depth + 1, begin, end, priority = lap}
//! ```
//!
//! [`CriticalTrace::assemble`] turns the entries into a [`SpanForest`]: Begin/End
//! pairs merge into CPU nodes, Delta entries become device nodes, every node is
//! attached to its parent, and siblings are ordered by `(begin_ns, priority)`.
//! Structural problems are reported as [`ForestViolation`]s rather than errors.

use crate::span_id::{CorrelationId, SpanId, SpanIdentity};
use crate::span_record::SpanKind;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Mutex;

/// Index of a node inside a [`SpanForest`]
pub type NodeIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CriticalDevice {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CriticalPhase {
    Begin,
    End,
    /// Complete interval known up front
    Delta,
}

/// One critical-trace entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalEntry {
    pub device: CriticalDevice,
    pub phase: CriticalPhase,
    pub thread_id: u64,
    pub span_id: SpanId,
    pub correlation_id: Option<CorrelationId>,
    pub parent_span_id: Option<SpanId>,
    pub begin_ns: u64,
    pub end_ns: u64,
    pub queue_id: Option<u64>,
    pub name_hash: u64,
    pub depth: u16,
    pub priority: u32,
}

/// FNV-1a hash of an operation name
pub fn name_hash(name: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

impl CriticalEntry {
    pub fn cpu_begin(
        name: &str,
        thread_id: u64,
        identity: SpanIdentity,
        correlation_id: Option<CorrelationId>,
        begin_ns: u64,
        queue_id: Option<u64>,
    ) -> Self {
        Self {
            device: CriticalDevice::Cpu,
            phase: CriticalPhase::Begin,
            thread_id,
            span_id: identity.span_id,
            correlation_id,
            parent_span_id: identity.parent_span_id,
            begin_ns,
            end_ns: begin_ns,
            queue_id,
            name_hash: name_hash(name),
            depth: identity.depth,
            priority: 0,
        }
    }

    pub fn cpu_end(name: &str, thread_id: u64, identity: SpanIdentity, end_ns: u64) -> Self {
        Self {
            device: CriticalDevice::Cpu,
            phase: CriticalPhase::End,
            thread_id,
            span_id: identity.span_id,
            correlation_id: None,
            parent_span_id: identity.parent_span_id,
            begin_ns: end_ns,
            end_ns,
            queue_id: None,
            name_hash: name_hash(name),
            depth: identity.depth,
            priority: 0,
        }
    }

    /// Device interval under CPU span `parent`; `priority` is the lap ordinal
    #[allow(clippy::too_many_arguments)]
    pub fn gpu_delta(
        name: &str,
        thread_id: u64,
        parent: SpanIdentity,
        correlation_id: CorrelationId,
        begin_ns: u64,
        end_ns: u64,
        queue_id: u64,
        priority: u32,
    ) -> Self {
        Self {
            device: CriticalDevice::Gpu,
            phase: CriticalPhase::Delta,
            thread_id,
            span_id: parent.span_id,
            correlation_id: Some(correlation_id),
            parent_span_id: Some(parent.span_id),
            begin_ns,
            end_ns,
            queue_id: Some(queue_id),
            name_hash: name_hash(name),
            depth: parent.depth.saturating_add(1),
            priority,
        }
    }
}

/// Structural problem found during assembly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForestViolation {
    /// CPU Begin with no End
    UnmatchedBegin { span_id: SpanId },
    /// CPU End with no Begin
    UnmatchedEnd { span_id: SpanId },
    /// Parent id that no CPU span carries
    MissingParent { span_id: SpanId, parent_span_id: SpanId },
    /// `depth != parent.depth + 1`
    DepthMismatch {
        span_id: SpanId,
        expected: u16,
        actual: u16,
    },
}

/// One span in the assembled forest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForestNode {
    pub name: String,
    pub kind: SpanKind,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub depth: u16,
    pub thread_id: u64,
    pub correlation_id: Option<CorrelationId>,
    pub begin_ns: u64,
    pub end_ns: u64,
    pub priority: u32,
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
}

impl ForestNode {
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.begin_ns)
    }
}

/// Parent-linked spans, roots and children ordered by `(begin_ns, priority)`
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpanForest {
    pub nodes: Vec<ForestNode>,
    pub roots: Vec<NodeIndex>,
    pub violations: Vec<ForestViolation>,
}

impl SpanForest {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: NodeIndex) -> Option<&ForestNode> {
        self.nodes.get(index)
    }

    pub fn children(&self, index: NodeIndex) -> &[NodeIndex] {
        self.nodes
            .get(index)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Index of the CPU node carrying `span_id`
    pub fn find_cpu(&self, span_id: SpanId) -> Option<NodeIndex> {
        self.nodes
            .iter()
            .position(|n| n.kind == SpanKind::Cpu && n.span_id == span_id)
    }

    /// True when every device node hangs under a CPU node and no violations exist
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
            && self.nodes.iter().all(|n| match (n.kind, n.parent) {
                (SpanKind::Device, Some(p)) => self.nodes[p].kind == SpanKind::Cpu,
                _ => true,
            })
    }
}

/// Thread-safe collector of critical-trace entries
#[derive(Debug, Default)]
pub struct CriticalTrace {
    entries: Mutex<Vec<CriticalEntry>>,
    names: Mutex<HashMap<u64, String>>,
}

impl CriticalTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry; `name` resolves its hash at assembly time
    pub fn push(&self, name: &str, entry: CriticalEntry) {
        self.names
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(entry.name_hash)
            .or_insert_with(|| name.to_string());
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry);
    }

    pub fn entries(&self) -> Vec<CriticalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the span forest from every entry recorded so far
    pub fn assemble(&self) -> SpanForest {
        let entries = self.entries();
        let names = self
            .names
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        assemble_entries(&entries, &names)
    }
}

fn resolve(names: &HashMap<u64, String>, hash: u64) -> String {
    names
        .get(&hash)
        .cloned()
        .unwrap_or_else(|| format!("{:016x}", hash))
}

/// Assemble a forest from raw entries
pub fn assemble_entries(entries: &[CriticalEntry], names: &HashMap<u64, String>) -> SpanForest {
    let mut forest = SpanForest::default();
    let mut cpu_index: HashMap<SpanId, NodeIndex> = HashMap::new();
    let mut open: HashMap<SpanId, CriticalEntry> = HashMap::new();
    let mut devices: Vec<&CriticalEntry> = Vec::new();

    // CPU begin/end pairing
    for entry in entries {
        match (entry.device, entry.phase) {
            (CriticalDevice::Cpu, CriticalPhase::Begin) => {
                open.insert(entry.span_id, *entry);
            }
            (CriticalDevice::Cpu, CriticalPhase::End) => match open.remove(&entry.span_id) {
                Some(begin) => {
                    cpu_index.insert(begin.span_id, forest.nodes.len());
                    forest.nodes.push(ForestNode {
                        name: resolve(names, begin.name_hash),
                        kind: SpanKind::Cpu,
                        span_id: begin.span_id,
                        parent_span_id: begin.parent_span_id,
                        depth: begin.depth,
                        thread_id: begin.thread_id,
                        correlation_id: begin.correlation_id,
                        begin_ns: begin.begin_ns,
                        end_ns: entry.end_ns,
                        priority: begin.priority,
                        parent: None,
                        children: Vec::new(),
                    });
                }
                None => forest.violations.push(ForestViolation::UnmatchedEnd {
                    span_id: entry.span_id,
                }),
            },
            (CriticalDevice::Cpu, CriticalPhase::Delta) => {
                cpu_index.insert(entry.span_id, forest.nodes.len());
                forest.nodes.push(leaf_node(entry, names, SpanKind::Cpu));
            }
            (CriticalDevice::Gpu, _) => devices.push(entry),
        }
    }

    let mut unmatched: Vec<_> = open.into_keys().collect();
    unmatched.sort_unstable();
    forest.violations.extend(
        unmatched
            .into_iter()
            .map(|span_id| ForestViolation::UnmatchedBegin { span_id }),
    );

    for entry in devices {
        forest.nodes.push(leaf_node(entry, names, SpanKind::Device));
    }

    // parent links
    for index in 0..forest.nodes.len() {
        let (span_id, parent_span_id, depth) = {
            let node = &forest.nodes[index];
            (node.span_id, node.parent_span_id, node.depth)
        };
        let Some(parent_id) = parent_span_id else {
            forest.roots.push(index);
            continue;
        };

        match cpu_index.get(&parent_id).copied() {
            Some(parent) if parent != index => {
                let expected = forest.nodes[parent].depth.saturating_add(1);
                if depth != expected {
                    forest.violations.push(ForestViolation::DepthMismatch {
                        span_id,
                        expected,
                        actual: depth,
                    });
                }
                forest.nodes[index].parent = Some(parent);
                forest.nodes[parent].children.push(index);
            }
            _ => {
                forest.violations.push(ForestViolation::MissingParent {
                    span_id,
                    parent_span_id: parent_id,
                });
                forest.roots.push(index);
            }
        }
    }

    // sibling order
    let order_key = |nodes: &[ForestNode], i: NodeIndex| (nodes[i].begin_ns, nodes[i].priority);
    let mut roots = std::mem::take(&mut forest.roots);
    roots.sort_by_key(|&i| order_key(&forest.nodes, i));
    forest.roots = roots;
    for index in 0..forest.nodes.len() {
        let mut children = std::mem::take(&mut forest.nodes[index].children);
        children.sort_by_key(|&i| order_key(&forest.nodes, i));
        forest.nodes[index].children = children;
    }

    forest
}

fn leaf_node(entry: &CriticalEntry, names: &HashMap<u64, String>, kind: SpanKind) -> ForestNode {
    ForestNode {
        name: resolve(names, entry.name_hash),
        kind,
        span_id: entry.span_id,
        parent_span_id: entry.parent_span_id,
        depth: entry.depth,
        thread_id: entry.thread_id,
        correlation_id: entry.correlation_id,
        begin_ns: entry.begin_ns,
        end_ns: entry.end_ns,
        priority: entry.priority,
        parent: None,
        children: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> SpanId {
        SpanId::from_raw(raw)
    }

    fn cpu_pair(trace: &CriticalTrace, name: &str, identity: SpanIdentity, begin: u64, end: u64) {
        trace.push(
            name,
            CriticalEntry::cpu_begin(name, 7, identity, None, begin, None),
        );
        trace.push(name, CriticalEntry::cpu_end(name, 7, identity, end));
    }

    #[test]
    fn test_name_hash_is_stable() {
        assert_eq!(name_hash("hipMemcpy"), name_hash("hipMemcpy"));
        assert_ne!(name_hash("hipMemcpy"), name_hash("hipFree"));
    }

    #[test]
    fn test_assemble_cpu_with_device_laps() {
        let trace = CriticalTrace::new();
        let launch = SpanIdentity::root(id(1));
        cpu_pair(&trace, "hipLaunchKernel", launch, 100, 200);
        // second lap arrives first but begins later
        trace.push(
            "vector_add",
            CriticalEntry::gpu_delta("vector_add", 7, launch, 42, 150, 160, 0, 2),
        );
        trace.push(
            "vector_add",
            CriticalEntry::gpu_delta("vector_add", 7, launch, 42, 120, 140, 0, 1),
        );

        let forest = trace.assemble();
        assert_eq!(forest.len(), 3);
        assert_eq!(forest.roots.len(), 1);
        assert!(forest.is_consistent());

        let root = forest.roots[0];
        assert_eq!(forest.nodes[root].name, "hipLaunchKernel");
        let children = forest.children(root);
        assert_eq!(children.len(), 2);
        assert_eq!(forest.nodes[children[0]].priority, 1);
        assert_eq!(forest.nodes[children[1]].priority, 2);
        assert_eq!(forest.nodes[children[0]].depth, 1);
        assert_eq!(forest.nodes[children[0]].kind, SpanKind::Device);
    }

    #[test]
    fn test_nested_cpu_spans() {
        let trace = CriticalTrace::new();
        let outer = SpanIdentity::root(id(1));
        let inner = SpanIdentity::child_of(id(2), &outer);
        trace.push("outer", CriticalEntry::cpu_begin("outer", 0, outer, None, 0, None));
        cpu_pair(&trace, "inner", inner, 10, 20);
        trace.push("outer", CriticalEntry::cpu_end("outer", 0, outer, 30));

        let forest = trace.assemble();
        let outer_idx = forest.find_cpu(id(1)).unwrap();
        let inner_idx = forest.find_cpu(id(2)).unwrap();
        assert_eq!(forest.children(outer_idx), &[inner_idx]);
        assert_eq!(forest.nodes[inner_idx].parent, Some(outer_idx));
        assert!(forest.violations.is_empty());
    }

    #[test]
    fn test_orphan_device_is_root() {
        let trace = CriticalTrace::new();
        let mut entry = CriticalEntry::gpu_delta("COPY", 0, SpanIdentity::degraded(), 9, 5, 6, 0, 1);
        entry.parent_span_id = None;
        entry.depth = 0;
        trace.push("COPY", entry);

        let forest = trace.assemble();
        assert_eq!(forest.roots.len(), 1);
        assert!(forest.violations.is_empty());
    }

    #[test]
    fn test_violations_reported() {
        let trace = CriticalTrace::new();
        let open = SpanIdentity::root(id(5));
        trace.push("open", CriticalEntry::cpu_begin("open", 0, open, None, 0, None));
        trace.push("stray", CriticalEntry::cpu_end("stray", 0, SpanIdentity::root(id(6)), 9));
        trace.push(
            "k",
            CriticalEntry::gpu_delta("k", 0, SpanIdentity::root(id(77)), 1, 0, 1, 0, 1),
        );

        let forest = trace.assemble();
        assert!(forest
            .violations
            .contains(&ForestViolation::UnmatchedBegin { span_id: id(5) }));
        assert!(forest
            .violations
            .contains(&ForestViolation::UnmatchedEnd { span_id: id(6) }));
        assert!(forest.violations.contains(&ForestViolation::MissingParent {
            span_id: id(77),
            parent_span_id: id(77)
        }));
        assert!(!forest.is_consistent());
    }

    #[test]
    fn test_depth_mismatch() {
        let trace = CriticalTrace::new();
        let root = SpanIdentity::root(id(1));
        cpu_pair(&trace, "root", root, 0, 100);
        let mut bad = CriticalEntry::gpu_delta("k", 0, root, 1, 10, 20, 0, 1);
        bad.depth = 3;
        trace.push("k", bad);

        let forest = trace.assemble();
        assert_eq!(
            forest.violations,
            vec![ForestViolation::DepthMismatch {
                span_id: id(1),
                expected: 1,
                actual: 3
            }]
        );
    }
}
