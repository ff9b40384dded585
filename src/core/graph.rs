//! # Test Graph Module / 测试图模块
//!
//! Freezes the nodes supplied by the discovery layer into an arena laid out in
//! depth-first pre-order, resolves dependency edges, rejects cycles, and answers
//! the ordering and master-discovery queries the planner needs.
//!
//! 将发现层提供的节点冻结到按深度优先前序排列的数组中，解析依赖边，拒绝环，
//! 并回答执行计划所需的排序和主节点发现查询。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::core::error::{CycleError, GraphError};
use crate::core::models::{DependencyEdge, NodeId, NodeIndex, NodeSpec, TestNode};

/// An immutable tree of test nodes with dependency edges.
/// 带有依赖边的不可变测试节点树。
#[derive(Debug)]
pub struct TestGraph {
    nodes: Vec<TestNode>,
    roots: Vec<NodeIndex>,
    index: HashMap<NodeId, NodeIndex>,
}

impl TestGraph {
    /// Builds and validates a graph. Fails without returning anything partial
    /// when an identifier is duplicated or unknown, or when the dependency
    /// relation (together with containment) has a cycle.
    ///
    /// 构建并验证图。当标识符重复或未知，或依赖关系（连同包含关系）存在环时失败，
    /// 且不会返回任何部分结果。
    pub fn build(roots: Vec<NodeSpec>, edges: Vec<DependencyEdge>) -> Result<Self, GraphError> {
        let mut graph = TestGraph {
            nodes: Vec::new(),
            roots: Vec::new(),
            index: HashMap::new(),
        };

        for spec in roots {
            let root = graph.insert(spec, None)?;
            graph.roots.push(root);
        }

        for edge in edges {
            let dependent = graph.lookup(&edge.dependent)?;
            let dependency = graph.lookup(&edge.dependency)?;
            let dependencies = &mut graph.nodes[dependent.0].dependencies;
            if !dependencies.contains(&dependency) {
                dependencies.push(dependency);
            }
        }

        // A child always runs inside its parent's scope, so containment takes
        // part in cycle detection: depending on an ancestor is a cycle.
        let cycle = find_cycle(graph.nodes.len(), |n| {
            let node = &graph.nodes[n];
            node.dependencies
                .iter()
                .chain(node.children.iter())
                .map(|idx| idx.0)
                .collect::<Vec<_>>()
        });
        if let Some(members) = cycle {
            return Err(CycleError {
                participants: members
                    .into_iter()
                    .map(|n| graph.nodes[n].id.clone())
                    .collect(),
            }
            .into());
        }

        Ok(graph)
    }

    fn insert(&mut self, spec: NodeSpec, parent: Option<NodeIndex>) -> Result<NodeIndex, GraphError> {
        let idx = NodeIndex(self.nodes.len());
        if self.index.insert(spec.id.clone(), idx).is_some() {
            return Err(GraphError::DuplicateId(spec.id));
        }

        self.nodes.push(TestNode {
            id: spec.id,
            is_test_case: spec.is_test_case,
            parent,
            children: Vec::with_capacity(spec.children.len()),
            dependencies: Vec::new(),
            execution_factory: spec.execution_factory,
            properties: spec.properties,
            subtree_len: 1,
        });

        for child in spec.children {
            let child_idx = self.insert(child, Some(idx))?;
            self.nodes[idx.0].children.push(child_idx);
        }

        self.nodes[idx.0].subtree_len = self.nodes.len() - idx.0;
        Ok(idx)
    }

    fn lookup(&self, id: &NodeId) -> Result<NodeIndex, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(id.clone()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: NodeIndex) -> &TestNode {
        &self.nodes[idx.0]
    }

    pub fn find(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    /// All node indices in declaration order.
    pub fn indices(&self) -> impl DoubleEndedIterator<Item = NodeIndex> + '_ {
        (0..self.nodes.len()).map(NodeIndex)
    }

    /// The node and all of its descendants, in pre-order.
    pub fn subtree(&self, idx: NodeIndex) -> impl DoubleEndedIterator<Item = NodeIndex> + '_ {
        let end = idx.0 + self.nodes[idx.0].subtree_len;
        (idx.0..end).map(NodeIndex)
    }

    /// Whether `node` lies in the subtree rooted at `ancestor` (inclusive).
    pub fn contains(&self, ancestor: NodeIndex, node: NodeIndex) -> bool {
        node.0 >= ancestor.0 && node.0 < ancestor.0 + self.nodes[ancestor.0].subtree_len
    }

    /// Ancestors of a node, nearest first.
    pub fn ancestors(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        std::iter::successors(self.nodes[idx.0].parent, move |p| self.nodes[p.0].parent)
    }

    /// A linear extension of the dependency order. Independent nodes keep
    /// their declaration order, so the result is the same on every call.
    ///
    /// 依赖顺序的一个线性扩展。相互独立的节点保持声明顺序，因此每次调用结果相同。
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        let (order, _blocked) = linear_extension(self.nodes.len(), |n| {
            self.nodes[n].dependencies.iter().map(|d| d.0).collect()
        });
        order.into_iter().map(NodeIndex).collect()
    }

    /// Master nodes discovered at the shallowest depth of every branch,
    /// in pre-order. The search does not descend into a master.
    pub fn top_level_masters(&self) -> Vec<NodeIndex> {
        let mut found = Vec::new();
        for &root in &self.roots {
            self.collect_masters(root, &mut found);
        }
        found
    }

    /// Masters nested inside `master`, found by a fresh search started from
    /// its children. Only the shallowest nested masters are returned.
    pub fn nested_masters(&self, master: NodeIndex) -> Vec<NodeIndex> {
        let mut found = Vec::new();
        for &child in &self.nodes[master.0].children {
            self.collect_masters(child, &mut found);
        }
        found
    }

    /// Every master in the graph: each shallowest master is followed by the
    /// masters nested inside it.
    ///
    /// 图中的所有主节点：每个最浅层主节点之后紧跟嵌套在其中的主节点。
    pub fn master_nodes(&self) -> Vec<NodeIndex> {
        let mut all = Vec::new();
        let mut pending: Vec<NodeIndex> = self.top_level_masters();
        pending.reverse();
        while let Some(master) = pending.pop() {
            all.push(master);
            let mut nested = self.nested_masters(master);
            nested.reverse();
            pending.extend(nested);
        }
        all
    }

    fn collect_masters(&self, start: NodeIndex, found: &mut Vec<NodeIndex>) {
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx.0];
            if node.is_master() {
                found.push(idx);
                continue;
            }
            stack.extend(node.children.iter().rev().copied());
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first white/gray/black colouring over `count` vertices. Returns the
/// members of the first cycle met, in traversal order.
pub(crate) fn find_cycle<F>(count: usize, successors: F) -> Option<Vec<usize>>
where
    F: Fn(usize) -> Vec<usize>,
{
    let mut color = vec![Color::White; count];

    for start in 0..count {
        if color[start] != Color::White {
            continue;
        }

        // Each frame is a vertex plus the successors still to visit.
        let mut stack: Vec<(usize, std::vec::IntoIter<usize>)> =
            vec![(start, successors(start).into_iter())];
        color[start] = Color::Gray;

        while let Some((vertex, pending)) = stack.last_mut() {
            match pending.next() {
                Some(next) => match color[next] {
                    Color::White => {
                        color[next] = Color::Gray;
                        stack.push((next, successors(next).into_iter()));
                    }
                    Color::Gray => {
                        let from = stack
                            .iter()
                            .position(|(v, _)| *v == next)
                            .unwrap_or(0);
                        return Some(stack[from..].iter().map(|(v, _)| *v).collect());
                    }
                    Color::Black => {}
                },
                None => {
                    color[*vertex] = Color::Black;
                    stack.pop();
                }
            }
        }
    }

    None
}

/// Kahn's algorithm with ties broken by the smallest index. Returns the
/// ordered vertices and, separately, those that could never be released
/// because they sit on or behind a cycle.
pub(crate) fn linear_extension<F>(count: usize, predecessors: F) -> (Vec<usize>, Vec<usize>)
where
    F: Fn(usize) -> Vec<usize>,
{
    let mut remaining = vec![0usize; count];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];

    for vertex in 0..count {
        let mut preds = predecessors(vertex);
        preds.sort_unstable();
        preds.dedup();
        remaining[vertex] = preds.len();
        for pred in preds {
            successors[pred].push(vertex);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..count)
        .filter(|&v| remaining[v] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(count);

    while let Some(Reverse(vertex)) = ready.pop() {
        order.push(vertex);
        for &next in &successors[vertex] {
            remaining[next] -= 1;
            if remaining[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    let blocked = (0..count).filter(|&v| remaining[v] > 0).collect();
    (order, blocked)
}
