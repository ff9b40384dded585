//! # Data Models Module / 数据模型模块
//!
//! This module defines the core data structures used throughout the plan runner:
//! node identifiers, node specifications supplied by the discovery layer, frozen
//! test nodes, terminal statuses, progress events and the final run report.
//!
//! 此模块定义了整个计划运行器中使用的核心数据结构：
//! 节点标识符、由发现层提供的节点规格、冻结的测试节点、终止状态、进度事件以及最终的运行报告。

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use crate::core::controller::ExecutionFactory;
use crate::core::error::TeardownWarning;

/// A stable identifier for a test node.
/// 测试节点的稳定标识符。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Position of a node inside a frozen [`TestGraph`](crate::core::graph::TestGraph).
/// Indices follow depth-first pre-order, which is also declaration order.
///
/// 节点在冻结的测试图中的位置。索引遵循深度优先前序，即声明顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub(crate) usize);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A node as supplied by the discovery layer, before the graph is frozen.
/// Children are nested; dependencies are declared separately as [`DependencyEdge`]s.
///
/// 由发现层提供的节点（在图被冻结之前）。
/// 子节点是嵌套的；依赖关系单独声明为 [`DependencyEdge`]。
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    pub is_test_case: bool,
    pub children: Vec<NodeSpec>,
    pub execution_factory: Option<ExecutionFactory>,
    pub properties: BTreeMap<String, String>,
}

impl NodeSpec {
    /// Creates a container node (a fixture or suite).
    pub fn container(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            is_test_case: false,
            children: Vec::new(),
            execution_factory: None,
            properties: BTreeMap::new(),
        }
    }

    /// Creates a node that represents an individual test case.
    pub fn test_case(id: impl Into<NodeId>) -> Self {
        Self {
            is_test_case: true,
            ..Self::container(id)
        }
    }

    pub fn with_child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = NodeSpec>) -> Self {
        self.children.extend(children);
        self
    }

    /// Turns this node into a master node.
    pub fn with_factory(mut self, factory: ExecutionFactory) -> Self {
        self.execution_factory = Some(factory);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A declared dependency: `dependent` may only run once `dependency` is terminal.
/// 声明的依赖关系：只有当 `dependency` 达到终止状态后 `dependent` 才能运行。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub dependent: NodeId,
    pub dependency: NodeId,
}

impl DependencyEdge {
    pub fn new(dependent: impl Into<NodeId>, dependency: impl Into<NodeId>) -> Self {
        Self {
            dependent: dependent.into(),
            dependency: dependency.into(),
        }
    }
}

/// A frozen test node. Nodes are never mutated once the graph is built;
/// their run outcome lives in the scheduler's status table.
///
/// 冻结的测试节点。图构建完成后节点不会再被修改；
/// 其运行结果保存在调度器的状态表中。
#[derive(Debug, Clone)]
pub struct TestNode {
    pub(crate) id: NodeId,
    pub(crate) is_test_case: bool,
    pub(crate) parent: Option<NodeIndex>,
    pub(crate) children: Vec<NodeIndex>,
    pub(crate) dependencies: Vec<NodeIndex>,
    pub(crate) execution_factory: Option<ExecutionFactory>,
    pub(crate) properties: BTreeMap<String, String>,
    /// Number of nodes in the subtree rooted here, the node itself included.
    pub(crate) subtree_len: usize,
}

impl TestNode {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn is_test_case(&self) -> bool {
        self.is_test_case
    }

    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }

    pub fn dependencies(&self) -> &[NodeIndex] {
        &self.dependencies
    }

    pub fn execution_factory(&self) -> Option<&ExecutionFactory> {
        self.execution_factory.as_ref()
    }

    /// A master node owns a controller for itself and its subtree.
    pub fn is_master(&self) -> bool {
        self.execution_factory.is_some()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

/// The final outcome of a node for one run.
/// 节点在一次运行中的最终结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalStatus {
    Passed,
    Failed,
    Skipped,
    Cancelled,
}

impl TerminalStatus {
    pub fn is_passed(self) -> bool {
        self == TerminalStatus::Passed
    }

    /// Rank used when a container summarises its children:
    /// `Failed > Cancelled > Skipped > Passed`.
    fn severity(self) -> u8 {
        match self {
            TerminalStatus::Passed => 0,
            TerminalStatus::Skipped => 1,
            TerminalStatus::Cancelled => 2,
            TerminalStatus::Failed => 3,
        }
    }

    /// Returns the worst status of the given ones, or `None` when empty.
    pub fn worst(statuses: impl IntoIterator<Item = TerminalStatus>) -> Option<TerminalStatus> {
        statuses.into_iter().max_by_key(|status| status.severity())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::Passed => "Passed",
            TerminalStatus::Failed => "Failed",
            TerminalStatus::Skipped => "Skipped",
            TerminalStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of progress emitted by a running controller or host.
/// 由正在运行的控制器或宿主发出的进度单元。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The master node whose controller emitted the event.
    pub source: NodeId,
    pub task_name: String,
    pub completed_units: u64,
    pub total_units: u64,
}

/// The phases a run moves through.
/// 一次运行所经历的阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Idle,
    Validating,
    Ordering,
    Dispatching,
    /// Number of masters dispatched for execution.
    Executing(usize),
    Aggregating,
    Done,
    Aborted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Executing(n) => write!(f, "Executing({n})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Aggregate status of a run: `Passed` only when every node passed.
/// 运行的汇总状态：只有当所有节点都通过时才为 `Passed`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Passed,
    Failed,
}

/// The terminal status of one node, as listed in the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub is_test_case: bool,
    pub is_master: bool,
    pub status: TerminalStatus,
}

/// A non-fatal problem raised while a master's environment was torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunWarning {
    pub master: NodeId,
    pub warning: TeardownWarning,
}

/// Why a master (and its subtree) failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MasterFault {
    pub master: NodeId,
    pub message: String,
}

/// Everything a run produced. Available even when some masters failed.
/// 一次运行产生的全部结果。即使部分主节点失败也可获得。
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub phase: RunPhase,
    pub outcome: RunOutcome,
    /// Terminal status of every node, in declaration order.
    pub statuses: Vec<NodeStatus>,
    /// The dependency-respecting order computed for the run.
    pub order: Vec<NodeId>,
    pub events: Vec<ProgressEvent>,
    pub warnings: Vec<RunWarning>,
    pub faults: Vec<MasterFault>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

impl RunReport {
    pub fn status_of(&self, id: &str) -> Option<TerminalStatus> {
        self.statuses
            .iter()
            .find(|entry| entry.id.as_str() == id)
            .map(|entry| entry.status)
    }

    pub fn is_passed(&self) -> bool {
        self.outcome == RunOutcome::Passed
    }

    pub fn count(&self, status: TerminalStatus) -> usize {
        self.statuses.iter().filter(|entry| entry.status == status).count()
    }

    /// Position of a node in the computed order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|node| node.as_str() == id)
    }
}
