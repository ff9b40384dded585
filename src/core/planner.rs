//! # Execution Planner Module / 执行计划模块
//!
//! This module turns a frozen [`TestGraph`] into an execution plan: the node
//! order for the run, the top-level masters in dispatch order together with
//! the dependencies each one must wait for, and the nodes no master covers.
//!
//! The same unit-level helpers are used by controllers that schedule the
//! units inside a master.
//!
//! 此模块将冻结的测试图转换为执行计划：本次运行的节点顺序、
//! 按分派顺序排列的顶层主节点及其各自需要等待的依赖，以及没有主节点覆盖的节点。
//!
//! 在主节点内部调度单元的控制器也使用相同的单元级辅助函数。

use std::sync::Arc;

use crate::core::error::CycleError;
use crate::core::graph::{TestGraph, find_cycle, linear_extension};
use crate::core::models::{NodeIndex, TestNode};

/// A top-level master and what it waits for before it may start.
/// 顶层主节点及其启动前需要等待的内容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterPlan {
    pub node: NodeIndex,
    /// Dependencies of the master's subtree (and of its ancestors) that
    /// point outside the subtree.
    pub external_dependencies: Vec<NodeIndex>,
    /// Other top-level masters this one is ordered after.
    pub upstream_masters: Vec<NodeIndex>,
}

/// Represents a complete execution plan for a test graph.
/// 表示测试图的完整执行计划。
#[derive(Debug)]
pub struct ExecutionPlan {
    pub graph: Arc<TestGraph>,
    /// Linear extension of the node dependency order.
    /// 节点依赖顺序的线性扩展。
    pub order: Vec<NodeIndex>,
    /// Top-level masters in dispatch order.
    /// 按分派顺序排列的顶层主节点。
    pub masters: Vec<MasterPlan>,
    /// Containers outside every master that have masters below them. Their
    /// status is the worst of their children.
    pub aggregates: Vec<NodeIndex>,
    /// Nodes outside every master with no master below them; nothing can
    /// run them.
    pub orphans: Vec<NodeIndex>,
    owner: Vec<Option<NodeIndex>>,
}

impl ExecutionPlan {
    /// The top-level master whose subtree contains `node`.
    pub fn owner(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.owner[node.0]
    }

    pub fn master_count(&self) -> usize {
        self.masters.len()
    }
}

/// What one unit waits for, as computed by [`unit_dependencies`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitDependencies {
    /// Dependencies pointing outside the unit's subtree and outside its ancestors.
    pub external: Vec<NodeIndex>,
    /// Positions (in the unit list) of units this one is ordered after.
    pub upstream: Vec<usize>,
}

/// Creates the execution plan for a graph.
///
/// The master-level dependency graph gets its own cycle check: two masters
/// whose subtrees depend on each other can never be ordered even when the
/// node graph itself is acyclic.
///
/// 为图创建执行计划。
/// 主节点级依赖图有单独的环检查：即使节点图本身无环，
/// 子树相互依赖的两个主节点也永远无法排序。
pub fn plan_execution(graph: Arc<TestGraph>) -> Result<ExecutionPlan, CycleError> {
    let masters = graph.top_level_masters();
    let dependencies = unit_dependencies(&graph, None, &masters);
    let dispatch = order_units(&graph, &masters, &dependencies)?;

    let mut owner = vec![None; graph.len()];
    let mut covers_master = vec![false; graph.len()];
    for &master in &masters {
        for node in graph.subtree(master) {
            owner[node.0] = Some(master);
        }
        for ancestor in graph.ancestors(master) {
            covers_master[ancestor.0] = true;
        }
    }

    let (aggregates, orphans): (Vec<_>, Vec<_>) = graph
        .indices()
        .filter(|node| owner[node.0].is_none())
        .partition(|node| covers_master[node.0]);

    let masters = dispatch
        .into_iter()
        .map(|position| MasterPlan {
            node: masters[position],
            external_dependencies: dependencies[position].external.clone(),
            upstream_masters: dependencies[position]
                .upstream
                .iter()
                .map(|&up| masters[up])
                .collect(),
        })
        .collect();

    Ok(ExecutionPlan {
        order: graph.topological_order(),
        masters,
        aggregates,
        orphans,
        owner,
        graph,
    })
}

/// The shallowest nodes below `scope` (or below the roots when `scope` is
/// `None`) for which `is_unit` holds. The search never descends into a unit.
pub fn partition_units<F>(graph: &TestGraph, scope: Option<NodeIndex>, is_unit: F) -> Vec<NodeIndex>
where
    F: Fn(&TestNode) -> bool,
{
    let mut stack: Vec<NodeIndex> = match scope {
        Some(scope) => graph.node(scope).children().iter().rev().copied().collect(),
        None => graph.roots().iter().rev().copied().collect(),
    };

    let mut units = Vec::new();
    while let Some(idx) = stack.pop() {
        let node = graph.node(idx);
        if is_unit(node) {
            units.push(idx);
            continue;
        }
        stack.extend(node.children().iter().rev().copied());
    }
    units
}

/// Computes, for each unit, the dependencies it must wait for and the units
/// it is ordered after.
///
/// A unit inherits the dependencies of its ancestors up to (excluding)
/// `scope`, because it runs inside their scope. A unit is ordered after
/// another when one of its dependencies lies inside the other unit, or
/// contains it.
pub fn unit_dependencies(
    graph: &TestGraph,
    scope: Option<NodeIndex>,
    units: &[NodeIndex],
) -> Vec<UnitDependencies> {
    units
        .iter()
        .enumerate()
        .map(|(position, &unit)| {
            let inherited = graph
                .ancestors(unit)
                .take_while(|&ancestor| Some(ancestor) != scope);

            let mut external: Vec<NodeIndex> = graph
                .subtree(unit)
                .chain(inherited)
                .flat_map(|node| graph.node(node).dependencies().iter().copied())
                // A scope the unit already runs inside never has to be waited for.
                .filter(|&dep| !graph.contains(unit, dep) && !graph.contains(dep, unit))
                .collect();
            external.sort_unstable();
            external.dedup();

            let upstream = units
                .iter()
                .enumerate()
                .filter(|&(other_pos, &other)| {
                    other_pos != position
                        && external
                            .iter()
                            .any(|&dep| graph.contains(other, dep) || graph.contains(dep, other))
                })
                .map(|(other_pos, _)| other_pos)
                .collect();

            UnitDependencies { external, upstream }
        })
        .collect()
}

/// Orders units so that every unit follows the units it depends on; ties
/// keep declaration order. Fails with the members of a cycle when the units
/// depend on each other.
pub fn order_units(
    graph: &TestGraph,
    units: &[NodeIndex],
    dependencies: &[UnitDependencies],
) -> Result<Vec<usize>, CycleError> {
    let (order, blocked) = linear_extension(units.len(), |u| dependencies[u].upstream.clone());
    if blocked.is_empty() {
        return Ok(order);
    }

    // Report the cycle in dependency direction: each member depends on the next.
    let members = find_cycle(units.len(), |u| dependencies[u].upstream.clone())
        .unwrap_or(blocked);
    Err(CycleError {
        participants: members
            .into_iter()
            .map(|u| graph.node(units[u]).id().clone())
            .collect(),
    })
}
