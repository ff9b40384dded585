//! Graph construction, cycle detection, ordering and planning.

use plan_runner::core::command_controller::CommandControllerFactory;
use plan_runner::core::controller::ExecutionFactory;
use plan_runner::core::error::GraphError;
use plan_runner::core::graph::TestGraph;
use plan_runner::core::models::{DependencyEdge, NodeSpec};
use plan_runner::core::planner::{order_units, partition_units, plan_execution, unit_dependencies};
use std::sync::Arc;

fn factory() -> ExecutionFactory {
    ExecutionFactory::new(CommandControllerFactory)
}

fn ids(graph: &TestGraph, nodes: impl IntoIterator<Item = plan_runner::core::models::NodeIndex>) -> Vec<String> {
    nodes
        .into_iter()
        .map(|idx| graph.node(idx).id().to_string())
        .collect()
}

/// suite
/// ├── A (master)
/// │   ├── A/1
/// │   └── A/inner (master)
/// │       └── A/inner/1
/// └── B (master)
///     └── B/1
/// loose
fn sample() -> Vec<NodeSpec> {
    vec![
        NodeSpec::container("suite")
            .with_child(
                NodeSpec::container("A")
                    .with_factory(factory())
                    .with_child(NodeSpec::test_case("A/1"))
                    .with_child(
                        NodeSpec::container("A/inner")
                            .with_factory(factory())
                            .with_child(NodeSpec::test_case("A/inner/1")),
                    ),
            )
            .with_child(
                NodeSpec::container("B")
                    .with_factory(factory())
                    .with_child(NodeSpec::test_case("B/1")),
            ),
        NodeSpec::test_case("loose"),
    ]
}

#[test]
fn test_build_links_parents_and_children() {
    let graph = TestGraph::build(sample(), Vec::new()).unwrap();

    assert_eq!(graph.len(), 8);
    let a = graph.find("A").unwrap();
    let a1 = graph.find("A/1").unwrap();
    let suite = graph.find("suite").unwrap();

    assert_eq!(graph.node(a1).parent(), Some(a));
    assert_eq!(graph.node(a).parent(), Some(suite));
    assert!(graph.node(graph.find("loose").unwrap()).parent().is_none());
    assert_eq!(ids(&graph, graph.roots().iter().copied()), vec!["suite", "loose"]);
    assert_eq!(ids(&graph, graph.ancestors(a1)), vec!["A", "suite"]);
    assert!(graph.contains(suite, a1));
    assert!(!graph.contains(a1, suite));
    assert_eq!(
        ids(&graph, graph.subtree(a)),
        vec!["A", "A/1", "A/inner", "A/inner/1"]
    );
}

#[test]
fn test_duplicate_identifier_is_rejected() {
    let roots = vec![NodeSpec::test_case("x"), NodeSpec::container("y").with_child(NodeSpec::test_case("x"))];
    let err = TestGraph::build(roots, Vec::new()).unwrap_err();
    assert!(matches!(err, GraphError::DuplicateId(ref id) if id.as_str() == "x"), "{err}");
}

#[test]
fn test_unknown_endpoint_is_rejected() {
    let err = TestGraph::build(sample(), vec![DependencyEdge::new("ghost", "A")]).unwrap_err();
    assert!(matches!(err, GraphError::UnknownNode(ref id) if id.as_str() == "ghost"), "{err}");
}

#[test]
fn test_duplicate_edges_are_collapsed() {
    let edges = vec![DependencyEdge::new("B", "A"), DependencyEdge::new("B", "A")];
    let graph = TestGraph::build(sample(), edges).unwrap();
    assert_eq!(graph.node(graph.find("B").unwrap()).dependencies().len(), 1);
}

#[test]
fn test_cycle_reports_its_participants() {
    let roots = vec![
        NodeSpec::test_case("x"),
        NodeSpec::test_case("y"),
        NodeSpec::test_case("z"),
    ];
    let edges = vec![
        DependencyEdge::new("x", "y"),
        DependencyEdge::new("y", "z"),
        DependencyEdge::new("z", "x"),
    ];

    let err = TestGraph::build(roots, edges).unwrap_err();
    let GraphError::Cycle(cycle) = err else {
        panic!("expected a cycle");
    };
    let mut members: Vec<&str> = cycle.participants.iter().map(|id| id.as_str()).collect();
    members.sort_unstable();
    assert_eq!(members, vec!["x", "y", "z"]);
    assert!(cycle.to_string().contains("->"));
}

#[test]
fn test_self_dependency_is_a_cycle() {
    let err = TestGraph::build(vec![NodeSpec::test_case("x")], vec![DependencyEdge::new("x", "x")]).unwrap_err();
    assert!(matches!(err, GraphError::Cycle(_)));
}

#[test]
fn test_dependency_on_an_ancestor_is_a_cycle() {
    let err = TestGraph::build(sample(), vec![DependencyEdge::new("A/1", "A")]).unwrap_err();
    assert!(matches!(err, GraphError::Cycle(_)), "{err}");
}

#[test]
fn test_topological_order_respects_edges_and_declaration_order() {
    let roots = vec![
        NodeSpec::test_case("a"),
        NodeSpec::test_case("b"),
        NodeSpec::test_case("c"),
        NodeSpec::test_case("d"),
    ];
    let edges = vec![DependencyEdge::new("a", "d"), DependencyEdge::new("b", "c")];
    let graph = TestGraph::build(roots, edges).unwrap();

    let order = ids(&graph, graph.topological_order());
    assert_eq!(order.len(), 4);
    let at = |id: &str| order.iter().position(|x| x == id).unwrap();
    assert!(at("d") < at("a"));
    assert!(at("c") < at("b"));
    // Independent of each other, c and d keep their relative declaration order.
    assert!(at("c") < at("d"));
    assert_eq!(order, ids(&graph, graph.topological_order()));
}

#[test]
fn test_master_discovery() {
    let graph = TestGraph::build(sample(), Vec::new()).unwrap();

    assert_eq!(ids(&graph, graph.top_level_masters()), vec!["A", "B"]);
    assert_eq!(ids(&graph, graph.nested_masters(graph.find("A").unwrap())), vec!["A/inner"]);
    assert_eq!(ids(&graph, graph.master_nodes()), vec!["A", "A/inner", "B"]);
    assert!(graph.node(graph.find("A/inner").unwrap()).is_master());
    assert!(!graph.node(graph.find("suite").unwrap()).is_master());
}

#[test]
fn test_plan_orders_masters_and_classifies_other_nodes() {
    let edges = vec![DependencyEdge::new("A/1", "B/1")];
    let graph = Arc::new(TestGraph::build(sample(), edges).unwrap());
    let plan = plan_execution(Arc::clone(&graph)).unwrap();

    let masters: Vec<String> = plan
        .masters
        .iter()
        .map(|m| graph.node(m.node).id().to_string())
        .collect();
    assert_eq!(masters, vec!["B", "A"]);
    assert_eq!(plan.master_count(), 2);

    let a = &plan.masters[1];
    assert_eq!(ids(&graph, a.external_dependencies.iter().copied()), vec!["B/1"]);
    assert_eq!(ids(&graph, a.upstream_masters.iter().copied()), vec!["B"]);

    assert_eq!(ids(&graph, plan.aggregates.iter().copied()), vec!["suite"]);
    assert_eq!(ids(&graph, plan.orphans.iter().copied()), vec!["loose"]);
    assert_eq!(plan.owner(graph.find("A/inner/1").unwrap()), graph.find("A"));
    assert_eq!(plan.owner(graph.find("loose").unwrap()), None);
}

#[test]
fn test_masters_inherit_dependencies_of_their_ancestors() {
    let roots = vec![
        NodeSpec::container("first").with_factory(factory()),
        NodeSpec::container("group").with_child(NodeSpec::container("second").with_factory(factory())),
    ];
    let graph = Arc::new(TestGraph::build(roots, vec![DependencyEdge::new("group", "first")]).unwrap());
    let plan = plan_execution(Arc::clone(&graph)).unwrap();

    let second = plan
        .masters
        .iter()
        .find(|m| graph.node(m.node).id().as_str() == "second")
        .unwrap();
    assert_eq!(ids(&graph, second.external_dependencies.iter().copied()), vec!["first"]);
}

#[test]
fn test_master_level_cycle_is_rejected() {
    let edges = vec![DependencyEdge::new("A/1", "B/1"), DependencyEdge::new("B/1", "A/inner/1")];
    let graph = Arc::new(TestGraph::build(sample(), edges).unwrap());

    let err = plan_execution(graph).unwrap_err();
    let mut members: Vec<&str> = err.participants.iter().map(|id| id.as_str()).collect();
    members.sort_unstable();
    assert_eq!(members, vec!["A", "B"]);
}

#[test]
fn test_units_inside_a_master() {
    let graph = TestGraph::build(sample(), vec![DependencyEdge::new("A/inner", "A/1")]).unwrap();
    let a = graph.find("A").unwrap();

    let units = partition_units(&graph, Some(a), |node| node.is_test_case() || node.is_master());
    assert_eq!(ids(&graph, units.iter().copied()), vec!["A/1", "A/inner"]);

    let deps = unit_dependencies(&graph, Some(a), &units);
    assert!(deps[0].upstream.is_empty());
    assert_eq!(deps[1].upstream, vec![0]);

    let order = order_units(&graph, &units, &deps).unwrap();
    assert_eq!(order, vec![0, 1]);
}

#[test]
fn test_dependency_on_own_descendant_is_not_waited_for() {
    let graph = TestGraph::build(sample(), vec![DependencyEdge::new("A", "A/1")]).unwrap();
    let units = vec![graph.find("A").unwrap()];
    let deps = unit_dependencies(&graph, None, &units);
    assert!(deps[0].external.is_empty());
}
