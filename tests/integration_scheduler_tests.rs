//! End-to-end runs of the scheduler against scripted controllers, the
//! command controller and in-process isolated hosts.

mod common;

use common::{
    Behaviour, FakeService, PanickingLauncher, ScriptedFactory, SilentLauncher, command_case,
    in_process, master, settings,
};
use plan_runner::core::command_controller::CommandControllerFactory;
use plan_runner::core::config::HostSetup;
use plan_runner::core::controller::ExecutionFactory;
use plan_runner::core::error::{GraphError, TeardownStep};
use plan_runner::core::models::{DependencyEdge, NodeId, NodeSpec, RunOutcome, TerminalStatus};
use plan_runner::core::scheduler::Scheduler;
use plan_runner::infra::boundary::DefaultLauncher;
use plan_runner::infra::host::IsolatedHost;
use std::sync::Arc;
use std::time::Duration;

fn command_factory() -> ExecutionFactory {
    ExecutionFactory::new(CommandControllerFactory)
}

fn isolated_scheduler(jobs: usize, service: FakeService) -> Scheduler {
    let launcher = DefaultLauncher::default().with_service(Arc::new(service.clone()));
    Scheduler::new(settings(jobs))
        .with_host(IsolatedHost::new(Arc::new(launcher)))
        .with_local_service(Arc::new(service))
}

/// Three masters, B depending on A: A runs before B, C runs independently
/// and everything passes.
#[tokio::test]
async fn test_dependent_master_runs_after_its_dependency() {
    let script = ScriptedFactory::new();
    let factory = script.clone().into_factory();
    let roots = vec![
        master("A", &factory, &["A/1"]),
        master("B", &factory, &["B/1"]),
        master("C", &factory, &["C/1"]),
    ];
    let edges = vec![DependencyEdge::new("B", "A")];

    let report = Scheduler::new(settings(4)).run(roots, edges).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Passed);
    assert_eq!(report.count(TerminalStatus::Passed), 6);
    let a_end = script.position("end A").unwrap();
    let b_start = script.position("start B").unwrap();
    assert!(a_end < b_start, "B started before A finished: {:?}", script.log());
    assert!(script.position("start C").is_some());
    assert!(report.position("A").unwrap() < report.position("B").unwrap());
}

#[tokio::test]
async fn test_failed_dependency_skips_dependent_subtree() {
    let script = ScriptedFactory::new().with_status("A/1", TerminalStatus::Failed);
    let factory = script.clone().into_factory();
    let roots = vec![
        master("A", &factory, &["A/1"]),
        master("B", &factory, &["B/1", "B/2"]),
        master("C", &factory, &["C/1"]),
    ];
    let edges = vec![DependencyEdge::new("B", "A")];

    let report = Scheduler::new(settings(4)).run(roots, edges).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.status_of("A/1"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("A"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("B"), Some(TerminalStatus::Skipped));
    assert_eq!(report.status_of("B/1"), Some(TerminalStatus::Skipped));
    assert_eq!(report.status_of("B/2"), Some(TerminalStatus::Skipped));
    assert_eq!(report.status_of("C"), Some(TerminalStatus::Passed));
    assert!(script.position("start B").is_none());
}

#[tokio::test]
async fn test_skip_propagates_through_a_chain() {
    let script = ScriptedFactory::new().with_status("A/1", TerminalStatus::Failed);
    let factory = script.clone().into_factory();
    let roots = vec![
        master("A", &factory, &["A/1"]),
        master("B", &factory, &["B/1"]),
        master("C", &factory, &["C/1"]),
    ];
    let edges = vec![DependencyEdge::new("B", "A"), DependencyEdge::new("C", "B")];

    let report = Scheduler::new(settings(2)).run(roots, edges).await.unwrap();

    assert_eq!(report.status_of("B"), Some(TerminalStatus::Skipped));
    assert_eq!(report.status_of("C"), Some(TerminalStatus::Skipped));
}

#[tokio::test]
async fn test_dependency_on_a_test_case_of_another_master() {
    let script = ScriptedFactory::new().with_status("A/2", TerminalStatus::Failed);
    let factory = script.clone().into_factory();
    let roots = vec![
        master("A", &factory, &["A/1", "A/2"]),
        master("B", &factory, &["B/1"]),
        master("C", &factory, &["C/1"]),
    ];
    let edges = vec![
        DependencyEdge::new("B/1", "A/1"),
        DependencyEdge::new("C", "A/2"),
    ];

    let report = Scheduler::new(settings(4)).run(roots, edges).await.unwrap();

    assert_eq!(report.status_of("B"), Some(TerminalStatus::Passed));
    assert_eq!(report.status_of("C"), Some(TerminalStatus::Skipped));
}

#[tokio::test]
async fn test_cycle_between_masters_aborts_before_any_controller_runs() {
    let script = ScriptedFactory::new();
    let factory = script.clone().into_factory();
    let roots = vec![
        master("A", &factory, &["A/1"]),
        master("B", &factory, &["B/1"]),
    ];
    let edges = vec![DependencyEdge::new("A/1", "B/1"), DependencyEdge::new("B/1", "A/1")];

    let err = Scheduler::new(settings(2)).run(roots, edges).await.unwrap_err();

    match err {
        GraphError::Cycle(cycle) => {
            let ids: Vec<&str> = cycle.participants.iter().map(|id| id.as_str()).collect();
            assert!(ids.contains(&"A/1") && ids.contains(&"B/1"), "{ids:?}");
        }
        other => panic!("expected a cycle, got {other}"),
    }
    assert!(script.log().is_empty());
}

#[tokio::test]
async fn test_unknown_dependency_is_rejected() {
    let factory = ScriptedFactory::new().into_factory();
    let roots = vec![master("A", &factory, &["A/1"])];
    let edges = vec![DependencyEdge::new("A", "missing")];

    let err = Scheduler::new(settings(1)).run(roots, edges).await.unwrap_err();
    assert!(matches!(err, GraphError::UnknownNode(_)), "{err}");
}

#[tokio::test]
async fn test_panicking_controller_fails_only_its_master() {
    let script = ScriptedFactory::new().with_behaviour("A", Behaviour::Panic);
    let factory = script.clone().into_factory();
    let roots = vec![
        master("A", &factory, &["A/1"]),
        master("C", &factory, &["C/1"]),
    ];

    let report = Scheduler::new(settings(2)).run(roots, Vec::new()).await.unwrap();

    assert_eq!(report.status_of("A"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("A/1"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("C"), Some(TerminalStatus::Passed));
    assert_eq!(report.faults.len(), 1);
    assert_eq!(report.faults[0].master.as_str(), "A");
    assert!(report.faults[0].message.contains("scripted panic"));
}

#[tokio::test]
async fn test_controller_error_fails_the_subtree() {
    let script = ScriptedFactory::new().with_behaviour("A", Behaviour::Error);
    let factory = script.into_factory();
    let roots = vec![master("A", &factory, &["A/1", "A/2"])];

    let report = Scheduler::new(settings(1)).run(roots, Vec::new()).await.unwrap();

    assert_eq!(report.count(TerminalStatus::Failed), 3);
    assert!(report.faults[0].message.contains("scripted error"));
}

#[tokio::test]
async fn test_unreported_containers_take_the_worst_child_status() {
    let script = ScriptedFactory::new().with_status("A/group/2", TerminalStatus::Failed);
    let factory = script.into_factory();
    let roots = vec![
        NodeSpec::container("A").with_factory(factory).with_child(
            NodeSpec::container("A/group")
                .with_child(NodeSpec::test_case("A/group/1"))
                .with_child(NodeSpec::test_case("A/group/2")),
        ),
    ];

    let report = Scheduler::new(settings(1)).run(roots, Vec::new()).await.unwrap();

    assert_eq!(report.status_of("A/group/1"), Some(TerminalStatus::Passed));
    assert_eq!(report.status_of("A/group"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("A"), Some(TerminalStatus::Failed));
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrent_masters() {
    let script = ScriptedFactory::new().with_delay(Duration::from_millis(50));
    let factory = script.clone().into_factory();
    let roots = (0..4)
        .map(|i| master(&format!("M{i}"), &factory, &[]))
        .collect();

    let report = Scheduler::new(settings(1)).run(roots, Vec::new()).await.unwrap();

    assert!(report.is_passed());
    assert_eq!(script.peak(), 1);
}

#[tokio::test]
async fn test_independent_masters_run_concurrently() {
    let script = ScriptedFactory::new().with_delay(Duration::from_millis(200));
    let factory = script.clone().into_factory();
    let roots = (0..3)
        .map(|i| master(&format!("M{i}"), &factory, &[]))
        .collect();

    let report = Scheduler::new(settings(3)).run(roots, Vec::new()).await.unwrap();

    assert!(report.is_passed());
    assert!(script.peak() > 1, "masters ran one at a time");
}

#[tokio::test]
async fn test_cancelled_before_start_marks_everything_cancelled() {
    let script = ScriptedFactory::new();
    let factory = script.clone().into_factory();
    let roots = vec![master("A", &factory, &["A/1"]), master("B", &factory, &["B/1"])];

    let scheduler = Scheduler::new(settings(2));
    scheduler.cancellation_token().cancel();
    let report = scheduler.run(roots, Vec::new()).await.unwrap();

    assert_eq!(report.count(TerminalStatus::Cancelled), 4);
    assert!(script.log().is_empty());
}

#[tokio::test]
async fn test_cancellation_abandons_masters_after_the_grace_period() {
    let script = ScriptedFactory::new().with_delay(Duration::from_secs(30));
    let factory = script.clone().into_factory();
    let roots = vec![master("A", &factory, &["A/1"]), master("B", &factory, &["B/1"])];
    let edges = vec![DependencyEdge::new("B", "A")];

    let scheduler = Scheduler::new(settings(2));
    let token = scheduler.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run(roots, edges))
        .await
        .expect("run did not stop after cancellation")
        .unwrap();

    assert_eq!(report.status_of("A"), Some(TerminalStatus::Cancelled));
    assert_eq!(report.status_of("A/1"), Some(TerminalStatus::Cancelled));
    assert_eq!(report.status_of("B"), Some(TerminalStatus::Cancelled));
    assert!(script.position("start B").is_none());
}

#[tokio::test]
async fn test_nodes_outside_every_master_are_skipped() {
    let factory = ScriptedFactory::new().into_factory();
    let roots = vec![
        master("A", &factory, &["A/1"]),
        NodeSpec::test_case("loose"),
    ];

    let report = Scheduler::new(settings(1)).run(roots, Vec::new()).await.unwrap();

    assert_eq!(report.status_of("A"), Some(TerminalStatus::Passed));
    assert_eq!(report.status_of("loose"), Some(TerminalStatus::Skipped));
}

#[tokio::test]
async fn test_containers_above_masters_aggregate_their_children() {
    let script = ScriptedFactory::new().with_status("suite/B/1", TerminalStatus::Failed);
    let factory = script.into_factory();
    let roots = vec![
        NodeSpec::container("suite")
            .with_child(master("suite/A", &factory, &["suite/A/1"]))
            .with_child(master("suite/B", &factory, &["suite/B/1"])),
    ];

    let report = Scheduler::new(settings(2)).run(roots, Vec::new()).await.unwrap();

    assert_eq!(report.status_of("suite/A"), Some(TerminalStatus::Passed));
    assert_eq!(report.status_of("suite"), Some(TerminalStatus::Failed));
}

#[tokio::test]
async fn test_command_controller_runs_cases_in_dependency_order() {
    let service = FakeService::default();
    let factory = command_factory();
    let roots = vec![
        NodeSpec::container("M")
            .with_factory(factory)
            .with_child(command_case("M/second", "second"))
            .with_child(command_case("M/first", "first"))
            .with_child(command_case("M/broken", "fail now"))
            .with_child(command_case("M/after-broken", "never")),
    ];
    let edges = vec![
        DependencyEdge::new("M/second", "M/first"),
        DependencyEdge::new("M/after-broken", "M/broken"),
    ];

    let report = Scheduler::new(settings(1))
        .with_local_service(Arc::new(service.clone()))
        .run(roots, edges)
        .await
        .unwrap();

    let executed = service.executed();
    let first = executed.iter().position(|c| c == "first").unwrap();
    let second = executed.iter().position(|c| c == "second").unwrap();
    assert!(first < second, "{executed:?}");
    assert!(!executed.contains(&"never".to_string()));

    assert_eq!(report.status_of("M/first"), Some(TerminalStatus::Passed));
    assert_eq!(report.status_of("M/second"), Some(TerminalStatus::Passed));
    assert_eq!(report.status_of("M/broken"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("M/after-broken"), Some(TerminalStatus::Skipped));
    assert_eq!(report.status_of("M"), Some(TerminalStatus::Failed));
}

#[tokio::test]
async fn test_isolated_master_runs_inside_its_own_environment() {
    let service = FakeService::default();
    let factory = command_factory().isolated(in_process());
    let roots = vec![
        NodeSpec::container("iso")
            .with_factory(factory)
            .with_child(command_case("iso/1", "one"))
            .with_child(command_case("iso/2", "two")),
    ];

    let report = isolated_scheduler(1, service.clone())
        .run(roots, Vec::new())
        .await
        .unwrap();

    assert!(report.is_passed(), "{:?}", report.statuses);
    assert_eq!(service.executed().len(), 2);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(
        report.events.iter().any(|event| event.source.as_str() == "iso"),
        "no progress from the isolated master"
    );
}

#[tokio::test]
async fn test_failed_acquisition_fails_the_master_and_records_a_fault() {
    let service = FakeService::default();
    let setup = HostSetup::new(Default::default())
        .with_working_directory("/definitely/not/a/directory/for/plan-runner");
    let factory = command_factory().isolated(setup);
    let roots = vec![
        NodeSpec::container("iso")
            .with_factory(factory)
            .with_child(command_case("iso/1", "one")),
        NodeSpec::container("other")
            .with_factory(command_factory())
            .with_child(command_case("other/1", "two")),
    ];

    let report = isolated_scheduler(2, service.clone())
        .run(roots, Vec::new())
        .await
        .unwrap();

    assert_eq!(report.status_of("iso"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("iso/1"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("other"), Some(TerminalStatus::Passed));
    assert_eq!(report.faults.len(), 1);
    assert_eq!(service.executed(), vec!["two".to_string()]);
}

#[tokio::test]
async fn test_nested_master_is_delegated_by_its_parent() {
    let service = FakeService::default();
    let factory = command_factory().isolated(in_process());
    let roots = vec![
        NodeSpec::container("outer")
            .with_factory(factory)
            .with_child(command_case("outer/setup", "setup"))
            .with_child(
                NodeSpec::container("outer/inner")
                    .with_factory(command_factory())
                    .with_child(command_case("outer/inner/1", "inner one"))
                    .with_child(command_case("outer/inner/2", "fail inner")),
            ),
    ];
    let edges = vec![DependencyEdge::new("outer/inner", "outer/setup")];

    let report = isolated_scheduler(1, service.clone())
        .run(roots, edges)
        .await
        .unwrap();

    assert_eq!(
        service.executed(),
        vec!["setup".to_string(), "inner one".to_string(), "fail inner".to_string()]
    );
    assert_eq!(report.status_of("outer/inner/1"), Some(TerminalStatus::Passed));
    assert_eq!(report.status_of("outer/inner/2"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("outer/inner"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("outer"), Some(TerminalStatus::Failed));
    assert!(report.events.iter().any(|event| event.source.as_str() == "outer/inner"));
}

#[tokio::test]
async fn test_cancelling_an_isolated_master_cancels_its_running_case() {
    let service = FakeService::default();
    let factory = command_factory().isolated(in_process());
    let roots = vec![
        NodeSpec::container("iso")
            .with_factory(factory)
            .with_child(command_case("iso/slow", "slow"))
            .with_child(command_case("iso/next", "next")),
    ];
    let mut run_settings = settings(1);
    run_settings.grace_period_secs = 5;

    let launcher = DefaultLauncher::default().with_service(Arc::new(service.clone()));
    let scheduler = Scheduler::new(run_settings).with_host(IsolatedHost::new(Arc::new(launcher)));
    let token = scheduler.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run(roots, Vec::new()))
        .await
        .expect("run did not stop after cancellation")
        .unwrap();

    assert_eq!(report.status_of("iso/slow"), Some(TerminalStatus::Cancelled));
    assert_eq!(report.status_of("iso/next"), Some(TerminalStatus::Cancelled));
    assert!(service.executed().is_empty());
}

#[tokio::test]
async fn test_masters_depending_on_each_other_are_rejected() {
    let script = ScriptedFactory::new();
    let factory = script.clone().into_factory();
    let roots = vec![
        master("A", &factory, &["A/1", "A/2"]),
        master("B", &factory, &["B/1", "B/2"]),
    ];
    // The node graph is acyclic; only the masters form a cycle.
    let edges = vec![DependencyEdge::new("A/1", "B/2"), DependencyEdge::new("B/1", "A/2")];

    let err = Scheduler::new(settings(2)).run(roots, edges).await.unwrap_err();

    match err {
        GraphError::Cycle(cycle) => assert_eq!(cycle.participants.len(), 2),
        other => panic!("expected a cycle, got {other}"),
    }
    assert!(script.log().is_empty());
}

#[tokio::test]
async fn test_cycle_between_nested_units_faults_the_master() {
    let service = FakeService::default();
    let roots = vec![
        NodeSpec::container("M")
            .with_factory(command_factory())
            .with_child(
                NodeSpec::container("M/x")
                    .with_child(command_case("M/x/1", "x1"))
                    .with_child(command_case("M/x/2", "x2")),
            )
            .with_child(command_case("M/y", "y")),
    ];
    // The node graph is acyclic, but M/x/2 inherits the dependency of M/x
    // on M/y while M/y waits for M/x/2.
    let edges = vec![DependencyEdge::new("M/x", "M/y"), DependencyEdge::new("M/y", "M/x/2")];

    let report = Scheduler::new(settings(1))
        .with_local_service(Arc::new(service.clone()))
        .run(roots, edges)
        .await
        .unwrap();

    assert_eq!(report.status_of("M"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("M/y"), Some(TerminalStatus::Failed));
    assert_eq!(report.faults.len(), 1);
    assert!(report.faults[0].message.contains("M/y"), "{}", report.faults[0].message);
    assert!(service.executed().is_empty());
}

/// A teardown step that fails while undoing a half-finished acquisition is
/// reported next to the acquisition fault.
#[tokio::test]
async fn test_rollback_warnings_reach_the_run_report() {
    let service = FakeService::default();
    let host = IsolatedHost::new(Arc::new(SilentLauncher))
        .with_timeouts(Duration::from_millis(200), Duration::from_secs(5));
    let roots = vec![
        NodeSpec::container("A")
            .with_factory(command_factory().isolated(in_process()))
            .with_child(command_case("A/1", "one")),
    ];

    let report = Scheduler::new(settings(2))
        .with_host(host)
        .with_local_service(Arc::new(service.clone()))
        .run(roots, Vec::new())
        .await
        .unwrap();

    assert_eq!(report.status_of("A"), Some(TerminalStatus::Failed));
    assert_eq!(report.faults.len(), 1);
    assert!(report.faults[0].message.contains("handshake"), "{:?}", report.faults);
    assert_eq!(report.warnings.len(), 1, "{:?}", report.warnings);
    assert_eq!(report.warnings[0].master, NodeId::new("A"));
    assert_eq!(report.warnings[0].warning.step, TeardownStep::Boundary);
    assert!(service.executed().is_empty());
}

/// A host that panics while being acquired fails its master; dependents and
/// the container above still reach a terminal status.
#[tokio::test]
async fn test_panicking_launcher_still_lets_the_run_finish() {
    let script = ScriptedFactory::new();
    let isolated = script.clone().into_factory().isolated(in_process());
    let plain = script.clone().into_factory();
    let roots = vec![
        NodeSpec::container("suite")
            .with_child(master("A", &isolated, &["A/1"]))
            .with_child(master("B", &plain, &["B/1"])),
    ];
    let edges = vec![DependencyEdge::new("B", "A")];
    let scheduler =
        Scheduler::new(settings(2)).with_host(IsolatedHost::new(Arc::new(PanickingLauncher)));

    let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run(roots, edges))
        .await
        .expect("run did not finish")
        .unwrap();

    assert_eq!(report.status_of("A"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("A/1"), Some(TerminalStatus::Failed));
    assert_eq!(report.status_of("B"), Some(TerminalStatus::Skipped));
    assert_eq!(report.status_of("suite"), Some(TerminalStatus::Failed));
    assert_eq!(report.faults.len(), 1);
    assert!(report.faults[0].message.contains("launcher exploded"), "{:?}", report.faults);
    assert!(script.position("start B").is_none());
}

#[tokio::test]
async fn test_oversized_job_count_is_clamped() {
    let script = ScriptedFactory::new();
    let factory = script.clone().into_factory();
    let roots = vec![master("A", &factory, &["A/1"])];

    let report = Scheduler::new(settings(usize::MAX))
        .run(roots, Vec::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Passed);
}
