use criterion::{Criterion, criterion_group, criterion_main};
use futures::FutureExt;
use futures::future::BoxFuture;
use plan_runner::core::config::RunSettings;
use plan_runner::core::controller::{
    ControllerContext, ControllerReport, ExecutionFactory, TestController,
};
use plan_runner::core::error::ControllerError;
use plan_runner::core::graph::TestGraph;
use plan_runner::core::models::{DependencyEdge, NodeSpec, TestNode};
use plan_runner::core::planner::plan_execution;
use plan_runner::core::scheduler::Scheduler;
use std::sync::Arc;
use tokio::runtime::Runtime;

struct NoopController;

impl TestController for NoopController {
    fn run<'a>(
        &'a mut self,
        _ctx: &'a mut ControllerContext<'_>,
    ) -> BoxFuture<'a, Result<ControllerReport, ControllerError>> {
        async { Ok(ControllerReport::new()) }.boxed()
    }
}

/// `masters` masters with `cases` test cases each; every master depends on
/// the one declared before it.
fn chain(masters: usize, cases: usize) -> (Vec<NodeSpec>, Vec<DependencyEdge>) {
    let factory = ExecutionFactory::new(|_: &TestNode| -> Box<dyn TestController> {
        Box::new(NoopController)
    });
    let roots = (0..masters)
        .map(|m| {
            NodeSpec::container(format!("m{m}"))
                .with_factory(factory.clone())
                .with_children((0..cases).map(|c| NodeSpec::test_case(format!("m{m}/c{c}"))))
        })
        .collect();
    let edges = (1..masters)
        .map(|m| DependencyEdge::new(format!("m{m}"), format!("m{}", m - 1)))
        .collect();
    (roots, edges)
}

fn bench_build_and_plan(c: &mut Criterion) {
    c.bench_function("build_and_plan_100x20", |b| {
        b.iter(|| {
            let (roots, edges) = chain(100, 20);
            let graph = Arc::new(TestGraph::build(roots, edges).unwrap());
            plan_execution(graph).unwrap()
        });
    });
}

fn bench_run(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let settings = RunSettings {
        jobs: 8,
        ..RunSettings::default()
    };

    c.bench_function("run_50x10", |b| {
        b.to_async(&rt).iter(|| async {
            let (roots, edges) = chain(50, 10);
            let _ = Scheduler::new(settings.clone()).run(roots, edges).await;
        });
    });
}

criterion_group!(benches, bench_build_and_plan, bench_run);
criterion_main!(benches);
