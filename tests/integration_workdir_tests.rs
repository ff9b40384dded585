//! The coordinator's working directory across an environment's lifetime.
//! Kept in its own test binary: it moves the process directory, which the
//! other host tests assume stays put.

mod common;

use common::{FakeService, in_process};
use plan_runner::core::models::NodeId;
use plan_runner::infra::boundary::DefaultLauncher;
use plan_runner::infra::host::IsolatedHost;
use plan_runner::reporting::progress::ProgressReporter;
use std::path::Path;
use std::sync::Arc;

fn same_dir(a: &Path, b: &Path) -> bool {
    a.canonicalize().ok() == b.canonicalize().ok()
}

#[tokio::test]
async fn test_release_keeps_a_directory_the_coordinator_moved_to() {
    let original = std::env::current_dir().unwrap();
    let start = tempfile::tempdir().unwrap();
    let moved = tempfile::tempdir().unwrap();
    std::env::set_current_dir(start.path()).unwrap();

    let launcher = DefaultLauncher::default().with_service(Arc::new(FakeService::default()));
    let host = IsolatedHost::new(Arc::new(launcher));
    let mut env = host
        .acquire(&in_process(), ProgressReporter::new().handle(NodeId::new("m")))
        .await
        .unwrap();
    assert!(same_dir(env.previous_working_directory().unwrap(), start.path()));

    std::env::set_current_dir(moved.path()).unwrap();
    let warnings = host.release(&mut env).await;
    let after = std::env::current_dir().unwrap();
    std::env::set_current_dir(&original).unwrap();

    assert!(warnings.is_empty(), "{warnings:?}");
    assert!(same_dir(&after, moved.path()), "release moved the coordinator to {}", after.display());
}
