//! Concurrent Project Tests
//!
//! Runs for different projects share one executor and one database.

mod common;

use std::sync::Arc;
use std::time::Duration;

use codeport::core::{CheckpointStore, Database, Executor, Orchestrator, RateLimit};
use codeport::domain::{ProjectStatus, RunStatus, StageName};
use common::Fixture;

#[tokio::test]
async fn test_two_projects_share_one_executor() {
    let fixture = Fixture::new();
    fixture
        .provider
        .delay(StageName::Document, Duration::from_millis(20));

    let executor = Arc::new(Executor::new(
        2,
        RateLimit::new(1000, Duration::from_secs(1)),
        Duration::from_secs(30),
    ));
    let db = Database::open(&fixture.settings.database_path()).unwrap();
    let go = Orchestrator::new(fixture.settings.clone(), db.clone(), fixture.provider.clone())
        .with_executor(Arc::clone(&executor));
    let rust = Orchestrator::new(fixture.settings.clone(), db, fixture.provider.clone())
        .with_executor(Arc::clone(&executor));

    let (go_result, rust_result) =
        tokio::join!(go.run(fixture.request("go")), rust.run(fixture.request("rust")));
    let go_result = go_result.unwrap();
    let rust_result = rust_result.unwrap();

    assert_eq!(go_result.status, RunStatus::Completed);
    assert_eq!(rust_result.status, RunStatus::Completed);

    // Six document calls in total, never more than two at once
    assert_eq!(fixture.provider.calls_for(StageName::Document), 6);
    assert!(executor.peak_in_flight() <= 2);
    assert_eq!(executor.in_flight(), 0);

    for (orchestrator, id) in [(&go, "order-service-go"), (&rust, "order-service-rust")] {
        let checkpoints = orchestrator.store().list(id).await.unwrap();
        assert_eq!(checkpoints.len(), 8);
        assert!(checkpoints.iter().all(|c| c.project_id == id));

        let project = orchestrator.registry().get(id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Completed);
    }
    assert!(fixture.output_dir("go").join("go.mod").exists());
    assert!(fixture.output_dir("rust").join("go.mod").exists());
}

#[tokio::test]
async fn test_clearing_one_project_leaves_the_other() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();

    let (go, rust) = tokio::join!(
        orchestrator.run(fixture.request("go")),
        orchestrator.run(fixture.request("rust"))
    );
    assert_eq!(go.unwrap().status, RunStatus::Completed);
    assert_eq!(rust.unwrap().status, RunStatus::Completed);

    let cleared = orchestrator.store().clear("order-service-go").await.unwrap();
    assert_eq!(cleared, 8);
    assert!(orchestrator
        .store()
        .list("order-service-go")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        orchestrator
            .store()
            .list("order-service-rust")
            .await
            .unwrap()
            .len(),
        8
    );
}
