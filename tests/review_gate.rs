//! Review Gate Integration Tests
//!
//! Suspending after analysis, approving with feedback, and rejecting.

mod common;

use codeport::core::{CancellationSignal, CheckpointStore, PutOutcome};
use codeport::domain::{ProjectStatus, RunStatus, StageName};
use codeport::error::{ErrorClass, PipelineError};
use common::Fixture;

#[tokio::test]
async fn test_run_suspends_at_review() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();

    let result = orchestrator
        .run(fixture.request("go").with_review(true))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::AwaitingReview);
    assert!(result.status.is_success());
    assert_eq!(result.last_completed(), Some(StageName::Document));
    assert_eq!(fixture.provider.calls_for(StageName::Translate), 0);

    let report = orchestrator.report(&fixture.root, "go").await.unwrap();
    assert!(report.review_pending);
    assert_eq!(report.project.status, ProjectStatus::Analyzing);
    assert_eq!(report.checkpoints.len(), 5);
}

#[tokio::test]
async fn test_review_enabled_by_settings() {
    let fixture = Fixture::new();
    let mut settings = fixture.settings.clone();
    settings.stages.human_review = true;
    let orchestrator = fixture.orchestrator_with(settings);

    let result = orchestrator.run(fixture.request("go")).await.unwrap();
    assert_eq!(result.status, RunStatus::AwaitingReview);

    // The request can still switch the gate off
    let result = orchestrator
        .run(fixture.request("go").with_review(false))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_resume_without_approval_waits_again() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();

    orchestrator
        .run(fixture.request("go").with_review(true))
        .await
        .unwrap();
    let calls = fixture.provider.total_calls();

    let result = orchestrator
        .run(fixture.request("go").with_review(true).with_resume(true))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::AwaitingReview);
    assert!(result.executed_stages.is_empty());
    assert_eq!(fixture.provider.total_calls(), calls);
}

#[tokio::test]
async fn test_approval_resumes_with_feedback() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();

    orchestrator
        .run(fixture.request("go").with_review(true))
        .await
        .unwrap();

    let result = orchestrator
        .resume_after_approval(
            fixture.request("go"),
            Some("keep the package layout".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.completed_stages.len(), 9);
    assert!(result.completed_stages.contains(&StageName::HumanReview));
    assert_eq!(
        result.executed_stages,
        vec![StageName::Translate, StageName::FillGaps, StageName::EmitOutput]
    );
    assert_eq!(fixture.provider.calls_for(StageName::AnalyzeProject), 1);

    let input = &fixture.provider.inputs_for(StageName::Translate)[0];
    assert_eq!(input["stages"]["human_review"]["approved"], true);
    assert_eq!(
        input["stages"]["human_review"]["feedback"],
        "keep the package layout"
    );
    assert!(fixture.output_dir("go").join("go.mod").exists());
}

#[tokio::test]
async fn test_approval_keeps_registered_source_language() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();

    orchestrator
        .run(
            fixture
                .request("go")
                .with_review(true)
                .with_source_language("python"),
        )
        .await
        .unwrap();

    // The approving request carries no hint
    let result = orchestrator
        .resume_after_approval(fixture.request("go"), None)
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let document = &fixture.provider.inputs_for(StageName::Document)[0];
    let translate = &fixture.provider.inputs_for(StageName::Translate)[0];
    assert_eq!(document["project"]["source_language"], "python");
    assert_eq!(translate["project"], document["project"]);

    let project = orchestrator
        .registry()
        .get("order-service-go")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(project.source_language.as_deref(), Some("python"));
}

#[tokio::test]
async fn test_approval_is_kept_when_gate_is_not_requested() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();

    orchestrator
        .run(fixture.request("go").with_review(true))
        .await
        .unwrap();
    orchestrator
        .approve_review(&fixture.root, "go", Some("use generics".to_string()))
        .await
        .unwrap();

    // Plain resume: the approved gate still feeds the translation stages
    let result = orchestrator
        .run(fixture.request("go").with_resume(true))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    let input = &fixture.provider.inputs_for(StageName::Translate)[0];
    assert_eq!(input["stages"]["human_review"]["feedback"], "use generics");
}

#[tokio::test]
async fn test_repeated_approval_is_unchanged() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    orchestrator
        .run(fixture.request("go").with_review(true))
        .await
        .unwrap();

    let first = orchestrator
        .approve_review(&fixture.root, "go", None)
        .await
        .unwrap();
    let second = orchestrator
        .approve_review(&fixture.root, "go", None)
        .await
        .unwrap();

    assert_eq!(first, PutOutcome::Written);
    assert_eq!(second, PutOutcome::Unchanged);

    let report = orchestrator.report(&fixture.root, "go").await.unwrap();
    assert!(!report.review_pending);
}

#[tokio::test]
async fn test_approve_before_gate_is_rejected() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();

    // A cancelled run registers the project without checkpointing anything
    let cancel = CancellationSignal::new();
    cancel.cancel();
    let result = orchestrator
        .run(fixture.request("go").with_review(true).with_cancel(cancel))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);

    let err = orchestrator
        .approve_review(&fixture.root, "go", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::GateNotReached {
            missing: StageName::AnalyzeProject
        }
    ));
    assert!(orchestrator
        .store()
        .get("order-service-go", StageName::HumanReview)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_approve_unknown_project() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();

    let err = orchestrator
        .approve_review(&fixture.root, "go", None)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::UnknownProject(id) if id == "order-service-go"));
}

#[tokio::test]
async fn test_rejection_fails_the_project() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    orchestrator
        .run(fixture.request("go").with_review(true))
        .await
        .unwrap();

    let project = orchestrator
        .reject_review(&fixture.root, "go", "module boundaries are wrong")
        .await
        .unwrap();

    assert_eq!(project.status, ProjectStatus::Failed);
    let failure = project.failure.unwrap();
    assert_eq!(failure.stage, Some(StageName::HumanReview));
    assert_eq!(failure.class, ErrorClass::ReviewRejected);
    assert!(failure.message.contains("module boundaries are wrong"));

    // A rejected project has nothing left to approve
    let err = orchestrator
        .approve_review(&fixture.root, "go", None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));

    // A fresh run starts the analysis over
    let rerun = orchestrator
        .run(fixture.request("go").with_review(true))
        .await
        .unwrap();
    assert_eq!(rerun.status, RunStatus::AwaitingReview);
    assert_eq!(fixture.provider.calls_for(StageName::AnalyzeProject), 2);
}

#[tokio::test]
async fn test_reject_after_approval_is_refused() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    orchestrator
        .run(fixture.request("go").with_review(true))
        .await
        .unwrap();
    orchestrator
        .approve_review(&fixture.root, "go", None)
        .await
        .unwrap();

    let err = orchestrator
        .reject_review(&fixture.root, "go", "changed my mind")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Configuration(_)));
}
