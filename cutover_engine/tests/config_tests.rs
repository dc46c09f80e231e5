//! Options loaded from files and persisted audit trails.

mod common;

use common::{failing_step, step, with_logged_undo, UndoLog};
use cutover_engine::{
    AuditEvent, DependencyPolicy, ErrorKind, OrchestratorOptions, RollbackStrategy, SkipDecision,
    TaskOrchestrator, WorkflowContext,
};
use tempfile::TempDir;

#[tokio::test]
async fn test_options_file_drives_the_run() {
    let temp_dir = TempDir::new().unwrap();
    let audit_dir = temp_dir.path().join("audit");
    let config_path = temp_dir.path().join("release.yaml");
    tokio::fs::write(
        &config_path,
        format!(
            "execution_id: release-2.0.0\nenabled_features: [git]\naudit_dir: {}\nrollback:\n  strategy: reverse\n  max_retries: 1\n",
            audit_dir.display()
        ),
    )
    .await
    .unwrap();

    let options = OrchestratorOptions::from_yaml_file(&config_path).await.unwrap();
    assert_eq!(options.rollback.strategy, RollbackStrategy::Reverse);

    let log = UndoLog::default();
    let mut orchestrator = TaskOrchestrator::new(options).unwrap();
    orchestrator
        .register(with_logged_undo(step("commit"), &log).requires_feature("git"))
        .unwrap();
    orchestrator
        .register(step("npm-publish").requires_feature("npm"))
        .unwrap();
    orchestrator.register(failing_step("push", "remote rejected")).unwrap();

    let result = orchestrator.run(WorkflowContext::default()).await.unwrap();

    assert_eq!(result.execution_id(), "release-2.0.0");
    assert_eq!(common::ids(result.executed_tasks()), vec!["commit"]);
    assert_eq!(common::entries(&log), vec!["commit"]);

    let audit_file = audit_dir.join(format!("{}.json", result.run_id()));
    let contents = tokio::fs::read_to_string(&audit_file).await.unwrap();
    let persisted: Vec<AuditEvent> = serde_json::from_str(&contents).unwrap();
    assert_eq!(persisted, result.audit_events());
    assert!(matches!(
        persisted.first(),
        Some(AuditEvent::RunStarted { execution_id, task_count: 2, .. }) if execution_id == "release-2.0.0"
    ));
}

#[tokio::test]
async fn test_invalid_options_file_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("release.yaml");
    tokio::fs::write(&config_path, "rollback:\n  max_retries: 50\n")
        .await
        .unwrap();

    let err = OrchestratorOptions::from_yaml_file(&config_path).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_strict_dependency_policy_from_json() {
    let options = OrchestratorOptions::from_json_str(
        r#"{"execution_id": "r1", "dependency_policy": "skipped-blocks"}"#,
    )
    .unwrap();
    assert_eq!(options.dependency_policy, DependencyPolicy::SkippedBlocks);

    let mut orchestrator = TaskOrchestrator::new(options).unwrap();
    orchestrator
        .register(step("changelog").skip_when(|_ctx| SkipDecision::skip("no commits")))
        .unwrap();
    orchestrator.register(step("tag").depends_on("changelog")).unwrap();
    orchestrator.register(step("report")).unwrap();

    let result = orchestrator.run(WorkflowContext::default()).await.unwrap();

    assert!(result.success());
    assert_eq!(common::ids(result.skipped_tasks()), vec!["changelog", "tag"]);
    assert_eq!(common::ids(result.executed_tasks()), vec!["report"]);
}
