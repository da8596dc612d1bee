//! Deployment coordinator integration tests

use std::time::Duration;

use deployd::errors::DeployError;
use deployd::models::deployment::{Deployment, DeploymentStatus, RunKind};
use deployd::storage::store::DeploymentStore;
use deployd::stream::frame::FrameKind;

use crate::fakes::{assert_status, FakeRuntime, FakeVcs, HarnessBuilder, COMMIT};

const IMAGE: &str = "registry.local:5001/shop:0123abcd";

// ============================= SINGLE PROCESS ================================== //

#[tokio::test]
async fn test_single_process_success() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h
        .create(serde_json::json!({
            "supervisor_process": "shop-web",
            "notification_emails": "dev@example.com",
        }))
        .await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Success);
    assert_eq!(done.deploy_count, 1);
    assert_eq!(done.last_commit.as_deref(), Some(COMMIT));
    assert!(done.last_deployed_at.is_some());
    assert!(done.logs.starts_with("==> [queued]"));
    assert!(done.logs.contains("==> [fetch] Pulling origin/main"));
    assert!(done.logs.contains("==> [restart] Restarting shop-web"));
    assert!(done.logs.trim_end().ends_with("==> [done] Deployment finished successfully"));
    assert_eq!(*h.supervisor.restarts.lock().unwrap(), vec!["shop-web".to_string()]);

    let history = h.coordinator.history().list(&deployment.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DeploymentStatus::Success);
    assert_eq!(history[0].kind, "deploy");
    assert_eq!(history[0].commit_hash.as_deref(), Some(COMMIT));

    let sent = h.wait_mail(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["dev@example.com".to_string()]);
    assert!(sent[0].subject.ends_with("SUCCESS"));
}

#[tokio::test]
async fn test_post_deploy_command_runs_in_source() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h
        .create(serde_json::json!({ "post_deploy_command": "echo migrated > marker.txt" }))
        .await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Success);
    let marker = std::fs::read_to_string(h.source().join("marker.txt")).unwrap();
    assert_eq!(marker.trim(), "migrated");
}

#[tokio::test]
async fn test_fetch_failure_fails_run() {
    let h = HarnessBuilder::new().vcs(FakeVcs::failing()).start().await;
    let deployment = h
        .create(serde_json::json!({ "supervisor_process": "shop-web" }))
        .await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Failed);
    assert!(done.logs.contains("couldn't find remote ref main"));
    assert!(done.logs.contains("ERROR: Stage failed: fetch"));
    assert!(done.logs.trim_end().ends_with("==> [failed] Deployment failed"));
    // Later stages never ran
    assert!(h.supervisor.restarts.lock().unwrap().is_empty());

    let history = h.coordinator.history().list(&deployment.id).await.unwrap();
    assert_eq!(history[0].status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_unknown_run_as_fails_without_fallback() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h
        .create(serde_json::json!({
            "post_deploy_command": "touch should-not-exist",
            "run_as": "no-such-user-deployd",
        }))
        .await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Failed);
    assert!(done.logs.contains("no-such-user-deployd"));
    assert!(!h.source().join("should-not-exist").exists());
}

#[tokio::test]
async fn test_missing_source_directory_fails() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h
        .create(serde_json::json!({ "project_path": "/nonexistent/deployd/source" }))
        .await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Failed);
    assert!(done.logs.contains("does not exist"));
}

#[tokio::test]
async fn test_worker_panic_marks_failed() {
    let h = HarnessBuilder::new().vcs(FakeVcs::panicking()).start().await;
    let deployment = h.create(serde_json::json!({})).await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Failed);
    assert!(done.logs.contains("crashed"));
    assert!(done.logs.contains("vcs exploded"));
    assert_eq!(done.deploy_count, 1);

    // The deployment accepts new runs afterwards
    assert!(!h.coordinator.is_active(&deployment.id));
}

// =============================== CONCURRENCY =================================== //

#[tokio::test]
async fn test_second_trigger_rejected_while_running() {
    let h = HarnessBuilder::new()
        .vcs(FakeVcs::slow(Duration::from_millis(300)))
        .start()
        .await;
    let deployment = h.create(serde_json::json!({})).await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let running = h.get(&deployment.id).await.unwrap();
    assert_eq!(running.status, DeploymentStatus::Running);

    let second = h.coordinator.trigger(&deployment.id, RunKind::Deploy).await;
    assert!(matches!(second, Err(DeployError::AlreadyRunning(_))));

    let done = h.wait_terminal(&deployment.id).await;
    assert_status(&done, DeploymentStatus::Success);
    assert_eq!(done.deploy_count, 1);

    // Terminal again, so a new run is accepted
    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;
    assert_eq!(done.deploy_count, 2);
}

#[tokio::test]
async fn test_trigger_unknown_deployment() {
    let h = HarnessBuilder::new().start().await;
    let err = h
        .coordinator
        .trigger("5b0f2c1e-7f43-4a44-9a53-0c6f7f7e0e11", RunKind::Deploy)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));
}

#[tokio::test]
async fn test_subscriber_sees_updates_then_final() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(serde_json::json!({})).await;
    let mut sub = h.coordinator.broadcaster().attach(&deployment.id);

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();

    let mut frames = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), sub.frames.recv())
            .await
            .unwrap()
            .unwrap();
        let last = frame.kind == FrameKind::Final;
        frames.push(frame);
        if last {
            break;
        }
    }

    let (last, updates) = frames.split_last().unwrap();
    assert_eq!(last.status, Some(DeploymentStatus::Success));
    assert_eq!(last.phase.as_deref(), Some("done"));
    assert!(!updates.is_empty());
    assert!(updates.iter().all(|f| f.kind == FrameKind::Update));
    assert!(updates.iter().all(|f| f.status == Some(DeploymentStatus::Running)));

    // Cumulative logs only ever grow
    let lengths: Vec<usize> = frames.iter().map(|f| f.logs.as_ref().unwrap().len()).collect();
    assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
}

// ================================= SWARM ======================================= //

fn swarm(extra: serde_json::Value) -> serde_json::Value {
    let mut body = serde_json::json!({ "mode": "swarm" });
    if let (Some(base), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    body
}

#[tokio::test]
async fn test_swarm_success() {
    let h = HarnessBuilder::new()
        .runtime(FakeRuntime::converging(&[0, 1, 2], 2))
        .start()
        .await;
    let deployment = h
        .create(swarm(serde_json::json!({
            "rollout": { "web_replicas": 2, "migration_command": ["./manage.py", "migrate"] }
        })))
        .await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Success);
    assert_eq!(done.last_image.as_deref(), Some(IMAGE));
    assert!(done.logs.contains("attempt 3/3: web 2/2"));
    assert!(done.logs.contains("All roles reached their desired replica count"));

    let stages: Vec<String> = h
        .runtime
        .calls()
        .iter()
        .map(|c| c.split(' ').next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        stages,
        vec!["build", "publish", "publish", "network", "migrate", "rollout"]
    );
    assert!(h.runtime.calls()[4].contains("./manage.py migrate"));

    let stack_file = h.state_dir.path().join("stacks").join("shop.yml");
    let yaml = std::fs::read_to_string(stack_file).unwrap();
    assert!(yaml.contains(IMAGE));

    let history = h.coordinator.history().list(&deployment.id).await.unwrap();
    assert_eq!(history[0].image_tag.as_deref(), Some(IMAGE));
}

#[tokio::test]
async fn test_swarm_without_migration_skips_stage() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(swarm(serde_json::json!({}))).await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Success);
    assert!(done.logs.contains("No migration command configured, skipping"));
    assert!(!h.runtime.calls().iter().any(|c| c.starts_with("migrate")));
}

#[tokio::test]
async fn test_health_timeout_still_succeeds() {
    let h = HarnessBuilder::new()
        .runtime(FakeRuntime::converging(&[0], 1))
        .health_attempts(3)
        .start()
        .await;
    let deployment = h.create(swarm(serde_json::json!({}))).await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Success);
    assert!(done.logs.contains("WARNING: replicas did not converge after 3 attempts"));
}

#[tokio::test]
async fn test_push_failure_keeps_local_image() {
    let h = HarnessBuilder::new()
        .runtime(FakeRuntime::failing_at("publish"))
        .start()
        .await;
    let deployment = h.create(swarm(serde_json::json!({}))).await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Failed);
    assert!(done.logs.contains(&format!("Image {} is still available locally", IMAGE)));
    assert!(done.last_image.is_none());
    assert!(!h.runtime.calls().iter().any(|c| c.starts_with("rollout")));
}

#[tokio::test]
async fn test_failed_migration_aborts_rollout() {
    let h = HarnessBuilder::new()
        .runtime(FakeRuntime::failing_at("migrate"))
        .start()
        .await;
    let deployment = h
        .create(swarm(serde_json::json!({
            "rollout": { "migration_command": ["./manage.py", "migrate"] }
        })))
        .await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Failed);
    assert!(done.logs.contains("ERROR: Stage failed: migrate"));
    assert!(!h.runtime.calls().iter().any(|c| c.starts_with("rollout")));
}

// ================================ ROLLBACK ===================================== //

#[tokio::test]
async fn test_rollback_validation() {
    let h = HarnessBuilder::new().start().await;
    let single = h.create(serde_json::json!({})).await;
    let err = h
        .coordinator
        .trigger(&single.id, RunKind::Rollback { image_tag: IMAGE.to_string() })
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ValidationError(_)));

    let swarm_deployment = h.create(swarm(serde_json::json!({}))).await;
    let err = h
        .coordinator
        .trigger(&swarm_deployment.id, RunKind::Rollback { image_tag: IMAGE.to_string() })
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ValidationError(_)));

    // Rejected rollbacks leave the record untouched
    let untouched = h.get(&swarm_deployment.id).await.unwrap();
    assert_eq!(untouched.status, DeploymentStatus::Idle);
}

#[tokio::test]
async fn test_rollback_to_previous_image() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(swarm(serde_json::json!({}))).await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    h.wait_terminal(&deployment.id).await;

    h.coordinator
        .trigger(&deployment.id, RunKind::Rollback { image_tag: IMAGE.to_string() })
        .await
        .unwrap();
    let done = h.wait_terminal(&deployment.id).await;

    assert_status(&done, DeploymentStatus::Success);
    assert!(done.logs.contains(&format!("==> [rollback] Rolling back to {}", IMAGE)));
    assert_eq!(done.deploy_count, 2);

    // Rollback reuses the published image
    let builds = h.runtime.calls().iter().filter(|c| c.starts_with("build")).count();
    assert_eq!(builds, 1);

    let history = h.coordinator.history().list(&deployment.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].kind, "rollback");
    assert_eq!(history[0].commit_hash.as_deref(), Some(COMMIT));
}

// =============================== LIFECYCLE ===================================== //

#[tokio::test]
async fn test_delete_mid_run() {
    let h = HarnessBuilder::new()
        .vcs(FakeVcs::slow(Duration::from_millis(200)))
        .start()
        .await;
    let deployment = h
        .create(serde_json::json!({ "notification_emails": "dev@example.com" }))
        .await;

    h.coordinator.trigger(&deployment.id, RunKind::Deploy).await.unwrap();
    assert!(h.coordinator.delete(&deployment.id).await.unwrap());
    h.wait_released(&deployment.id).await;

    assert!(h.get(&deployment.id).await.is_none());
    assert!(h.coordinator.history().list(&deployment.id).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.mail.sent().is_empty());
}

#[tokio::test]
async fn test_recover_interrupted_runs() {
    let h = HarnessBuilder::new().start().await;
    let idle = h.create(serde_json::json!({})).await;
    let stuck = h.create(serde_json::json!({ "name": "stuck" })).await;
    h.coordinator
        .store()
        .update(
            &stuck.id,
            Box::new(|d: &mut Deployment| {
                d.status = DeploymentStatus::Running;
                d.logs = "==> [build] Building x\n".to_string();
            }),
        )
        .await
        .unwrap();

    assert_eq!(h.coordinator.recover_interrupted().await.unwrap(), 1);

    let recovered = h.get(&stuck.id).await.unwrap();
    assert_eq!(recovered.status, DeploymentStatus::Failed);
    assert!(recovered.logs.contains("interrupted"));
    assert!(recovered.logs.starts_with("==> [build] Building x\n"));
    assert_eq!(h.get(&idle.id).await.unwrap().status, DeploymentStatus::Idle);

    // Recovered records accept new runs
    h.coordinator.trigger(&stuck.id, RunKind::Deploy).await.unwrap();
    assert_status(&h.wait_terminal(&stuck.id).await, DeploymentStatus::Success);
}
