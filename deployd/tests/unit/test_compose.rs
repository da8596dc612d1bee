//! Stack composition unit tests

use std::fs;

use deployd::deploy::compose::{compose, StackContext, ROLE_MONITOR, ROLE_SCHEDULER, ROLE_WEB, ROLE_WORKER};
use deployd::models::deployment::{Deployment, DeploymentCreate};

const IMAGE: &str = "registry.local:5001/shop:0123abcd";

fn swarm_deployment(rollout: serde_json::Value) -> Deployment {
    let create: DeploymentCreate = serde_json::from_value(serde_json::json!({
        "name": "Shop",
        "project_path": "/srv/shop",
        "mode": "swarm",
        "rollout": rollout,
    }))
    .unwrap();
    Deployment::new(create)
}

fn context() -> StackContext {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(".env"), "DATABASE_URL=postgres://db/shop\n").unwrap();
    fs::write(dir.path().join("firebase.json"), "{}").unwrap();
    let rollout = serde_json::from_value(serde_json::json!({ "port": 9000 })).unwrap();
    StackContext::resolve(dir.path(), &rollout).unwrap()
}

#[test]
fn test_web_only_stack() {
    let deployment = swarm_deployment(serde_json::json!({ "web_replicas": 0 }));
    let stack = compose(&deployment, IMAGE, &StackContext::default(), "app-net");

    assert_eq!(stack.services.len(), 1);
    let web = &stack.services[ROLE_WEB];
    // Web never scales to zero
    assert_eq!(web.deploy.replicas, 1);
    assert_eq!(web.image, IMAGE);
    assert_eq!(web.deploy.update_config.order, "start-first");
    assert_eq!(web.deploy.update_config.parallelism, 1);
    assert_eq!(web.deploy.update_config.failure_action.as_deref(), Some("rollback"));
    assert_eq!(web.ports, vec!["8080:8080".to_string()]);
    assert!(web.healthcheck.as_ref().unwrap().test[1].contains("8080"));
}

#[test]
fn test_all_roles() {
    let deployment = swarm_deployment(serde_json::json!({
        "web_replicas": 3,
        "worker_replicas": 2,
        "scheduler_enabled": true,
        "monitor_enabled": true,
        "worker_command": ["celery", "worker"],
    }));
    let stack = compose(&deployment, IMAGE, &StackContext::default(), "app-net");

    let desired = stack.desired_replicas();
    assert_eq!(desired[ROLE_WEB], 3);
    assert_eq!(desired[ROLE_WORKER], 2);
    assert_eq!(desired[ROLE_SCHEDULER], 1);
    assert_eq!(desired[ROLE_MONITOR], 1);

    let worker = &stack.services[ROLE_WORKER];
    assert_eq!(worker.deploy.update_config.order, "stop-first");
    assert_eq!(worker.stop_grace_period.as_deref(), Some("60s"));
    assert_eq!(
        worker.command,
        Some(vec!["celery".to_string(), "worker".to_string()])
    );
    assert!(worker.ports.is_empty());
}

#[test]
fn test_disabled_roles_are_omitted() {
    let deployment = swarm_deployment(serde_json::json!({ "worker_replicas": 0 }));
    let stack = compose(&deployment, IMAGE, &StackContext::default(), "app-net");
    assert!(!stack.services.contains_key(ROLE_WORKER));
    assert!(!stack.services.contains_key(ROLE_SCHEDULER));
    assert!(!stack.services.contains_key(ROLE_MONITOR));
}

#[test]
fn test_roles_share_environment_network_and_volumes() {
    let deployment = swarm_deployment(serde_json::json!({
        "port": 9000,
        "worker_replicas": 1,
        "scheduler_enabled": true,
    }));
    let context = context();
    let stack = compose(&deployment, IMAGE, &context, "app-net");

    for (role, service) in &stack.services {
        assert_eq!(service.networks, vec!["app-net".to_string()], "{}", role);
        assert_eq!(service.environment["DATABASE_URL"], "postgres://db/shop", "{}", role);
        assert_eq!(service.environment["PORT"], "9000", "{}", role);
        assert_eq!(service.environment["APP_PORT"], "9000", "{}", role);
        assert!(service.volumes.contains(&"storage:/usr/src/app/storage".to_string()));
        assert!(service
            .volumes
            .iter()
            .any(|v| v.ends_with(":/usr/src/app/firebase.json:ro")));
    }
}

#[test]
fn test_yaml_declares_external_network() {
    let deployment = swarm_deployment(serde_json::json!({}));
    let stack = compose(&deployment, IMAGE, &StackContext::default(), "app-net");
    let yaml = stack.to_yaml().unwrap();

    let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed["version"].as_str(), Some("3.8"));
    assert_eq!(parsed["networks"]["app-net"]["external"].as_bool(), Some(true));
    assert!(parsed["volumes"]["storage"].is_mapping());
    assert_eq!(parsed["services"]["web"]["image"].as_str(), Some(IMAGE));
}
