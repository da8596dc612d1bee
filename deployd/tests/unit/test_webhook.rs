//! Webhook gateway and HTTP API tests

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use secrecy::SecretString;
use tower::ServiceExt;

use deployd::authn::token::{Claims, TokenVerifier};
use deployd::errors::DeployError;
use deployd::models::deployment::{Deployment, DeploymentStatus, WebhookSecret};
use deployd::server::serve::router;
use deployd::server::state::ServerState;
use deployd::webhook::{sign, verify_signature, EVENT_HEADER, SIGNATURE_HEADER};

use crate::fakes::{assert_status, FakeVcs, Harness, HarnessBuilder};

const JWT_SECRET: &str = "operator-signing-key";
const PUSH_MAIN: &[u8] = br#"{"ref":"refs/heads/main","after":"0123abcd"}"#;
const PUSH_DEV: &[u8] = br#"{"ref":"refs/heads/dev","after":"0123abcd"}"#;

fn app(h: &Harness) -> Router {
    let secret = SecretString::from(JWT_SECRET);
    let verifier = Arc::new(TokenVerifier::new(Some(&secret)));
    router(Arc::new(ServerState::new(
        h.coordinator.clone(),
        verifier,
        Duration::from_secs(30),
    )))
}

fn operator_token() -> String {
    let claims = Claims {
        sub: "ops".to_string(),
        exp: (chrono::Utc::now().timestamp() + 600) as u64,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

fn webhook(deployment: &Deployment, event: &str, body: &'static [u8], signature: Option<String>) -> Request<Body> {
    let mut builder = Request::post(format!("/deployments/webhook/{}", deployment.id))
        .header("content-type", "application/json")
        .header(EVENT_HEADER, event);
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body)).unwrap()
}

fn signed(deployment: &Deployment, event: &str, body: &'static [u8]) -> Request<Body> {
    let signature = sign(&deployment.secret, body).unwrap();
    webhook(deployment, event, body, Some(signature))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

// =============================== SIGNATURES ==================================== //

#[test]
fn test_single_bit_mutations_rejected() {
    let secret = WebhookSecret::from("0123456789abcdef0123456789abcdef01234567");
    let signature = sign(&secret, PUSH_MAIN).unwrap();
    assert!(verify_signature(&secret, PUSH_MAIN, Some(&signature)).is_ok());

    for index in [0, PUSH_MAIN.len() / 2, PUSH_MAIN.len() - 1] {
        let mut body = PUSH_MAIN.to_vec();
        body[index] ^= 0x01;
        let err = verify_signature(&secret, &body, Some(&signature)).unwrap_err();
        assert!(matches!(err, DeployError::AuthError(_)));
    }

    let other = WebhookSecret::from("1123456789abcdef0123456789abcdef01234567");
    assert!(verify_signature(&other, PUSH_MAIN, Some(&signature)).is_err());
}

#[test]
fn test_uppercase_hex_signature_accepted() {
    let secret = WebhookSecret::from("s3cr3t");
    let signature = sign(&secret, PUSH_MAIN).unwrap();
    let upper = format!("sha256={}", signature["sha256=".len()..].to_uppercase());
    assert!(verify_signature(&secret, PUSH_MAIN, Some(&upper)).is_ok());
}

// ================================ WEBHOOKS ===================================== //

#[tokio::test]
async fn test_ping_confirms_without_running() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(serde_json::json!({})).await;
    let app = app(&h);

    let (status, body) = send(&app, signed(&deployment, "ping", br#"{"zen":"hi"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["message"], "Webhook configured successfully");
    assert_eq!(h.get(&deployment.id).await.unwrap().status, DeploymentStatus::Idle);
}

#[tokio::test]
async fn test_push_to_other_branch_ignored() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(serde_json::json!({})).await;
    let app = app(&h);

    let (status, body) = send(&app, signed(&deployment, "push", PUSH_DEV)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
    assert!(body["message"].as_str().unwrap().contains("refs/heads/dev"));
    assert_eq!(h.get(&deployment.id).await.unwrap().status, DeploymentStatus::Idle);
}

#[tokio::test]
async fn test_other_events_ignored() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(serde_json::json!({})).await;
    let app = app(&h);

    let (status, body) = send(&app, signed(&deployment, "issues", b"{}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn test_push_to_branch_queues_deployment() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(serde_json::json!({})).await;
    let app = app(&h);

    let (status, body) = send(&app, signed(&deployment, "push", PUSH_MAIN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "deployment_queued");

    let done = h.wait_terminal(&deployment.id).await;
    assert_status(&done, DeploymentStatus::Success);
}

#[tokio::test]
async fn test_empty_branch_accepts_any_push() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(serde_json::json!({ "branch": "" })).await;
    let app = app(&h);

    let (_, body) = send(&app, signed(&deployment, "push", PUSH_DEV)).await;
    assert_eq!(body["status"], "deployment_queued");
    h.wait_terminal(&deployment.id).await;
}

#[tokio::test]
async fn test_push_while_running_is_ignored() {
    let h = HarnessBuilder::new()
        .vcs(FakeVcs::slow(Duration::from_millis(300)))
        .start()
        .await;
    let deployment = h.create(serde_json::json!({})).await;
    let app = app(&h);

    let (_, first) = send(&app, signed(&deployment, "push", PUSH_MAIN)).await;
    assert_eq!(first["status"], "deployment_queued");
    let (status, second) = send(&app, signed(&deployment, "push", PUSH_MAIN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], "ignored");

    let done = h.wait_terminal(&deployment.id).await;
    assert_eq!(done.deploy_count, 1);
}

#[tokio::test]
async fn test_bad_signature_rejected() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(serde_json::json!({})).await;
    let app = app(&h);

    let (status, _) = send(&app, webhook(&deployment, "push", PUSH_MAIN, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = sign(&WebhookSecret::from("guess"), PUSH_MAIN).unwrap();
    let (status, _) = send(&app, webhook(&deployment, "push", PUSH_MAIN, Some(forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Signed for a different body
    let replayed = sign(&deployment.secret, PUSH_DEV).unwrap();
    let (status, _) = send(&app, webhook(&deployment, "push", PUSH_MAIN, Some(replayed))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(h.get(&deployment.id).await.unwrap().status, DeploymentStatus::Idle);
}

#[tokio::test]
async fn test_unknown_deployment_not_found() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(serde_json::json!({})).await;
    h.coordinator.delete(&deployment.id).await.unwrap();
    let app = app(&h);

    let (status, _) = send(&app, signed(&deployment, "push", PUSH_MAIN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_push_payload() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(serde_json::json!({})).await;
    let app = app(&h);

    let (status, _) = send(&app, signed(&deployment, "push", b"not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================== OPERATOR API =================================== //

#[tokio::test]
async fn test_trigger_requires_token() {
    let h = HarnessBuilder::new().start().await;
    let deployment = h.create(serde_json::json!({})).await;
    let app = app(&h);
    let uri = format!("/deployments/{}/trigger", deployment.id);

    let (status, _) = send(&app, Request::post(uri.as_str()).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        Request::post(uri.as_str())
            .header("authorization", "Bearer not-a-token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        Request::post(uri.as_str())
            .header("authorization", format!("Bearer {}", operator_token()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "deployment_queued");
    h.wait_terminal(&deployment.id).await;
}

#[tokio::test]
async fn test_trigger_while_running_conflicts() {
    let h = HarnessBuilder::new()
        .vcs(FakeVcs::slow(Duration::from_millis(300)))
        .start()
        .await;
    let deployment = h.create(serde_json::json!({})).await;
    let app = app(&h);
    let trigger = || {
        Request::post(format!("/deployments/{}/trigger", deployment.id))
            .header("authorization", format!("Bearer {}", operator_token()))
            .body(Body::empty())
            .unwrap()
    };

    let (status, _) = send(&app, trigger()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, trigger()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    h.wait_terminal(&deployment.id).await;
}

#[tokio::test]
async fn test_create_get_history_delete() {
    let h = HarnessBuilder::new().start().await;
    let app = app(&h);
    let auth = format!("Bearer {}", operator_token());

    let (status, created) = send(
        &app,
        Request::post("/deployments")
            .header("authorization", auth.as_str())
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "name": "api", "project_path": h.source() }).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "idle");
    assert_eq!(created["secret"].as_str().unwrap().len(), 40);
    assert_eq!(created["webhook_url"], format!("/deployments/webhook/{}", id));

    let (status, fetched) = send(
        &app,
        Request::get(format!("/deployments/{}", id))
            .header("authorization", auth.as_str())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "api");

    let (status, history) = send(
        &app,
        Request::get(format!("/deployments/{}/history", id))
            .header("authorization", auth.as_str())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history, serde_json::json!([]));

    let delete = || {
        Request::delete(format!("/deployments/{}", id))
            .header("authorization", auth.as_str())
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&app, delete()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, delete()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_rejects_relative_path() {
    let h = HarnessBuilder::new().start().await;
    let app = app(&h);

    let (status, _) = send(
        &app,
        Request::post("/deployments")
            .header("authorization", format!("Bearer {}", operator_token()))
            .body(Body::from(r#"{"name":"api","project_path":"relative/dir"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

fn create_request(body: serde_json::Value) -> Request<Body> {
    Request::post("/deployments")
        .header("authorization", format!("Bearer {}", operator_token()))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_create_rejects_line_breaks() {
    let h = HarnessBuilder::new().start().await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        create_request(serde_json::json!({
            "name": "api\r\nBcc: someone@example.net",
            "project_path": h.source(),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("name"));

    let (status, _) = send(
        &app,
        create_request(serde_json::json!({
            "name": "api",
            "project_path": h.source(),
            "notification_emails": "dev@example.com\r\nBcc: someone@example.net",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_rejects_colliding_stack_name() {
    let h = HarnessBuilder::new().start().await;
    let app = app(&h);

    let (status, first) = send(
        &app,
        create_request(serde_json::json!({ "name": "My App", "project_path": h.source() })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    for name in ["my-app", "my_app", " MY APP "] {
        let (status, body) = send(
            &app,
            create_request(serde_json::json!({ "name": name, "project_path": "/srv/other" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", name);
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .contains(first["id"].as_str().unwrap()));
    }

    let (status, _) = send(
        &app,
        create_request(serde_json::json!({ "name": "my-app-2", "project_path": "/srv/other" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_health_is_public() {
    let h = HarnessBuilder::new().start().await;
    let (status, body) = send(&app(&h), Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}
