use crate::common::*;
use crate::setup_integration_tests;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use toolgate::backend::{SessionStatus, SESSION_HEADER};
use toolgate::clock::ManualClock;
use toolgate::errors::GatewayError;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_expired_token_triggers_exactly_one_login() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .and(body_partial_json(json!({ "api-key": "k" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_response("S1", 600)))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_response("S2", 600)))
        .expect(1)
        .mount(&server)
        .await;
    mount_single_domain(&server).await;

    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .and(header(SESSION_HEADER, "S1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "objects": [], "total": 0 })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .and(header(SESSION_HEADER, "S2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "objects": [], "total": 0 })))
        .expect(1)
        .mount(&server)
        .await;

    let session = primary_session(&api_key_config(&server, "k"), &clock);

    session.call("show-hosts", &json!({})).await.unwrap();
    assert_eq!(session.login_count(), 1);
    assert_eq!(session.status().await, SessionStatus::Authenticated);

    clock.advance_secs(601);
    assert_eq!(session.status().await, SessionStatus::Expired);

    session.call("show-hosts", &json!({})).await.unwrap();
    assert_eq!(session.login_count(), 2);
}

#[tokio::test]
async fn test_token_inside_safety_margin_is_renewed() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    mount_login(&server, "S1").await;
    mount_single_domain(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let session = primary_session(&api_key_config(&server, "k"), &clock);
    session.call("show-hosts", &json!({})).await.unwrap();

    clock.advance_secs(585);
    session.call("show-hosts", &json!({})).await.unwrap();
    assert_eq!(session.login_count(), 1);

    // 595s is within the safety margin of a 600s token
    clock.advance_secs(10);
    session.call("show-hosts", &json!({})).await.unwrap();
    assert_eq!(session.login_count(), 2);
}

#[tokio::test]
async fn test_rejected_session_is_renewed_and_retried_once() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_response("S1", 600)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_login(&server, "S2").await;
    mount_single_domain(&server).await;

    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .and(header(SESSION_HEADER, "S1"))
        .respond_with(session_rejected())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .and(header(SESSION_HEADER, "S2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "total": 3 })))
        .expect(1)
        .mount(&server)
        .await;

    let session = primary_session(&api_key_config(&server, "k"), &clock);
    let response = session.call("show-hosts", &json!({})).await.unwrap();

    assert_eq!(response["total"], 3);
    assert_eq!(session.login_count(), 2);
}

#[tokio::test]
async fn test_second_rejection_fails_visibly() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    mount_login(&server, "S1").await;
    mount_single_domain(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .respond_with(session_rejected())
        .expect(2)
        .mount(&server)
        .await;

    let session = primary_session(&api_key_config(&server, "k"), &clock);
    let err = session.call("show-hosts", &json!({})).await.unwrap_err();

    match err {
        GatewayError::Backend { command, status, body } => {
            assert_eq!(command, "show-hosts");
            assert_eq!(status, 401);
            assert!(body.contains("Wrong session id"));
        }
        other => panic!("expected backend error, got {other:?}"),
    }
    assert_eq!(session.login_count(), 2);
}

#[tokio::test]
async fn test_other_unauthorized_responses_are_not_retried() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    mount_login(&server, "S1").await;
    mount_single_domain(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("delete-host")))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "code": "generic_err_insufficient_permissions",
            "message": "Insufficient permissions for this operation"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = primary_session(&api_key_config(&server, "k"), &clock);
    let err = session.call("delete-host", &json!({ "name": "h1" })).await.unwrap_err();

    assert!(matches!(err, GatewayError::Backend { status: 401, .. }));
    assert_eq!(session.login_count(), 1);
}

#[tokio::test]
async fn test_login_without_sid_is_an_authentication_failure() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "session-timeout": 600 })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let session = primary_session(&api_key_config(&server, "k"), &clock);
    let err = session.call("show-hosts", &json!({})).await.unwrap_err();

    assert!(matches!(err, GatewayError::Authentication { .. }));
    assert_eq!(session.status().await, SessionStatus::Unauthenticated);
}

#[tokio::test]
async fn test_rejected_credentials_name_the_target() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "err_login_failed",
            "message": "Authentication to server failed."
        })))
        .mount(&server)
        .await;

    let config = api_key_config(&server, "super-secret-key");
    let session = primary_session(&config, &clock);
    let err = session.call("show-hosts", &json!({})).await.unwrap_err();

    let message = err.to_string();
    assert!(matches!(err, GatewayError::Authentication { .. }));
    assert!(message.contains(&config.target.display_name()));
    assert!(message.contains("HTTP 400"));
    assert!(!message.contains("super-secret-key"));
}

#[tokio::test]
async fn test_concurrent_calls_share_one_login() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(login_response("S1", 600))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_single_domain(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .and(header(SESSION_HEADER, "S1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(8)
        .mount(&server)
        .await;

    let session = primary_session(&api_key_config(&server, "k"), &clock);
    let calls = (0..8).map(|_| {
        let session = Arc::clone(&session);
        async move { session.call("show-hosts", &json!({})).await }
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(session.login_count(), 1);
}

#[tokio::test]
async fn test_concurrent_rejections_share_one_relogin() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_response("S1", 600)))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_response("S2", 600)))
        .expect(1)
        .mount(&server)
        .await;
    mount_single_domain(&server).await;

    // Both calls are in flight with S1 before either rejection arrives
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .and(header(SESSION_HEADER, "S1"))
        .respond_with(session_rejected().set_delay(Duration::from_millis(100)))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .and(header(SESSION_HEADER, "S2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "total": 0 })))
        .expect(2)
        .mount(&server)
        .await;

    let session = primary_session(&api_key_config(&server, "k"), &clock);
    let calls = (0..2).map(|_| {
        let session = Arc::clone(&session);
        async move { session.call("show-hosts", &json!({})).await }
    });
    let results = futures::future::join_all(calls).await;

    for result in &results {
        assert_eq!(result.as_ref().unwrap()["total"], 0);
    }
    assert_eq!(session.login_count(), 2);
    assert_eq!(session.status().await, SessionStatus::Authenticated);
}

#[tokio::test]
async fn test_bearer_token_skips_login() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_response("S1", 600)))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "objects": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let session = primary_session(&bearer_config(&server, "tok-1"), &clock);
    session.call("show-hosts", &json!({})).await.unwrap();

    // Bearer tokens never expire locally
    clock.advance_secs(86_400);
    assert_eq!(session.status().await, SessionStatus::Authenticated);
}

#[tokio::test]
async fn test_rejected_bearer_token_is_an_authentication_failure() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .respond_with(session_rejected())
        .expect(1)
        .mount(&server)
        .await;

    let session = primary_session(&bearer_config(&server, "tok-1"), &clock);
    let err = session.call("show-hosts", &json!({})).await.unwrap_err();

    assert!(matches!(err, GatewayError::Authentication { .. }));
}

#[tokio::test]
async fn test_logout_posts_current_session() {
    setup_integration_tests();
    let server = MockServer::start().await;
    let clock = ManualClock::starting_now();

    mount_login(&server, "S1").await;
    mount_single_domain(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("logout")))
        .and(header(SESSION_HEADER, "S1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "OK" })))
        .expect(1)
        .mount(&server)
        .await;

    let session = primary_session(&api_key_config(&server, "k"), &clock);
    session.call("show-hosts", &json!({})).await.unwrap();
    session.logout().await.unwrap();

    assert_eq!(session.status().await, SessionStatus::Unauthenticated);

    // Nothing left to log out of
    session.logout().await.unwrap();
}
