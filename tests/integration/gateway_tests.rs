use crate::common::*;
use crate::setup_integration_tests;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use toolgate::clock::ManualClock;
use toolgate::config::{headers, RequestMetadata};
use toolgate::gateway::{Gateway, GatewaySettings, ResultStatus, ToolRequest};
use toolgate::session::{TransportMetadata, DEFAULT_CALLER_ID};
use toolgate::task::BackoffSchedule;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway(max_sessions: usize, clock: &Arc<ManualClock>) -> Gateway {
    let settings = GatewaySettings {
        idle_timeout: Duration::from_secs(1800),
        max_sessions,
        max_task_polls: 5,
        backoff: BackoffSchedule::immediate(),
    };
    Gateway::new(settings, clock.clone())
}

fn show_hosts() -> ToolRequest {
    ToolRequest::ApiCall {
        command: "show-hosts".to_string(),
        payload: json!({ "limit": 10 }),
        target: None,
    }
}

async fn mount_backend(server: &MockServer) {
    mount_login(server, "S1").await;
    mount_single_domain(server).await;
    mount_logout(server).await;
    Mock::given(method("POST"))
        .and(path(api_path("show-hosts")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "objects": [], "total": 0 })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_call_with_header_configuration() {
    setup_integration_tests();
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let clock = ManualClock::starting_now();
    let gateway = gateway(10, &clock);

    let result = gateway
        .handle(
            "caller-1",
            &api_key_metadata(&server, "k"),
            TransportMetadata::http(None, Some("test-agent".to_string())),
            show_hosts(),
        )
        .await;

    assert_eq!(result.status, ResultStatus::Ok);
    assert_eq!(result.data.unwrap()["total"], 0);

    // Later calls reuse the stored configuration without resending headers
    let result = gateway
        .handle("caller-1", &RequestMetadata::new(), TransportMetadata::stdio(), show_hosts())
        .await;
    assert!(result.is_ok());

    let report = gateway.status_report().unwrap();
    assert_eq!(report.active_callers, 1);
    assert_eq!(report.callers[0].caller_id, "caller-1");
}

#[tokio::test]
async fn test_population_cap_evicts_connections() {
    setup_integration_tests();
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let clock = ManualClock::starting_now();
    let gateway = gateway(2, &clock);
    let metadata = api_key_metadata(&server, "k");

    for caller in ["c1", "c2", "c3"] {
        let result = gateway
            .handle(caller, &metadata, TransportMetadata::stdio(), show_hosts())
            .await;
        assert!(result.is_ok());
        clock.advance_secs(1);
    }

    assert!(gateway.registry().get("c1").unwrap().is_none());
    assert!(!gateway.connections().contains("c1").await);
    assert!(gateway.connections().contains("c2").await);
    assert!(gateway.connections().contains("c3").await);

    // An evicted caller has to configure itself again
    let result = gateway
        .handle("c1", &RequestMetadata::new(), TransportMetadata::stdio(), show_hosts())
        .await;
    assert_eq!(result.status, ResultStatus::Error);
    assert_eq!(result.error.unwrap().kind, "unknown_caller");
}

#[tokio::test]
async fn test_idle_eviction_spares_default_caller() {
    setup_integration_tests();
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let clock = ManualClock::starting_now();
    let gateway = gateway(10, &clock)
        .with_default_configuration(api_key_config(&server, "k"))
        .await
        .unwrap();

    let result = gateway
        .handle(DEFAULT_CALLER_ID, &RequestMetadata::new(), TransportMetadata::stdio(), show_hosts())
        .await;
    assert!(result.is_ok());
    let result = gateway
        .handle("visitor", &api_key_metadata(&server, "k"), TransportMetadata::stdio(), show_hosts())
        .await;
    assert!(result.is_ok());

    clock.advance_secs(2 * 3600);
    let evicted = gateway.evict_idle().await.unwrap();

    assert_eq!(evicted, vec!["visitor".to_string()]);
    assert!(gateway.registry().get(DEFAULT_CALLER_ID).unwrap().is_some());
    assert!(gateway.connections().contains(DEFAULT_CALLER_ID).await);
    assert!(!gateway.connections().contains("visitor").await);
}

#[tokio::test]
async fn test_errors_are_structured_results() {
    setup_integration_tests();
    let server = MockServer::start().await;
    mount_login(&server, "S1").await;
    mount_single_domain(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("set-host")))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "code": "generic_error",
            "message": "Object is locked"
        })))
        .mount(&server)
        .await;
    let clock = ManualClock::starting_now();
    let gateway = gateway(10, &clock);

    // No configuration at all
    let result = gateway
        .handle("nobody", &RequestMetadata::new(), TransportMetadata::stdio(), show_hosts())
        .await;
    assert_eq!(result.error.unwrap().kind, "unknown_caller");

    // Conflicting targets
    let mut conflicting = api_key_metadata(&server, "secret-key");
    conflicting.insert(headers::TENANT_URL.to_string(), "https://tenant.example".to_string());
    let result = gateway
        .handle("confused", &conflicting, TransportMetadata::stdio(), show_hosts())
        .await;
    let error = result.error.unwrap();
    assert_eq!(error.kind, "configuration");
    assert!(error.message.contains("tenant URL"));
    assert!(!error.message.contains("secret-key"));

    // Backend failure carries the status and body
    let result = gateway
        .handle(
            "caller",
            &api_key_metadata(&server, "k"),
            TransportMetadata::stdio(),
            ToolRequest::ApiCall {
                command: "set-host".to_string(),
                payload: json!({ "name": "h1" }),
                target: None,
            },
        )
        .await;
    assert_eq!(result.status, ResultStatus::Error);
    let error = result.error.unwrap();
    assert_eq!(error.kind, "backend");
    assert!(error.message.contains("500"));
    assert!(error.message.contains("Object is locked"));
    assert!(!error.correlation_id.is_empty());
}

#[tokio::test]
async fn test_unfinished_script_is_processing() {
    setup_integration_tests();
    let server = MockServer::start().await;
    mount_login(&server, "S1").await;
    mount_single_domain(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("run-script")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tasks": [{ "task-id": "T7" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("show-task")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tasks": [{ "task-id": "T7", "status": "in progress" }]
        })))
        .expect(2)
        .mount(&server)
        .await;
    let clock = ManualClock::starting_now();
    let gateway = gateway(10, &clock);

    let result = gateway
        .handle(
            "caller",
            &api_key_metadata(&server, "k"),
            TransportMetadata::stdio(),
            ToolRequest::RunScript {
                target: "gw1".to_string(),
                name: "show_route".to_string(),
                script: "netstat -rn".to_string(),
                max_retries: Some(2),
            },
        )
        .await;

    assert_eq!(result.status, ResultStatus::Processing);
    assert_eq!(result.task_id.as_deref(), Some("T7"));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_set_debug_is_visible_on_cached_connection() {
    setup_integration_tests();
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let clock = ManualClock::starting_now();
    let gateway = gateway(10, &clock);

    let result = gateway
        .handle("caller", &api_key_metadata(&server, "k"), TransportMetadata::stdio(), show_hosts())
        .await;
    assert!(result.is_ok());
    let connection = gateway.connections().get("caller").await.unwrap();
    assert!(!connection.debug());

    let result = gateway
        .handle(
            "caller",
            &RequestMetadata::new(),
            TransportMetadata::stdio(),
            ToolRequest::SetDebug { enabled: true },
        )
        .await;
    assert!(result.is_ok());
    assert!(connection.debug());

    let mut metadata = RequestMetadata::new();
    metadata.insert(headers::DEBUG.to_string(), "false".to_string());
    gateway
        .handle("caller", &metadata, TransportMetadata::stdio(), show_hosts())
        .await;
    assert!(!connection.debug());
    assert!(Arc::ptr_eq(&connection, &gateway.connections().get("caller").await.unwrap()));
}

/// Wait for the background logout of a discarded connection to reach `server`
async fn logouts_received(server: &MockServer) -> usize {
    for _ in 0..50 {
        let count = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == api_path("logout"))
            .count();
        if count > 0 {
            return count;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    0
}

#[tokio::test]
async fn test_cap_tie_keeps_the_new_caller_and_its_connection() {
    setup_integration_tests();
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let clock = ManualClock::starting_now();
    let gateway = gateway(1, &clock);
    let metadata = api_key_metadata(&server, "k");

    // Same instant; "a" sorts before "b"
    for caller in ["b", "a"] {
        let result = gateway
            .handle(caller, &metadata, TransportMetadata::stdio(), show_hosts())
            .await;
        assert!(result.is_ok());
    }

    assert!(gateway.registry().get("a").unwrap().is_some());
    assert!(gateway.registry().get("b").unwrap().is_none());
    assert!(gateway.connections().contains("a").await);
    assert!(!gateway.connections().contains("b").await);

    clock.advance_secs(10 * 3600);
    let evicted = gateway.evict_idle().await.unwrap();

    assert_eq!(evicted, vec!["a".to_string()]);
    assert!(gateway.connections().caller_ids().await.is_empty());
}

#[tokio::test]
async fn test_idle_sweep_discards_unregistered_connections() {
    setup_integration_tests();
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let clock = ManualClock::starting_now();
    let gateway = gateway(10, &clock)
        .with_default_configuration(api_key_config(&server, "k"))
        .await
        .unwrap();

    gateway
        .connections()
        .configure("stray", api_key_config(&server, "k"))
        .await
        .unwrap();
    assert!(gateway.connections().contains("stray").await);

    let evicted = gateway.evict_idle().await.unwrap();

    assert!(evicted.is_empty());
    assert!(!gateway.connections().contains("stray").await);
    assert!(gateway.connections().contains(DEFAULT_CALLER_ID).await);
}

#[tokio::test]
async fn test_switching_backends_logs_out_previous_connection() {
    setup_integration_tests();
    let old_server = MockServer::start().await;
    let new_server = MockServer::start().await;
    mount_backend(&old_server).await;
    mount_backend(&new_server).await;
    let clock = ManualClock::starting_now();
    let gateway = gateway(10, &clock);

    let result = gateway
        .handle("caller", &api_key_metadata(&old_server, "k"), TransportMetadata::stdio(), show_hosts())
        .await;
    assert!(result.is_ok());
    let previous = gateway.connections().get("caller").await.unwrap();

    let result = gateway
        .handle("caller", &api_key_metadata(&new_server, "k"), TransportMetadata::stdio(), show_hosts())
        .await;
    assert!(result.is_ok());

    assert_eq!(logouts_received(&old_server).await, 1);
    let current = gateway.connections().get("caller").await.unwrap();
    assert!(!Arc::ptr_eq(&previous, &current));
}

#[tokio::test]
async fn test_headers_without_debug_keep_the_current_flag() {
    setup_integration_tests();
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let clock = ManualClock::starting_now();
    let gateway = gateway(10, &clock);
    let metadata = api_key_metadata(&server, "k");

    let result = gateway
        .handle("caller", &metadata, TransportMetadata::stdio(), show_hosts())
        .await;
    assert!(result.is_ok());
    let result = gateway
        .handle(
            "caller",
            &RequestMetadata::new(),
            TransportMetadata::stdio(),
            ToolRequest::SetDebug { enabled: true },
        )
        .await;
    assert!(result.is_ok());

    // The transport resends the connection headers, but not x-debug
    let result = gateway
        .handle("caller", &metadata, TransportMetadata::stdio(), show_hosts())
        .await;
    assert!(result.is_ok());

    let connection = gateway.connections().get("caller").await.unwrap();
    assert!(connection.debug());
    assert!(gateway.connections().configuration("caller").await.unwrap().debug);
}
