#![forbid(unsafe_code)]

use std::time::Duration;

use subsync_core::error::is_temporary;
use subsync_core::{Operation, OperationType, ProvisioningParameters, SyncError};
use subsync_ops::{ClusterDriver, DriverState, HttpClusterDriver};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn operation() -> Operation {
    let params = ProvisioningParameters { plan_id: "azure".into(), global_account_id: "ga-1".into(), ..Default::default() };
    Operation::new(OperationType::Provision, "inst-1", params)
}

fn driver(server: &MockServer) -> HttpClusterDriver { HttpClusterDriver::new(&server.uri(), Duration::from_secs(5)).unwrap() }

#[tokio::test]
async fn start_posts_the_operation() {
    let server = MockServer::start().await;
    let op = operation();
    Mock::given(method("POST"))
        .and(path("/operations"))
        .and(body_partial_json(serde_json::json!({
            "operationId": op.id,
            "instanceId": "inst-1",
            "planId": "azure",
            "globalAccountId": "ga-1",
            "type": "provision",
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({ "id": "drv-7" })))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(driver(&server).start(&op).await.unwrap(), "drv-7");
}

#[tokio::test]
async fn status_is_decoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/operations/drv-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "state": "IN_PROGRESS" })))
        .mount(&server)
        .await;

    let status = driver(&server).operation_status("drv-7").await.unwrap();
    assert_eq!(status.state, DriverState::InProgress);
    assert_eq!(status.message, None);
}

#[tokio::test]
async fn server_errors_are_temporary() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).mount(&server).await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(400).set_body_string("bad id")).mount(&server).await;

    let err = driver(&server).start(&operation()).await.unwrap_err();
    assert!(is_temporary(&err));

    let err = driver(&server).operation_status("x").await.unwrap_err();
    assert!(!is_temporary(&err));
    assert!(err.downcast_ref::<SyncError>().is_some_and(|e| e.reason.contains("bad id")));
}
