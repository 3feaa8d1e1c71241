//! End-to-end scenarios straight out of spec §8 ("End-to-end scenarios"),
//! driving a real [`WattsonClient`] against a real
//! [`wattson_core::controller::Controller`] over TCP: echo (scenario 1),
//! named-event rendezvous (scenario 2), and shutdown (scenario 6).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use wattson_client::{ClientConfig, WattsonClient};
use wattson_core::controller::ControllerBuilder;
use wattson_core::message::Payload;

async fn spawn_server(base: &std::path::Path, run_name: &str) -> (wattson_core::controller::Controller, std::net::SocketAddr, std::net::SocketAddr) {
    let (controller, receiver) = ControllerBuilder::new(base).build(run_name).unwrap();

    let query_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let query_addr = query_listener.local_addr().unwrap();
    let query_server = Arc::new(wattson_core::transport::QueryServer::new(controller.router()));
    let query_shutdown = controller.shutdown_receiver();
    tokio::spawn(async move {
        query_server.serve(query_listener, query_shutdown).await.unwrap();
    });

    let publish_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let publish_addr = publish_listener.local_addr().unwrap();
    let publish_server = Arc::new(wattson_core::transport::PublishServer::new());
    let publish_shutdown = controller.shutdown_receiver();
    tokio::spawn(async move {
        publish_server.serve(publish_listener, receiver, publish_shutdown).await.unwrap();
    });

    // Give both listeners a beat to start accepting before clients dial in.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (controller, query_addr, publish_addr)
}

fn temp_base(label: &str) -> std::path::PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("wattson-client-it-{label}-{}", std::process::id()));
    dir
}

#[tokio::test]
async fn scenario_1_echo_round_trip() {
    let base = temp_base("echo");
    let _ = std::fs::remove_dir_all(&base);
    let (controller, query_addr, publish_addr) = spawn_server(&base, "echo-scenario").await;

    let client = Arc::new(WattsonClient::new(
        ClientConfig::new("probe", query_addr, publish_addr).with_default_timeout(Duration::from_secs(5)),
    ));
    client.start().await.unwrap();
    assert!(client.is_registered());

    let response = client.query("ECHO", Payload::new()).await.unwrap();
    match response {
        wattson_core::message::Response::Ok { payload, .. } => assert!(payload.is_empty()),
        other => panic!("expected Ok, got {other:?}"),
    }

    client.stop();
    controller.stop();
    std::fs::remove_dir_all(&base).ok();
}

#[tokio::test]
async fn scenario_2_named_event_rendezvous() {
    let base = temp_base("event-rendezvous");
    let _ = std::fs::remove_dir_all(&base);
    let (controller, query_addr, publish_addr) = spawn_server(&base, "event-scenario").await;

    let client_a = Arc::new(WattsonClient::new(ClientConfig::new(
        "client_a",
        query_addr,
        publish_addr,
    )));
    let client_b = Arc::new(WattsonClient::new(ClientConfig::new(
        "client_b",
        query_addr,
        publish_addr,
    )));
    let client_c = Arc::new(WattsonClient::new(ClientConfig::new(
        "client_c",
        query_addr,
        publish_addr,
    )));
    client_a.start().await.unwrap();
    client_b.start().await.unwrap();
    client_c.start().await.unwrap();

    // B waits on "go" before A ever sets it: event_wait must first learn
    // the event is currently cleared (GET_EVENT_STATE), then block on the
    // EVENTS notification A's SET_EVENT eventually broadcasts.
    let waiter = {
        let client_b = client_b.clone();
        tokio::spawn(async move { client_b.event_wait("go", Some(Duration::from_secs(5))).await })
    };

    // Give B's wait a moment to register its interest before A fires.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client_a.event_set("go").await.unwrap();

    let observed = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("event_wait should not hang")
        .unwrap()
        .unwrap();
    assert!(observed);

    let occurred = client_c.event_is_set("go").await.unwrap();
    assert!(occurred);

    client_a.stop();
    client_b.stop();
    client_c.stop();
    controller.stop();
    std::fs::remove_dir_all(&base).ok();
}

#[tokio::test]
async fn scenario_6_shutdown_is_acknowledged_then_stops_the_controller() {
    let base = temp_base("shutdown");
    let _ = std::fs::remove_dir_all(&base);
    let (controller, query_addr, publish_addr) = spawn_server(&base, "shutdown-scenario").await;

    let client = Arc::new(WattsonClient::new(ClientConfig::new("operator", query_addr, publish_addr)));
    client.start().await.unwrap();

    client.request_shutdown().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(*controller.shutdown_receiver().borrow());

    client.stop();
    std::fs::remove_dir_all(&base).ok();
}

#[tokio::test]
async fn registration_assigns_distinct_ids_with_the_name_n_scheme() {
    let base = temp_base("registration");
    let _ = std::fs::remove_dir_all(&base);
    let (controller, query_addr, publish_addr) = spawn_server(&base, "registration-scenario").await;

    let first = Arc::new(WattsonClient::new(ClientConfig::new("scada", query_addr, publish_addr)));
    let second = Arc::new(WattsonClient::new(ClientConfig::new("scada", query_addr, publish_addr)));
    first.start().await.unwrap();
    second.start().await.unwrap();

    assert_eq!(first.client_id().as_deref(), Some("scada_0"));
    assert_eq!(second.client_id().as_deref(), Some("scada_1"));

    first.stop();
    second.stop();
    controller.stop();
    std::fs::remove_dir_all(&base).ok();
}
