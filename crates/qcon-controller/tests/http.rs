use std::net::SocketAddr;

use qcon_controller::{start_server, ControllerConfig, ServerHandle};
use reqwest::StatusCode;
use serde_json::{json, Value};
use uuid::Uuid;

const SECRET: &str = "launch-secret";

async fn server(limit: usize) -> (ServerHandle, SocketAddr) {
    let mut config = ControllerConfig::new(
        "/nonexistent/qemu",
        "/nonexistent/images",
        "/nonexistent/venv",
        SECRET,
    );
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.emulator_limit = limit;
    let handle = start_server(config).await.unwrap();
    let addr = handle.local_addr();
    (handle, addr)
}

fn launch_body(platform: &str) -> Value {
    json!({ "token": "abcdefghijkl", "platform": platform, "version": "4.0" })
}

fn parse_metric(body: &str, name: &str) -> Option<u64> {
    body.lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let (key, value) = line.split_once(' ')?;
            (key == name).then(|| value.parse().ok()).flatten()
        })
}

#[tokio::test]
async fn healthz_is_ok() {
    let (handle, addr) = server(1).await;
    let res = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    handle.shutdown().await;
}

#[tokio::test]
async fn launch_admission_statuses() {
    let (handle, addr) = server(0).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/launch");

    let res = client
        .post(&url)
        .json(&launch_body("basalt"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client
        .post(&url)
        .header("Authorization", "wrong")
        .json(&launch_body("basalt"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client
        .post(&url)
        .header("Authorization", SECRET)
        .json(&launch_body("basalt"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let metrics = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(parse_metric(&metrics, "qcon_launch_rejected_total"), Some(3));
    assert_eq!(parse_metric(&metrics, "qcon_instances_active"), Some(0));

    handle.shutdown().await;
}

#[tokio::test]
async fn path_separators_are_a_bad_request() {
    let (handle, addr) = server(1).await;
    let client = reqwest::Client::new();

    for body in [
        launch_body("basalt/evil"),
        json!({ "token": "t", "platform": "basalt", "version": "../../etc" }),
        launch_body("tintin"),
    ] {
        let res = client
            .post(format!("http://{addr}/launch"))
            .header("Authorization", SECRET)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{body}");
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn ping_and_kill_unknown_instances() {
    let (handle, addr) = server(1).await;
    let client = reqwest::Client::new();
    let id = Uuid::new_v4();

    let res = client
        .post(format!("http://{addr}/{id}/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.json::<Value>().await.unwrap(), json!({ "alive": false }));

    for _ in 0..2 {
        let res = client
            .post(format!("http://{addr}/{id}/kill"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.json::<Value>().await.unwrap(), json!({ "status": "ok" }));
    }

    let res = client
        .post(format!("http://{addr}/{id}/test/kill"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    handle.shutdown().await;
}

#[tokio::test]
async fn malformed_ids_are_not_found() {
    let (handle, addr) = server(1).await;
    let client = reqwest::Client::new();

    for path in ["not-a-uuid/ping", "not-a-uuid/kill", "not-a-uuid/test/kill"] {
        let res = client
            .post(format!("http://{addr}/{path}"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND, "{path}");
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_run_needs_a_known_instance() {
    let (handle, addr) = server(1).await;
    let client = reqwest::Client::new();
    let id = Uuid::new_v4();

    let res = client
        .post(format!("http://{addr}/{id}/test"))
        .header("Authorization", SECRET)
        .body(Vec::<u8>::new())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    handle.shutdown().await;
}

#[tokio::test]
async fn tunnel_to_unknown_instance_is_not_found() {
    let (handle, addr) = server(1).await;
    let id = Uuid::new_v4();

    for channel in ["phone", "vnc"] {
        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/{id}/ws/{channel}"))
            .await
            .unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), 404);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    handle.shutdown().await;
}
