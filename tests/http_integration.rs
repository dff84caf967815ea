use modeld::config::Config;
use modeld::engine::EchoEngine;
use modeld::error::ModeldError;
use modeld::http::client::HttpClient;
use modeld::http::server::HttpServer;
use modeld::http::ErrorReply;
use modeld::models::{ArtifactStore, ModelStatus, Orchestrator};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::Duration;

const IO_PARAMS: &str = r#"{
    "input_features": [{"name": "doc_text", "type": "text"}],
    "output_features": [{"name": "class", "type": "category"}]
}"#;

struct TestDaemon {
    _dir: TempDir,
    base_url: String,
    client: HttpClient,
    files: PathBuf,
}

/// Start a daemon on an ephemeral port backed by a fresh store
async fn start_daemon() -> TestDaemon {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::open(dir.path().join("models")).expect("Failed to open store");
    let orchestrator = Arc::new(Orchestrator::new(store, Arc::new(EchoEngine::new())));

    let (ready_tx, ready_rx) = oneshot::channel();
    let server = HttpServer::new(orchestrator, &Config::default())
        .expect("Failed to create server")
        .with_bind_addr("127.0.0.1:0")
        .with_ready_signal(ready_tx);
    tokio::spawn(async move {
        server.start().await.ok();
    });

    let addr = tokio::time::timeout(Duration::from_secs(2), ready_rx)
        .await
        .expect("Server didn't start in time")
        .expect("Server dropped ready signal");

    let files = dir.path().join("files");
    std::fs::create_dir_all(&files).unwrap();
    std::fs::write(files.join("io_params.json"), IO_PARAMS).unwrap();
    std::fs::write(files.join("train.csv"), "doc_text,class\nhello,greeting\n").unwrap();
    std::fs::write(files.join("metadata.json"), r#"{"owner":"tests"}"#).unwrap();
    std::fs::write(files.join("weights.bin"), [1u8, 2, 3, 4]).unwrap();

    let base_url = format!("http://{addr}");
    TestDaemon {
        client: HttpClient::new(base_url.clone()).unwrap(),
        base_url,
        files,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_liveness() {
    let daemon = start_daemon().await;
    let body: Value = reqwest::get(format!("{}/test", daemon.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"hello": "world"}));
}

#[tokio::test]
async fn test_train_then_eval() {
    let daemon = start_daemon().await;
    let client = &daemon.client;

    let reply = client
        .train(
            "news",
            &daemon.files.join("train.csv"),
            &daemon.files.join("io_params.json"),
        )
        .await
        .expect("Train failed");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.msg, "DONE");
    let version = reply.version.expect("Train reply carries the version");

    let out = client
        .eval("news", &json!({"doc_text": ["football"]}))
        .await
        .expect("Eval failed");
    assert_eq!(out["input"]["doc_text"], json!(["football"]));
    assert_eq!(out["model"], json!(version.as_str()));

    let records = client.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ModelStatus::Ready);

    let details = client.status("news").await.unwrap();
    assert_eq!(details.versions.len(), 1);
    assert_eq!(details.versions[0].version, version);

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.engine, "echo");
    assert_eq!(stats.models, 1);
    assert!(stats.latency.is_some());
    assert!(!stats.samples.is_empty());
}

#[tokio::test]
async fn test_load_plain_file() {
    let daemon = start_daemon().await;
    let reply = daemon
        .client
        .load(
            "news",
            &daemon.files.join("weights.bin"),
            &daemon.files.join("metadata.json"),
            &daemon.files.join("io_params.json"),
        )
        .await
        .expect("Load failed");
    assert_eq!(reply.msg, "DONE");

    daemon
        .client
        .eval("news", &json!({"doc_text": ""}))
        .await
        .expect("Falsy values must pass validation");
}

#[tokio::test]
async fn test_missing_part_is_bad_request() {
    let daemon = start_daemon().await;

    let form = Form::new().part(
        "io_params",
        Part::bytes(IO_PARAMS.as_bytes().to_vec()).file_name("io_params.json"),
    );
    let response = reqwest::Client::new()
        .post(format!("{}/train/news", daemon.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let body: ErrorReply = response.json().await.unwrap();
    assert_eq!(body.status, 400);
    assert_eq!(body.error, "missing_input");
    assert!(body.msg.contains("training_data"));

    // Nothing was created
    assert!(daemon.client.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_eval_errors_map_to_status_codes() {
    let daemon = start_daemon().await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/eval/ghost", daemon.base_url))
        .json(&json!({"doc_text": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: ErrorReply = response.json().await.unwrap();
    assert_eq!(body.error, "unknown_key");

    daemon
        .client
        .train(
            "news",
            &daemon.files.join("train.csv"),
            &daemon.files.join("io_params.json"),
        )
        .await
        .unwrap();

    let response = http
        .post(format!("{}/eval/news", daemon.base_url))
        .json(&json!({"other": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: ErrorReply = response.json().await.unwrap();
    assert_eq!(body.error, "schema_validation_failed");
    assert!(body.msg.contains("doc_text"));

    let response = http
        .post(format!("{}/eval/news", daemon.base_url))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_export_import_delete() {
    let daemon = start_daemon().await;
    let client = &daemon.client;

    let err = client.export("news").await.unwrap_err();
    assert!(matches!(err, ModeldError::Http(ref msg) if msg.contains("404")));

    client
        .train(
            "news",
            &daemon.files.join("train.csv"),
            &daemon.files.join("io_params.json"),
        )
        .await
        .unwrap();

    let archive = client.export("news").await.unwrap();
    assert!(modeld::archive::is_zip(&archive));

    let imported = client.import("copy", archive.clone()).await.unwrap();
    assert_eq!(imported.len(), 1);
    let copy = client.status("copy").await.unwrap();
    assert_eq!(copy.record.status, ModelStatus::Ready);

    let err = client.import("copy", archive).await.unwrap_err();
    assert!(matches!(err, ModeldError::Http(ref msg) if msg.contains("409")));

    client.delete("copy").await.unwrap();
    assert!(client.status("copy").await.is_err());
    assert_eq!(client.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_key_rejected() {
    let daemon = start_daemon().await;
    let response = reqwest::Client::new()
        .post(format!("{}/import/.hidden", daemon.base_url))
        .body(vec![0u8; 4])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: ErrorReply = response.json().await.unwrap();
    assert_eq!(body.error, "invalid_key");
}
