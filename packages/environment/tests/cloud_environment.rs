// ABOUTME: Integration tests for the cloud sandbox backend against a mock sandbox service
// ABOUTME: Verifies request shapes, status mapping, lease expiry and polled background sessions

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{init_tracing, wait_for_session, wait_for_stdout};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_environment::{
    CloudConfig, CloudEnvironment, Environment, ReadMode, SessionState, ShellRequest, ShellStatus,
    WriteMode,
};
use wiremock::matchers::{body_bytes, body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const SANDBOX: &str = "/sandboxes/sbx_test";

async fn setup() -> (MockServer, CloudEnvironment) {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "template": "base", "timeout_secs": 300 })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "sandbox_id": "sbx_test",
            "expires_at": (Utc::now() + ChronoDuration::seconds(300)).to_rfc3339(),
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = CloudConfig::new(server.uri())
        .with_api_key("test-key")
        .with_timeout(Duration::from_secs(300))
        .with_poll_interval(Duration::from_millis(20));
    let env = CloudEnvironment::create(config)
        .await
        .expect("sandbox should be created");
    (server, env)
}

#[tokio::test]
async fn test_create_and_read_file() {
    let (server, env) = setup().await;
    assert_eq!(env.sandbox_id(), "sbx_test");
    assert!(env.is_alive().await);

    Mock::given(method("GET"))
        .and(path(format!("{SANDBOX}/files")))
        .and(query_param("path", "/home/user/notes.txt"))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes("hello cloud"))
        .expect(1)
        .mount(&server)
        .await;

    let read = env.read_file("notes.txt", ReadMode::Text).await.unwrap();
    assert_eq!(read.path, "/home/user/notes.txt");
    assert_eq!(read.content.as_text(), Some("hello cloud"));
    assert_eq!(read.size_bytes, 11);
}

#[tokio::test]
async fn test_write_file_sends_raw_bytes() {
    let (server, env) = setup().await;

    Mock::given(method("PUT"))
        .and(path(format!("{SANDBOX}/files")))
        .and(query_param("path", "/home/user/out/data.bin"))
        .and(query_param("append", "false"))
        .and(body_bytes(vec![0u8, 1, 2, 255]))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "/home/user/out/data.bin",
            "size": 4,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let written = env
        .write_file("out/data.bin", &[0, 1, 2, 255], WriteMode::Binary)
        .await
        .unwrap();
    assert_eq!(written.size, 4);
    assert_eq!(written.path, "/home/user/out/data.bin");

    let err = env
        .write_file("../../etc/passwd", b"x", WriteMode::Write)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "permission_denied");
}

#[tokio::test]
async fn test_missing_file_maps_to_not_found() {
    let (server, env) = setup().await;

    Mock::given(method("DELETE"))
        .and(path(format!("{SANDBOX}/files")))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({ "error": "no such file" })),
        )
        .mount(&server)
        .await;

    let err = env.delete_file("ghost.txt").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(env.is_alive().await);
}

#[tokio::test]
async fn test_list_files_filters_hidden_entries() {
    let (server, env) = setup().await;

    Mock::given(method("GET"))
        .and(path(format!("{SANDBOX}/files/list")))
        .and(query_param("path", "/home/user"))
        .and(query_param("recursive", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                { "name": "zeta.txt", "type": "file", "size": 4 },
                { "name": ".bashrc", "type": "file", "size": 10 },
                { "name": "app", "type": "directory", "size": 0 },
            ]
        })))
        .mount(&server)
        .await;

    let listing = env.list_files(".", false, false).await.unwrap();
    let names: Vec<&str> = listing.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["app", "zeta.txt"]);

    let listing = env.list_files(".", false, true).await.unwrap();
    assert_eq!(listing.entries.len(), 3);
}

#[tokio::test]
async fn test_create_directory_conflict_is_invalid_input() {
    let (server, env) = setup().await;

    Mock::given(method("POST"))
        .and(path(format!("{SANDBOX}/directories")))
        .and(body_json(json!({
            "path": "/home/user/build",
            "parents": true,
            "exist_ok": false,
        })))
        .respond_with(
            ResponseTemplate::new(409).set_body_json(json!({ "error": "directory exists" })),
        )
        .mount(&server)
        .await;

    let err = env.create_directory("build", true, false).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
    assert!(err.to_string().contains("directory exists"));
}

#[tokio::test]
async fn test_blocking_commands() {
    let (server, env) = setup().await;

    Mock::given(method("POST"))
        .and(path(format!("{SANDBOX}/commands")))
        .and(body_partial_json(json!({
            "command": "echo hi",
            "cwd": "/home/user",
            "background": false,
            "timeout_secs": 5,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "exit_code": 0,
            "stdout": "hi\n",
            "stderr": "",
            "timed_out": false,
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{SANDBOX}/commands")))
        .and(body_partial_json(json!({ "command": "sleep 10" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "exit_code": null,
            "stdout": "",
            "stderr": "",
            "timed_out": true,
        })))
        .mount(&server)
        .await;

    let output = env
        .exec_shell(ShellRequest::blocking("echo hi").with_timeout_secs(5.0))
        .await
        .unwrap()
        .into_output()
        .unwrap();
    assert_eq!(output.status, ShellStatus::Success);
    assert_eq!(output.return_code, Some(0));
    assert_eq!(output.stdout, "hi\n");

    let output = env
        .exec_shell(ShellRequest::blocking("sleep 10").with_timeout_secs(1.0))
        .await
        .unwrap()
        .into_output()
        .unwrap();
    assert_eq!(output.status, ShellStatus::Timeout);
}

#[tokio::test]
async fn test_gone_sandbox_is_terminal() {
    let (server, env) = setup().await;

    Mock::given(method("GET"))
        .and(path(format!("{SANDBOX}/files")))
        .respond_with(
            ResponseTemplate::new(410).set_body_json(json!({ "error": "sandbox expired" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = env.read_file("a.txt", ReadMode::Text).await.unwrap_err();
    assert_eq!(err.kind(), "sandbox_unavailable");
    assert!(err.is_terminal());

    // Later calls fail locally without reaching the service
    let err = env.list_files(".", false, false).await.unwrap_err();
    assert_eq!(err.kind(), "sandbox_unavailable");
    assert!(!env.is_alive().await);

    env.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_expired_lease_rejects_operations() {
    init_tracing();
    let server = MockServer::start().await;
    let config = CloudConfig::new(server.uri());
    let env = CloudEnvironment::connect(config, "sbx_old", Utc::now() - ChronoDuration::seconds(5))
        .unwrap();

    let err = env
        .exec_shell(ShellRequest::blocking("echo hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "sandbox_unavailable");

    let err = env.change_directory("src").await.unwrap_err();
    assert_eq!(err.kind(), "sandbox_unavailable");
    assert_eq!(env.working_directory().await, env.base_path());

    let err = env.get_process_status("proc_missing").await.unwrap_err();
    assert_eq!(err.kind(), "sandbox_unavailable");
    let err = env
        .write_to_process("proc_missing", "y", true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "sandbox_unavailable");
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_extend_lease_updates_expiry() {
    let (server, env) = setup().await;
    let extended = Utc::now() + ChronoDuration::seconds(900);

    Mock::given(method("POST"))
        .and(path(format!("{SANDBOX}/timeout")))
        .and(body_json(json!({ "timeout_secs": 900 })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "expires_at": extended.to_rfc3339() })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let expires_at = env.extend_lease(Duration::from_secs(900)).await.unwrap();
    assert_eq!(expires_at.timestamp(), extended.timestamp());
    assert_eq!(env.expires_at().await.timestamp(), extended.timestamp());
}

#[tokio::test]
async fn test_background_session_is_polled_to_completion() {
    let (server, env) = setup().await;

    Mock::given(method("POST"))
        .and(path(format!("{SANDBOX}/commands")))
        .and(body_partial_json(json!({ "background": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "pid": 7 })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("{SANDBOX}/commands/7")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "running": false,
            "exit_code": 0,
            "stdout": "done\n",
            "stderr": "",
        })))
        .mount(&server)
        .await;

    let outcome = env
        .exec_shell(ShellRequest::background("make build"))
        .await
        .unwrap();
    assert_eq!(outcome.status(), ShellStatus::Success);
    let id = outcome.session_id().unwrap().to_string();

    let output = wait_for_session(&env, &id, Duration::from_secs(5)).await;
    assert!(!output.running);
    assert_eq!(output.stdout, "done\n");
    assert_eq!(output.exit_code, Some(0));
}

#[tokio::test]
async fn test_background_session_stdin_and_terminate() {
    let (server, env) = setup().await;
    let killed = Arc::new(AtomicBool::new(false));

    Mock::given(method("POST"))
        .and(path(format!("{SANDBOX}/commands")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "pid": 9 })))
        .mount(&server)
        .await;

    let flag = killed.clone();
    Mock::given(method("GET"))
        .and(path(format!("{SANDBOX}/commands/9")))
        .respond_with(move |_: &Request| {
            let body = if flag.load(Ordering::SeqCst) {
                json!({ "running": false, "exit_code": -15, "stdout": "ready\n", "stderr": "" })
            } else {
                json!({ "running": true, "exit_code": null, "stdout": "ready\n", "stderr": "" })
            };
            ResponseTemplate::new(200).set_body_json(body)
        })
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{SANDBOX}/commands/9/stdin")))
        .and(body_json(json!({ "data": "hello\n" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let flag = killed.clone();
    Mock::given(method("POST"))
        .and(path(format!("{SANDBOX}/commands/9/kill")))
        .and(body_json(json!({ "signal": "SIGTERM" })))
        .respond_with(move |_: &Request| {
            flag.store(true, Ordering::SeqCst);
            ResponseTemplate::new(200)
        })
        .expect(1)
        .mount(&server)
        .await;

    let outcome = env.exec_shell(ShellRequest::background("python3 -i")).await.unwrap();
    let id = outcome.session_id().unwrap().to_string();

    let output = wait_for_stdout(&env, &id, "ready", Duration::from_secs(5)).await;
    assert!(output.running);
    env.write_to_process(&id, "hello", true).await.unwrap();

    let status = env.terminate_process(&id).await.unwrap();
    assert_eq!(status.state, SessionState::Exited);
    assert_eq!(status.exit_code, Some(-15));
    assert!(killed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cleanup_deletes_sandbox_once() {
    let (server, env) = setup().await;

    Mock::given(method("DELETE"))
        .and(path(SANDBOX))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    env.cleanup().await.unwrap();
    env.cleanup().await.unwrap();
    assert!(!env.is_alive().await);
}
