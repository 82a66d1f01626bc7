// ABOUTME: Shared helpers for environment integration tests
// ABOUTME: Tracing setup and polling utilities for background sessions

#![allow(dead_code)]

use std::time::Duration;
use tether_config::constants::TETHER_LOG;
use tether_environment::{Environment, ProcessOutput};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring TETHER_LOG; safe to call from every test
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(TETHER_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Poll a session until it stops running or `timeout` elapses
pub async fn wait_for_session(env: &dyn Environment, session_id: &str, timeout: Duration) -> ProcessOutput {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let output = env
            .get_process_output(session_id)
            .await
            .expect("session should exist");
        if !output.running || tokio::time::Instant::now() >= deadline {
            return output;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll a session until its stdout contains `needle`
pub async fn wait_for_stdout(env: &dyn Environment, session_id: &str, needle: &str, timeout: Duration) -> ProcessOutput {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let output = env
            .get_process_output(session_id)
            .await
            .expect("session should exist");
        if output.stdout.contains(needle) || tokio::time::Instant::now() >= deadline {
            return output;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
