// tests/integration/reload_test.rs

//! Credential reloads against a running gateway.

use super::test_helpers::*;
use respgate::config::Config;
use respgate::core::protocol::RespFrame;
use respgate::core::{CredentialStore, UpstreamDialer};
use respgate::core::state::GatewayState;
use respgate::server::{load_initial_credentials, reload_credentials};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_file(file: &NamedTempFile, contents: &str) {
    std::fs::write(file.path(), contents).unwrap();
}

#[tokio::test]
async fn test_reload_applies_to_new_sessions() {
    let upstream = MockUpstream::start(MockBehavior::default()).await;
    let file = NamedTempFile::new().unwrap();
    write_file(&file, r#"{"tenant": {"dbIndex": "1"}}"#);

    let mut config = TestGateway::config_for(upstream.addr);
    config.credentials_file = Some(file.path().to_string_lossy().to_string());
    let gateway = TestGateway::start(config, credentials(&[("tenant", "1")])).await;

    let mut first = gateway.connect().await;
    assert_eq!(first.command(&["AUTH", "tenant"]).await, ok());
    assert_eq!(first.command(&["PING"]).await, RespFrame::SimpleString("PONG".into()));

    write_file(&file, r#"{"tenant": {"dbIndex": "2"}, "other": {"dbIndex": "3"}}"#);
    assert_eq!(reload_credentials(&gateway.state).await.unwrap(), 2);

    let mut second = gateway.connect().await;
    assert_eq!(second.command(&["AUTH", "tenant"]).await, ok());
    assert_eq!(second.command(&["PING"]).await, RespFrame::SimpleString("PONG".into()));

    let log = upstream.commands();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0][1], vec!["SELECT".to_string(), "1".to_string()]);
    assert_eq!(log[1][1], vec!["SELECT".to_string(), "2".to_string()]);
}

#[tokio::test]
async fn test_invalid_reload_keeps_previous_snapshot() {
    let file = NamedTempFile::new().unwrap();
    write_file(&file, r#"{"tenant": {"dbIndex": "4"}}"#);

    let mut config = Config::default();
    config.credentials_file = Some(file.path().to_string_lossy().to_string());
    let state = GatewayState::new(
        config,
        Arc::new(CredentialStore::default()),
        Arc::new(UpstreamDialer::new(Duration::from_secs(1))),
    );

    assert_eq!(reload_credentials(&state).await.unwrap(), 1);
    assert_eq!(state.credentials.lookup(b"tenant"), Some("4".to_string()));

    write_file(&file, r#"{"tenant": {"dbIndex": "four"}}"#);
    assert!(reload_credentials(&state).await.is_err());
    assert_eq!(state.credentials.lookup(b"tenant"), Some("4".to_string()));

    write_file(&file, "not json");
    assert!(reload_credentials(&state).await.is_err());
    assert_eq!(state.credentials.len(), 1);
}

#[tokio::test]
async fn test_reload_without_credentials_file_is_a_no_op() {
    let state = GatewayState::new(
        Config::default(),
        Arc::new(CredentialStore::new(credentials(&[("tenant", "1")]))),
        Arc::new(UpstreamDialer::new(Duration::from_secs(1))),
    );
    assert_eq!(reload_credentials(&state).await.unwrap(), 1);
    assert_eq!(state.credentials.lookup(b"tenant"), Some("1".to_string()));
}

#[tokio::test]
async fn test_startup_without_credentials_file_uses_empty_store() {
    init_tracing();
    let store = load_initial_credentials(&Config::default()).await.unwrap();
    assert!(store.is_empty());
    assert_eq!(store.lookup(b"tenant"), None);
}

#[tokio::test]
async fn test_startup_loads_and_validates_credentials_file() {
    let file = NamedTempFile::new().unwrap();
    write_file(&file, r#"{"tenant": {"dbIndex": "5"}}"#);
    let mut config = Config::default();
    config.credentials_file = Some(file.path().to_string_lossy().to_string());

    let store = load_initial_credentials(&config).await.unwrap();
    assert_eq!(store.lookup(b"tenant"), Some("5".to_string()));

    write_file(&file, r#"{"tenant": {"dbIndex": "five"}}"#);
    assert!(load_initial_credentials(&config).await.is_err());
}
