//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use hive_proxy::config::{DockerRetryConfig, LogFormat};
use hive_proxy::transport::mock::MockHost;
use hive_proxy::{
    Credentials, HostGate, NodeIdentity, NodeProxy, OperationLog, ProxyConfig, TimingConfig,
};

/// Timing with every pause removed
pub fn fast_config() -> ProxyConfig {
    ProxyConfig {
        timing: TimingConfig {
            connect_attempts: 3,
            connect_retry_delay_ms: 0,
            retry_count: 2,
            retry_delay_ms: 0,
            poll_interval_ms: 0,
            teardown_timeout_ms: 1_000,
            reboot_grace_ms: 0,
            reboot_poll_interval_ms: 0,
            reboot_timeout_ms: 5_000,
            ..TimingConfig::default()
        },
        docker: DockerRetryConfig {
            attempts: 3,
            delay_ms: 0,
            ..DockerRetryConfig::default()
        },
        ..ProxyConfig::default()
    }
}

pub fn identity(name: &str) -> NodeIdentity {
    NodeIdentity::new(name, "10.0.0.20".parse().unwrap())
}

/// Proxy for `host` with its own gate and an in-memory operation log
pub fn proxy(host: &MockHost) -> NodeProxy {
    proxy_with_gate(host, Arc::new(HostGate::new()))
}

pub fn proxy_with_gate(host: &MockHost, gate: Arc<HostGate>) -> NodeProxy {
    NodeProxy::new(
        identity("worker-1"),
        Credentials::password("sysadmin", "secret"),
        fast_config(),
        Arc::new(host.clone()),
    )
    .with_host_gate(gate)
    .with_operation_log(OperationLog::in_memory(LogFormat::Text))
}
