// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use apm_agent_core::{AgentConfig, InjectorRegistry, JobFramework, RetryStrategy};
use std::time::{Duration, Instant};

/// Error a failing job returns
#[derive(Debug, thiserror::Error)]
#[error("divided by 0")]
pub struct ZeroDivisionError;

/// Configuration with short timeouts and the given injectors enabled
#[allow(dead_code)]
pub fn test_config(injectors: &[&str]) -> AgentConfig {
    AgentConfig {
        flush_interval: Duration::from_millis(50),
        max_batch_size: 10,
        max_queue_size: 100,
        retry_strategy: RetryStrategy::Immediate(1),
        request_timeout: Duration::from_secs(1),
        shutdown_timeout: Duration::from_secs(1),
        capture_backtraces: false,
        ..AgentConfig::with_enabled_injectors(injectors.iter().copied())
    }
}

/// A loaded framework registered under `key`
#[allow(dead_code)]
pub fn loaded_framework(registry: &InjectorRegistry, key: &str, tag: &str) -> JobFramework {
    let framework = JobFramework::new(key, tag);
    framework.set_loaded(true);
    framework.register_injector(registry);
    framework
}

/// Polls `condition` until it holds or `timeout` elapses
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
