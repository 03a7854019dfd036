// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock transports standing in for the collector

use apm_agent_core::reporter::payload::{IntakeRequest, ERRORS_PATH, TRANSACTIONS_PATH};
use apm_agent_core::{ShippingError, Transport};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Accepts every request and keeps the parsed bodies
#[derive(Default)]
pub struct RecordingTransport {
    requests: Mutex<Vec<(&'static str, Value)>>,
}

#[allow(dead_code)]
impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("lock poisoned").len()
    }

    fn items(&self, path: &str, field: &str) -> Vec<Value> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|(p, _)| *p == path)
            .flat_map(|(_, body)| body[field].as_array().cloned().unwrap_or_default())
            .collect()
    }

    /// Every transaction event received, in arrival order
    pub fn transactions(&self) -> Vec<Value> {
        self.items(TRANSACTIONS_PATH, "transactions")
    }

    /// Every error event received, in arrival order
    pub fn errors(&self) -> Vec<Value> {
        self.items(ERRORS_PATH, "errors")
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: &IntakeRequest) -> Result<(), ShippingError> {
        let body: Value = serde_json::from_slice(&request.body)
            .map_err(|e| ShippingError::Request(e.to_string()))?;
        self.requests
            .lock()
            .expect("lock poisoned")
            .push((request.path, body));
        Ok(())
    }
}

/// Holds every request until released, then behaves like [`RecordingTransport`]
#[allow(dead_code)]
pub struct StalledTransport {
    gate: CancellationToken,
    calls: AtomicUsize,
    inner: RecordingTransport,
}

#[allow(dead_code)]
impl StalledTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: CancellationToken::new(),
            calls: AtomicUsize::new(0),
            inner: RecordingTransport::default(),
        })
    }

    pub fn release(&self) {
        self.gate.cancel();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn transactions(&self) -> Vec<Value> {
        self.inner.transactions()
    }
}

#[async_trait::async_trait]
impl Transport for StalledTransport {
    async fn send(&self, request: &IntakeRequest) -> Result<(), ShippingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.cancelled().await;
        self.inner.send(request).await
    }
}

/// Answers every request with the same error status
#[allow(dead_code)]
pub struct FailingTransport {
    status: StatusCode,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl FailingTransport {
    pub fn new(status: StatusCode) -> Arc<Self> {
        Arc::new(Self {
            status,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for FailingTransport {
    async fn send(&self, _request: &IntakeRequest) -> Result<(), ShippingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ShippingError::Destination(
            Some(self.status),
            "collector unavailable".to_string(),
        ))
    }
}
