// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector request bodies.
//!
//! A batch becomes one `/v1/transactions` request, plus one `/v1/errors` request
//! when any transaction in the batch carries errors.

use crate::transaction::{FinishedTransaction, TransactionId};
use serde::Serialize;
use uuid::Uuid;

pub const TRANSACTIONS_PATH: &str = "/v1/transactions";
pub const ERRORS_PATH: &str = "/v1/errors";

const AGENT_NAME: &str = "apm-agent-core";
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Which intake endpoint a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeKind {
    Transactions,
    Errors,
}

/// A serialized request ready for a [`Transport`](super::transport::Transport).
#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub kind: IntakeKind,
    pub path: &'static str,
    pub body: Vec<u8>,
    /// Number of transactions (or error reports) carried.
    pub items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    name: String,
    agent: AgentInfo,
}

#[derive(Debug, Clone, Serialize)]
struct AgentInfo {
    name: &'static str,
    version: &'static str,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent: AgentInfo {
                name: AGENT_NAME,
                version: AGENT_VERSION,
            },
        }
    }
}

#[derive(Serialize)]
struct TransactionsPayload<'a> {
    service: &'a ServiceInfo,
    transactions: Vec<TransactionEvent<'a>>,
}

#[derive(Serialize)]
struct TransactionEvent<'a> {
    id: TransactionId,
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    result: &'static str,
    /// Microseconds since the Unix epoch
    timestamp: u64,
    /// Milliseconds
    duration: f64,
}

#[derive(Serialize)]
struct ErrorsPayload<'a> {
    service: &'a ServiceInfo,
    errors: Vec<ErrorEvent<'a>>,
}

#[derive(Serialize)]
struct ErrorEvent<'a> {
    id: Uuid,
    timestamp: u64,
    transaction: TransactionRef,
    exception: ExceptionEvent<'a>,
}

#[derive(Serialize)]
struct TransactionRef {
    id: TransactionId,
}

#[derive(Serialize)]
struct ExceptionEvent<'a> {
    #[serde(rename = "type")]
    exception_type: &'a str,
    message: &'a str,
    backtrace: Vec<String>,
}

/// Serializes a batch into the requests the collector expects.
pub fn build_requests(
    service: &ServiceInfo,
    batch: &[FinishedTransaction],
) -> Result<Vec<IntakeRequest>, serde_json::Error> {
    let mut requests = Vec::with_capacity(2);

    let errors: Vec<ErrorEvent<'_>> = batch
        .iter()
        .flat_map(|transaction| {
            transaction.errors().iter().map(move |error| ErrorEvent {
                id: error.id(),
                timestamp: error.timestamp_us(),
                transaction: TransactionRef {
                    id: error.transaction_id().unwrap_or_else(|| transaction.id()),
                },
                exception: ExceptionEvent {
                    exception_type: error.exception_type(),
                    message: error.message(),
                    backtrace: error.backtrace(),
                },
            })
        })
        .collect();

    if !errors.is_empty() {
        let items = errors.len();
        requests.push(IntakeRequest {
            kind: IntakeKind::Errors,
            path: ERRORS_PATH,
            body: serde_json::to_vec(&ErrorsPayload { service, errors })?,
            items,
        });
    }

    let transactions: Vec<TransactionEvent<'_>> = batch
        .iter()
        .map(|transaction| TransactionEvent {
            id: transaction.id(),
            name: transaction.name(),
            kind: transaction.kind(),
            result: transaction.result().as_str(),
            timestamp: transaction.timestamp_us(),
            duration: transaction.duration().as_secs_f64() * 1000.0,
        })
        .collect();

    requests.push(IntakeRequest {
        kind: IntakeKind::Transactions,
        path: TRANSACTIONS_PATH,
        body: serde_json::to_vec(&TransactionsPayload {
            service,
            transactions,
        })?,
        items: batch.len(),
    });

    Ok(requests)
}
