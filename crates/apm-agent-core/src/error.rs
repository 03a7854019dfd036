// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::transaction::TransactionId;

/// Errors returned by the agent lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start reporter: {0}")]
    ReporterStart(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while detecting, building or installing an instrumentor.
///
/// These never escape `Agent::start`; they are logged and recorded per key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InjectorError {
    #[error("Failed to build instrumentor {key}: {reason}")]
    Factory { key: String, reason: String },

    #[error("Failed to install instrumentor {key}: {reason}")]
    Install { key: String, reason: String },
}

/// Errors from the per-thread transaction slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("A transaction is already current on this thread: {0}")]
    AlreadyBound(TransactionId),

    #[error("Transaction context is no longer active")]
    Inactive,
}
