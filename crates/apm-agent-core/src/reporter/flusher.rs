// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships batches through a [`Transport`] with bounded retry.
//!
//! Each request of a batch is retried in place, so batches leave in the order
//! they were pulled from the queue. Temporary failures (5xx, network, timeout)
//! are retried per [`RetryStrategy`]; permanent ones (4xx, bad payload) are
//! dropped immediately. Nothing here ever reaches a worker thread.

use crate::config::RetryStrategy;
use crate::reporter::payload::{self, IntakeKind, IntakeRequest, ServiceInfo};
use crate::reporter::transport::{ShippingError, Transport};
use crate::transaction::FinishedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Result of shipping one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub sent: usize,
    pub dropped: usize,
    pub dropped_error_reports: usize,
}

#[derive(Clone)]
pub struct Flusher {
    transport: Arc<dyn Transport>,
    service: ServiceInfo,
    retry_strategy: RetryStrategy,
    request_timeout: Duration,
}

impl Flusher {
    pub fn new(
        transport: Arc<dyn Transport>,
        service: ServiceInfo,
        retry_strategy: RetryStrategy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            service,
            retry_strategy,
            request_timeout,
        }
    }

    /// Ships one batch and reports how many transactions made it.
    pub async fn flush_batch(&self, batch: Vec<FinishedTransaction>) -> FlushOutcome {
        let total = batch.len();
        if total == 0 {
            return FlushOutcome::default();
        }
        debug!("APM | Flushing {total} transactions");

        let requests = match payload::build_requests(&self.service, &batch) {
            Ok(requests) => requests,
            Err(e) => {
                error!("APM | Failed to prepare payload. Data dropped: {e}");
                return FlushOutcome {
                    sent: 0,
                    dropped: total,
                    dropped_error_reports: 0,
                };
            }
        };
        drop(batch);

        let mut outcome = FlushOutcome::default();
        for request in &requests {
            let delivered = self.send_with_retry(request).await.is_ok();
            match (request.kind, delivered) {
                (IntakeKind::Transactions, true) => outcome.sent += request.items,
                (IntakeKind::Transactions, false) => outcome.dropped += request.items,
                (IntakeKind::Errors, true) => {}
                (IntakeKind::Errors, false) => outcome.dropped_error_reports += request.items,
            }
        }

        if outcome.dropped == 0 {
            debug!("APM | Successfully flushed {} transactions", outcome.sent);
        }
        outcome
    }

    async fn send_with_retry(&self, request: &IntakeRequest) -> Result<(), ShippingError> {
        let attempts = self.retry_strategy.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(self.request_timeout, self.transport.send(request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(ShippingError::Destination(
                        None,
                        format!("request timed out after {:?}", self.request_timeout),
                    )),
                };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_permanent() => {
                    error!(
                        "APM | Collector rejected {} ({} items), not retrying: {e}",
                        request.path, request.items
                    );
                    return Err(e);
                }
                Err(e) if attempt >= attempts => {
                    error!(
                        "APM | Failed to send {} ({} items) after {attempt} attempts: {e}",
                        request.path, request.items
                    );
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        "APM | Attempt {attempt}/{attempts} to send {} failed: {e}",
                        request.path
                    );
                    let delay = self.retry_strategy.delay_after(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}
