// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reporter counters and the drain barrier used by `flush`.
//!
//! Every submitted transaction settles exactly once: it is either sent or
//! dropped (backpressure, transport, shutdown). `flush` waits for the settled
//! count to catch up with the submitted count observed when it was called.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Why a transaction was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DropReason {
    Backpressure,
    Transport,
    Shutdown,
}

/// Snapshot of the reporter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStats {
    pub submitted: u64,
    pub sent: u64,
    pub dropped_backpressure: u64,
    pub dropped_transport: u64,
    pub dropped_shutdown: u64,
    /// Error reports whose request could not be delivered.
    pub dropped_error_reports: u64,
    pub queued: usize,
}

impl ReporterStats {
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped_backpressure + self.dropped_transport + self.dropped_shutdown
    }

    #[must_use]
    pub fn settled(&self) -> u64 {
        self.sent + self.dropped()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    submitted: AtomicU64,
    sent: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_transport: AtomicU64,
    dropped_shutdown: AtomicU64,
    dropped_error_reports: AtomicU64,
    settled: Mutex<u64>,
    settled_cv: Condvar,
}

impl Counters {
    pub(crate) fn record_submitted(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub(crate) fn record_sent(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.sent.fetch_add(count, Ordering::AcqRel);
        self.settle(count);
    }

    pub(crate) fn record_dropped(&self, reason: DropReason, count: u64) {
        if count == 0 {
            return;
        }
        let counter = match reason {
            DropReason::Backpressure => &self.dropped_backpressure,
            DropReason::Transport => &self.dropped_transport,
            DropReason::Shutdown => &self.dropped_shutdown,
        };
        counter.fetch_add(count, Ordering::AcqRel);
        self.settle(count);
    }

    pub(crate) fn record_dropped_error_reports(&self, count: u64) {
        self.dropped_error_reports.fetch_add(count, Ordering::AcqRel);
    }

    fn settle(&self, count: u64) {
        let mut settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
        *settled += count;
        self.settled_cv.notify_all();
    }

    /// Blocks until at least `target` transactions settled, or `timeout` elapses.
    pub(crate) fn wait_settled(&self, target: u64, timeout: Duration) -> bool {
        let settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
        let (settled, _) = self
            .settled_cv
            .wait_timeout_while(settled, timeout, |settled| *settled < target)
            .unwrap_or_else(PoisonError::into_inner);
        *settled >= target
    }

    pub(crate) fn snapshot(&self, queued: usize) -> ReporterStats {
        ReporterStats {
            submitted: self.submitted.load(Ordering::Acquire),
            sent: self.sent.load(Ordering::Acquire),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Acquire),
            dropped_transport: self.dropped_transport.load(Ordering::Acquire),
            dropped_shutdown: self.dropped_shutdown.load(Ordering::Acquire),
            dropped_error_reports: self.dropped_error_reports.load(Ordering::Acquire),
            queued,
        }
    }
}
