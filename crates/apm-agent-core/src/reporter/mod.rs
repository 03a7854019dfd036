// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous delivery of finished transactions.
//!
//! The [`Reporter`] handle is what worker threads see: `submit` pushes onto a
//! bounded queue and returns immediately. A background thread named
//! `apm-reporter` owns a single-threaded tokio runtime and runs the flush loop,
//! which pulls batches off the queue and ships them through a [`Transport`].

pub mod flusher;
pub mod payload;
pub(crate) mod queue;
pub(crate) mod stats;
pub mod transport;

pub use stats::ReporterStats;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::reporter::flusher::Flusher;
use crate::reporter::payload::ServiceInfo;
use crate::reporter::queue::{Admission, TransactionQueue};
use crate::reporter::stats::{Counters, DropReason};
use crate::reporter::transport::Transport;
use crate::transaction::FinishedTransaction;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REPORTER_THREAD_NAME: &str = "apm-reporter";

/// What happened to a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queued after evicting the oldest queued transaction.
    QueuedEvictingOldest,
    /// Not queued: the queue was full under `DropNewest`, or the reporter is
    /// shut down.
    Rejected,
}

struct Shared {
    queue: Mutex<TransactionQueue>,
    /// Only read or written while `queue` is locked.
    accepting: AtomicBool,
    counters: Counters,
    wake: Notify,
    cancel: CancellationToken,
    max_batch_size: usize,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, TransactionQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cancels the reporter service once the last handle is dropped.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Handle to the background reporter. Clones share the same reporter.
///
/// Dropping the last clone without [`shutdown`](Self::shutdown) still stops
/// the service: it drains within the shutdown timeout and its thread exits.
#[derive(Clone)]
pub struct Reporter {
    shared: Arc<Shared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
    _cancel_on_drop: Arc<CancelOnDrop>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Reporter {
    /// Spawns the reporter thread and returns its handle.
    pub fn start(config: &AgentConfig, transport: Arc<dyn Transport>) -> Result<Self, AgentError> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(TransactionQueue::new(
                config.max_queue_size,
                config.drop_policy,
            )),
            accepting: AtomicBool::new(true),
            counters: Counters::default(),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            max_batch_size: config.max_batch_size.max(1),
        });

        let service = ReporterService {
            shared: Arc::clone(&shared),
            flusher: Flusher::new(
                transport,
                ServiceInfo::new(config.service_name.clone()),
                config.retry_strategy,
                config.request_timeout,
            ),
            flush_interval: config.flush_interval,
            shutdown_timeout: config.shutdown_timeout,
            in_flight: AtomicUsize::new(0),
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let handle = std::thread::Builder::new()
            .name(REPORTER_THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(service.run()))
            .map_err(|e| {
                AgentError::ReporterStart(format!("Failed to spawn reporter thread: {e}"))
            })?;

        debug!(
            "APM | Reporter started (batch size {}, queue size {}, flush interval {:?})",
            config.max_batch_size, config.max_queue_size, config.flush_interval
        );

        Ok(Self {
            _cancel_on_drop: Arc::new(CancelOnDrop(shared.cancel.clone())),
            shared,
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Hands a finished transaction to the reporter. Never waits on the network.
    pub fn submit(&self, transaction: FinishedTransaction) -> SubmitOutcome {
        let counters = &self.shared.counters;
        counters.record_submitted();

        let (admission, queued) = {
            let mut queue = self.shared.lock_queue();
            if !self.shared.accepting.load(Ordering::Acquire) {
                drop(queue);
                counters.record_dropped(DropReason::Shutdown, 1);
                debug!(
                    "APM | Reporter is shut down, dropped transaction '{}'",
                    transaction.name()
                );
                return SubmitOutcome::Rejected;
            }
            let admission = queue.add(transaction);
            (admission, queue.len())
        };

        let outcome = match admission {
            Admission::Queued => SubmitOutcome::Queued,
            Admission::Evicted(oldest) => {
                counters.record_dropped(DropReason::Backpressure, 1);
                warn!(
                    "APM | Transaction queue full, dropped oldest transaction '{}'",
                    oldest.name()
                );
                SubmitOutcome::QueuedEvictingOldest
            }
            Admission::Rejected(rejected) => {
                counters.record_dropped(DropReason::Backpressure, 1);
                warn!(
                    "APM | Transaction queue full, dropped transaction '{}'",
                    rejected.name()
                );
                SubmitOutcome::Rejected
            }
        };

        if queued >= self.shared.max_batch_size {
            self.shared.wake.notify_one();
        }
        outcome
    }

    /// Waits until every transaction submitted before this call has been sent
    /// or dropped. Returns `false` if `timeout` elapsed first.
    pub fn flush(&self, timeout: Duration) -> bool {
        let target = self.shared.counters.submitted();
        self.shared.wake.notify_one();
        self.shared.counters.wait_settled(target, timeout)
    }

    /// Stops accepting transactions, drains what is queued within the shutdown
    /// timeout and joins the reporter thread. Idempotent.
    pub fn shutdown(&self) {
        self.cancel();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if handle.join().is_err() {
            error!("APM | Reporter thread panicked");
            let leftovers = self.shared.lock_queue().drain_all().len();
            self.shared
                .counters
                .record_dropped(DropReason::Shutdown, leftovers as u64);
        }
    }

    /// Stops accepting transactions and tells the service to drain and exit,
    /// without waiting for it.
    pub(crate) fn cancel(&self) {
        {
            let _queue = self.shared.lock_queue();
            self.shared.accepting.store(false, Ordering::Release);
        }
        self.shared.cancel.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    #[must_use]
    pub fn stats(&self) -> ReporterStats {
        let queued = self.shared.lock_queue().len();
        self.shared.counters.snapshot(queued)
    }
}

struct ReporterService {
    shared: Arc<Shared>,
    flusher: Flusher,
    flush_interval: Duration,
    shutdown_timeout: Duration,
    /// Size of the batch currently being shipped.
    in_flight: AtomicUsize,
}

impl ReporterService {
    async fn run(self) {
        debug!("APM | Reporter service started");
        let mut flush_interval = interval(self.flush_interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_interval.tick().await; // discard first tick

        let deadline = loop {
            tokio::select! {
                biased;
                () = self.shared.cancel.cancelled() => break Instant::now() + self.shutdown_timeout,
                _ = flush_interval.tick() => {}
                () = self.shared.wake.notified() => {}
            }

            let drain = self.drain();
            tokio::pin!(drain);
            tokio::select! {
                biased;
                () = &mut drain => {}
                () = self.shared.cancel.cancelled() => {
                    // the in-flight batch finishes inside the shutdown window
                    let deadline = Instant::now() + self.shutdown_timeout;
                    if timeout_at(deadline, drain).await.is_err() {
                        warn!("APM | In-flight batch did not finish before the shutdown timeout");
                    }
                    break deadline;
                }
            }
        };

        self.final_drain(deadline).await;
        debug!("APM | Reporter service stopped");
    }

    /// Ships batches until the queue is empty or shutdown is requested.
    async fn drain(&self) {
        while !self.shared.cancel.is_cancelled() {
            if !self.flush_next().await {
                break;
            }
        }
    }

    async fn final_drain(&self, deadline: Instant) {
        let mut lost = self.in_flight.swap(0, Ordering::AcqRel);
        let drained = timeout_at(deadline, async {
            while self.flush_next().await {}
        })
        .await;
        if drained.is_err() {
            warn!("APM | Shutdown timeout elapsed before the queue was drained");
        }

        lost += self.in_flight.swap(0, Ordering::AcqRel);
        lost += self.shared.lock_queue().drain_all().len();
        if lost > 0 {
            info!("APM | Dropped {lost} transactions on shutdown");
            self.shared
                .counters
                .record_dropped(DropReason::Shutdown, lost as u64);
        }
    }

    /// Ships one batch. Returns `false` when the queue was empty.
    async fn flush_next(&self) -> bool {
        let batch = self.shared.lock_queue().get_batch(self.shared.max_batch_size);
        if batch.is_empty() {
            return false;
        }
        self.in_flight.store(batch.len(), Ordering::Release);

        let outcome = self.flusher.flush_batch(batch).await;

        self.in_flight.store(0, Ordering::Release);
        let counters = &self.shared.counters;
        counters.record_sent(outcome.sent as u64);
        counters.record_dropped(DropReason::Transport, outcome.dropped as u64);
        counters.record_dropped_error_reports(outcome.dropped_error_reports as u64);
        true
    }
}
