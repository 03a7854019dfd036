// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO queue of finished transactions waiting to be batched.
//!
//! 1. Worker threads push finished transactions via `add()`
//! 2. The flush loop pulls batches of at most `max_batch_size` via `get_batch()`
//! 3. When the queue holds `max_queue_items`, the [`DropPolicy`] decides whether
//!    the oldest entry is evicted or the new one is rejected

use crate::config::DropPolicy;
use crate::transaction::FinishedTransaction;
use std::collections::VecDeque;

/// What happened to a transaction offered to the queue.
#[derive(Debug)]
pub(crate) enum Admission {
    Queued,
    /// Queued, after evicting the returned (oldest) transaction.
    Evicted(FinishedTransaction),
    /// Not queued; the transaction is handed back.
    Rejected(FinishedTransaction),
}

#[derive(Debug)]
pub(crate) struct TransactionQueue {
    queue: VecDeque<FinishedTransaction>,
    max_queue_items: usize,
    drop_policy: DropPolicy,
}

impl TransactionQueue {
    pub(crate) fn new(max_queue_items: usize, drop_policy: DropPolicy) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_queue_items.min(1024)),
            max_queue_items: max_queue_items.max(1),
            drop_policy,
        }
    }

    pub(crate) fn add(&mut self, transaction: FinishedTransaction) -> Admission {
        if self.queue.len() < self.max_queue_items {
            self.queue.push_back(transaction);
            return Admission::Queued;
        }
        match self.drop_policy {
            DropPolicy::DropNewest => Admission::Rejected(transaction),
            DropPolicy::DropOldest => match self.queue.pop_front() {
                Some(oldest) => {
                    self.queue.push_back(transaction);
                    Admission::Evicted(oldest)
                }
                None => {
                    self.queue.push_back(transaction);
                    Admission::Queued
                }
            },
        }
    }

    /// Pulls up to `max_batch_size` transactions in FIFO order.
    pub(crate) fn get_batch(&mut self, max_batch_size: usize) -> Vec<FinishedTransaction> {
        let take = self.queue.len().min(max_batch_size.max(1));
        self.queue.drain(..take).collect()
    }

    pub(crate) fn drain_all(&mut self) -> Vec<FinishedTransaction> {
        self.queue.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}
