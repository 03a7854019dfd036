// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread storage of the currently active transaction.
//!
//! Each worker thread owns one slot. Reading or writing a thread's own slot takes
//! no lock, and no other thread can see it. Slots are tagged with the id of the
//! [`TransactionContext`] that bound them; a slot whose tag is not the live
//! context's id is stale and behaves as empty.
//!
//! Clearing a context therefore invalidates the slots of every thread at once,
//! including pooled threads that are still running code from the previous agent
//! run, without visiting them.

use crate::error::ContextError;
use crate::transaction::{Transaction, TransactionId};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Source of process-unique context ids. Zero means "no context".
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Id of the context published as the process-wide one.
static ACTIVE_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

struct Slot {
    context_id: u64,
    transaction: Transaction,
}

thread_local! {
    static CURRENT: RefCell<Option<Slot>> = const { RefCell::new(None) };
}

/// Returns a snapshot of the current thread's transaction under the
/// process-wide context, if any.
///
/// Lock-free: one atomic load plus a thread-local read.
#[must_use]
pub fn current_transaction() -> Option<Transaction> {
    let active = ACTIVE_CONTEXT_ID.load(Ordering::Acquire);
    if active == 0 {
        return None;
    }
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .filter(|slot| slot.context_id == active)
            .map(|slot| slot.transaction.clone())
    })
}

#[derive(Debug)]
struct Inner {
    id: u64,
    active: AtomicBool,
}

/// Maps each worker thread to at most one live transaction.
///
/// One context exists per agent run. Clones share the same context.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    inner: Arc<Inner>,
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                active: AtomicBool::new(true),
            }),
        }
    }

    /// Publishes this context as the one read by [`current_transaction`].
    pub fn activate(&self) {
        if self.is_active() {
            ACTIVE_CONTEXT_ID.store(self.inner.id, Ordering::Release);
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Binds `transaction` as current for the calling thread.
    ///
    /// Fails when this context already has a live transaction on this thread, or
    /// when the context has been cleared. A stale slot left by an earlier
    /// context is replaced.
    pub fn bind(&self, transaction: Transaction) -> Result<TransactionId, ContextError> {
        if !self.is_active() {
            return Err(ContextError::Inactive);
        }
        let id = transaction.id();
        CURRENT.with(|cell| {
            let mut slot = cell.borrow_mut();
            if let Some(existing) = slot.as_ref() {
                if existing.context_id == self.inner.id {
                    return Err(ContextError::AlreadyBound(existing.transaction.id()));
                }
            }
            *slot = Some(Slot {
                context_id: self.inner.id,
                transaction,
            });
            Ok(id)
        })
    }

    /// Returns a snapshot of this thread's live transaction.
    #[must_use]
    pub fn current(&self) -> Option<Transaction> {
        self.with_current(|transaction| transaction.clone())
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.with_current(|_| ()).is_some()
    }

    /// Runs `f` against this thread's live transaction.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Transaction) -> R) -> Option<R> {
        if !self.is_active() {
            return None;
        }
        CURRENT.with(|cell| {
            cell.borrow_mut()
                .as_mut()
                .filter(|slot| slot.context_id == self.inner.id)
                .map(|slot| f(&mut slot.transaction))
        })
    }

    /// Unbinds and returns the transaction `id` from this thread's slot.
    ///
    /// Works after [`clear`](Self::clear) so that a job which outlived its agent
    /// run still releases the slot of its pooled thread.
    pub fn take(&self, id: TransactionId) -> Option<Transaction> {
        CURRENT.with(|cell| {
            let mut slot = cell.borrow_mut();
            let owned = slot
                .as_ref()
                .is_some_and(|s| s.context_id == self.inner.id && s.transaction.id() == id);
            if owned {
                slot.take().map(|s| s.transaction)
            } else {
                None
            }
        })
    }

    /// Deactivates the context. Every thread's slot bound by it becomes stale.
    pub fn clear(&self) {
        self.inner.active.store(false, Ordering::Release);
        let _ = ACTIVE_CONTEXT_ID.compare_exchange(
            self.inner.id,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Barrier;

    #[test]
    fn test_bind_current_take() {
        let context = TransactionContext::new();
        let id = context
            .bind(Transaction::new("Worker1", "JobRunner"))
            .expect("bind failed");

        let current = context.current().expect("no current transaction");
        assert_eq!(current.id(), id);
        assert_eq!(current.name(), "Worker1");

        let taken = context.take(id).expect("take failed");
        assert_eq!(taken.id(), id);
        assert!(context.current().is_none());
        assert!(context.take(id).is_none());
    }

    #[test]
    fn test_bind_twice_is_rejected() {
        let context = TransactionContext::new();
        let first = context
            .bind(Transaction::new("Outer", "JobRunner"))
            .expect("bind failed");

        let result = context.bind(Transaction::new("Inner", "JobRunner"));
        assert_eq!(result, Err(ContextError::AlreadyBound(first)));
        assert_eq!(context.current().map(|t| t.id()), Some(first));

        context.take(first);
    }

    #[test]
    fn test_take_ignores_other_transaction_ids() {
        let context = TransactionContext::new();
        let id = context
            .bind(Transaction::new("Worker1", "JobRunner"))
            .expect("bind failed");

        assert!(context.take(TransactionId::new()).is_none());
        assert!(context.is_bound());
        context.take(id);
    }

    #[test]
    fn test_with_current_mutates_live_transaction() {
        let context = TransactionContext::new();
        let id = context
            .bind(Transaction::new("Worker1", "JobRunner"))
            .expect("bind failed");

        context.with_current(|t| t.add_error(crate::ErrorRecord::new("Warning", "slow")));

        let taken = context.take(id).expect("take failed");
        assert_eq!(taken.errors().len(), 1);
    }

    #[test]
    fn test_cleared_context_hides_and_rejects() {
        let context = TransactionContext::new();
        let id = context
            .bind(Transaction::new("Worker1", "JobRunner"))
            .expect("bind failed");

        context.clear();
        assert!(context.current().is_none());
        assert_eq!(
            context.bind(Transaction::new("Worker2", "JobRunner")),
            Err(ContextError::Inactive)
        );

        // The stale slot can still be released by its owner.
        assert!(context.take(id).is_some());
    }

    #[test]
    fn test_stale_slot_is_replaced_by_new_context() {
        let old = TransactionContext::new();
        old.bind(Transaction::new("Stale", "JobRunner"))
            .expect("bind failed");
        old.clear();

        let new = TransactionContext::new();
        assert!(new.current().is_none());
        let id = new
            .bind(Transaction::new("Fresh", "JobRunner"))
            .expect("stale slot should be replaced");
        assert_eq!(new.current().map(|t| t.id()), Some(id));
        new.take(id);
    }

    #[test]
    fn test_threads_do_not_share_slots() {
        let context = TransactionContext::new();
        let barrier = Barrier::new(4);

        std::thread::scope(|s| {
            for n in 0..4 {
                let context = context.clone();
                let barrier = &barrier;
                s.spawn(move || {
                    let name = format!("Worker{n}");
                    let id = context
                        .bind(Transaction::new(name.clone(), "JobRunner"))
                        .expect("bind failed");
                    // every thread holds a transaction at the same time
                    barrier.wait();
                    let current = context.current().expect("lost transaction");
                    assert_eq!(current.id(), id);
                    assert_eq!(current.name(), name);
                    barrier.wait();
                    context.take(id).expect("take failed");
                });
            }
        });

        assert!(context.current().is_none());
    }

    #[test]
    #[serial]
    fn test_process_wide_accessor_follows_active_context() {
        let context = TransactionContext::new();
        context.activate();
        let id = context
            .bind(Transaction::new("Worker1", "JobRunner"))
            .expect("bind failed");

        assert_eq!(current_transaction().map(|t| t.id()), Some(id));

        context.clear();
        assert!(current_transaction().is_none());
        context.take(id);
    }

    #[test]
    #[serial]
    fn test_clear_of_replaced_context_keeps_newer_one_published() {
        let first = TransactionContext::new();
        first.activate();
        let second = TransactionContext::new();
        second.activate();

        first.clear();
        let id = second
            .bind(Transaction::new("Worker1", "JobRunner"))
            .expect("bind failed");
        assert_eq!(current_transaction().map(|t| t.id()), Some(id));

        second.take(id);
        second.clear();
    }
}
