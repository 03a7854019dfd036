// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hooks around job execution.
//!
//! A host framework runs every job through its [`MiddlewareChain`]. Installed
//! instrumentors add a [`JobHooks`] implementation to the chain; the chain calls
//! `before` in installation order, runs the job body, then `after` or
//! `on_error` in reverse order on every exit path. The job outcome is never
//! altered: an `Err` is returned as is and a panic resumes unwinding once the
//! hooks have seen it.
//!
//! When a hook asks for backtraces, a panic's backtrace is taken by a panic
//! hook at the panic site, and an `Err`'s at the point the job returned. Both
//! are captured unresolved; symbols are looked up when the record is rendered
//! on the reporter thread.

use crate::agent::Tracer;
use crate::job::JobDescriptor;
use crate::transaction::{ErrorRecord, TransactionId};
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, PoisonError, RwLock};
use tracing::{debug, warn};

/// Callbacks an instrumentor receives around one job execution, on the worker
/// thread that runs the job.
pub trait JobHooks: Send + Sync {
    /// Starts tracking the job. `None` means the hook does not track this
    /// execution and neither `after` nor `on_error` will be called for it.
    fn before(&self, job: &JobDescriptor) -> Option<TransactionId>;

    /// The job returned successfully.
    fn after(&self, id: TransactionId);

    /// The job returned an error or panicked.
    fn on_error(&self, id: TransactionId, error: ErrorRecord);

    /// The wrap unwound before `after` or `on_error` completed. Releases any
    /// per-thread state without reporting.
    fn abandon(&self, _id: TransactionId) {}

    /// Whether errors passed to `on_error` should carry a backtrace.
    fn captures_backtraces(&self) -> bool {
        false
    }
}

thread_local! {
    static CAPTURE_PANICS: Cell<bool> = const { Cell::new(false) };
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains a panic hook that keeps the panicking thread's backtrace while a
/// wrapped job runs there. The previously installed hook still runs.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURE_PANICS.try_with(Cell::get).unwrap_or(false) {
                let _ = PANIC_BACKTRACE.try_with(|slot| {
                    if let Ok(mut slot) = slot.try_borrow_mut() {
                        *slot = Some(Backtrace::force_capture());
                    }
                });
            }
            previous(info);
        }));
    });
}

/// Arms panic backtrace capture on this thread until dropped.
struct PanicCapture {
    previous: bool,
}

impl PanicCapture {
    fn arm() -> Self {
        install_panic_hook();
        PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take());
        Self {
            previous: CAPTURE_PANICS.with(|armed| armed.replace(true)),
        }
    }

    /// Backtrace of the last panic since arming, if one happened.
    fn take(&self) -> Option<Backtrace> {
        PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
    }
}

impl Drop for PanicCapture {
    fn drop(&mut self) {
        CAPTURE_PANICS.with(|armed| armed.set(self.previous));
        PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take());
    }
}

struct Entered<'a> {
    hooks: &'a dyn JobHooks,
    id: TransactionId,
    settled: bool,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.hooks.abandon(self.id);
        }
    }
}

/// Runs `f`, logging instead of propagating a panic raised by a hook.
fn guarded<R>(stage: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let error = ErrorRecord::from_panic(&*payload);
            warn!("APM | Instrumentation hook panicked in {stage}: {}", error.message());
            None
        }
    }
}

fn run_wrapped<T, E, F>(hooks: &[&dyn JobHooks], job: &JobDescriptor, body: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: fmt::Display + 'static,
{
    let mut entered: Vec<Entered<'_>> = Vec::with_capacity(hooks.len());
    for hook in hooks {
        if let Some(Some(id)) = guarded("before", || hook.before(job)) {
            entered.push(Entered {
                hooks: *hook,
                id,
                settled: false,
            });
        }
    }

    let backtraces = wants_backtrace(&entered);
    let capture = backtraces.then(PanicCapture::arm);

    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    let panic_backtrace = capture.as_ref().and_then(PanicCapture::take);
    drop(capture);

    match outcome {
        Ok(Ok(value)) => {
            for entry in entered.iter_mut().rev() {
                let (hooks, id) = (entry.hooks, entry.id);
                entry.settled = guarded("after", || hooks.after(id)).is_some();
            }
            Ok(value)
        }
        Ok(Err(error)) => {
            let mut record = ErrorRecord::from_job_error(&error);
            if backtraces {
                record = record.with_captured_backtrace(Backtrace::force_capture());
            }
            settle_with_error(&mut entered, &record);
            Err(error)
        }
        Err(payload) => {
            let mut record = ErrorRecord::from_panic(&*payload);
            if let Some(backtrace) = panic_backtrace {
                record = record.with_captured_backtrace(backtrace);
            }
            settle_with_error(&mut entered, &record);
            drop(entered);
            panic::resume_unwind(payload)
        }
    }
}

fn wants_backtrace(entered: &[Entered<'_>]) -> bool {
    entered.iter().any(|entry| {
        let hooks = entry.hooks;
        guarded("captures_backtraces", || hooks.captures_backtraces()).unwrap_or(false)
    })
}

fn settle_with_error(entered: &mut [Entered<'_>], record: &ErrorRecord) {
    for entry in entered.iter_mut().rev() {
        let (hooks, id) = (entry.hooks, entry.id);
        entry.settled = guarded("on_error", || hooks.on_error(id, record.clone())).is_some();
    }
}

/// Ordered list of installed hooks a host framework wraps job execution with.
///
/// Clones share the same list.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Arc<RwLock<Vec<(String, Arc<dyn JobHooks>)>>>,
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("keys", &self.keys())
            .finish()
    }
}

impl MiddlewareChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `hooks` under `key`. An entry already installed under the same
    /// key is replaced in place.
    pub fn add(&self, key: impl Into<String>, hooks: Arc<dyn JobHooks>) {
        let key = key.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = hooks;
        } else {
            entries.push((key, hooks));
        }
    }

    /// Removes the entry installed under `key`. Returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        entries.len() != before
    }

    /// Removes the entry under `key` only if it is `hooks` itself. An entry
    /// that replaced it since is left in place.
    pub fn remove_installed(&self, key: &str, hooks: &Arc<dyn JobHooks>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(k, installed)| k != key || !Arc::ptr_eq(installed, hooks));
        entries.len() != before
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(k, _)| k == key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `body` wrapped by every installed hook.
    ///
    /// Returns exactly what `body` returned. If `body` panics, the hooks record
    /// the panic and unwinding resumes with the original payload.
    pub fn invoke<T, E, F>(&self, job: &JobDescriptor, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display + 'static,
    {
        let snapshot: Vec<Arc<dyn JobHooks>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, hooks)| Arc::clone(hooks))
            .collect();
        let hooks: Vec<&dyn JobHooks> = snapshot.iter().map(|hooks| &**hooks).collect();
        run_wrapped(&hooks, job, body)
    }
}

struct MiddlewareInner {
    tag: String,
    tracer: Tracer,
    active: AtomicBool,
}

/// Turns each job execution into one transaction.
///
/// The transaction is named after the job (see
/// [`JobDescriptor::transaction_name`]) and typed with the framework tag.
/// When a transaction is already current on the thread, as happens when one
/// framework runs inside another, this middleware leaves it to the outer one.
#[derive(Clone)]
pub struct JobMiddleware {
    inner: Arc<MiddlewareInner>,
}

impl fmt::Debug for JobMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobMiddleware")
            .field("tag", &self.inner.tag)
            .field("active", &self.is_active())
            .finish()
    }
}

impl JobMiddleware {
    pub fn new(tag: impl Into<String>, tracer: Tracer) -> Self {
        Self {
            inner: Arc::new(MiddlewareInner {
                tag: tag.into(),
                tracer,
                active: AtomicBool::new(true),
            }),
        }
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire) && self.inner.tracer.is_active()
    }

    /// Stops producing transactions, including through clones the host kept.
    pub fn deactivate(&self) {
        self.inner.active.store(false, Ordering::Release);
    }

    /// Runs `body` wrapped by this middleware alone.
    pub fn call<T, E, F>(&self, job: &JobDescriptor, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display + 'static,
    {
        run_wrapped(&[self as &dyn JobHooks], job, body)
    }
}

impl JobHooks for JobMiddleware {
    fn before(&self, job: &JobDescriptor) -> Option<TransactionId> {
        if !self.is_active() {
            return None;
        }
        let tracer = &self.inner.tracer;
        if tracer.context().is_bound() {
            debug!(
                "APM | Transaction already current, {} does not trace {}",
                self.inner.tag,
                job.transaction_name()
            );
            return None;
        }
        match tracer.begin_transaction(job.transaction_name(), &self.inner.tag) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!("APM | Not tracing {}: {e}", job.transaction_name());
                None
            }
        }
    }

    fn after(&self, id: TransactionId) {
        self.inner.tracer.end_transaction(id, None);
    }

    fn on_error(&self, id: TransactionId, error: ErrorRecord) {
        self.inner.tracer.end_transaction(id, Some(error));
    }

    fn abandon(&self, id: TransactionId) {
        self.inner.tracer.discard_transaction(id);
    }

    fn captures_backtraces(&self) -> bool {
        self.inner.tracer.capture_backtraces()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("divided by 0")]
    struct ZeroDivisionError;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    impl Calls {
        fn push(&self, call: String) {
            self.0.lock().expect("lock poisoned").push(call);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().expect("lock poisoned"))
        }
    }

    struct RecordingHooks {
        name: &'static str,
        calls: Arc<Calls>,
        panic_in_after: bool,
    }

    impl RecordingHooks {
        fn new(name: &'static str, calls: &Arc<Calls>) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: Arc::clone(calls),
                panic_in_after: false,
            })
        }
    }

    impl JobHooks for RecordingHooks {
        fn before(&self, job: &JobDescriptor) -> Option<TransactionId> {
            self.calls
                .push(format!("{}:before:{}", self.name, job.transaction_name()));
            Some(TransactionId::new())
        }

        fn after(&self, _id: TransactionId) {
            self.calls.push(format!("{}:after", self.name));
            if self.panic_in_after {
                panic!("hook bug");
            }
        }

        fn on_error(&self, _id: TransactionId, error: ErrorRecord) {
            self.calls.push(format!(
                "{}:on_error:{}:{}",
                self.name,
                error.exception_type(),
                error.message()
            ));
        }

        fn abandon(&self, _id: TransactionId) {
            self.calls.push(format!("{}:abandon", self.name));
        }
    }

    fn chain(calls: &Arc<Calls>) -> MiddlewareChain {
        let chain = MiddlewareChain::new();
        chain.add("outer", RecordingHooks::new("outer", calls));
        chain.add("inner", RecordingHooks::new("inner", calls));
        chain
    }

    #[test]
    fn test_success_runs_hooks_in_order() {
        let calls = Arc::new(Calls::default());
        let result: Result<u32, ZeroDivisionError> =
            chain(&calls).invoke(&JobDescriptor::new("Worker1"), || Ok(42));

        assert_eq!(result.expect("job failed"), 42);
        assert_eq!(
            calls.take(),
            vec![
                "outer:before:Worker1",
                "inner:before:Worker1",
                "inner:after",
                "outer:after"
            ]
        );
    }

    #[test]
    fn test_error_is_returned_unchanged() {
        let calls = Arc::new(Calls::default());
        let result: Result<(), ZeroDivisionError> =
            chain(&calls).invoke(&JobDescriptor::new("BoomWorker"), || Err(ZeroDivisionError));

        assert!(matches!(result, Err(ZeroDivisionError)));
        let calls = calls.take();
        assert_eq!(calls[2], "inner:on_error:ZeroDivisionError:divided by 0");
        assert_eq!(calls[3], "outer:on_error:ZeroDivisionError:divided by 0");
    }

    #[test]
    fn test_panic_is_recorded_then_resumed() {
        let calls = Arc::new(Calls::default());
        let chain = chain(&calls);

        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), ZeroDivisionError> =
                chain.invoke(&JobDescriptor::new("PanickyWorker"), || panic!("boom"));
        }));

        let payload = unwound.expect_err("panic was swallowed");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
        let calls = calls.take();
        assert!(calls.contains(&"inner:on_error:panic:boom".to_string()));
        assert!(calls.contains(&"outer:on_error:panic:boom".to_string()));
    }

    #[test]
    fn test_panicking_hook_is_isolated() {
        let calls = Arc::new(Calls::default());
        let chain = MiddlewareChain::new();
        chain.add(
            "buggy",
            Arc::new(RecordingHooks {
                name: "buggy",
                calls: Arc::clone(&calls),
                panic_in_after: true,
            }),
        );

        let result: Result<&str, ZeroDivisionError> =
            chain.invoke(&JobDescriptor::new("Worker1"), || Ok("done"));

        assert_eq!(result.expect("job failed"), "done");
        assert_eq!(
            calls.take(),
            vec!["buggy:before:Worker1", "buggy:after", "buggy:abandon"]
        );
    }

    #[test]
    fn test_add_replaces_and_remove() {
        let calls = Arc::new(Calls::default());
        let chain = chain(&calls);
        chain.add("outer", RecordingHooks::new("replacement", &calls));

        assert_eq!(chain.keys(), vec!["outer", "inner"]);
        assert!(chain.remove("outer"));
        assert!(!chain.remove("outer"));
        assert!(!chain.contains("outer"));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_remove_installed_keeps_replacement() {
        let calls = Arc::new(Calls::default());
        let chain = MiddlewareChain::new();
        let first: Arc<dyn JobHooks> = RecordingHooks::new("first", &calls);
        let second: Arc<dyn JobHooks> = RecordingHooks::new("second", &calls);

        chain.add("jobrunner", Arc::clone(&first));
        chain.add("jobrunner", Arc::clone(&second));
        assert!(!chain.remove_installed("jobrunner", &first));
        assert!(chain.contains("jobrunner"));

        assert!(chain.remove_installed("jobrunner", &second));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_boxed_error_is_returned_unchanged() {
        let calls = Arc::new(Calls::default());
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> =
            chain(&calls).invoke(&JobDescriptor::new("BoomWorker"), || Err("disk full".into()));

        assert_eq!(result.expect_err("job succeeded").to_string(), "disk full");
        let calls = calls.take();
        assert_eq!(
            calls[2],
            "inner:on_error:Box<dyn error::Error + Send + Sync>:disk full"
        );
    }

    #[derive(Default)]
    struct BacktraceHooks {
        errors: Mutex<Vec<ErrorRecord>>,
    }

    impl JobHooks for BacktraceHooks {
        fn before(&self, _job: &JobDescriptor) -> Option<TransactionId> {
            Some(TransactionId::new())
        }

        fn after(&self, _id: TransactionId) {}

        fn on_error(&self, _id: TransactionId, error: ErrorRecord) {
            self.errors.lock().expect("lock poisoned").push(error);
        }

        fn captures_backtraces(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_backtraces_leave_out_agent_frames() {
        let hooks = Arc::new(BacktraceHooks::default());
        let chain = MiddlewareChain::new();
        chain.add("backtraces", Arc::clone(&hooks) as Arc<dyn JobHooks>);

        let _: Result<(), ZeroDivisionError> =
            chain.invoke(&JobDescriptor::new("BoomWorker"), || Err(ZeroDivisionError));
        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), ZeroDivisionError> =
                chain.invoke(&JobDescriptor::new("PanickyWorker"), || panic!("boom"));
        }));
        assert!(unwound.is_err());

        let errors = hooks.errors.lock().expect("lock poisoned");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].message(), "boom");
        for error in errors.iter() {
            assert!(error.has_backtrace());
            assert!(error
                .backtrace()
                .iter()
                .all(|frame| !frame.contains("apm_agent_core::")));
        }
    }

    #[test]
    fn test_backtraces_only_when_requested() {
        let calls = Arc::new(Calls::default());
        let chain = MiddlewareChain::new();
        let hooks = Arc::new(BacktraceHooks::default());
        chain.add("recording", RecordingHooks::new("recording", &calls));

        let _: Result<(), ZeroDivisionError> =
            chain.invoke(&JobDescriptor::new("BoomWorker"), || Err(ZeroDivisionError));
        assert!(!CAPTURE_PANICS.with(Cell::get));

        chain.add("backtraces", Arc::clone(&hooks) as Arc<dyn JobHooks>);
        let _: Result<(), ZeroDivisionError> = chain.invoke(&JobDescriptor::new("Worker1"), || {
            assert!(CAPTURE_PANICS.with(Cell::get));
            Ok(())
        });
        assert!(!CAPTURE_PANICS.with(Cell::get));
    }

    #[test]
    fn test_empty_chain_runs_body() {
        let chain = MiddlewareChain::new();
        assert!(chain.is_empty());
        let result: Result<u8, ZeroDivisionError> =
            chain.invoke(&JobDescriptor::new("Worker1"), || Ok(1));
        assert_eq!(result.expect("job failed"), 1);
    }
}
