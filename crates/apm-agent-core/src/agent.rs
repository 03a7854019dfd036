// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::AgentConfig;
use crate::context::TransactionContext;
use crate::error::{AgentError, ContextError, InjectorError};
use crate::registry::{InjectorRegistry, Instrumentor};
use crate::reporter::transport::{HttpTransport, Transport};
use crate::reporter::{Reporter, ReporterStats, SubmitOutcome};
use crate::transaction::{ErrorRecord, Transaction, TransactionId, TransactionResult};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle status of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct TracerInner {
    context: TransactionContext,
    reporter: Reporter,
    capture_backtraces: bool,
}

/// What instrumentors use to open and close transactions for one agent run.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("active", &self.is_active())
            .field("capture_backtraces", &self.inner.capture_backtraces)
            .finish_non_exhaustive()
    }
}

impl Tracer {
    pub fn new(context: TransactionContext, reporter: Reporter, capture_backtraces: bool) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                context,
                reporter,
                capture_backtraces,
            }),
        }
    }

    #[must_use]
    pub fn context(&self) -> &TransactionContext {
        &self.inner.context
    }

    #[must_use]
    pub fn reporter(&self) -> &Reporter {
        &self.inner.reporter
    }

    /// False once the agent run this tracer belongs to has stopped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.context.is_active()
    }

    #[must_use]
    pub fn capture_backtraces(&self) -> bool {
        self.inner.capture_backtraces
    }

    /// Opens a transaction and makes it current on the calling thread.
    pub fn begin_transaction(&self, name: &str, kind: &str) -> Result<TransactionId, ContextError> {
        self.inner.context.bind(Transaction::new(name, kind))
    }

    /// Ends transaction `id` on the calling thread and hands it to the reporter.
    ///
    /// With an error the transaction fails and carries it, otherwise it
    /// succeeds. Returns `None` when `id` is not current on this thread.
    pub fn end_transaction(
        &self,
        id: TransactionId,
        error: Option<ErrorRecord>,
    ) -> Option<SubmitOutcome> {
        let Some(transaction) = self.inner.context.take(id) else {
            debug!("APM | Transaction {id} is not current on this thread");
            return None;
        };
        let finished = match error {
            Some(error) => transaction.fail(error),
            None => transaction.finish(TransactionResult::Success),
        };
        Some(self.inner.reporter.submit(finished))
    }

    /// Releases transaction `id` from the calling thread without reporting it.
    pub fn discard_transaction(&self, id: TransactionId) -> bool {
        self.inner.context.take(id).is_some()
    }

    #[must_use]
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.inner.context.current()
    }
}

struct Run {
    config: AgentConfig,
    tracer: Tracer,
    instrumentors: Vec<Box<dyn Instrumentor>>,
    installed: BTreeMap<String, bool>,
}

impl Run {
    /// Uninstalls every instrumentor, in reverse install order.
    fn uninstall_all(&self) {
        for instrumentor in self.instrumentors.iter().rev() {
            let key = instrumentor.key();
            if panic::catch_unwind(AssertUnwindSafe(|| instrumentor.uninstall())).is_err() {
                warn!("APM | Instrumentor {key} panicked while uninstalling");
            }
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    run: Option<Run>,
    /// Reporter of the last stopped run, kept for its counters.
    last_reporter: Option<Reporter>,
}

struct AgentInner {
    registry: Arc<InjectorRegistry>,
    transport: Option<Arc<dyn Transport>>,
    status: RwLock<AgentStatus>,
    /// Tracer of the running run, readable while `lifecycle` is held by
    /// `start` or `stop`.
    tracer: RwLock<Option<Tracer>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = lifecycle.run.take() {
            warn!("APM | Agent dropped while running, stopping without flushing");
            run.uninstall_all();
            run.tracer.context().clear();
            run.tracer.reporter().cancel();
        }
    }
}

/// Handle to an agent. Clones share the same agent.
///
/// `start` and `stop` are serialized by one lock; the read path used by worker
/// threads (hooks, [`crate::current_transaction`]) never takes it.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// A stopped agent shipping over HTTP to the configured collector.
    #[must_use]
    pub fn new(registry: Arc<InjectorRegistry>) -> Self {
        Self::build(registry, None)
    }

    /// A stopped agent shipping through `transport`.
    #[must_use]
    pub fn with_transport(registry: Arc<InjectorRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self::build(registry, Some(transport))
    }

    fn build(registry: Arc<InjectorRegistry>, transport: Option<Arc<dyn Transport>>) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                registry,
                transport,
                status: RwLock::new(AgentStatus::Stopped),
                tracer: RwLock::new(None),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: AgentStatus) {
        *self
            .inner
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn set_tracer(&self, tracer: Option<Tracer>) {
        *self
            .inner
            .tracer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = tracer;
    }

    /// Starts the agent. A no-op when it is already running.
    ///
    /// Fails only on an invalid configuration or when the reporter cannot be
    /// started; the agent is then left stopped. Instrumentors that fail to
    /// build or install are logged and skipped.
    pub fn start(&self, config: AgentConfig) -> Result<(), AgentError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.run.is_some() {
            debug!("APM | Agent already running");
            return Ok(());
        }
        config.validate()?;

        self.set_status(AgentStatus::Starting);
        match self.start_run(config) {
            Ok(run) => {
                info!(
                    "APM | Agent started for service {} with {} instrumentors",
                    run.config.service_name,
                    run.instrumentors.len()
                );
                self.set_tracer(Some(run.tracer.clone()));
                lifecycle.run = Some(run);
                lifecycle.last_reporter = None;
                self.set_status(AgentStatus::Running);
                Ok(())
            }
            Err(e) => {
                self.set_status(AgentStatus::Stopped);
                Err(e)
            }
        }
    }

    fn start_run(&self, config: AgentConfig) -> Result<Run, AgentError> {
        let transport: Arc<dyn Transport> = match &self.inner.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(HttpTransport::new(&config)?),
        };

        let context = TransactionContext::new();
        context.activate();
        let reporter = match Reporter::start(&config, transport) {
            Ok(reporter) => reporter,
            Err(e) => {
                context.clear();
                return Err(e);
            }
        };
        let tracer = Tracer::new(context, reporter, config.capture_backtraces);

        let registry = &self.inner.registry;
        let candidates = registry.resolve(
            config.enabled_injectors.iter().map(String::as_str),
            &tracer,
        );

        let mut instrumentors = Vec::with_capacity(candidates.len());
        for instrumentor in candidates {
            match install(instrumentor.as_ref()) {
                Ok(()) => {
                    debug!("APM | Installed instrumentor {}", instrumentor.key());
                    instrumentors.push(instrumentor);
                }
                Err(e) => {
                    warn!("APM | {e}");
                    registry.record_failure(instrumentor.key(), &e);
                }
            }
        }

        Ok(Run {
            installed: registry.installed(),
            config,
            tracer,
            instrumentors,
        })
    }

    /// Stops the agent: uninstalls every instrumentor, flushes and shuts down
    /// the reporter, then clears the transaction context. A no-op when stopped.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle();
        let Some(run) = lifecycle.run.take() else {
            debug!("APM | Agent already stopped");
            return;
        };
        self.set_status(AgentStatus::Stopping);
        self.set_tracer(None);
        run.uninstall_all();

        let reporter = run.tracer.reporter().clone();
        if !reporter.flush(run.config.shutdown_timeout) {
            warn!(
                "APM | Timed out after {:?} flushing transactions",
                run.config.shutdown_timeout
            );
        }
        reporter.shutdown();
        run.tracer.context().clear();

        let stats = reporter.stats();
        info!(
            "APM | Agent stopped: {} transactions sent, {} dropped",
            stats.sent,
            stats.dropped()
        );
        lifecycle.last_reporter = Some(reporter);
        self.set_status(AgentStatus::Stopped);
    }

    #[must_use]
    pub fn status(&self) -> AgentStatus {
        *self
            .inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status() == AgentStatus::Running
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<InjectorRegistry> {
        &self.inner.registry
    }

    /// The calling thread's current transaction under this agent, if any.
    #[must_use]
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.tracer()?.current_transaction()
    }

    #[must_use]
    pub fn tracer(&self) -> Option<Tracer> {
        self.inner
            .tracer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Per enabled injector key, whether it is installed. Empty when stopped.
    #[must_use]
    pub fn installed(&self) -> BTreeMap<String, bool> {
        self.lifecycle()
            .run
            .as_ref()
            .map(|run| run.installed.clone())
            .unwrap_or_default()
    }

    /// Counters of the running reporter, or of the last run once stopped.
    #[must_use]
    pub fn reporter_stats(&self) -> Option<ReporterStats> {
        let lifecycle = self.lifecycle();
        lifecycle
            .run
            .as_ref()
            .map(|run| run.tracer.reporter())
            .or(lifecycle.last_reporter.as_ref())
            .map(Reporter::stats)
    }

    /// Waits until every transaction finished so far is sent or dropped.
    /// Returns `true` right away when the agent is not running.
    pub fn flush(&self, timeout: Duration) -> bool {
        let reporter = self
            .lifecycle()
            .run
            .as_ref()
            .map(|run| run.tracer.reporter().clone());
        reporter.map_or(true, |reporter| reporter.flush(timeout))
    }
}

fn install(instrumentor: &dyn Instrumentor) -> Result<(), InjectorError> {
    panic::catch_unwind(AssertUnwindSafe(|| instrumentor.install())).unwrap_or_else(|_| {
        Err(InjectorError::Install {
            key: instrumentor.key().to_string(),
            reason: "install panicked".to_string(),
        })
    })
}
