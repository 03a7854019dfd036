// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic host job framework shim.
//!
//! A [`JobFramework`] stands for one job processing library in the host: it
//! knows whether the library is loaded, owns the middleware chain every job is
//! dispatched through, and publishes the processors' lifecycle events. It
//! registers itself in an [`InjectorRegistry`] so that enabling its key
//! installs a [`JobMiddleware`] into its chain.

use crate::agent::Tracer;
use crate::config::AgentConfig;
use crate::error::InjectorError;
use crate::job::JobDescriptor;
use crate::middleware::{JobHooks, JobMiddleware, MiddlewareChain};
use crate::registry::{InjectorRegistry, Instrumentor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

/// Lifecycle of the framework's job processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Processors started fetching jobs.
    Startup,
    /// Processors stopped fetching new jobs.
    Quiet,
    Shutdown,
}

type Listener = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

struct FrameworkInner {
    key: String,
    tag: String,
    loaded: AtomicBool,
    chain: MiddlewareChain,
    listeners: RwLock<Vec<Listener>>,
}

#[derive(Clone)]
pub struct JobFramework {
    inner: Arc<FrameworkInner>,
}

impl std::fmt::Debug for JobFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFramework")
            .field("key", &self.inner.key)
            .field("tag", &self.inner.tag)
            .field("loaded", &self.is_loaded())
            .field("chain", &self.inner.chain)
            .finish_non_exhaustive()
    }
}

impl JobFramework {
    /// `key` names the framework in `enabled_injectors`; `tag` is the
    /// transaction type its jobs are reported with.
    pub fn new(key: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FrameworkInner {
                key: key.into(),
                tag: tag.into(),
                loaded: AtomicBool::new(false),
                chain: MiddlewareChain::new(),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.inner.loaded.store(loaded, Ordering::Release);
    }

    #[must_use]
    pub fn chain(&self) -> &MiddlewareChain {
        &self.inner.chain
    }

    /// Runs one job through the framework's middleware chain.
    pub fn perform<T, E, F>(&self, job: &JobDescriptor, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::fmt::Display + 'static,
    {
        self.inner.chain.invoke(job, body)
    }

    /// Registers this framework under its key: present while loaded, and
    /// instrumented by a [`JobInstrumentor`] over its chain.
    pub fn register_injector(&self, registry: &InjectorRegistry) {
        let presence = self.clone();
        let framework = self.clone();
        registry.register(
            self.key(),
            move || presence.is_loaded(),
            move |tracer| {
                Ok(Box::new(JobInstrumentor::new(framework.clone(), tracer.clone()))
                    as Box<dyn Instrumentor>)
            },
        );
    }

    pub fn on_lifecycle<F>(&self, listener: F)
    where
        F: Fn(LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Publishes a lifecycle event to every listener, in registration order.
    pub fn emit(&self, event: LifecycleEvent) {
        debug!("APM | {} lifecycle event {event:?}", self.inner.key);
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event);
        }
    }

    /// Starts the process-wide agent when the processors start, and stops it
    /// when they go quiet or shut down.
    pub fn start_agent_with_lifecycle(&self, config: AgentConfig) {
        let key = self.inner.key.clone();
        self.on_lifecycle(move |event| match event {
            LifecycleEvent::Startup => {
                if let Err(e) = crate::start(config.clone()) {
                    error!("APM | Failed to start agent on {key} startup: {e}");
                }
            }
            LifecycleEvent::Quiet | LifecycleEvent::Shutdown => crate::stop(),
        });
    }
}

/// Installs a [`JobMiddleware`] into a framework's chain.
pub struct JobInstrumentor {
    framework: JobFramework,
    middleware: JobMiddleware,
    /// The chain entry this instrumentor adds and removes.
    hooks: Arc<dyn JobHooks>,
}

impl std::fmt::Debug for JobInstrumentor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobInstrumentor")
            .field("framework", &self.framework)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

impl JobInstrumentor {
    #[must_use]
    pub fn new(framework: JobFramework, tracer: Tracer) -> Self {
        let middleware = JobMiddleware::new(framework.tag(), tracer);
        let hooks: Arc<dyn JobHooks> = Arc::new(middleware.clone());
        Self {
            framework,
            middleware,
            hooks,
        }
    }

    #[must_use]
    pub fn middleware(&self) -> &JobMiddleware {
        &self.middleware
    }
}

impl Instrumentor for JobInstrumentor {
    fn key(&self) -> &str {
        self.framework.key()
    }

    fn install(&self) -> Result<(), InjectorError> {
        if !self.middleware.is_active() {
            return Err(InjectorError::Install {
                key: self.key().to_string(),
                reason: "middleware was already uninstalled".to_string(),
            });
        }
        self.framework
            .chain()
            .add(self.key(), Arc::clone(&self.hooks));
        Ok(())
    }

    fn uninstall(&self) {
        self.middleware.deactivate();
        self.framework
            .chain()
            .remove_installed(self.key(), &self.hooks);
    }
}
