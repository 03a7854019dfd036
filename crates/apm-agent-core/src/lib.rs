// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # APM agent core
//!
//! Tracing core of an APM agent embedded in a process that runs background job
//! workers. Every job execution becomes one transaction; failures escaping the
//! job are captured and re-raised; finished transactions are shipped to a
//! collector from a background thread so worker threads never wait on the
//! network.
//!
//! ## Architecture
//!
//! - [`registry`]: which frameworks can be instrumented, resolved at start
//! - [`middleware`]: hooks wrapping job execution, and the middleware that
//!   turns a job into a transaction
//! - [`framework`]: generic host job framework shim
//! - [`context`]: per-thread current transaction
//! - [`reporter`]: bounded queue, batching and delivery to the collector
//! - [`agent`]: start/stop lifecycle tying the above together
//!
//! ## Usage
//!
//! ```rust,no_run
//! use apm_agent_core::{AgentConfig, JobDescriptor, JobFramework, InjectorRegistry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let jobs = JobFramework::new("jobrunner", "JobRunner");
//! jobs.set_loaded(true);
//! jobs.register_injector(InjectorRegistry::global());
//!
//! apm_agent_core::start(AgentConfig::with_enabled_injectors(["jobrunner"]))?;
//!
//! jobs.perform(&JobDescriptor::new("MyApp::HardWorker"), || {
//!     Ok::<_, std::io::Error>(())
//! })?;
//!
//! apm_agent_core::stop();
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod framework;
pub mod job;
pub mod logger;
pub mod middleware;
pub mod registry;
pub mod reporter;
pub mod transaction;

pub use agent::{Agent, AgentStatus, Tracer};
pub use config::{AgentConfig, DropPolicy, RetryStrategy};
pub use context::TransactionContext;
pub use error::{AgentError, ContextError, InjectorError};
pub use framework::{JobFramework, JobInstrumentor, LifecycleEvent};
pub use job::JobDescriptor;
pub use middleware::{JobHooks, JobMiddleware, MiddlewareChain};
pub use registry::{InjectorRegistry, InjectorStatus, Instrumentor};
pub use reporter::transport::{HttpTransport, ShippingError, Transport};
pub use reporter::{Reporter, ReporterStats, SubmitOutcome};
pub use transaction::{
    ErrorRecord, FinishedTransaction, Transaction, TransactionId, TransactionResult,
};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static AGENT: Mutex<Option<Agent>> = Mutex::new(None);

fn global_agent() -> MutexGuard<'static, Option<Agent>> {
    AGENT.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Starts the process-wide agent over the global [`InjectorRegistry`],
/// shipping to the configured collector over HTTP.
///
/// Returns the running agent if one is already started.
pub fn start(config: AgentConfig) -> Result<Agent, AgentError> {
    start_agent(config, None)
}

/// Like [`start`], shipping through `transport` instead of HTTP.
pub fn start_with_transport(
    config: AgentConfig,
    transport: Arc<dyn Transport>,
) -> Result<Agent, AgentError> {
    start_agent(config, Some(transport))
}

fn start_agent(
    config: AgentConfig,
    transport: Option<Arc<dyn Transport>>,
) -> Result<Agent, AgentError> {
    let mut slot = global_agent();
    if let Some(agent) = slot.as_ref().filter(|agent| agent.is_running()) {
        return Ok(agent.clone());
    }

    if logger::init(&config.log_level) {
        tracing::debug!("APM | Logging initialized at {}", config.log_level);
    }

    let registry = Arc::clone(InjectorRegistry::global());
    let agent = match transport {
        Some(transport) => Agent::with_transport(registry, transport),
        None => Agent::new(registry),
    };
    agent.start(config)?;
    *slot = Some(agent.clone());
    Ok(agent)
}

/// Stops the process-wide agent. A no-op when none is running.
pub fn stop() {
    let agent = global_agent().take();
    if let Some(agent) = agent {
        agent.stop();
    }
}

/// The process-wide agent, if started.
#[must_use]
pub fn agent() -> Option<Agent> {
    global_agent().clone()
}

/// The calling thread's current transaction under the process-wide agent.
///
/// Lock-free; `None` when no agent is running or no job is being traced on
/// this thread.
#[must_use]
pub fn current_transaction() -> Option<Transaction> {
    context::current_transaction()
}
