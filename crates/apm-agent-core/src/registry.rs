// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Injector registry: which frameworks can be instrumented, and how.
//!
//! Framework shims register a key with a presence predicate and a factory at
//! load time. When the agent starts it asks the registry to resolve the keys
//! enabled in its configuration. A fault in one entry (a panicking predicate,
//! a panicking or failing factory) is logged and recorded against its key and
//! never prevents the other keys from resolving.

use crate::agent::Tracer;
use crate::error::InjectorError;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::{debug, warn};

/// An installable instrumentation of one framework.
pub trait Instrumentor: Send + Sync {
    fn key(&self) -> &str;

    /// Hooks into the framework.
    fn install(&self) -> Result<(), InjectorError>;

    /// Removes the hooks. Must be safe to call more than once.
    fn uninstall(&self);
}

pub type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;
pub type Factory =
    Arc<dyn Fn(&Tracer) -> Result<Box<dyn Instrumentor>, InjectorError> + Send + Sync>;

/// Outcome of resolving one requested key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectorStatus {
    Resolved,
    /// Registered, but the framework is not loaded.
    NotPresent,
    /// Nothing registered under the key.
    Unknown,
    Failed(String),
}

impl InjectorStatus {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self, InjectorStatus::Resolved)
    }
}

#[derive(Clone)]
struct Entry {
    predicate: Predicate,
    factory: Factory,
}

#[derive(Default)]
pub struct InjectorRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
    statuses: RwLock<BTreeMap<String, InjectorStatus>>,
}

impl std::fmt::Debug for InjectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectorRegistry")
            .field("keys", &self.keys())
            .field("statuses", &self.statuses())
            .finish()
    }
}

impl InjectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry framework shims register into.
    pub fn global() -> &'static Arc<InjectorRegistry> {
        static GLOBAL: OnceLock<Arc<InjectorRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(InjectorRegistry::new()))
    }

    /// Registers `key`. A previous registration under the same key is replaced.
    pub fn register<P, F>(&self, key: impl Into<String>, predicate: P, factory: F)
    where
        P: Fn() -> bool + Send + Sync + 'static,
        F: Fn(&Tracer) -> Result<Box<dyn Instrumentor>, InjectorError> + Send + Sync + 'static,
    {
        let key = key.into();
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.clone(),
                Entry {
                    predicate: Arc::new(predicate),
                    factory: Arc::new(factory),
                },
            );
        if previous.is_some() {
            debug!("APM | Replaced injector registration for {key}");
        }
    }

    #[must_use]
    pub fn is_registered(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Builds an instrumentor for every requested key that is registered and
    /// whose framework is present. The status of each requested key replaces
    /// whatever the previous resolution recorded.
    pub fn resolve<'a, I>(&self, requested: I, tracer: &Tracer) -> Vec<Box<dyn Instrumentor>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut statuses = BTreeMap::new();
        let mut resolved = Vec::new();

        for key in requested {
            let entry = self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned();

            let status = match entry {
                None => {
                    debug!("APM | No injector registered for {key}");
                    InjectorStatus::Unknown
                }
                Some(entry) => match Self::build(key, &entry, tracer) {
                    Ok(Some(instrumentor)) => {
                        resolved.push(instrumentor);
                        InjectorStatus::Resolved
                    }
                    Ok(None) => {
                        debug!("APM | Framework {key} is not present, skipping");
                        InjectorStatus::NotPresent
                    }
                    Err(e) => {
                        warn!("APM | {e}");
                        InjectorStatus::Failed(e.to_string())
                    }
                },
            };
            statuses.insert(key.to_string(), status);
        }

        *self.statuses.write().unwrap_or_else(PoisonError::into_inner) = statuses;
        resolved
    }

    fn build(
        key: &str,
        entry: &Entry,
        tracer: &Tracer,
    ) -> Result<Option<Box<dyn Instrumentor>>, InjectorError> {
        let present = panic::catch_unwind(AssertUnwindSafe(|| (entry.predicate)())).map_err(
            |_| InjectorError::Factory {
                key: key.to_string(),
                reason: "presence check panicked".to_string(),
            },
        )?;
        if !present {
            return Ok(None);
        }

        panic::catch_unwind(AssertUnwindSafe(|| (entry.factory)(tracer)))
            .map_err(|_| InjectorError::Factory {
                key: key.to_string(),
                reason: "factory panicked".to_string(),
            })?
            .map(Some)
    }

    /// Marks a resolved key as failed, after its install step failed.
    pub(crate) fn record_failure(&self, key: &str, error: &InjectorError) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), InjectorStatus::Failed(error.to_string()));
    }

    /// Per requested key, whether it is installed after the last resolution.
    #[must_use]
    pub fn installed(&self) -> BTreeMap<String, bool> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, status)| (key.clone(), status.is_resolved()))
            .collect()
    }

    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, InjectorStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
