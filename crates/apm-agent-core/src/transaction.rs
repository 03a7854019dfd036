// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction and error records.
//!
//! A [`Transaction`] is one timed execution of a job. It is mutable only while it
//! is live; ending it consumes the value and yields a [`FinishedTransaction`],
//! which is what the reporter accepts. The reporter therefore never sees a
//! transaction that a worker thread can still modify.
//!
//! ```text
//!   before hook            after / on_error hook          reporter
//!   Transaction::new() ──> finish(result) ──────────────> FinishedTransaction
//!        (worker slot)         (consumes)                  (sole owner)
//! ```

use serde::Serialize;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque unique identifier of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of a finished transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionResult {
    Success,
    Failure,
}

impl TransactionResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionResult::Success => "success",
            TransactionResult::Failure => "failure",
        }
    }
}

/// A live transaction, owned by the worker thread that runs the job.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    name: String,
    kind: String,
    started_at: Instant,
    timestamp_us: u64,
    errors: Vec<ErrorRecord>,
}

impl Transaction {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: TransactionId::new(),
            name: name.into(),
            kind: kind.into(),
            started_at: Instant::now(),
            timestamp_us: unix_micros(),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Framework tag, reported as `type`.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    #[must_use]
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    #[must_use]
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Attaches an error, pointing its back reference at this transaction.
    pub fn add_error(&mut self, mut error: ErrorRecord) {
        error.transaction_id = Some(self.id);
        self.errors.push(error);
    }

    #[must_use]
    pub fn finish(self, result: TransactionResult) -> FinishedTransaction {
        FinishedTransaction {
            ended_at: Instant::now(),
            result,
            inner: self,
        }
    }

    #[must_use]
    pub fn succeed(self) -> FinishedTransaction {
        self.finish(TransactionResult::Success)
    }

    #[must_use]
    pub fn fail(mut self, error: ErrorRecord) -> FinishedTransaction {
        self.add_error(error);
        self.finish(TransactionResult::Failure)
    }
}

/// An ended, immutable transaction ready to be reported.
#[derive(Debug, Clone)]
pub struct FinishedTransaction {
    inner: Transaction,
    ended_at: Instant,
    result: TransactionResult,
}

impl FinishedTransaction {
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    #[must_use]
    pub fn result(&self) -> TransactionResult {
        self.result
    }

    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    #[must_use]
    pub fn ended_at(&self) -> Instant {
        self.ended_at
    }

    #[must_use]
    pub fn timestamp_us(&self) -> u64 {
        self.inner.timestamp_us
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_duration_since(self.inner.started_at)
    }

    #[must_use]
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.inner.errors
    }
}

/// A failure captured from a job body.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    id: Uuid,
    exception_type: String,
    message: String,
    frames: Vec<String>,
    /// Captured on the worker thread, symbolized only when rendered.
    captured: Option<Arc<Backtrace>>,
    transaction_id: Option<TransactionId>,
    timestamp_us: u64,
}

impl ErrorRecord {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            exception_type: exception_type.into(),
            message: message.into(),
            frames: Vec::new(),
            captured: None,
            transaction_id: None,
            timestamp_us: unix_micros(),
        }
    }

    /// Builds a record from an error value.
    ///
    /// The type is the error's short type name (see [`short_type_name`]), and
    /// the message is its `Display` followed by its `source()` chain.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self::new(
            short_type_name(std::any::type_name::<E>()),
            with_sources(error.to_string(), error.source()),
        )
    }

    /// Builds a record from whatever error type a job returns.
    ///
    /// Boxed `dyn Error` values keep their `source()` chain. Other types are
    /// rendered with the alternate `Display` form, which error-report types
    /// use to print their whole chain.
    pub fn from_job_error<E>(error: &E) -> Self
    where
        E: fmt::Display + 'static,
    {
        let exception_type = short_type_name(std::any::type_name::<E>());
        let any: &dyn Any = error;
        let boxed: Option<&(dyn std::error::Error + 'static)> =
            if let Some(e) = any.downcast_ref::<Box<dyn std::error::Error + Send + Sync>>() {
                Some(&**e)
            } else if let Some(e) = any.downcast_ref::<Box<dyn std::error::Error + Send>>() {
                Some(&**e)
            } else if let Some(e) = any.downcast_ref::<Box<dyn std::error::Error>>() {
                Some(&**e)
            } else {
                None
            };

        match boxed {
            Some(e) => Self::new(exception_type, with_sources(e.to_string(), e.source())),
            None => Self::new(exception_type, format!("{error:#}")),
        }
    }

    /// Builds a record from a panic payload caught while unwinding.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self::new("panic", message)
    }

    /// Sets already rendered frames, replacing any captured backtrace.
    #[must_use]
    pub fn with_backtrace(mut self, frames: Vec<String>) -> Self {
        self.frames = frames;
        self.captured = None;
        self
    }

    /// Attaches a captured backtrace. Ignored when the platform captured no
    /// frames.
    #[must_use]
    pub fn with_captured_backtrace(mut self, backtrace: Backtrace) -> Self {
        if backtrace.status() == BacktraceStatus::Captured {
            self.frames.clear();
            self.captured = Some(Arc::new(backtrace));
        }
        self
    }

    #[must_use]
    pub fn has_backtrace(&self) -> bool {
        !self.frames.is_empty() || self.captured.is_some()
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn exception_type(&self) -> &str {
        &self.exception_type
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Backtrace frames, innermost first.
    ///
    /// A captured backtrace is symbolized here, so call this off the worker
    /// threads. Frames of the agent itself and of the panic machinery are left
    /// out.
    #[must_use]
    pub fn backtrace(&self) -> Vec<String> {
        match &self.captured {
            Some(backtrace) => render_frames(&backtrace.to_string()),
            None => self.frames.clone(),
        }
    }

    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }

    #[must_use]
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }
}

fn with_sources(
    mut message: String,
    mut source: Option<&(dyn std::error::Error + 'static)>,
) -> String {
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Frames naming this crate are the agent's own.
const AGENT_FRAME: &str = "apm_agent_core::";

/// Symbol prefixes of frames that belong to the unwinding machinery rather
/// than to the failing job.
const HIDDEN_FRAME_PREFIXES: &[&str] = &[
    "std::backtrace",
    "std::panicking::",
    "std::panic::",
    "core::panicking::",
    "core::panic::",
    "<alloc::boxed::Box<F,A> as core::ops::function::Fn",
    "rust_begin_unwind",
    "__rust_",
];

/// Turns `Backtrace`'s `Display` output into one line per frame, as
/// `function at file:line`, dropping hidden frames.
fn render_frames(display: &str) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();
    let mut hidden = false;
    for line in display.lines().map(str::trim) {
        if let Some(location) = line.strip_prefix("at ") {
            if !hidden {
                if let Some(frame) = frames.last_mut() {
                    frame.push_str(" at ");
                    frame.push_str(location);
                }
            }
            continue;
        }
        let Some((index, symbol)) = line.split_once(": ") else {
            continue;
        };
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        hidden = symbol.contains(AGENT_FRAME)
            || HIDDEN_FRAME_PREFIXES
                .iter()
                .any(|prefix| symbol.starts_with(prefix));
        if !hidden {
            frames.push(symbol.to_string());
        }
    }
    frames
}

/// Strips module paths from every path in a type name, keeping the parent
/// module of a bare `Error` so that `std::io::Error` and `core::fmt::Error`
/// stay distinguishable.
///
/// `alloc::boxed::Box<my_app::ZeroDivisionError>` becomes
/// `Box<ZeroDivisionError>`, `std::io::Error` becomes `io::Error`.
pub(crate) fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut path = String::new();
    for c in full.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            path.push(c);
        } else {
            push_short_path(&mut out, &path);
            path.clear();
            out.push(c);
        }
    }
    push_short_path(&mut out, &path);
    out
}

fn push_short_path(out: &mut String, path: &str) {
    let mut segments = path.rsplit("::");
    let Some(last) = segments.next() else {
        return;
    };
    if last == "Error" {
        if let Some(parent) = segments.next() {
            out.push_str(parent);
            out.push_str("::");
        }
    }
    out.push_str(last);
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
