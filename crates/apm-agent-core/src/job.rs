// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Identity of a job as handed over by the host framework.
///
/// Frameworks that wrap another framework's jobs (an adapter class running the
/// real job) report the adapter as `class_name` and the real job as `wrapped`;
/// the transaction is named after the wrapped class when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    class_name: String,
    wrapped: Option<String>,
    queue: Option<String>,
}

impl JobDescriptor {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            wrapped: None,
            queue: None,
        }
    }

    #[must_use]
    pub fn with_wrapped(mut self, wrapped: impl Into<String>) -> Self {
        self.wrapped = Some(wrapped.into());
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    #[must_use]
    pub fn wrapped(&self) -> Option<&str> {
        self.wrapped.as_deref()
    }

    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Name used for the transaction.
    #[must_use]
    pub fn transaction_name(&self) -> &str {
        self.wrapped.as_deref().unwrap_or(&self.class_name)
    }
}
