//! Service options.

use serde::{Deserialize, Serialize};

use crate::scheduler::{OverflowPolicy, SchedulerOptions};

/// Reply to access requests for resources whose handler has no access function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessFallback {
    /// Send no reply and let the gateway apply its default.
    #[default]
    PassThrough,
    /// Deny access.
    Deny,
    /// Grant get and every call method.
    Grant,
}

/// Runtime options of a [`Service`](crate::Service).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Queue group for the request subscriptions, for load balancing between
    /// instances of the same service.
    pub queue_group: Option<String>,
    /// Group lane backpressure.
    pub scheduler: SchedulerOptions,
    /// Access reply for handlers without an access function.
    pub access_fallback: AccessFallback,
    /// Resource patterns announced in the reset event. Defaults to
    /// `<service>.>`.
    pub owned_resources: Option<Vec<String>>,
    /// Access patterns announced in the reset event. Defaults to `<service>.>`.
    pub owned_access: Option<Vec<String>>,
    /// Skip the reset event when serving starts.
    pub no_reset_on_serve: bool,
}

impl ServiceOptions {
    /// Creates default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the queue group.
    pub fn queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    /// Limits the number of groups executing concurrently.
    pub fn worker_limit(mut self, limit: usize) -> Self {
        self.scheduler.worker_limit = Some(limit);
        self
    }

    /// Limits the number of pending tasks per group.
    pub fn max_queue_depth(mut self, depth: usize, overflow: OverflowPolicy) -> Self {
        self.scheduler.max_queue_depth = Some(depth);
        self.scheduler.overflow = overflow;
        self
    }

    /// Sets the access fallback.
    pub fn access_fallback(mut self, fallback: AccessFallback) -> Self {
        self.access_fallback = fallback;
        self
    }

    /// Sets the owned resource and access patterns announced on reset.
    pub fn owned(mut self, resources: Vec<String>, access: Vec<String>) -> Self {
        self.owned_resources = Some(resources);
        self.owned_access = Some(access);
        self
    }

    /// Disables the reset event on serve.
    pub fn without_reset(mut self) -> Self {
        self.no_reset_on_serve = true;
        self
    }
}
