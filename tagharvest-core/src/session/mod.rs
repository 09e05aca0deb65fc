//! Boundary to the telemetry protocol stack.
//!
//! The harvester never talks to the wire directly. It drives a
//! [`SubscriptionSession`], which owns exactly one live session/subscription
//! pair per connection lifetime and pushes every value change into the
//! [`NotificationSink`] it was handed at connect time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{HarvestError, Result};
use crate::harvest::sink::NotificationSink;
use crate::types::{MonitoredHandle, StatusCode, TagId};

#[cfg(feature = "opcua")]
pub mod opcua;
#[cfg(feature = "simulator")]
pub mod simulated;

/// A tag the session could not turn into a monitored item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedTag {
    pub tag: TagId,
    pub reason: StatusCode,
}

/// Outcome of [`SubscriptionSession::create_monitored`]. Creation is
/// best-effort: one bad tag never fails the batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MonitoredBatch {
    pub accepted: Vec<(TagId, MonitoredHandle)>,
    pub rejected: Vec<RejectedTag>,
}

impl MonitoredBatch {
    pub fn handles(&self) -> Vec<MonitoredHandle> {
        self.accepted.iter().map(|(_, handle)| *handle).collect()
    }
}

/// Contract between the scheduler and one server connection.
///
/// Implementations must make `subscribe`/`unsubscribe` idempotent and
/// tolerate handles that were already removed. After `teardown` the adapter
/// holds no session; the next `connect` builds a fresh session and
/// subscription and starts a new handle space.
#[async_trait]
pub trait SubscriptionSession: Send + Sync {
    /// Establish the session and its subscription. Every value change on the
    /// subscription is pushed into `notifications`.
    async fn connect(&self, notifications: Arc<NotificationSink>) -> Result<()>;

    /// Whether the current session is alive.
    fn is_connected(&self) -> bool;

    /// Mint handles for `tags`. Unresolvable tags are reported in
    /// [`MonitoredBatch::rejected`].
    async fn create_monitored(&self, tags: &[TagId]) -> Result<MonitoredBatch>;

    /// Add handles to the subscription so the server starts publishing.
    async fn subscribe(&self, handles: &[MonitoredHandle]) -> Result<()>;

    /// Remove handles from the subscription.
    async fn unsubscribe(&self, handles: &[MonitoredHandle]) -> Result<()>;

    /// Ask the server whether `tag` names an existing node. `Ok(false)` is
    /// only returned when the server positively reports the id as unknown or
    /// invalid.
    async fn verify_exists(&self, tag: &TagId) -> Result<bool>;

    /// Drop the subscription and close the session. Safe to call repeatedly.
    async fn teardown(&self) -> Result<()>;
}

/// Bound a protocol call by the configured operation timeout.
pub async fn bounded<T, F>(timeout: Duration, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(HarvestError::Timeout(format!(
            "{operation} exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}
