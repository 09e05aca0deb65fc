//! In-memory telemetry server.
//!
//! Backs the integration tests and the service's `--simulate` mode. Each tag
//! carries a scripted behaviour; the server publishes a tag's current reading
//! as soon as it is subscribed, the way real servers deliver initial data,
//! and further updates only when the caller asks for them.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use super::{MonitoredBatch, RejectedTag, SubscriptionSession};
use crate::error::{HarvestError, Result};
use crate::harvest::sink::NotificationSink;
use crate::types::{DataValue, MonitoredHandle, PendingNotification, StatusCode, TagId};

/// What the server reports for a tag while it is subscribed.
#[derive(Clone, Debug, PartialEq)]
pub enum Reading {
    Good(DataValue),
    Bad(StatusCode),
    /// Subscribed but never publishes.
    Silent,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedTag {
    pub reading: Reading,
    /// Answer to `verify_exists`.
    pub exists: bool,
    /// Reject at handle creation with this status.
    pub reject_with: Option<StatusCode>,
}

impl SimulatedTag {
    pub fn good(value: impl Into<DataValue>) -> Self {
        Self {
            reading: Reading::Good(value.into()),
            exists: true,
            reject_with: None,
        }
    }

    pub fn bad(status: StatusCode) -> Self {
        Self {
            reading: Reading::Bad(status),
            exists: true,
            reject_with: None,
        }
    }

    pub fn silent() -> Self {
        Self {
            reading: Reading::Silent,
            exists: true,
            reject_with: None,
        }
    }

    pub fn rejected(status: StatusCode) -> Self {
        Self {
            reading: Reading::Silent,
            exists: false,
            reject_with: Some(status),
        }
    }

    /// Mark the tag as unknown to the server's address space.
    pub fn unknown(mut self) -> Self {
        self.exists = false;
        self
    }
}

struct LiveSession {
    sink: Arc<NotificationSink>,
    handles: HashMap<MonitoredHandle, TagId>,
    subscribed: BTreeSet<MonitoredHandle>,
    next_handle: u32,
}

impl LiveSession {
    fn new(sink: Arc<NotificationSink>) -> Self {
        Self {
            sink,
            handles: HashMap::new(),
            subscribed: BTreeSet::new(),
            next_handle: 1,
        }
    }
}

#[derive(Default)]
struct ServerState {
    session: Option<LiveSession>,
    connects: u32,
    subscribe_calls: u32,
    unsubscribe_calls: u32,
    peak_subscribed: usize,
    failing_subscribes: u32,
    failing_unsubscribes: u32,
}

/// Scripted server shared between a test and the sessions it hands out.
pub struct SimulatedServer {
    tags: RwLock<HashMap<TagId, SimulatedTag>>,
    online: AtomicBool,
    state: Mutex<ServerState>,
}

impl fmt::Debug for SimulatedServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedServer")
            .field("tags", &self.tags.read().len())
            .field("online", &self.online.load(Ordering::SeqCst))
            .field("connected", &state.session.is_some())
            .field("connects", &state.connects)
            .field("peak_subscribed", &state.peak_subscribed)
            .finish()
    }
}

impl Default for SimulatedServer {
    fn default() -> Self {
        Self {
            tags: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            state: Mutex::new(ServerState::default()),
        }
    }
}

impl SimulatedServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A server whose tags `tag-0000..tag-{count}` all report a good value.
    pub fn with_numbered_tags(count: usize) -> Arc<Self> {
        let server = Self::new();
        for i in 0..count {
            server.insert_tag(
                TagId::new(format!("tag-{i:04}")),
                SimulatedTag::good(DataValue::Float(i as f64 * 0.5)),
            );
        }
        server
    }

    pub fn insert_tag(&self, tag: TagId, behaviour: SimulatedTag) {
        self.tags.write().insert(tag, behaviour);
    }

    /// A session adapter bound to this server.
    pub fn session(self: &Arc<Self>) -> SimulatedSession {
        SimulatedSession {
            server: Arc::clone(self),
        }
    }

    /// Take the server off the network. The live session is lost.
    pub fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.state.lock().session = None;
    }

    /// Accept connections again. Clients still have to reconnect.
    pub fn go_online(&self) {
        self.online.store(true, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Make the next `count` subscribe calls fail with a timeout.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.state.lock().failing_subscribes = count;
    }

    /// Make the next `count` unsubscribe calls fail with a timeout.
    pub fn fail_next_unsubscribes(&self, count: u32) {
        self.state.lock().failing_unsubscribes = count;
    }

    /// Replace a tag's reading and publish it if the tag is subscribed.
    pub fn publish(&self, tag: &TagId, reading: Reading) {
        if let Some(entry) = self.tags.write().get_mut(tag) {
            entry.reading = reading;
        }
        let state = self.state.lock();
        if let Some(session) = state.session.as_ref() {
            let subscribed = session
                .subscribed
                .iter()
                .any(|handle| session.handles.get(handle) == Some(tag));
            if subscribed {
                self.emit(session, tag);
            }
        }
    }

    /// Publish the current reading of every subscribed tag again.
    pub fn republish_subscribed(&self) {
        let state = self.state.lock();
        if let Some(session) = state.session.as_ref() {
            for handle in &session.subscribed {
                if let Some(tag) = session.handles.get(handle) {
                    self.emit(session, tag);
                }
            }
        }
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.state.lock().subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> u32 {
        self.state.lock().unsubscribe_calls
    }

    pub fn subscribed_count(&self) -> usize {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|session| session.subscribed.len())
            .unwrap_or(0)
    }

    /// Highest number of simultaneously subscribed tags seen so far.
    pub fn peak_subscribed(&self) -> usize {
        self.state.lock().peak_subscribed
    }

    pub fn subscribed_tags(&self) -> Vec<TagId> {
        let state = self.state.lock();
        let Some(session) = state.session.as_ref() else {
            return Vec::new();
        };
        session
            .subscribed
            .iter()
            .filter_map(|handle| session.handles.get(handle).cloned())
            .collect()
    }

    fn emit(&self, session: &LiveSession, tag: &TagId) {
        let tags = self.tags.read();
        let Some(behaviour) = tags.get(tag) else {
            return;
        };
        let notification = match &behaviour.reading {
            Reading::Good(value) => {
                PendingNotification::new(tag.clone(), value.clone(), StatusCode::GOOD, Utc::now())
            }
            Reading::Bad(status) => {
                PendingNotification::new(tag.clone(), DataValue::Null, *status, Utc::now())
            }
            Reading::Silent => return,
        };
        session.sink.push(notification);
    }
}

/// [`SubscriptionSession`] over a [`SimulatedServer`].
#[derive(Debug, Clone)]
pub struct SimulatedSession {
    server: Arc<SimulatedServer>,
}

impl SimulatedSession {
    pub fn server(&self) -> &Arc<SimulatedServer> {
        &self.server
    }
}

#[async_trait]
impl SubscriptionSession for SimulatedSession {
    async fn connect(&self, notifications: Arc<NotificationSink>) -> Result<()> {
        if !self.server.is_online() {
            return Err(HarvestError::Session("server unreachable".into()));
        }
        let mut state = self.server.state.lock();
        state.session = Some(LiveSession::new(notifications));
        state.connects += 1;
        tracing::debug!(
            target: "harvest::session",
            connects = state.connects,
            "simulated session established"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.server.is_online() && self.server.state.lock().session.is_some()
    }

    async fn create_monitored(&self, tags: &[TagId]) -> Result<MonitoredBatch> {
        let mut state = self.server.state.lock();
        let known = self.server.tags.read();
        let session = state.session.as_mut().ok_or(HarvestError::NotConnected)?;

        let mut batch = MonitoredBatch::default();
        for tag in tags {
            if let Some(reason) = known.get(tag).and_then(|t| t.reject_with) {
                batch.rejected.push(RejectedTag {
                    tag: tag.clone(),
                    reason,
                });
                continue;
            }
            let handle = MonitoredHandle(session.next_handle);
            session.next_handle += 1;
            session.handles.insert(handle, tag.clone());
            batch.accepted.push((tag.clone(), handle));
        }
        Ok(batch)
    }

    async fn subscribe(&self, handles: &[MonitoredHandle]) -> Result<()> {
        let mut newly_subscribed = Vec::new();
        {
            let mut state = self.server.state.lock();
            state.subscribe_calls += 1;
            if state.failing_subscribes > 0 {
                state.failing_subscribes -= 1;
                return Err(HarvestError::Timeout("subscribe".into()));
            }
            let session = state.session.as_mut().ok_or(HarvestError::NotConnected)?;
            for handle in handles {
                if session.handles.contains_key(handle) && session.subscribed.insert(*handle) {
                    newly_subscribed.push(*handle);
                }
            }
            let current = session.subscribed.len();
            state.peak_subscribed = state.peak_subscribed.max(current);
        }

        let state = self.server.state.lock();
        if let Some(session) = state.session.as_ref() {
            for handle in newly_subscribed {
                if let Some(tag) = session.handles.get(&handle) {
                    self.server.emit(session, tag);
                }
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, handles: &[MonitoredHandle]) -> Result<()> {
        let mut state = self.server.state.lock();
        state.unsubscribe_calls += 1;
        if state.failing_unsubscribes > 0 {
            state.failing_unsubscribes -= 1;
            return Err(HarvestError::Timeout("unsubscribe".into()));
        }
        let session = state.session.as_mut().ok_or(HarvestError::NotConnected)?;
        for handle in handles {
            session.subscribed.remove(handle);
            session.handles.remove(handle);
        }
        Ok(())
    }

    async fn verify_exists(&self, tag: &TagId) -> Result<bool> {
        if !self.is_connected() {
            return Err(HarvestError::NotConnected);
        }
        Ok(self
            .server
            .tags
            .read()
            .get(tag)
            .map(|behaviour| behaviour.exists)
            .unwrap_or(false))
    }

    async fn teardown(&self) -> Result<()> {
        if self.server.state.lock().session.take().is_some() {
            tracing::debug!(target: "harvest::session", "simulated session closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_publishes_initial_values() {
        let server = SimulatedServer::new();
        server.insert_tag("A".into(), SimulatedTag::good(1.5));
        server.insert_tag("B".into(), SimulatedTag::bad(StatusCode::BAD_WAITING_FOR_INITIAL_DATA));
        server.insert_tag("C".into(), SimulatedTag::silent());

        let sink = Arc::new(NotificationSink::new());
        let session = server.session();
        session.connect(Arc::clone(&sink)).await.expect("connect");

        let batch = session
            .create_monitored(&["A".into(), "B".into(), "C".into()])
            .await
            .expect("create");
        assert!(batch.rejected.is_empty());
        session.subscribe(&batch.handles()).await.expect("subscribe");

        let mut drained = sink.drain();
        drained.sort_by(|a, b| a.tag.cmp(&b.tag));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].value, DataValue::Float(1.5));
        assert!(drained[1].status.is_bad());
        assert_eq!(server.peak_subscribed(), 3);
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_are_idempotent() {
        let server = SimulatedServer::with_numbered_tags(2);
        let sink = Arc::new(NotificationSink::new());
        let session = server.session();
        session.connect(Arc::clone(&sink)).await.expect("connect");

        let batch = session
            .create_monitored(&["tag-0000".into(), "tag-0001".into()])
            .await
            .expect("create");
        let handles = batch.handles();
        session.subscribe(&handles).await.expect("subscribe");
        session.subscribe(&handles).await.expect("subscribe again");
        assert_eq!(server.subscribed_count(), 2);

        session.unsubscribe(&handles).await.expect("unsubscribe");
        session.unsubscribe(&handles).await.expect("unsubscribe again");
        assert_eq!(server.subscribed_count(), 0);
    }

    #[tokio::test]
    async fn rejected_tags_do_not_fail_the_batch() {
        let server = SimulatedServer::new();
        server.insert_tag("ok".into(), SimulatedTag::good(true));
        server.insert_tag("bad-id".into(), SimulatedTag::rejected(StatusCode::BAD_NODE_ID_INVALID));

        let session = server.session();
        session
            .connect(Arc::new(NotificationSink::new()))
            .await
            .expect("connect");
        let batch = session
            .create_monitored(&["ok".into(), "bad-id".into()])
            .await
            .expect("create");
        assert_eq!(batch.accepted.len(), 1);
        assert_eq!(
            batch.rejected,
            vec![RejectedTag {
                tag: "bad-id".into(),
                reason: StatusCode::BAD_NODE_ID_INVALID,
            }]
        );
    }

    #[tokio::test]
    async fn going_offline_drops_the_session() {
        let server = SimulatedServer::with_numbered_tags(1);
        let session = server.session();
        session
            .connect(Arc::new(NotificationSink::new()))
            .await
            .expect("connect");
        assert!(session.is_connected());

        server.go_offline();
        assert!(!session.is_connected());
        assert!(session.connect(Arc::new(NotificationSink::new())).await.is_err());
        assert!(matches!(
            session.verify_exists(&"tag-0000".into()).await,
            Err(HarvestError::NotConnected)
        ));

        server.go_online();
        session
            .connect(Arc::new(NotificationSink::new()))
            .await
            .expect("reconnect");
        assert_eq!(server.connect_count(), 2);
        assert!(session.verify_exists(&"tag-0000".into()).await.expect("verify"));
        assert!(!session.verify_exists(&"nope".into()).await.expect("verify"));
    }
}
