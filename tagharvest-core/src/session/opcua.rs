//! [`SubscriptionSession`] over an OPC UA server, built on `async-opcua`.
//!
//! One connect builds one client session with one subscription. Monitored
//! items are created disabled with a queue of one and switched to reporting
//! on `subscribe`, so creating a batch never floods the notification sink.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opcua::client::{ClientBuilder, DataChangeCallback, IdentityToken, MonitoredItem, Session};
use opcua::crypto::SecurityPolicy;
use opcua::types::{
    AttributeId, DataValue as UaDataValue, MessageSecurityMode, MonitoredItemCreateRequest,
    MonitoringMode, NodeId, ReadValueId, StatusCode as UaStatusCode, TimestampsToReturn,
    UserTokenPolicy, Variant,
};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{MonitoredBatch, RejectedTag, SubscriptionSession};
use crate::error::{HarvestError, Result};
use crate::harvest::config::{HarvestConfig, SessionSettings};
use crate::harvest::sink::NotificationSink;
use crate::types::{DataValue, MonitoredHandle, PendingNotification, StatusCode, TagId};

type ItemIndex = Arc<RwLock<HashMap<u32, TagId>>>;

struct Live {
    session: Arc<Session>,
    subscription_id: u32,
    event_loop: JoinHandle<UaStatusCode>,
    items: ItemIndex,
}

/// Anonymous, unsecured OPC UA client for one endpoint.
pub struct OpcUaSession {
    endpoint_url: String,
    settings: SessionSettings,
    publish_interval: Duration,
    live: Mutex<Option<Arc<Live>>>,
}

impl std::fmt::Debug for OpcUaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcUaSession")
            .field("endpoint_url", &self.endpoint_url)
            .field("session_name", &self.settings.session_name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl OpcUaSession {
    pub fn new(
        endpoint_url: impl Into<String>,
        settings: SessionSettings,
        publish_interval: Duration,
    ) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            settings,
            publish_interval,
            live: Mutex::new(None),
        }
    }

    /// Session for `config.endpoint_url`, publishing at the drain cadence.
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(
            config.endpoint_url.clone(),
            config.session.clone(),
            config.schedule.publish_interval(),
        )
    }

    fn live(&self) -> Result<Arc<Live>> {
        self.live.lock().clone().ok_or(HarvestError::NotConnected)
    }

    fn monitor_request(&self, node_id: NodeId) -> MonitoredItemCreateRequest {
        let mut request: MonitoredItemCreateRequest = node_id.into();
        request.monitoring_mode = MonitoringMode::Disabled;
        request.requested_parameters.sampling_interval = self.settings.sampling_interval_ms as f64;
        request.requested_parameters.queue_size = 1;
        request.requested_parameters.discard_oldest = true;
        request
    }
}

fn protocol_error(operation: &str, status: UaStatusCode) -> HarvestError {
    HarvestError::Session(format!("{operation}: {status}"))
}

fn status_of(status: UaStatusCode) -> StatusCode {
    StatusCode(status.bits())
}

/// Tags are OPC UA node ids in their string form, e.g. `ns=2;s=Pump.Speed`.
fn parse_node_id(tag: &TagId) -> Option<NodeId> {
    NodeId::from_str(tag.as_str()).ok()
}

fn to_data_value(variant: Variant) -> DataValue {
    match variant {
        Variant::Empty => DataValue::Null,
        Variant::Boolean(v) => DataValue::Bool(v),
        Variant::SByte(v) => DataValue::Int(v.into()),
        Variant::Int16(v) => DataValue::Int(v.into()),
        Variant::Int32(v) => DataValue::Int(v.into()),
        Variant::Int64(v) => DataValue::Int(v),
        Variant::Byte(v) => DataValue::UInt(v.into()),
        Variant::UInt16(v) => DataValue::UInt(v.into()),
        Variant::UInt32(v) => DataValue::UInt(v.into()),
        Variant::UInt64(v) => DataValue::UInt(v),
        Variant::Float(v) => DataValue::Float(v.into()),
        Variant::Double(v) => DataValue::Float(v),
        Variant::String(v) => DataValue::Text(v.value().clone().unwrap_or_default()),
        Variant::DateTime(v) => DataValue::DateTime(v.as_chrono()),
        other => DataValue::Text(format!("{other:?}")),
    }
}

fn to_notification(tag: TagId, value: UaDataValue) -> PendingNotification {
    let status = value.status.map(status_of).unwrap_or(StatusCode::GOOD);
    let timestamp = value
        .source_timestamp
        .or(value.server_timestamp)
        .map(|ts| ts.as_chrono())
        .unwrap_or_else(Utc::now);
    let data = value.value.map(to_data_value).unwrap_or(DataValue::Null);
    PendingNotification::new(tag, data, status, timestamp)
}

#[async_trait]
impl SubscriptionSession for OpcUaSession {
    async fn connect(&self, notifications: Arc<NotificationSink>) -> Result<()> {
        self.teardown().await?;

        let session_timeout = u32::try_from(self.settings.session_timeout_ms).unwrap_or(u32::MAX);
        let mut client = ClientBuilder::new()
            .application_name(self.settings.session_name.as_str())
            .application_uri(format!("urn:{}", self.settings.session_name))
            .product_uri("urn:tagharvest")
            .trust_server_certs(true)
            .create_sample_keypair(true)
            // Reconnection belongs to the supervisor; a dropped event loop is the signal.
            .session_retry_limit(0)
            .session_timeout(session_timeout)
            .client()
            .map_err(|errors| HarvestError::Config(format!("opc ua client: {}", errors.join("; "))))?;

        let (session, event_loop) = client
            .connect_to_matching_endpoint(
                (
                    self.endpoint_url.as_str(),
                    SecurityPolicy::None.to_str(),
                    MessageSecurityMode::None,
                    UserTokenPolicy::anonymous(),
                ),
                IdentityToken::Anonymous,
            )
            .await
            .map_err(|status| protocol_error("connect", status))?;
        let event_loop = event_loop.spawn();
        if !session.wait_for_connection().await {
            event_loop.abort();
            return Err(HarvestError::Session(format!(
                "connect: session to {} never activated",
                self.endpoint_url
            )));
        }

        let items = ItemIndex::default();
        let callback_items = Arc::clone(&items);
        let subscription_id = match session
            .create_subscription(
                self.publish_interval,
                self.settings.lifetime_count,
                self.settings.keep_alive_count,
                0,
                0,
                true,
                DataChangeCallback::new(move |value: UaDataValue, item: &MonitoredItem| {
                    let Some(tag) = callback_items.read().get(&item.id()).cloned() else {
                        return;
                    };
                    notifications.push(to_notification(tag, value));
                }),
            )
            .await
        {
            Ok(id) => id,
            Err(status) => {
                let _ = session.disconnect().await;
                event_loop.abort();
                return Err(protocol_error("create_subscription", status));
            }
        };

        tracing::info!(
            target: "harvest::session",
            endpoint = %self.endpoint_url,
            session = %self.settings.session_name,
            subscription = %self.settings.subscription_name,
            subscription_id,
            publish_interval_ms = self.publish_interval.as_millis() as u64,
            "opc ua session established"
        );
        *self.live.lock() = Some(Arc::new(Live {
            session,
            subscription_id,
            event_loop,
            items,
        }));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.live
            .lock()
            .as_ref()
            .is_some_and(|live| !live.event_loop.is_finished())
    }

    async fn create_monitored(&self, tags: &[TagId]) -> Result<MonitoredBatch> {
        let live = self.live()?;
        let mut batch = MonitoredBatch::default();
        let mut requested = Vec::with_capacity(tags.len());
        let mut requests = Vec::with_capacity(tags.len());
        for tag in tags {
            match parse_node_id(tag) {
                Some(node_id) => {
                    requests.push(self.monitor_request(node_id));
                    requested.push(tag.clone());
                }
                None => batch.rejected.push(RejectedTag {
                    tag: tag.clone(),
                    reason: StatusCode::BAD_NODE_ID_INVALID,
                }),
            }
        }
        if requests.is_empty() {
            return Ok(batch);
        }

        let results = live
            .session
            .create_monitored_items(live.subscription_id, TimestampsToReturn::Both, requests)
            .await
            .map_err(|status| protocol_error("create_monitored_items", status))?;

        let mut items = live.items.write();
        for (tag, result) in requested.into_iter().zip(results) {
            if result.status_code.is_good() {
                items.insert(result.monitored_item_id, tag.clone());
                batch
                    .accepted
                    .push((tag, MonitoredHandle(result.monitored_item_id)));
            } else {
                batch.rejected.push(RejectedTag {
                    tag,
                    reason: status_of(result.status_code),
                });
            }
        }
        Ok(batch)
    }

    async fn subscribe(&self, handles: &[MonitoredHandle]) -> Result<()> {
        let live = self.live()?;
        let ids: Vec<u32> = handles.iter().map(|handle| handle.0).collect();
        let results = live
            .session
            .set_monitoring_mode(live.subscription_id, MonitoringMode::Reporting, &ids)
            .await
            .map_err(|status| protocol_error("set_monitoring_mode", status))?;
        if let Some(status) = results.into_iter().find(|status| !status.is_good()) {
            return Err(protocol_error("set_monitoring_mode", status));
        }
        Ok(())
    }

    async fn unsubscribe(&self, handles: &[MonitoredHandle]) -> Result<()> {
        let live = self.live()?;
        let ids: Vec<u32> = handles.iter().map(|handle| handle.0).collect();
        let results = live
            .session
            .delete_monitored_items(live.subscription_id, &ids)
            .await
            .map_err(|status| protocol_error("delete_monitored_items", status))?;

        let mut items = live.items.write();
        for (id, status) in ids.iter().zip(results) {
            // Already gone counts as removed.
            if status.is_good() || status == UaStatusCode::BadMonitoredItemIdInvalid {
                items.remove(id);
            } else {
                return Err(protocol_error("delete_monitored_items", status));
            }
        }
        Ok(())
    }

    async fn verify_exists(&self, tag: &TagId) -> Result<bool> {
        let live = self.live()?;
        let Some(node_id) = parse_node_id(tag) else {
            return Ok(false);
        };
        let mut read: ReadValueId = node_id.into();
        read.attribute_id = AttributeId::NodeId as u32;

        let values = live
            .session
            .read(&[read], TimestampsToReturn::Neither, 0.0)
            .await
            .map_err(|status| protocol_error("read", status))?;
        let unresolvable = values
            .first()
            .and_then(|value| value.status)
            .is_some_and(|status| status_of(status).is_unresolvable());
        Ok(!unresolvable)
    }

    async fn teardown(&self) -> Result<()> {
        let Some(live) = self.live.lock().take() else {
            return Ok(());
        };
        if !live.event_loop.is_finished() {
            if let Err(status) = live.session.delete_subscription(live.subscription_id).await {
                tracing::debug!(target: "harvest::session", status = %status, "delete_subscription failed");
            }
            if let Err(status) = live.session.disconnect().await {
                tracing::debug!(target: "harvest::session", status = %status, "disconnect failed");
            }
        }
        live.event_loop.abort();
        live.items.write().clear();
        tracing::debug!(
            target: "harvest::session",
            endpoint = %self.endpoint_url,
            "opc ua session closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use opcua::types::DateTime as UaDateTime;

    use super::*;

    #[test]
    fn tags_parse_as_node_ids() {
        assert_eq!(
            parse_node_id(&TagId::from("ns=2;s=Pump.Speed")),
            Some(NodeId::new(2, "Pump.Speed"))
        );
        assert_eq!(parse_node_id(&TagId::from("i=2258")), Some(NodeId::new(0, 2258_u32)));
        assert_eq!(parse_node_id(&TagId::from("not a node id")), None);
    }

    #[test]
    fn variants_map_onto_plain_values() {
        assert_eq!(to_data_value(Variant::Empty), DataValue::Null);
        assert_eq!(to_data_value(Variant::Boolean(true)), DataValue::Bool(true));
        assert_eq!(to_data_value(Variant::Int16(-4)), DataValue::Int(-4));
        assert_eq!(to_data_value(Variant::UInt32(7)), DataValue::UInt(7));
        assert_eq!(to_data_value(Variant::Double(2.5)), DataValue::Float(2.5));
        assert_eq!(
            to_data_value(Variant::from("running")),
            DataValue::Text("running".to_string())
        );
    }

    #[test]
    fn missing_status_means_good_and_source_time_wins() {
        let source = UaDateTime::now();
        let value = UaDataValue {
            value: Some(Variant::Int32(12)),
            source_timestamp: Some(source),
            ..Default::default()
        };
        let notification = to_notification(TagId::from("ns=2;s=Level"), value);
        assert_eq!(notification.status, StatusCode::GOOD);
        assert_eq!(notification.value, DataValue::Int(12));
        assert_eq!(notification.source_timestamp, source.as_chrono());
    }

    #[test]
    fn unknown_node_status_is_unresolvable() {
        assert!(status_of(UaStatusCode::BadNodeIdUnknown).is_unresolvable());
        assert!(!status_of(UaStatusCode::BadOutOfService).is_unresolvable());
    }
}
