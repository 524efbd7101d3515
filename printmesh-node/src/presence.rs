//! Presence and discovery protocol
//!
//! Built on the connection manager's publish/subscribe primitives:
//! - announce: retained `online` record on `status/{id}` after every connect
//!   and on each heartbeat
//! - withdraw: retained `offline` record, then a graceful disconnect
//! - abrupt loss: the broker publishes the same `offline` record from the will
//! - discover: `status/+` messages are folded into the [`PeerRegistry`]
//! - inbox: `{message, sender}` messages for this node go to an optional channel
//!
//! The presence lock only guards identity and heartbeat bookkeeping. It is
//! always released before the connection or registry is called.

use crate::clock::Clock;
use crate::connection::{ConnectionManager, DriveReport, InboundMessage};
use crate::error::{NodeError, NodeResult};
use crate::identity::NodeIdentity;
use crate::manager::{rank, Manager, DEFAULT_LOCK_TIMEOUT};
use crate::registry::{PeerRegistry, PeerStatus, StatusPayload};
use crate::topics::Topics;
use crate::transport::WillMessage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Payload of an inbox topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// What one [`PresenceService::tick`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub connected_now: bool,
    pub lost: bool,
    pub announced: bool,
    pub status_updates: usize,
    pub discarded: usize,
    pub inbox_messages: usize,
}

fn online_payload(identity: &NodeIdentity) -> StatusPayload {
    StatusPayload {
        peer_id: Some(identity.id.clone()),
        display_name: Some(identity.display_name.clone()),
        firmware_version: Some(identity.firmware_version.clone()),
        chip_model: Some(identity.chip_model.clone()),
        network_address: Some(identity.network_address.clone()),
        hostname: identity.hostname.clone(),
        status: PeerStatus::Online,
        last_power_on: Some(identity.boot_time.clone()),
        timezone: Some(identity.timezone.clone()),
    }
}

fn offline_payload(identity: &NodeIdentity) -> NodeResult<Vec<u8>> {
    let payload = StatusPayload::offline(&identity.display_name, &identity.chip_model);
    Ok(serde_json::to_vec(&payload)?)
}

struct PresenceState {
    identity: NodeIdentity,
    last_announce: Option<Duration>,
}

pub struct PresenceService {
    state: Manager<PresenceState>,
    connection: Arc<ConnectionManager>,
    registry: Arc<PeerRegistry>,
    topics: Topics,
    clock: Arc<dyn Clock>,
    heartbeat: Duration,
    inbox: Option<mpsc::Sender<InboxMessage>>,
}

impl PresenceService {
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<PeerRegistry>,
        topics: Topics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Manager::new("PRESENCE", rank::PRESENCE),
            connection,
            registry,
            topics,
            clock,
            heartbeat: DEFAULT_HEARTBEAT,
            inbox: None,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Forward inbox messages to `tx`. Without a channel they are only logged.
    pub fn with_inbox(mut self, tx: mpsc::Sender<InboxMessage>) -> Self {
        self.inbox = Some(tx);
        self
    }

    /// Store the identity and prime the connection with the will, the
    /// discovery filter and the inbox subscription. Idempotent.
    pub fn begin(&self, identity: NodeIdentity) -> NodeResult<bool> {
        let will = self.will_for(&identity)?;
        let inbox = self.topics.inbox(&identity.display_name);
        if !self.state.begin(|| PresenceState {
            identity,
            last_announce: None,
        }) {
            return Ok(false);
        }

        self.connection.set_last_will(will)?;
        self.connection
            .set_discovery_filter(&self.topics.status_subscription())?;
        self.connection.update_subscription(&inbox)?;
        Ok(true)
    }

    fn will_for(&self, identity: &NodeIdentity) -> NodeResult<WillMessage> {
        Ok(WillMessage {
            topic: self.topics.status(&identity.id),
            payload: offline_payload(identity)?,
            retain: true,
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut PresenceState) -> R) -> NodeResult<R> {
        self.state.with(Some(DEFAULT_LOCK_TIMEOUT), f)
    }

    pub fn identity(&self) -> NodeResult<NodeIdentity> {
        self.with_state(|s| s.identity.clone())
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// One scheduling-loop step: drive the connection, announce when a
    /// session came up or the heartbeat is due, dispatch inbound messages.
    pub fn tick(&self) -> NodeResult<TickReport> {
        let DriveReport {
            connected_now,
            lost,
            inbound,
        } = self.connection.handle_connection()?;
        let now = self.clock.now();

        let mut report = TickReport {
            connected_now,
            lost,
            ..TickReport::default()
        };

        if self.connection.is_connected()? {
            let heartbeat = self.heartbeat;
            let due = self.with_state(|s| match s.last_announce {
                None => true,
                Some(at) => now.saturating_sub(at) >= heartbeat,
            })?;
            if connected_now || due {
                match self.announce() {
                    Ok(()) => report.announced = true,
                    Err(e) => warn!("status announce failed: {}", e),
                }
            }
        }

        self.dispatch_all(inbound, now, &mut report);
        Ok(report)
    }

    /// A message that cannot be dispatched is dropped alone; the rest of the batch still goes through.
    fn dispatch_all(&self, inbound: Vec<InboundMessage>, now: Duration, report: &mut TickReport) {
        for message in inbound {
            let topic = message.topic.clone();
            if let Err(e) = self.dispatch(message, now, report) {
                warn!("message on {} dropped: {}", topic, e);
                report.discarded += 1;
            }
        }
    }

    /// Publish this node's retained `online` record.
    pub fn announce(&self) -> NodeResult<()> {
        let (topic, payload) = self.with_state(|s| {
            (
                self.topics.status(&s.identity.id),
                serde_json::to_vec(&online_payload(&s.identity)),
            )
        })?;
        self.connection.publish(&topic, &payload?, true)?;

        let now = self.clock.now();
        self.with_state(|s| s.last_announce = Some(now))?;
        debug!("announced status on {}", topic);
        Ok(())
    }

    /// Publish the retained `offline` record, then disconnect gracefully.
    pub fn withdraw(&self) -> NodeResult<()> {
        let (topic, payload) = self.with_state(|s| {
            s.last_announce = None;
            (self.topics.status(&s.identity.id), offline_payload(&s.identity))
        })?;

        if let Err(e) = self.connection.publish(&topic, &payload?, true) {
            warn!("offline status not published, relying on will: {}", e);
        }
        self.connection.disconnect()?;
        info!("withdrew presence");
        Ok(())
    }

    /// Withdraw and disable the broker client.
    pub fn shutdown(&self) -> NodeResult<()> {
        if self.connection.is_connected()? {
            self.withdraw()?;
        }
        self.connection.stop_client()
    }

    /// Change the display name: new will, new inbox subscription, fresh announce.
    pub fn rename(&self, display_name: &str) -> NodeResult<()> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(NodeError::Identity("display name cannot be empty".into()));
        }

        let identity = self.with_state(|s| {
            s.identity.display_name = display_name.to_string();
            s.identity.clone()
        })?;

        self.connection.set_last_will(self.will_for(&identity)?)?;
        self.connection
            .update_subscription(&self.topics.inbox(&identity.display_name))?;
        if self.connection.is_connected()? {
            self.announce()?;
        }
        info!("renamed to {}", display_name);
        Ok(())
    }

    /// Send `text` to the inbox of the node called `target_display_name`.
    pub fn send_message(&self, target_display_name: &str, text: &str) -> NodeResult<()> {
        if text.is_empty() {
            return Err(NodeError::EmptyPayload);
        }
        let sender = self.with_state(|s| s.identity.display_name.clone())?;
        let payload = serde_json::to_vec(&InboxMessage {
            message: text.to_string(),
            sender: Some(sender),
        })?;
        self.connection
            .publish(&self.topics.inbox(target_display_name), &payload, false)
    }

    fn dispatch(&self, message: InboundMessage, now: Duration, report: &mut TickReport) -> NodeResult<()> {
        if let Some(peer_id) = self.topics.peer_id_from_status(&message.topic) {
            if message.payload.is_empty() {
                warn!("empty status payload for {}, ignoring", peer_id);
                return Ok(());
            }
            match serde_json::from_slice::<StatusPayload>(&message.payload) {
                Ok(status) => match self.registry.apply(peer_id, &status, now) {
                    Ok(_) => report.status_updates += 1,
                    Err(e) => warn!("status from {} dropped: {}", peer_id, e),
                },
                Err(e) => {
                    warn!("discarding malformed status from {}: {}", peer_id, e);
                    report.discarded += 1;
                }
            }
            return Ok(());
        }

        let own_inbox = self.with_state(|s| self.topics.inbox(&s.identity.display_name))?;
        if message.topic != own_inbox {
            debug!("ignoring message on {}", message.topic);
            return Ok(());
        }

        match serde_json::from_slice::<InboxMessage>(&message.payload) {
            Ok(inbox) => {
                report.inbox_messages += 1;
                info!(
                    "message from {}: {}",
                    inbox.sender.as_deref().unwrap_or("anonymous"),
                    inbox.message
                );
                if let Some(tx) = &self.inbox {
                    if tx.try_send(inbox).is_err() {
                        warn!("inbox consumer not keeping up, message dropped");
                    }
                }
            }
            Err(e) => {
                warn!("discarding malformed inbox message: {}", e);
                report.discarded += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connection::ConnectionSettings;
    use crate::transport::{BrokerSession, Connector, LinkError, LinkResult, SessionPlan};

    struct NoBroker;

    impl Connector for NoBroker {
        fn open(&self, _plan: &SessionPlan) -> LinkResult<BrokerSession> {
            Err(LinkError::Unreachable("no broker".into()))
        }
    }

    fn identity(name: &str) -> NodeIdentity {
        NodeIdentity {
            id: "a1".into(),
            display_name: name.into(),
            firmware_version: "1.0.0".into(),
            timezone: "UTC".into(),
            chip_model: "linux-x86_64".into(),
            network_address: "10.0.0.7".into(),
            hostname: Some("alpha.local".into()),
            boot_time: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn service() -> PresenceService {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let connection = Arc::new(ConnectionManager::new(Arc::new(NoBroker), clock.clone()));
        connection.begin(ConnectionSettings::default());
        let registry = Arc::new(PeerRegistry::new());
        registry.begin();
        let service = PresenceService::new(connection, registry, Topics::default(), clock);
        assert!(service.begin(identity("alpha")).unwrap());
        service
    }

    fn inbound(topic: &str, payload: &[u8]) -> InboundMessage {
        InboundMessage {
            topic: topic.into(),
            payload: payload.to_vec(),
            retained: false,
        }
    }

    #[test]
    fn test_online_payload_keys() {
        let json = serde_json::to_value(online_payload(&identity("alpha"))).unwrap();
        for key in [
            "peerId",
            "displayName",
            "firmwareVersion",
            "chipModel",
            "networkAddress",
            "hostname",
            "status",
            "lastPowerOnTimestamp",
            "timezone",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["status"], "online");
    }

    #[test]
    fn test_will_is_retained_offline_record() {
        let service = service();
        let will = service.will_for(&identity("alpha")).unwrap();
        assert_eq!(will.topic, "status/a1");
        assert!(will.retain);
        let payload: serde_json::Value = serde_json::from_slice(&will.payload).unwrap();
        assert_eq!(payload["status"], "offline");
        assert_eq!(payload["displayName"], "alpha");
    }

    #[test]
    fn test_dispatch_status_messages() {
        let service = service();
        let mut report = TickReport::default();

        let status = br#"{"displayName":"beta","status":"online"}"#;
        service
            .dispatch(inbound("status/b2", status), Duration::ZERO, &mut report)
            .unwrap();
        service
            .dispatch(inbound("status/c3", b"{not json"), Duration::ZERO, &mut report)
            .unwrap();
        service
            .dispatch(inbound("status/d4", b""), Duration::ZERO, &mut report)
            .unwrap();

        assert_eq!(report.status_updates, 1);
        assert_eq!(report.discarded, 1);
        let peers = service.registry().snapshot().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].display_name, "beta");
    }

    #[test]
    fn test_failed_dispatch_keeps_rest_of_batch() {
        let service = service();
        let mut report = TickReport::default();
        let batch = vec![
            inbound("print/alpha", br#"{"message":"hello"}"#),
            inbound("status/b2", br#"{"displayName":"beta","status":"online"}"#),
            inbound("status/c3", br#"{"displayName":"gamma","status":"online"}"#),
        ];

        {
            // Inbox routing needs the presence lock, which is already held here
            let _held = service.state.lock(None).unwrap();
            service.dispatch_all(batch, Duration::ZERO, &mut report);
        }

        assert_eq!(report.discarded, 1);
        assert_eq!(report.status_updates, 2);
        assert_eq!(service.registry().len().unwrap(), 2);
    }

    #[test]
    fn test_dispatch_inbox_to_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let connection = Arc::new(ConnectionManager::new(Arc::new(NoBroker), clock.clone()));
        connection.begin(ConnectionSettings::default());
        let registry = Arc::new(PeerRegistry::new());
        registry.begin();
        let service = PresenceService::new(connection, registry, Topics::default(), clock).with_inbox(tx);
        service.begin(identity("Alpha Desk")).unwrap();

        let mut report = TickReport::default();
        let body = br#"{"message":"hello","sender":"beta"}"#;
        service
            .dispatch(inbound("print/alpha-desk", body), Duration::ZERO, &mut report)
            .unwrap();
        service
            .dispatch(inbound("print/alpha-desk", b"[]"), Duration::ZERO, &mut report)
            .unwrap();
        service
            .dispatch(inbound("print/someone-else", body), Duration::ZERO, &mut report)
            .unwrap();

        assert_eq!(report.inbox_messages, 1);
        assert_eq!(report.discarded, 1);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.message, "hello");
        assert_eq!(received.sender.as_deref(), Some("beta"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_operations_need_connection() {
        let service = service();
        assert!(matches!(service.announce(), Err(NodeError::Disabled)));
        assert!(matches!(
            service.send_message("beta", "hi"),
            Err(NodeError::Disabled)
        ));
        assert!(matches!(
            service.send_message("beta", ""),
            Err(NodeError::EmptyPayload)
        ));
    }

    #[test]
    fn test_rename_updates_identity() {
        let service = service();
        service.rename("  gamma ").unwrap();
        assert_eq!(service.identity().unwrap().display_name, "gamma");
        assert!(service.rename("   ").is_err());
    }

    #[test]
    fn test_begin_is_idempotent() {
        let service = service();
        assert!(!service.begin(identity("other")).unwrap());
        assert_eq!(service.identity().unwrap().display_name, "alpha");
    }
}
