//! Broker connection state machine
//!
//! ```text
//! Disabled -> EnabledDisconnected -> Connecting -> Connected -> Disconnecting -> EnabledDisconnected
//! ```
//!
//! [`ConnectionManager::handle_connection`] is the periodic driver. It is the
//! only place a connection attempt starts, at most once per
//! [`RETRY_INTERVAL`]; while connected it drains inbound messages instead.
//! Nothing here blocks on the network: the transport queues requests and
//! reports outcomes as [`LinkEvent`]s, which the driver consumes.

use crate::clock::Clock;
use crate::error::{NodeError, NodeResult};
use crate::manager::{rank, Manager, DEFAULT_LOCK_TIMEOUT};
use crate::transport::{BrokerSession, Connector, Credentials, LinkError, LinkEvent, LinkResult, SessionPlan, WillMessage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(7);
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";
const MIN_CERT_LENGTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disabled,
    EnabledDisconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Broker parameters taken from the config accessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub enabled: bool,
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub tls: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub keep_alive_secs: u64,
    pub max_packet_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            client_id: "printmesh-unknown".to_string(),
            host: String::new(),
            port: 8883,
            credentials: None,
            tls: true,
            ca_cert_path: None,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            max_packet_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub attempts: u64,
    pub failures: u64,
    pub publishes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

/// Outcome of one driver call.
#[derive(Debug, Default)]
pub struct DriveReport {
    /// A session reached `Connected` during this call
    pub connected_now: bool,
    /// An established session dropped during this call
    pub lost: bool,
    pub inbound: Vec<InboundMessage>,
}

/// Structural check of a PEM trust anchor before it is handed to TLS.
pub fn validate_ca_certificate(pem: &str) -> NodeResult<()> {
    let pem = pem.trim();
    if pem.is_empty() {
        return Err(NodeError::Certificate("certificate is empty".into()));
    }
    if !pem.contains(PEM_BEGIN) || !pem.contains(PEM_END) {
        return Err(NodeError::Certificate("missing PEM begin/end markers".into()));
    }
    if pem.len() < MIN_CERT_LENGTH {
        return Err(NodeError::Certificate(format!(
            "certificate too short ({} bytes)",
            pem.len()
        )));
    }
    Ok(())
}

fn load_trust_anchor(settings: &ConnectionSettings) -> NodeResult<Option<String>> {
    if !settings.tls {
        return Ok(None);
    }
    let path = settings
        .ca_cert_path
        .as_ref()
        .ok_or_else(|| NodeError::Certificate("TLS enabled but no CA certificate path configured".into()))?;
    let pem = std::fs::read_to_string(path)
        .map_err(|e| NodeError::Certificate(format!("cannot read {}: {}", path.display(), e)))?;
    validate_ca_certificate(&pem)?;
    Ok(Some(pem))
}

struct ConnectionInner {
    settings: ConnectionSettings,
    state: ConnectionState,
    session: Option<BrokerSession>,
    /// When the current state was entered
    since: Duration,
    last_attempt: Option<Duration>,
    consecutive_failures: u32,
    cooldown_until: Option<Duration>,
    will: Option<WillMessage>,
    discovery_filter: Option<String>,
    desired_topic: Option<String>,
    current_topic: Option<String>,
    cert_fault_reported: bool,
    stats: ConnectionStats,
}

impl ConnectionInner {
    fn new(settings: ConnectionSettings) -> Self {
        let state = if settings.enabled {
            ConnectionState::EnabledDisconnected
        } else {
            ConnectionState::Disabled
        };
        Self {
            settings,
            state,
            session: None,
            since: Duration::ZERO,
            last_attempt: None,
            consecutive_failures: 0,
            cooldown_until: None,
            will: None,
            discovery_filter: None,
            desired_topic: None,
            current_topic: None,
            cert_fault_reported: false,
            stats: ConnectionStats::default(),
        }
    }

    fn enter(&mut self, state: ConnectionState, now: Duration) {
        if self.state != state {
            debug!("connection state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.since = now;
    }

    fn drop_session(&mut self, graceful: bool) {
        if let Some(mut session) = self.session.take() {
            if graceful {
                if let Err(e) = session.link.disconnect() {
                    debug!("graceful disconnect not queued: {}", e);
                }
            } else {
                session.link.abort();
            }
        }
        self.current_topic = None;
    }

    fn retry_due(&mut self, now: Duration) -> bool {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }
        match self.last_attempt {
            None => true,
            Some(at) => now.saturating_sub(at) >= RETRY_INTERVAL,
        }
    }

    fn fail_attempt(&mut self, reason: &str, now: Duration) {
        self.stats.failures += 1;
        self.consecutive_failures += 1;
        self.drop_session(false);
        self.enter(ConnectionState::EnabledDisconnected, now);

        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            warn!(
                "broker connect failed {} times in a row ({}), cooling down for {}s",
                self.consecutive_failures,
                reason,
                FAILURE_COOLDOWN.as_secs()
            );
            self.cooldown_until = Some(now + FAILURE_COOLDOWN);
            self.consecutive_failures = 0;
        } else {
            warn!("broker connect failed: {}", reason);
        }
    }

    fn plan(&self, ca_pem: Option<String>) -> SessionPlan {
        SessionPlan {
            client_id: self.settings.client_id.clone(),
            host: self.settings.host.clone(),
            port: self.settings.port,
            credentials: self.settings.credentials.clone(),
            keep_alive_secs: self.settings.keep_alive_secs,
            max_packet_size: self.settings.max_packet_size,
            ca_pem,
            will: self.will.clone(),
        }
    }

    fn begin_attempt(&mut self, connector: &dyn Connector, now: Duration) {
        let ca_pem = match load_trust_anchor(&self.settings) {
            Ok(pem) => pem,
            Err(e) => {
                if !self.cert_fault_reported {
                    error!("broker connection disabled: {}", e);
                    self.cert_fault_reported = true;
                }
                self.enter(ConnectionState::Disabled, now);
                return;
            }
        };

        self.last_attempt = Some(now);
        self.stats.attempts += 1;

        if self.settings.host.trim().is_empty() {
            self.fail_attempt("no broker host configured", now);
            return;
        }

        debug!(
            "connecting to broker {}:{} (attempt {})",
            self.settings.host, self.settings.port, self.stats.attempts
        );
        match connector.open(&self.plan(ca_pem)) {
            Ok(session) => {
                self.session = Some(session);
                self.enter(ConnectionState::Connecting, now);
            }
            Err(e) => self.fail_attempt(&e.to_string(), now),
        }
    }

    fn on_connected(&mut self, now: Duration) -> LinkResult<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(LinkError::Closed);
        };

        if let Some(filter) = &self.discovery_filter {
            session.link.subscribe(filter)?;
        }
        if let Some(topic) = &self.desired_topic {
            session.link.subscribe(topic)?;
            self.current_topic = Some(topic.clone());
        }

        self.consecutive_failures = 0;
        self.cooldown_until = None;
        self.cert_fault_reported = false;
        self.enter(ConnectionState::Connected, now);
        info!("connected to broker {}:{}", self.settings.host, self.settings.port);
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        let Some(session) = self.session.as_mut() else {
            return events;
        };
        loop {
            match session.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    events.push(LinkEvent::Lost("event stream closed".into()));
                    break;
                }
            }
        }
        events
    }

    fn process_events(&mut self, now: Duration, report: &mut DriveReport) {
        for event in self.drain_events() {
            match (self.state, event) {
                (ConnectionState::Connecting, LinkEvent::Connected) => {
                    if let Err(e) = self.on_connected(now) {
                        self.fail_attempt(&format!("subscribe failed: {e}"), now);
                    } else {
                        report.connected_now = true;
                    }
                }
                (ConnectionState::Connecting, LinkEvent::Refused(reason)) => {
                    self.fail_attempt(&format!("refused by broker: {reason}"), now);
                }
                (ConnectionState::Connecting, LinkEvent::Lost(reason)) => {
                    self.fail_attempt(&reason, now);
                }
                (ConnectionState::Connecting, LinkEvent::Closed) => {
                    self.fail_attempt("closed during handshake", now);
                }
                (ConnectionState::Connected, LinkEvent::Message { topic, payload, retained }) => {
                    report.inbound.push(InboundMessage {
                        topic,
                        payload,
                        retained,
                    });
                }
                (ConnectionState::Connected, LinkEvent::Lost(reason)) => {
                    warn!("broker connection lost: {}", reason);
                    self.drop_session(false);
                    self.enter(ConnectionState::EnabledDisconnected, now);
                    report.lost = true;
                }
                (ConnectionState::Connected, LinkEvent::Closed) => {
                    warn!("broker closed the session");
                    self.drop_session(false);
                    self.enter(ConnectionState::EnabledDisconnected, now);
                    report.lost = true;
                }
                (ConnectionState::Disconnecting, LinkEvent::Closed | LinkEvent::Lost(_)) => {
                    self.session = None;
                    self.current_topic = None;
                    self.enter(ConnectionState::EnabledDisconnected, now);
                    info!("disconnected from broker");
                }
                (state, event) => {
                    debug!("ignoring {:?} in state {:?}", event, state);
                }
            }
        }
    }
}

/// Owner of the broker session. One instance per process.
pub struct ConnectionManager {
    inner: Manager<ConnectionInner>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Manager::new("CONNECTION", rank::CONNECTION),
            connector,
            clock,
        }
    }

    /// Create the lock and load `settings`. Idempotent.
    pub fn begin(&self, settings: ConnectionSettings) -> bool {
        self.inner.begin(|| ConnectionInner::new(settings))
    }

    fn lock(&self) -> NodeResult<crate::manager::ManagerGuard<'_, ConnectionInner>> {
        self.inner.lock(Some(DEFAULT_LOCK_TIMEOUT))
    }

    /// Periodic driver: start an attempt when due, complete pending
    /// handshakes, detect loss, and collect inbound messages.
    pub fn handle_connection(&self) -> NodeResult<DriveReport> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let mut report = DriveReport::default();

        let state = inner.state;
        match state {
            ConnectionState::Disabled => return Ok(report),
            ConnectionState::EnabledDisconnected => {
                if inner.retry_due(now) {
                    inner.begin_attempt(self.connector.as_ref(), now);
                }
            }
            ConnectionState::Disconnecting if now.saturating_sub(inner.since) >= CONNECT_TIMEOUT => {
                debug!("disconnect did not complete, dropping session");
                inner.drop_session(false);
                inner.enter(ConnectionState::EnabledDisconnected, now);
                return Ok(report);
            }
            _ => {}
        }

        if inner.session.is_some() {
            inner.process_events(now, &mut report);
        }

        if inner.state == ConnectionState::Connecting && now.saturating_sub(inner.since) >= CONNECT_TIMEOUT {
            inner.fail_attempt("connect timed out", now);
        }

        Ok(report)
    }

    pub fn publish(&self, topic: &str, payload: &[u8], retained: bool) -> NodeResult<()> {
        if topic.is_empty() {
            return Err(NodeError::EmptyTopic);
        }
        if payload.is_empty() {
            return Err(NodeError::EmptyPayload);
        }

        let now = self.clock.now();
        let mut inner = self.lock()?;
        match inner.state {
            ConnectionState::Disabled => return Err(NodeError::Disabled),
            ConnectionState::Connected => {}
            _ => return Err(NodeError::NotConnected),
        }

        let sent = match inner.session.as_mut() {
            Some(session) => session.link.publish(topic, payload, retained),
            None => Err(LinkError::Closed),
        };
        match sent {
            Ok(()) => {
                inner.stats.publishes += 1;
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                warn!("publish to {} failed, dropping session: {}", topic, e);
                inner.drop_session(false);
                inner.enter(ConnectionState::EnabledDisconnected, now);
                Err(e.into())
            }
            Err(e) => {
                warn!("publish to {} dropped: {}", topic, e);
                Err(e.into())
            }
        }
    }

    /// Replace the inbox subscription. No-op if unchanged; while offline only
    /// the desired topic is recorded and applied on the next connect.
    pub fn update_subscription(&self, new_topic: &str) -> NodeResult<()> {
        if new_topic.is_empty() {
            return Err(NodeError::EmptyTopic);
        }

        let mut inner = self.lock()?;
        let connected = inner.state == ConnectionState::Connected;
        let unchanged = if connected {
            inner.current_topic.as_deref() == Some(new_topic)
        } else {
            inner.desired_topic.as_deref() == Some(new_topic)
        };
        if unchanged {
            return Ok(());
        }

        inner.desired_topic = Some(new_topic.to_string());
        if !connected {
            return Ok(());
        }

        let old = inner.current_topic.take();
        let Some(session) = inner.session.as_mut() else {
            return Err(NodeError::NotConnected);
        };
        if let Some(old) = old {
            if let Err(e) = session.link.unsubscribe(&old) {
                warn!("unsubscribe from {} failed: {}", old, e);
            }
        }
        session.link.subscribe(new_topic)?;
        inner.current_topic = Some(new_topic.to_string());
        info!("inbox subscription now {}", new_topic);
        Ok(())
    }

    /// Will attached to the next session.
    pub fn set_last_will(&self, will: WillMessage) -> NodeResult<()> {
        let mut inner = self.lock()?;
        inner.will = Some(will);
        Ok(())
    }

    /// Always-on discovery subscription, applied on every connect.
    pub fn set_discovery_filter(&self, filter: &str) -> NodeResult<()> {
        if filter.is_empty() {
            return Err(NodeError::EmptyTopic);
        }
        let mut inner = self.lock()?;
        if inner.discovery_filter.as_deref() == Some(filter) {
            return Ok(());
        }
        inner.discovery_filter = Some(filter.to_string());
        if inner.state == ConnectionState::Connected {
            if let Some(session) = inner.session.as_mut() {
                session.link.subscribe(filter)?;
            }
        }
        Ok(())
    }

    /// Enable the feature. With `immediate` the next driver call attempts a
    /// connection, otherwise it waits one retry interval.
    pub fn start_client(&self, immediate: bool) -> NodeResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.settings.enabled = true;
        if inner.state != ConnectionState::Disabled {
            return Ok(());
        }
        inner.last_attempt = if immediate { None } else { Some(now) };
        inner.cooldown_until = None;
        inner.consecutive_failures = 0;
        inner.enter(ConnectionState::EnabledDisconnected, now);
        info!("broker client started");
        Ok(())
    }

    /// Disable the feature, closing any session gracefully.
    pub fn stop_client(&self) -> NodeResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.settings.enabled = false;
        inner.drop_session(true);
        inner.last_attempt = None;
        inner.cooldown_until = None;
        inner.consecutive_failures = 0;
        inner.enter(ConnectionState::Disabled, now);
        info!("broker client stopped");
        Ok(())
    }

    /// Graceful disconnect that keeps the feature enabled. The driver
    /// completes the transition once the transport confirms.
    pub fn disconnect(&self) -> NodeResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let state = inner.state;
        match state {
            ConnectionState::Connected => {
                let sent = match inner.session.as_mut() {
                    Some(session) => session.link.disconnect(),
                    None => Err(LinkError::Closed),
                };
                inner.last_attempt = Some(now);
                if let Err(e) = sent {
                    debug!("graceful disconnect not queued: {}", e);
                    inner.drop_session(false);
                    inner.enter(ConnectionState::EnabledDisconnected, now);
                } else {
                    inner.enter(ConnectionState::Disconnecting, now);
                }
            }
            ConnectionState::Connecting => {
                inner.drop_session(false);
                inner.last_attempt = Some(now);
                inner.enter(ConnectionState::EnabledDisconnected, now);
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply new broker settings. Any session is closed; the next driver
    /// call reconnects if the new settings are enabled.
    pub fn reconfigure(&self, settings: ConnectionSettings) -> NodeResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.drop_session(true);
        let state = if settings.enabled {
            ConnectionState::EnabledDisconnected
        } else {
            ConnectionState::Disabled
        };
        inner.settings = settings;
        inner.last_attempt = None;
        inner.cooldown_until = None;
        inner.consecutive_failures = 0;
        inner.cert_fault_reported = false;
        inner.enter(state, now);
        Ok(())
    }

    pub fn state(&self) -> NodeResult<ConnectionState> {
        Ok(self.lock()?.state)
    }

    pub fn is_enabled(&self) -> NodeResult<bool> {
        Ok(self.state()? != ConnectionState::Disabled)
    }

    pub fn is_connected(&self) -> NodeResult<bool> {
        Ok(self.state()? == ConnectionState::Connected)
    }

    pub fn stats(&self) -> NodeResult<ConnectionStats> {
        Ok(self.lock()?.stats)
    }

    pub fn current_subscription(&self) -> NodeResult<Option<String>> {
        Ok(self.lock()?.current_topic.clone())
    }
}
