//! Broker transport seam
//!
//! The connection state machine talks to the broker through these traits so
//! the real MQTT client ([`crate::mqtt::RumqttConnector`]) and the in-process
//! simulator used by tests are interchangeable. Every method is non-blocking:
//! requests are queued, results come back as [`LinkEvent`]s.

use thiserror::Error;
use tokio::sync::mpsc;

/// Why a link request was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Request queue is full; the session itself is still usable
    #[error("transport request queue full")]
    Backpressure,

    /// Session is gone; nothing more will be sent on it
    #[error("session closed")]
    Closed,

    /// Session could not be opened
    #[error("broker unreachable: {0}")]
    Unreachable(String),
}

impl LinkError {
    /// Whether the session should be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LinkError::Backpressure)
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Message the broker publishes on our behalf when the link dies without a
/// graceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Everything needed to open one broker session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub keep_alive_secs: u64,
    pub max_packet_size: usize,
    /// PEM trust anchor; `None` means plain TCP.
    pub ca_pem: Option<String>,
    pub will: Option<WillMessage>,
}

/// Asynchronous outcome reported by a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Broker accepted the session
    Connected,
    /// Broker answered but rejected the session
    Refused(String),
    Message {
        topic: String,
        payload: Vec<u8>,
        retained: bool,
    },
    /// Network failure; the broker will fire the will
    Lost(String),
    /// Graceful disconnect completed
    Closed,
}

/// Outgoing half of an open session.
pub trait BrokerLink: Send {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> LinkResult<()>;
    fn subscribe(&mut self, filter: &str) -> LinkResult<()>;
    fn unsubscribe(&mut self, filter: &str) -> LinkResult<()>;
    /// Graceful close: no will.
    fn disconnect(&mut self) -> LinkResult<()>;
    /// Tear the session down without a DISCONNECT packet.
    fn abort(&mut self);
}

pub struct BrokerSession {
    pub link: Box<dyn BrokerLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession").finish_non_exhaustive()
    }
}

/// Opens sessions. Called from the connection driver, so it must not block
/// on the network.
pub trait Connector: Send + Sync {
    fn open(&self, plan: &SessionPlan) -> LinkResult<BrokerSession>;
}
