//! In-memory registry of discovered peers
//!
//! One [`PeerRecord`] per peer id, built from retained status messages.
//! Offline peers are kept and flagged, never dropped implicitly; removal is
//! the caller's decision through [`PeerRegistry::evict_offline`].
//! Readers get snapshot copies; change notifications go out on a broadcast
//! channel after the registry lock is released.

use crate::error::NodeResult;
use crate::manager::{rank, Manager, DEFAULT_LOCK_TIMEOUT};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 64;
const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

/// Only an exact `"offline"` withdraws a peer. Any other value, a non-string
/// or a missing key reads as online.
fn reported_status<'de, D>(deserializer: D) -> Result<PeerStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw.as_ref().and_then(|v| v.as_str()) {
        Some("offline") => PeerStatus::Offline,
        Some(other) if other != "online" => {
            debug!("status '{}' treated as online", other);
            PeerStatus::Online
        }
        _ => PeerStatus::Online,
    })
}

fn default_status() -> PeerStatus {
    PeerStatus::Online
}

/// Wire form of a `status/{peerId}` message. Every field is optional so the
/// minimal offline record and peers on other firmware revisions parse too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chip_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default = "default_status", deserialize_with = "reported_status")]
    pub status: PeerStatus,
    #[serde(
        default,
        rename = "lastPowerOnTimestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_power_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl StatusPayload {
    pub fn offline(display_name: &str, chip_model: &str) -> Self {
        Self {
            peer_id: None,
            display_name: Some(display_name.to_string()),
            firmware_version: None,
            chip_model: Some(chip_model.to_string()),
            network_address: None,
            hostname: None,
            status: PeerStatus::Offline,
            last_power_on: None,
            timezone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: String,
    pub display_name: String,
    pub firmware_version: String,
    pub chip_model: String,
    pub network_address: String,
    pub hostname: Option<String>,
    pub status: PeerStatus,
    pub last_power_on: String,
    pub timezone: String,
    /// Monotonic time of the last status message
    pub last_seen: Duration,
}

impl PeerRecord {
    fn new(peer_id: &str, now: Duration) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            display_name: UNKNOWN.to_string(),
            firmware_version: UNKNOWN.to_string(),
            chip_model: UNKNOWN.to_string(),
            network_address: String::new(),
            hostname: None,
            status: PeerStatus::Online,
            last_power_on: String::new(),
            timezone: String::new(),
            last_seen: now,
        }
    }

    fn merge(&mut self, status: &StatusPayload, now: Duration) {
        fn keep_or(field: &mut String, value: &Option<String>) {
            if let Some(v) = value {
                field.clone_from(v);
            }
        }

        keep_or(&mut self.display_name, &status.display_name);
        keep_or(&mut self.firmware_version, &status.firmware_version);
        keep_or(&mut self.chip_model, &status.chip_model);
        keep_or(&mut self.network_address, &status.network_address);
        keep_or(&mut self.last_power_on, &status.last_power_on);
        keep_or(&mut self.timezone, &status.timezone);
        if status.hostname.is_some() {
            self.hostname.clone_from(&status.hostname);
        }
        self.status = PeerStatus::Online;
        self.last_seen = now;
    }

    pub fn is_online(&self) -> bool {
        self.status == PeerStatus::Online
    }
}

/// What one status message did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChange {
    Discovered,
    Updated,
    WentOffline,
    /// Offline status for an unknown or already offline peer
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Discovered(PeerRecord),
    Updated(PeerRecord),
    WentOffline(PeerRecord),
    Evicted(String),
}

pub struct PeerRegistry {
    peers: Manager<HashMap<String, PeerRecord>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            peers: Manager::new("REGISTRY", rank::REGISTRY),
            events,
        }
    }

    pub fn begin(&self) -> bool {
        self.peers.begin(HashMap::new)
    }

    /// Change feed for display/API consumers. Lagging receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Fold one status message from `peer_id` into the registry.
    pub fn apply(&self, peer_id: &str, status: &StatusPayload, now: Duration) -> NodeResult<PeerChange> {
        if let Some(claimed) = status.peer_id.as_deref() {
            if claimed != peer_id {
                debug!("status for {} claims peer id {}, using topic id", peer_id, claimed);
            }
        }

        let (change, event) = {
            let mut peers = self.peers.lock(Some(DEFAULT_LOCK_TIMEOUT))?;
            match (status.status, peers.get_mut(peer_id)) {
                (PeerStatus::Offline, None) => (PeerChange::Ignored, None),
                (PeerStatus::Offline, Some(record)) if !record.is_online() => (PeerChange::Ignored, None),
                (PeerStatus::Offline, Some(record)) => {
                    record.status = PeerStatus::Offline;
                    record.last_seen = now;
                    (PeerChange::WentOffline, Some(PeerEvent::WentOffline(record.clone())))
                }
                (PeerStatus::Online, Some(record)) => {
                    record.merge(status, now);
                    (PeerChange::Updated, Some(PeerEvent::Updated(record.clone())))
                }
                (PeerStatus::Online, None) => {
                    let mut record = PeerRecord::new(peer_id, now);
                    record.merge(status, now);
                    peers.insert(peer_id.to_string(), record.clone());
                    (PeerChange::Discovered, Some(PeerEvent::Discovered(record)))
                }
            }
        };

        match &event {
            Some(PeerEvent::Discovered(record)) => {
                info!("discovered peer {} ({})", record.display_name, record.peer_id)
            }
            Some(PeerEvent::WentOffline(record)) => {
                info!("peer {} ({}) went offline", record.display_name, record.peer_id)
            }
            _ => {}
        }
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        Ok(change)
    }

    /// Copy of every record, ordered by peer id.
    pub fn snapshot(&self) -> NodeResult<Vec<PeerRecord>> {
        let mut records: Vec<PeerRecord> = self
            .peers
            .with(Some(DEFAULT_LOCK_TIMEOUT), |peers| peers.values().cloned().collect())?;
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        Ok(records)
    }

    pub fn get(&self, peer_id: &str) -> NodeResult<Option<PeerRecord>> {
        self.peers
            .with(Some(DEFAULT_LOCK_TIMEOUT), |peers| peers.get(peer_id).cloned())
    }

    pub fn len(&self) -> NodeResult<usize> {
        self.peers.with(Some(DEFAULT_LOCK_TIMEOUT), |peers| peers.len())
    }

    pub fn is_empty(&self) -> NodeResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove offline records not heard from for at least `older_than`.
    /// Online records are never evicted. Returns the removed peer ids.
    pub fn evict_offline(&self, older_than: Duration, now: Duration) -> NodeResult<Vec<String>> {
        let evicted = self.peers.with(Some(DEFAULT_LOCK_TIMEOUT), |peers| {
            let stale: Vec<String> = peers
                .values()
                .filter(|r| !r.is_online() && now.saturating_sub(r.last_seen) >= older_than)
                .map(|r| r.peer_id.clone())
                .collect();
            for id in &stale {
                peers.remove(id);
            }
            stale
        })?;

        for id in &evicted {
            debug!("evicted offline peer {}", id);
            let _ = self.events.send(PeerEvent::Evicted(id.clone()));
        }
        Ok(evicted)
    }
}
