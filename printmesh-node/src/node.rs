//! Composition root
//!
//! Builds one instance of each manager, wires them together, and runs the
//! periodic driver until shutdown.

use crate::clock::Clock;
use crate::config::{ConfigStore, NodeConfig};
use crate::connection::ConnectionManager;
use crate::error::NodeResult;
use crate::identity::NodeIdentity;
use crate::presence::{InboxMessage, PresenceService, TickReport};
use crate::registry::PeerRegistry;
use crate::topics::Topics;
use crate::transport::Connector;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Period of the scheduling loop.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

pub struct Node {
    config: Arc<ConfigStore>,
    presence: Arc<PresenceService>,
    clock: Arc<dyn Clock>,
    client_id: String,
}

impl Node {
    /// Construct and `begin()` every manager. Nothing touches the network
    /// until the first [`Node::tick`].
    pub fn start(
        config: NodeConfig,
        identity: NodeIdentity,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
        inbox: Option<mpsc::Sender<InboxMessage>>,
    ) -> NodeResult<Self> {
        let client_id = identity.client_id();

        let connection = Arc::new(ConnectionManager::new(connector, clock.clone()));
        connection.begin(config.connection_settings(client_id.clone()));

        let registry = Arc::new(PeerRegistry::new());
        registry.begin();

        let mut presence = PresenceService::new(
            connection,
            registry,
            Topics::new(config.discovery.namespace.clone()),
            clock.clone(),
        )
        .with_heartbeat(config.heartbeat());
        if let Some(tx) = inbox {
            presence = presence.with_inbox(tx);
        }

        info!("starting node {} ({})", identity.display_name, identity.id);
        presence.begin(identity)?;

        let store = Arc::new(ConfigStore::new());
        store.begin(config);

        Ok(Self {
            config: store,
            presence: Arc::new(presence),
            clock,
            client_id,
        })
    }

    pub fn presence(&self) -> &Arc<PresenceService> {
        &self.presence
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        self.presence.registry()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        self.presence.connection()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// One driver step plus the configured offline eviction.
    pub fn tick(&self) -> NodeResult<TickReport> {
        let report = self.presence.tick()?;

        if let Some(ttl) = self.config.snapshot()?.eviction_threshold() {
            self.registry().evict_offline(ttl, self.clock.now())?;
        }
        Ok(report)
    }

    /// Replace the configuration and re-apply the broker settings.
    pub fn reload(&self, config: NodeConfig) -> NodeResult<()> {
        let settings = config.connection_settings(self.client_id.clone());
        self.config.replace(config)?;
        self.connection().reconfigure(settings)
    }

    /// Drive the node every [`TICK_INTERVAL`] until `shutdown` resolves, then
    /// withdraw presence and stop the broker client.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> NodeResult<()> {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        warn!("driver step failed: {}", e);
                    }
                }
            }
        }

        info!("shutting down");
        self.presence.shutdown()
    }
}
