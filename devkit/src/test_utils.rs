/*!
Test harness for multi-node scenarios

Spawns PrintMesh nodes wired to one [`SimBroker`] and one shared
[`ManualClock`], and drives them deterministically:
- `settle()` ticks every node until no more traffic is produced
- `advance()` moves the clock in steps, ticking every node after each step
*/

use crate::sim_broker::SimBroker;
use anyhow::Result;
use printmesh_node::clock::ManualClock;
use printmesh_node::config::NodeConfig;
use printmesh_node::identity::NodeIdentity;
use printmesh_node::presence::InboxMessage;
use printmesh_node::registry::PeerRecord;
use printmesh_node::Node;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Enough rounds for connect, subscribe, announce and delivery to complete.
const SETTLE_ROUNDS: usize = 6;

pub struct TestHarness {
    pub broker: SimBroker,
    pub clock: ManualClock,
    nodes: BTreeMap<String, Arc<Node>>,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok(); // Init logging for tests

        Self {
            broker: SimBroker::new(),
            clock: ManualClock::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// Identity used for simulated nodes.
    pub fn identity(id: &str, display_name: &str) -> NodeIdentity {
        NodeIdentity {
            id: id.to_string(),
            display_name: display_name.to_string(),
            firmware_version: "1.0.0".to_string(),
            timezone: "UTC".to_string(),
            chip_model: "sim-node".to_string(),
            network_address: format!("10.0.0.{}", id.len()),
            hostname: Some(format!("{display_name}.local")),
            boot_time: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    /// Broker settings pointing at the simulator, TLS off.
    pub fn config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.mqtt.host = "sim.broker".to_string();
        config.mqtt.port = 1883;
        config.mqtt.tls = false;
        config
    }

    pub fn spawn_node(&mut self, id: &str, display_name: &str) -> Result<Arc<Node>> {
        self.spawn_with(id, display_name, Self::config(), None)
    }

    /// Node whose inbox messages are forwarded to the returned receiver.
    pub fn spawn_node_with_inbox(
        &mut self,
        id: &str,
        display_name: &str,
    ) -> Result<(Arc<Node>, mpsc::Receiver<InboxMessage>)> {
        let (tx, rx) = mpsc::channel(16);
        let node = self.spawn_with(id, display_name, Self::config(), Some(tx))?;
        Ok((node, rx))
    }

    pub fn spawn_with(
        &mut self,
        id: &str,
        display_name: &str,
        config: NodeConfig,
        inbox: Option<mpsc::Sender<InboxMessage>>,
    ) -> Result<Arc<Node>> {
        let node = Node::start(
            config,
            Self::identity(id, display_name),
            Arc::new(self.broker.clone()),
            Arc::new(self.clock.clone()),
            inbox,
        )?;
        let node = Arc::new(node);
        self.nodes.insert(id.to_string(), node.clone());
        log::info!("[HARNESS] spawned node {} ({})", display_name, id);
        Ok(node)
    }

    /// Stop ticking a node; it stays connected until dropped by the broker.
    pub fn detach(&mut self, id: &str) -> Option<Arc<Node>> {
        self.nodes.remove(id)
    }

    pub fn tick_all(&self) -> Result<()> {
        for node in self.nodes.values() {
            node.tick()?;
        }
        Ok(())
    }

    /// Tick without moving the clock until traffic settles.
    pub fn settle(&self) -> Result<()> {
        for _ in 0..SETTLE_ROUNDS {
            self.tick_all()?;
        }
        Ok(())
    }

    /// Move the clock by `total` in `step` increments, ticking after each.
    pub fn advance(&self, total: Duration, step: Duration) -> Result<()> {
        let step = step.max(Duration::from_millis(1));
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.clock.advance(step);
            elapsed += step;
            self.tick_all()?;
        }
        self.settle()
    }

    /// Record `observer` holds for `peer_id`.
    pub fn peer_seen_by(&self, observer: &Node, peer_id: &str) -> Result<Option<PeerRecord>> {
        Ok(observer.registry().get(peer_id)?)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
