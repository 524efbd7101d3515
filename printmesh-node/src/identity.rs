//! Node identification
//!
//! This module handles:
//! - Primary MAC selection with priority (Ethernet > WiFi > Other)
//! - Stable short node id derived from that MAC
//! - Network address, host name and chip model for status records

use crate::config::NodeSection;
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use if_addrs::{get_if_addrs, IfAddr};
use tracing::{debug, info, warn};

/// Immutable-for-session description of this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: String,
    pub display_name: String,
    pub firmware_version: String,
    pub timezone: String,
    pub chip_model: String,
    pub network_address: String,
    pub hostname: Option<String>,
    /// RFC 3339 time this process started
    pub boot_time: String,
}

impl NodeIdentity {
    /// Broker session identifier.
    pub fn client_id(&self) -> String {
        format!("printmesh-{}", self.id)
    }

    /// Discover hardware identity and merge the configured overrides.
    pub fn discover(node: &NodeSection) -> Result<Self> {
        info!("Starting node discovery...");

        let candidates = enumerate_interfaces().context("Failed to enumerate network interfaces")?;
        let primary = select_primary(&candidates).context("No interface with a MAC address found")?;
        let id = node_id_from_mac(primary.mac);

        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let hostname = Some(hostname).filter(|h| !h.is_empty());

        let display_name = node
            .display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| hostname.clone())
            .unwrap_or_else(|| format!("printmesh-{id}"));

        let identity = NodeIdentity {
            id,
            display_name,
            firmware_version: node
                .firmware_version
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            timezone: node.timezone.clone(),
            chip_model: chip_model(),
            network_address: primary.ipv4.clone().unwrap_or_default(),
            hostname,
            boot_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        info!(
            "Discovery complete - Node ID: {}, Name: {}, Address: {}",
            identity.id, identity.display_name, identity.network_address
        );
        Ok(identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum InterfaceClass {
    Ethernet,
    Wireless,
    Other,
}

#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    class: InterfaceClass,
    mac: [u8; 6],
    ipv4: Option<String>,
}

fn enumerate_interfaces() -> Result<Vec<Candidate>> {
    let mut candidates: Vec<Candidate> = Vec::new();

    for if_addr in get_if_addrs()? {
        if if_addr.is_loopback() {
            continue;
        }
        let ipv4 = match &if_addr.addr {
            IfAddr::V4(v4) => Some(v4.ip.to_string()),
            IfAddr::V6(_) => None,
        };

        if let Some(existing) = candidates.iter_mut().find(|c| c.name == if_addr.name) {
            if existing.ipv4.is_none() {
                existing.ipv4 = ipv4;
            }
            continue;
        }

        match mac_address::mac_address_by_name(&if_addr.name) {
            Ok(Some(mac)) => candidates.push(Candidate {
                class: classify_interface(&if_addr.name),
                name: if_addr.name,
                mac: mac.bytes(),
                ipv4,
            }),
            Ok(None) => debug!("No MAC found for interface: {}", if_addr.name),
            Err(e) => debug!("Error getting MAC for {}: {}", if_addr.name, e),
        }
    }

    Ok(candidates)
}

fn classify_interface(name: &str) -> InterfaceClass {
    let name = name.to_lowercase();
    if ["wlan", "wifi", "wlp", "wlo"].iter().any(|p| name.contains(p)) {
        InterfaceClass::Wireless
    } else if name.starts_with("eth") || name.starts_with("en") {
        InterfaceClass::Ethernet
    } else {
        InterfaceClass::Other
    }
}

/// Best interface by class; ties keep enumeration order. Interfaces with an
/// IPv4 address win within a class.
fn select_primary(candidates: &[Candidate]) -> Option<&Candidate> {
    let best = candidates
        .iter()
        .enumerate()
        .min_by_key(|(idx, c)| (c.class, c.ipv4.is_none(), *idx))
        .map(|(_, c)| c);

    match best {
        Some(c) if c.class == InterfaceClass::Other => {
            warn!("No Ethernet/WiFi found, using interface: {}", c.name)
        }
        Some(c) => debug!("Selected {:?} interface as primary: {}", c.class, c.name),
        None => {}
    }
    best
}

/// Short hex id from the upper four bytes of the MAC read as a little-endian integer.
pub fn node_id_from_mac(mac: [u8; 6]) -> String {
    let mut raw = [0u8; 8];
    raw[..6].copy_from_slice(&mac);
    let value = u64::from_le_bytes(raw);
    format!("{:x}", (value >> 16) as u32)
}

fn chip_model() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}
