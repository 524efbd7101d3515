//! Broker topic layout
//!
//! - `status/{peerId}`: retained presence record of one node
//! - `status/+`: discovery subscription
//! - `print/{displayName}`: inbox of one node
//!
//! An optional namespace is prepended to every topic (`{ns}/status/{peerId}`).

const STATUS_RESOURCE: &str = "status";
const INBOX_RESOURCE: &str = "print";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topics {
    namespace: Option<String>,
}

impl Topics {
    pub fn new(namespace: Option<String>) -> Self {
        let namespace = namespace
            .map(|ns| ns.trim_matches('/').to_string())
            .filter(|ns| !ns.is_empty());
        Self { namespace }
    }

    fn join(&self, resource: &str, leaf: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{resource}/{leaf}"),
            None => format!("{resource}/{leaf}"),
        }
    }

    pub fn status(&self, peer_id: &str) -> String {
        self.join(STATUS_RESOURCE, peer_id)
    }

    pub fn status_subscription(&self) -> String {
        self.join(STATUS_RESOURCE, "+")
    }

    /// Inbox topic of a node. Display names are lowercased and spaces become dashes
    /// so the topic stays a single level.
    pub fn inbox(&self, display_name: &str) -> String {
        let leaf: String = display_name
            .trim()
            .chars()
            .map(|c| match c {
                '/' | '+' | '#' | ' ' => '-',
                other => other.to_ascii_lowercase(),
            })
            .collect();
        self.join(INBOX_RESOURCE, &leaf)
    }

    pub fn is_status_topic(&self, topic: &str) -> bool {
        self.peer_id_from_status(topic).is_some()
    }

    /// Peer id encoded in a `status/{peerId}` topic.
    pub fn peer_id_from_status<'t>(&self, topic: &'t str) -> Option<&'t str> {
        let prefix = self.join(STATUS_RESOURCE, "");
        topic
            .strip_prefix(prefix.as_str())
            .filter(|id| !id.is_empty() && !id.contains('/'))
    }
}

/// MQTT topic filter matching (`+` single level, `#` trailing multi level).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
