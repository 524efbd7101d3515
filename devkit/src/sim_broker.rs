/*!
In-memory MQTT broker for tests

Implements the node's `Connector` seam with the broker behaviour the
presence protocol depends on:
- retained store (an empty retained payload clears the topic)
- `+` / `#` filter routing, retained replay on subscribe
- last will published on abrupt loss, never on graceful disconnect
- fault injection: refused sessions, unreachable broker, dropped clients

Every publish is recorded for assertions.
*/

use printmesh_node::topics::topic_matches;
use printmesh_node::transport::{
    BrokerLink, BrokerSession, Connector, LinkError, LinkEvent, LinkResult, SessionPlan, WillMessage,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const SESSION_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMessage {
    /// Publishing client; `None` for the broker itself (wills, injections)
    pub client_id: Option<String>,
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

struct Session {
    id: u64,
    filters: Vec<String>,
    tx: mpsc::Sender<LinkEvent>,
    will: Option<WillMessage>,
}

#[derive(Default)]
struct BrokerState {
    retained: BTreeMap<String, Vec<u8>>,
    sessions: HashMap<String, Session>,
    next_session: u64,
    published: Vec<SimMessage>,
    refuse: bool,
    unreachable: bool,
    connects: u64,
}

impl BrokerState {
    fn route(&mut self, from: Option<&str>, topic: &str, payload: &[u8], retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.to_vec());
            }
        }

        self.published.push(SimMessage {
            client_id: from.map(str::to_string),
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });

        for session in self.sessions.values() {
            if session.filters.iter().any(|f| topic_matches(f, topic)) {
                let _ = session.tx.try_send(LinkEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    retained: false,
                });
            }
        }
    }

    fn fire_will(&mut self, will: Option<WillMessage>) {
        if let Some(will) = will {
            log::info!("[SIM] firing will on {}", will.topic);
            self.route(None, &will.topic, &will.payload, will.retain);
        }
    }

    /// Session for `client_id` if it is still the one with `session_id`.
    fn live(&mut self, client_id: &str, session_id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(client_id).filter(|s| s.id == session_id)
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheap to clone; clones share one broker.
#[derive(Clone, Default)]
pub struct SimBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer new sessions with a refusal.
    pub fn set_refuse(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    /// Fail `open()` outright, as if the host did not answer.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Kill a client's connection without a DISCONNECT: the client sees
    /// `Lost` and the broker publishes its will. Returns whether it was connected.
    pub fn drop_client(&self, client_id: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(session) = state.sessions.remove(client_id) else {
            return false;
        };
        log::info!("[SIM] dropping {}", client_id);
        let _ = session.tx.try_send(LinkEvent::Lost("connection reset by broker".into()));
        state.fire_will(session.will);
        true
    }

    /// Publish as the broker itself, e.g. a foreign or malformed message.
    pub fn inject(&self, topic: &str, payload: &[u8], retain: bool) {
        lock(&self.state).route(None, topic, payload, retain);
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        lock(&self.state).sessions.contains_key(client_id)
    }

    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        lock(&self.state)
            .sessions
            .get(client_id)
            .map(|s| s.filters.clone())
            .unwrap_or_default()
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        lock(&self.state).retained.get(topic).cloned()
    }

    pub fn retained_json(&self, topic: &str) -> Option<serde_json::Value> {
        self.retained(topic)
            .and_then(|payload| serde_json::from_slice(&payload).ok())
    }

    pub fn published(&self) -> Vec<SimMessage> {
        lock(&self.state).published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<SimMessage> {
        lock(&self.state)
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Sessions accepted or refused so far.
    pub fn connect_count(&self) -> u64 {
        lock(&self.state).connects
    }

    pub fn clear_history(&self) {
        lock(&self.state).published.clear();
    }
}

impl Connector for SimBroker {
    fn open(&self, plan: &SessionPlan) -> LinkResult<BrokerSession> {
        let mut state = lock(&self.state);
        if state.unreachable {
            return Err(LinkError::Unreachable(format!("{}:{}", plan.host, plan.port)));
        }

        state.connects += 1;
        state.next_session += 1;
        let id = state.next_session;
        let (tx, events) = mpsc::channel(SESSION_QUEUE);

        if state.refuse {
            let _ = tx.try_send(LinkEvent::Refused("not authorized".into()));
            return Ok(BrokerSession {
                link: Box::new(SimLink {
                    state: self.state.clone(),
                    client_id: plan.client_id.clone(),
                    session_id: 0,
                }),
                events,
            });
        }

        if let Some(previous) = state.sessions.remove(&plan.client_id) {
            let _ = previous.tx.try_send(LinkEvent::Lost("session taken over".into()));
        }

        let _ = tx.try_send(LinkEvent::Connected);
        state.sessions.insert(
            plan.client_id.clone(),
            Session {
                id,
                filters: Vec::new(),
                tx,
                will: plan.will.clone(),
            },
        );
        log::info!("[SIM] {} connected", plan.client_id);

        Ok(BrokerSession {
            link: Box::new(SimLink {
                state: self.state.clone(),
                client_id: plan.client_id.clone(),
                session_id: id,
            }),
            events,
        })
    }
}

struct SimLink {
    state: Arc<Mutex<BrokerState>>,
    client_id: String,
    session_id: u64,
}

impl BrokerLink for SimLink {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> LinkResult<()> {
        let mut state = lock(&self.state);
        if state.live(&self.client_id, self.session_id).is_none() {
            return Err(LinkError::Closed);
        }
        state.route(Some(&self.client_id), topic, payload, retain);
        Ok(())
    }

    fn subscribe(&mut self, filter: &str) -> LinkResult<()> {
        let mut state = lock(&self.state);
        let replay: Vec<(String, Vec<u8>)> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect();

        let session = state
            .live(&self.client_id, self.session_id)
            .ok_or(LinkError::Closed)?;
        if !session.filters.iter().any(|f| f == filter) {
            session.filters.push(filter.to_string());
        }
        for (topic, payload) in replay {
            let _ = session.tx.try_send(LinkEvent::Message {
                topic,
                payload,
                retained: true,
            });
        }
        Ok(())
    }

    fn unsubscribe(&mut self, filter: &str) -> LinkResult<()> {
        let mut state = lock(&self.state);
        let session = state
            .live(&self.client_id, self.session_id)
            .ok_or(LinkError::Closed)?;
        session.filters.retain(|f| f != filter);
        Ok(())
    }

    fn disconnect(&mut self) -> LinkResult<()> {
        let mut state = lock(&self.state);
        if state.live(&self.client_id, self.session_id).is_none() {
            return Err(LinkError::Closed);
        }
        if let Some(session) = state.sessions.remove(&self.client_id) {
            let _ = session.tx.try_send(LinkEvent::Closed);
        }
        log::info!("[SIM] {} disconnected", self.client_id);
        Ok(())
    }

    fn abort(&mut self) {
        let mut state = lock(&self.state);
        if state.live(&self.client_id, self.session_id).is_none() {
            return;
        }
        if let Some(session) = state.sessions.remove(&self.client_id) {
            state.fire_will(session.will);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(client_id: &str, will_topic: Option<&str>) -> SessionPlan {
        SessionPlan {
            client_id: client_id.to_string(),
            host: "sim".into(),
            port: 1883,
            credentials: None,
            keep_alive_secs: 30,
            max_packet_size: 4096,
            ca_pem: None,
            will: will_topic.map(|topic| WillMessage {
                topic: topic.to_string(),
                payload: b"gone".to_vec(),
                retain: true,
            }),
        }
    }

    fn drain(session: &mut BrokerSession) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = session.events.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_retained_replay_on_subscribe() {
        let broker = SimBroker::new();
        let mut a = broker.open(&plan("a", None)).unwrap();
        a.link.publish("status/a", b"online", true).unwrap();

        let mut b = broker.open(&plan("b", None)).unwrap();
        b.link.subscribe("status/+").unwrap();

        let events = drain(&mut b);
        assert_eq!(events[0], LinkEvent::Connected);
        assert_eq!(
            events[1],
            LinkEvent::Message {
                topic: "status/a".into(),
                payload: b"online".to_vec(),
                retained: true
            }
        );
    }

    #[test]
    fn test_empty_retained_payload_clears_topic() {
        let broker = SimBroker::new();
        broker.inject("status/x", b"online", true);
        assert!(broker.retained("status/x").is_some());
        broker.inject("status/x", b"", true);
        assert!(broker.retained("status/x").is_none());
    }

    #[test]
    fn test_graceful_disconnect_skips_will() {
        let broker = SimBroker::new();
        let mut a = broker.open(&plan("a", Some("status/a"))).unwrap();
        a.link.disconnect().unwrap();
        assert!(broker.retained("status/a").is_none());
        assert_eq!(drain(&mut a).last(), Some(&LinkEvent::Closed));
    }

    #[test]
    fn test_abrupt_drop_fires_will() {
        let broker = SimBroker::new();
        let mut a = broker.open(&plan("a", Some("status/a"))).unwrap();
        let mut b = broker.open(&plan("b", None)).unwrap();
        b.link.subscribe("status/#").unwrap();

        assert!(broker.drop_client("a"));
        assert_eq!(broker.retained("status/a"), Some(b"gone".to_vec()));
        assert!(matches!(drain(&mut a).last(), Some(LinkEvent::Lost(_))));
        assert!(drain(&mut b)
            .iter()
            .any(|e| matches!(e, LinkEvent::Message { topic, .. } if topic == "status/a")));
        assert!(!broker.drop_client("a"));
    }

    #[test]
    fn test_stale_link_cannot_publish() {
        let broker = SimBroker::new();
        let mut first = broker.open(&plan("a", None)).unwrap();
        let _second = broker.open(&plan("a", None)).unwrap();
        assert!(first.link.publish("t", b"x", false).is_err());
        assert!(matches!(drain(&mut first).last(), Some(LinkEvent::Lost(_))));
    }

    #[test]
    fn test_refused_and_unreachable() {
        let broker = SimBroker::new();
        broker.set_refuse(true);
        let mut refused = broker.open(&plan("a", None)).unwrap();
        assert!(matches!(drain(&mut refused)[0], LinkEvent::Refused(_)));
        assert!(!broker.is_connected("a"));

        broker.set_unreachable(true);
        assert!(broker.open(&plan("a", None)).is_err());
        assert_eq!(broker.connect_count(), 1);
    }
}
