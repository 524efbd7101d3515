//! MQTT transport backed by `rumqttc`
//!
//! Each session owns one `AsyncClient` plus a pump task that polls the event
//! loop and forwards what the state machine cares about as [`LinkEvent`]s.
//! The pump stops on the first error; reconnecting is the connection
//! manager's job, not rumqttc's.

use crate::transport::{BrokerLink, BrokerSession, Connector, LinkError, LinkEvent, LinkResult, SessionPlan};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, LastWill, MqttOptions,
    Outgoing, QoS, TlsConfiguration, Transport,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Requests buffered between the link and the event loop.
const CLIENT_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Default, Clone)]
pub struct RumqttConnector;

impl RumqttConnector {
    pub fn new() -> Self {
        Self
    }
}

fn options_for(plan: &SessionPlan) -> MqttOptions {
    let mut opts = MqttOptions::new(&plan.client_id, &plan.host, plan.port);
    opts.set_keep_alive(Duration::from_secs(plan.keep_alive_secs.max(5)));
    opts.set_clean_session(true);
    opts.set_max_packet_size(plan.max_packet_size, plan.max_packet_size);

    if let Some(creds) = &plan.credentials {
        opts.set_credentials(&creds.username, &creds.password);
    }

    if let Some(will) = &plan.will {
        opts.set_last_will(LastWill::new(
            &will.topic,
            will.payload.clone(),
            QoS::AtLeastOnce,
            will.retain,
        ));
    }

    if let Some(ca) = &plan.ca_pem {
        opts.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: ca.as_bytes().to_vec(),
            alpn: None,
            client_auth: None,
        }));
    }

    opts
}

impl Connector for RumqttConnector {
    fn open(&self, plan: &SessionPlan) -> LinkResult<BrokerSession> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LinkError::Unreachable(format!("no async runtime for MQTT event loop: {e}")))?;

        let (client, eventloop) = AsyncClient::new(options_for(plan), CLIENT_CAPACITY);
        let (tx, events) = mpsc::channel(EVENT_CAPACITY);
        let pump = runtime.spawn(pump_events(eventloop, tx));

        debug!("MQTT session opening to {}:{} as {}", plan.host, plan.port, plan.client_id);
        Ok(BrokerSession {
            link: Box::new(RumqttLink {
                client,
                pump,
                closing: false,
            }),
            events,
        })
    }
}

async fn pump_events(mut eventloop: EventLoop, tx: mpsc::Sender<LinkEvent>) {
    loop {
        let forwarded = match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => match ack.code {
                ConnectReturnCode::Success => LinkEvent::Connected,
                code => LinkEvent::Refused(format!("{code:?}")),
            },
            Ok(Event::Incoming(Incoming::Publish(publish))) => LinkEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
                retained: publish.retain,
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = tx.send(LinkEvent::Closed).await;
                return;
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                let _ = tx.send(LinkEvent::Refused(format!("{code:?}"))).await;
                return;
            }
            Err(e) => {
                warn!("MQTT event loop stopped: {}", e);
                let _ = tx.send(LinkEvent::Lost(e.to_string())).await;
                return;
            }
        };

        if tx.send(forwarded).await.is_err() {
            // Session was replaced; nobody is listening.
            return;
        }
    }
}

struct RumqttLink {
    client: AsyncClient,
    pump: JoinHandle<()>,
    /// DISCONNECT queued; the pump exits on its own once it is sent.
    closing: bool,
}

impl RumqttLink {
    /// rumqttc reports a full and a closed request queue the same way; the
    /// pump tells them apart.
    fn classify(&self, err: ClientError) -> LinkError {
        if self.closing || self.pump.is_finished() {
            LinkError::Closed
        } else {
            debug!("MQTT request rejected: {}", err);
            LinkError::Backpressure
        }
    }
}

impl BrokerLink for RumqttLink {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> LinkResult<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|e| self.classify(e))
    }

    fn subscribe(&mut self, filter: &str) -> LinkResult<()> {
        self.client
            .try_subscribe(filter, QoS::AtLeastOnce)
            .map_err(|e| self.classify(e))
    }

    fn unsubscribe(&mut self, filter: &str) -> LinkResult<()> {
        self.client.try_unsubscribe(filter).map_err(|e| self.classify(e))
    }

    fn disconnect(&mut self) -> LinkResult<()> {
        self.client.try_disconnect().map_err(|e| self.classify(e))?;
        self.closing = true;
        Ok(())
    }

    fn abort(&mut self) {
        // Dropping the event loop drops the socket without a DISCONNECT packet.
        self.pump.abort();
    }
}

impl Drop for RumqttLink {
    fn drop(&mut self) {
        if !self.closing {
            self.pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Credentials, WillMessage};

    fn plan() -> SessionPlan {
        SessionPlan {
            client_id: "printmesh-a1".into(),
            host: "broker.local".into(),
            port: 8883,
            credentials: Some(Credentials {
                username: "mesh".into(),
                password: "secret".into(),
            }),
            keep_alive_secs: 30,
            max_packet_size: 4096,
            ca_pem: None,
            will: Some(WillMessage {
                topic: "status/a1".into(),
                payload: br#"{"status":"offline"}"#.to_vec(),
                retain: true,
            }),
        }
    }

    #[test]
    fn test_options_carry_session_plan() {
        let opts = options_for(&plan());
        assert_eq!(opts.client_id(), "printmesh-a1");
        assert_eq!(opts.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(opts.keep_alive(), Duration::from_secs(30));
        assert!(opts.clean_session());
        assert_eq!(opts.credentials(), Some(("mesh".to_string(), "secret".to_string())));

        let will = opts.last_will().expect("will configured");
        assert_eq!(will.topic, "status/a1");
        assert!(will.retain);
    }

    #[test]
    fn test_open_without_runtime_fails() {
        let err = RumqttConnector::new().open(&plan()).err().unwrap();
        assert!(matches!(err, LinkError::Unreachable(ref reason) if reason.contains("runtime")));
    }

    #[tokio::test]
    async fn test_requests_after_abort_report_closed() {
        let mut session = RumqttConnector::new().open(&plan()).unwrap();
        session.link.abort();

        for _ in 0..100 {
            if session.link.publish("status/a1", b"{}", true) == Err(LinkError::Closed) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("aborted session still accepts requests");
    }
}
