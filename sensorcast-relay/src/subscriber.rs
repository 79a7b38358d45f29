//! MQTT subscriber feeding the history buffer and the broadcast hub.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, SubscribeReasonCode,
};
use sensorcast_common::{MqttConfig, Record, generate_client_id};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::error::Result;
use crate::history::{HistoryBuffer, Snapshot};
use crate::hub::SharedHub;

/// Capacity of the request queue between the MQTT client and its event loop.
const REQUEST_CAPACITY: usize = 10;

/// Maintains the single upstream subscription.
///
/// Owns the history buffer; every accepted message is appended and the
/// resulting snapshot handed to the hub. Messages are handled one at a time,
/// so appends never interleave.
pub struct UpstreamSubscriber {
    hub: SharedHub,
    config: MqttConfig,
    history: HistoryBuffer,
    client_id: String,
}

impl UpstreamSubscriber {
    /// Create a new subscriber with a freshly generated client id.
    pub fn new(hub: SharedHub, config: MqttConfig, capacity: usize) -> Self {
        let client_id = generate_client_id(&config.client_id_prefix);
        Self {
            hub,
            config,
            history: HistoryBuffer::new(capacity),
            client_id,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// Ingest one upstream message.
    ///
    /// Returns the new snapshot, or `None` if the message was dropped because
    /// it arrived on another topic or its body is not valid UTF-8.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Option<Snapshot> {
        if topic != self.config.topic {
            trace!(topic, "Ignoring message on unexpected topic");
            return None;
        }

        self.hub.record_received();

        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                self.hub.record_dropped();
                warn!(
                    topic,
                    payload_len = payload.len(),
                    error = %e,
                    "Dropping message that is not valid text"
                );
                return None;
            }
        };

        debug!(topic, payload = %text, "Received message");

        let snapshot = self.history.append(Record::new(text));
        self.hub.record_accepted();
        self.hub.broadcast(snapshot.clone());

        Some(snapshot)
    }

    /// Called after every successful (re)connection: (re)subscribe.
    ///
    /// A failure to queue the subscription is logged; the next reconnection
    /// tries again.
    pub fn on_connected(&mut self, client: &AsyncClient) {
        match client.try_subscribe(self.config.topic.as_str(), QoS::AtMostOnce) {
            Ok(()) => debug!(topic = %self.config.topic, "Subscription requested"),
            Err(e) => error!(
                topic = %self.config.topic,
                error = %e,
                "Failed to request subscription"
            ),
        }
    }

    /// Called when the broker answers a subscription request.
    pub fn on_subscribe_ack(&mut self, return_codes: &[SubscribeReasonCode]) {
        let failed = return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));

        if failed || return_codes.is_empty() {
            self.hub.set_upstream_subscribed(false);
            error!(
                topic = %self.config.topic,
                codes = ?return_codes,
                "Broker rejected subscription"
            );
        } else {
            self.hub.set_upstream_subscribed(true);
            info!(topic = %self.config.topic, "Subscribed to topic");
        }
    }

    /// Called when the connection is lost or could not be established.
    pub fn on_disconnected(&mut self, reason: &str) {
        self.hub.set_upstream_subscribed(false);
        warn!(
            reason,
            retry_in_ms = self.config.reconnect_interval_ms,
            "MQTT connection unavailable, retrying"
        );
    }

    /// Run the subscriber until the shutdown signal is received.
    ///
    /// Connection failures never end the loop: the subscriber waits the
    /// configured interval and connects again, indefinitely.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let broker = self.config.broker_address()?;

        let mut options =
            MqttOptions::new(self.client_id.clone(), broker.host.clone(), broker.port);
        options.set_clean_session(true);
        options.set_keep_alive(self.config.keep_alive());

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let connect_timeout = self.config.connect_timeout();
        let reconnect_interval = self.config.reconnect_interval();

        info!(
            broker = %broker,
            topic = %self.config.topic,
            client_id = %self.client_id,
            "Connecting to MQTT broker"
        );

        let mut connected = false;

        loop {
            let polled = async {
                if connected {
                    Some(eventloop.poll().await)
                } else {
                    tokio::time::timeout(connect_timeout, eventloop.poll()).await.ok()
                }
            };

            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping subscriber");
                        break;
                    }
                    continue;
                }
                event = polled => event,
            };

            match event {
                Some(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code == ConnectReturnCode::Success {
                        connected = true;
                        info!(
                            broker = %broker,
                            session_present = ack.session_present,
                            "Connected to MQTT broker"
                        );
                        self.on_connected(&client);
                    } else {
                        connected = false;
                        self.on_disconnected(&format!("connection refused: {:?}", ack.code));
                        if wait_or_shutdown(reconnect_interval, &mut shutdown).await {
                            break;
                        }
                    }
                }
                Some(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                    self.on_subscribe_ack(&ack.return_codes);
                }
                Some(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    self.handle_message(&publish.topic, &publish.payload);
                }
                Some(Ok(other)) => {
                    trace!(event = ?other, "MQTT event");
                }
                Some(Err(e)) => {
                    connected = false;
                    self.on_disconnected(&e.to_string());
                    if wait_or_shutdown(reconnect_interval, &mut shutdown).await {
                        break;
                    }
                }
                None => {
                    self.on_disconnected(&format!(
                        "connect timed out after {} ms",
                        connect_timeout.as_millis()
                    ));
                    if wait_or_shutdown(reconnect_interval, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = client.try_disconnect() {
            debug!(error = %e, "Failed to request MQTT disconnect");
        }
        self.hub.set_upstream_subscribed(false);

        info!("Subscriber stopped");
        Ok(())
    }
}

/// Sleep for `delay`, returning `true` early if shutdown was signalled.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
