//! MQTT pub/sub forwarding.
//!
//! Each write is published (QoS 0, not retained) to `<namespace>/<path>`
//! with the raw submitted value as payload. The client also subscribes to
//! `<namespace>/#`; inbound messages are only logged.

use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use sparcus_common::RequestPath;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ForwardError, ForwardUpdate, Forwarder};

const SINK: &str = "mqtt";

/// Capacity of the client's outgoing request queue.
const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Pause before the event loop retries a failed connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
}

/// Topic for a request path under `namespace`.
pub fn topic_for(namespace: &str, path: &RequestPath) -> String {
    format!("{}/{}", namespace.trim_end_matches('/'), path)
}

/// Wildcard subscription covering the whole namespace.
pub fn subscription_for(namespace: &str) -> String {
    format!("{}/#", namespace.trim_end_matches('/'))
}

pub struct MqttForwarder {
    client: Client,
    namespace: String,
    shutdown: Arc<AtomicBool>,
}

impl MqttForwarder {
    /// Create the client and start its event loop thread.
    ///
    /// Connecting happens in the background; publishes made before the
    /// broker is reachable wait in the client's request queue.
    pub fn connect(settings: &MqttSettings) -> Result<Self, ForwardError> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !settings.username.is_empty() {
            options.set_credentials(&settings.username, &settings.password);
        }

        let (client, connection) = Client::new(options, REQUEST_QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let loop_client = client.clone();
        let loop_shutdown = Arc::clone(&shutdown);
        let subscription = subscription_for(&settings.namespace);
        thread::Builder::new()
            .name("sparcus-mqtt".to_string())
            .spawn(move || event_loop(connection, loop_client, subscription, loop_shutdown))
            .map_err(|e| ForwardError::Mqtt(format!("failed to spawn event loop: {e}")))?;

        info!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            "mqtt forwarder started"
        );

        Ok(Self {
            client,
            namespace: settings.namespace.clone(),
            shutdown,
        })
    }
}

impl Forwarder for MqttForwarder {
    fn name(&self) -> &'static str {
        SINK
    }

    fn forward(&self, update: &ForwardUpdate) -> Result<(), ForwardError> {
        let topic = topic_for(&self.namespace, &update.path);
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, update.raw_value.clone())
            .map_err(|e| ForwardError::Mqtt(e.to_string()))
    }
}

impl Drop for MqttForwarder {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.client.try_disconnect();
    }
}

/// Drive the connection, (re)subscribing on every connect and logging
/// inbound messages.
fn event_loop(
    mut connection: Connection,
    client: Client,
    subscription: String,
    shutdown: Arc<AtomicBool>,
) {
    for notification in connection.iter() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(topic = %subscription, "mqtt connected, subscribing");
                if let Err(e) = client.try_subscribe(subscription.as_str(), QoS::AtMostOnce) {
                    warn!(error = %e, "mqtt subscribe failed");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                info!(
                    topic = %publish.topic,
                    payload = %String::from_utf8_lossy(&publish.payload),
                    "mqtt message received"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt connection error");
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
    debug!("mqtt event loop stopped");
}
