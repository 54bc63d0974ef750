//! MQTT publisher over the ESP-IDF client.

use super::{PublishError, Publisher};
use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration, QoS};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// [`Publisher`] backed by `EspMqttClient`. Messages go out at QoS 0.
pub struct MqttPublisher {
    client: EspMqttClient<'static>,
    connected: Arc<AtomicBool>,
}

impl MqttPublisher {
    pub fn connect(broker_url: &str, client_id: &str) -> Result<Self, PublishError> {
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            ..Default::default()
        };
        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        let client = EspMqttClient::new_cb(broker_url, &conf, move |event| {
            match event.payload() {
                EventPayload::Connected(_) => {
                    info!("MQTT connected");
                    flag.store(true, Ordering::SeqCst);
                }
                EventPayload::Disconnected => {
                    warn!("MQTT disconnected");
                    flag.store(false, Ordering::SeqCst);
                }
                other => debug!("MQTT event: {:?}", other),
            }
        })
        .map_err(|e| PublishError::Rejected(format!("client init: {:?}", e)))?;
        info!("MQTT client started for {}", broker_url);
        Ok(Self { client, connected })
    }
}

impl Publisher for MqttPublisher {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PublishError::NotConnected);
        }
        self.client
            .enqueue(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|e| PublishError::Rejected(format!("{:?}", e)))
    }
}
