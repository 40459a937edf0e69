use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS};
use serde_derive::Serialize;

use crate::config::{self, MqttConfig};
use crate::dispatcher::Publisher;
use crate::messages::Post;

const REQUEST_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct MqttPublisher {
    client: rumqttc::AsyncClient,
    topic: String,
}

#[derive(Debug, Serialize)]
struct NowPlayingMqttMessage<'a> {
    text: &'a str,
    alt_text: &'a str,
    image_mime: &'a str,
    image: String,
}

impl MqttPublisher {
    pub fn new(config: &MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "nowplaying-relay".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));
        // Cover art rides in the payload.
        mqttoptions.set_max_packet_size(4 * 1024 * 1024, 4 * 1024 * 1024);

        if let (Some(username), Some(password)) = (
            config::secret(&config.username, "MQTT_USERNAME"),
            config::secret(&config.password, "MQTT_PASSWORD"),
        ) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, REQUEST_QUEUE_CAPACITY);
        let topic_path = config.topic_path.as_deref().unwrap_or("nowplaying");

        (
            MqttPublisher {
                client,
                topic: format!("{}/{}/now_playing", topic_path, sanitize_name(&publisher_id)),
            },
            eventloop,
        )
    }

    /// Drives the connection; must be polled for any publish to leave the process.
    pub async fn event_loop(mut eventloop: rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                }
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::PubAck(ack))) => {
                    debug!("Publish {} acknowledged", ack.pkid);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn payload(post: &Post) -> serde_json::Result<String> {
    serde_json::to_string(&NowPlayingMqttMessage {
        text: &post.text,
        alt_text: &post.alt_text,
        image_mime: post.image.mime,
        image: STANDARD.encode(&post.image.bytes),
    })
}

#[async_trait]
impl Publisher for MqttPublisher {
    fn name(&self) -> &str {
        "MQTT"
    }

    /// Queues the message without waiting; a full queue means the broker is not
    /// draining it and the publish fails.
    async fn publish(&self, post: &Post) -> anyhow::Result<()> {
        info!("Announcing now playing on {}", self.topic);
        self.client
            .try_publish(&self.topic, QoS::AtLeastOnce, false, payload(post)?)
            .context("MQTT request queue is full; is the broker reachable?")?;
        Ok(())
    }
}

fn sanitize_name(name: &str) -> String {
    // Lowercased; anything outside [a-z0-9] becomes an underscore
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
