use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde_derive::Deserialize;

use crate::dispatcher::DEFAULT_PUBLISH_TIMEOUT;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    pub sensor: Option<SensorConfig>,
    pub spotify: Option<SpotifyConfig>,
    pub bluesky: Option<BlueskyConfig>,
    pub twitter: Option<TwitterConfig>,
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub post: PostConfig,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ListenerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub idle_timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SensorConfig {
    pub server_host: String,
    pub server_port: Option<u16>,
    pub device_path: String,
    pub scale: Option<f64>,
    pub threshold: Option<f64>,
    pub poll_interval_ms: Option<u64>,
    pub signal_timeout_seconds: Option<u64>,
    pub led_path: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SpotifyConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct BlueskyConfig {
    pub handle: Option<String>,
    pub password: Option<String>,
    pub service: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct TwitterConfig {
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    pub access_token: Option<String>,
    pub access_token_secret: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PostConfig {
    pub footer: Option<String>,
    pub publish_timeout_seconds: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}

impl ListenerConfig {
    pub fn address(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("127.0.0.1"),
            self.port.unwrap_or(5001)
        )
    }
}

impl PostConfig {
    pub fn footer(&self) -> &str {
        self.footer.as_deref().unwrap_or("(Automated Post)")
    }

    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PUBLISH_TIMEOUT)
    }
}

/// Returns the configured value, or the environment variable `var` when the file omits it.
pub fn secret(value: &Option<String>, var: &str) -> Option<String> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [listener]
            host = "0.0.0.0"
            port = 6001
            idle_timeout_seconds = 10

            [sensor]
            server_host = "192.168.1.64"
            device_path = "/sys/bus/iio/devices/iio:device0/in_distance_raw"
            threshold = 0.1

            [spotify]
            client_id = "id"
            client_secret = "secret"

            [twitter]
            consumer_key = "ck"

            [mqtt]
            host = "localhost"
            port = 1883

            [post]
            footer = "(bot)"
            publish_timeout_seconds = 15
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert_eq!(config.listener.address(), "0.0.0.0:6001");
        assert_eq!(config.listener.idle_timeout_seconds, Some(10));
        let sensor = config.sensor.unwrap();
        assert_eq!(sensor.server_host, "192.168.1.64");
        assert_eq!(sensor.server_port, None);
        assert_eq!(sensor.threshold, Some(0.1));
        assert!(config.bluesky.is_none());
        assert_eq!(config.mqtt.unwrap().host, "localhost");
        assert_eq!(config.post.footer(), "(bot)");
        assert_eq!(config.post.publish_timeout(), Duration::from_secs(15));
        let twitter = config.twitter.unwrap();
        assert_eq!(twitter.consumer_key.as_deref(), Some("ck"));
        assert_eq!(twitter.access_token, None);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::de::from_str("").unwrap();
        assert_eq!(config.listener.address(), "127.0.0.1:5001");
        assert_eq!(config.post.footer(), "(Automated Post)");
        assert_eq!(config.post.publish_timeout(), DEFAULT_PUBLISH_TIMEOUT);
        assert!(config.spotify.is_none());
        assert!(config.twitter.is_none());
    }

    #[test]
    fn test_secret_prefers_file_value() {
        let value = Some("from-file".to_string());
        assert_eq!(
            secret(&value, "NOWPLAYING_RELAY_TEST_UNSET_VAR"),
            Some("from-file".to_string())
        );
        assert_eq!(secret(&None, "NOWPLAYING_RELAY_TEST_UNSET_VAR"), None);
        assert_eq!(
            secret(&Some(String::new()), "NOWPLAYING_RELAY_TEST_UNSET_VAR"),
            None
        );
    }
}
