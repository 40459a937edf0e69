use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use log::{LevelFilter, info, warn};

mod bluesky;
mod config;
mod cover;
mod detector;
mod dispatcher;
mod listener;
mod messages;
mod mqtt;
mod node;
mod sensor;
mod signal;
mod spotify;
mod twitter;

use crate::config::{AppConfig, SensorConfig};
use crate::dispatcher::{Dispatcher, Publisher};
use crate::listener::TriggerListener;
use crate::sensor::{IioDistanceSensor, Indicator, NoIndicator, SysfsLed};
use crate::signal::{SignalClient, TcpConnector};

#[derive(Parser, Debug)]
#[command(version, about = "Proximity-triggered now-playing announcer")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "RELAY_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept trigger signals and publish what is playing
    Listen,
    /// Watch the distance sensor and signal the listener on every approach
    Sensor,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Command::Listen => listen(&config).await,
        Command::Sensor => {
            let sensor = config
                .sensor
                .as_ref()
                .context("[sensor] section missing from config")?;
            run_sensor(sensor).await
        }
    }
}

async fn listen(config: &AppConfig) -> anyhow::Result<()> {
    let spotify_config = config.spotify.clone().unwrap_or_default();
    let spotify = spotify::SpotifyClient::connect(&spotify_config)
        .await
        .context("setting up Spotify")?;

    let mut publishers: Vec<Box<dyn Publisher>> = Vec::new();
    if let Some(bluesky_config) = &config.bluesky {
        let bluesky = bluesky::BlueskyPublisher::login(bluesky_config)
            .await
            .context("setting up Bluesky")?;
        publishers.push(Box::new(bluesky));
    }

    if let Some(twitter_config) = &config.twitter {
        let twitter = twitter::TwitterPublisher::connect(twitter_config)
            .await
            .context("setting up Twitter")?;
        publishers.push(Box::new(twitter));
    }

    let mut mqtt_client = None;
    if let Some(mqtt_config) = &config.mqtt {
        let (client, eventloop) = mqtt::MqttPublisher::new(mqtt_config);
        tokio::spawn(mqtt::MqttPublisher::event_loop(eventloop));
        mqtt_client = Some(client.clone());
        publishers.push(Box::new(client));
    }

    if publishers.is_empty() {
        bail!("no publishers configured; add a [bluesky], [twitter] or [mqtt] section");
    }
    info!(
        "Publishing to: {}",
        publishers.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
    );

    let dispatcher = Dispatcher::new(
        Box::new(spotify),
        Box::new(cover::HttpCoverFetcher::new()?),
        publishers,
        config.post.footer(),
    )
    .with_publish_timeout(config.post.publish_timeout());

    let address = config.listener.address();
    let idle_timeout = Duration::from_secs(config.listener.idle_timeout_seconds.unwrap_or(30));
    let listener = TriggerListener::bind(&address, dispatcher, idle_timeout)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!("Server listening on {}", listener.local_addr()?);

    tokio::select! {
        _ = listener.run() => {}
        res = tokio::signal::ctrl_c() => res?,
    }
    info!("Shutting down listener");

    if let Some(client) = mqtt_client {
        if let Err(err) = client.disconnect().await {
            warn!("Error disconnecting MQTT client: {}", err);
        }
    }
    Ok(())
}

async fn run_sensor(config: &SensorConfig) -> anyhow::Result<()> {
    let port = config.server_port.unwrap_or(5001);
    node::wait_for_network(&config.server_host, port).await;

    let detector = detector::EdgeDetector::new(
        IioDistanceSensor::new(&config.device_path, config.scale.unwrap_or(0.001)),
        config.threshold.unwrap_or(0.1),
    );
    let indicator: Box<dyn Indicator> = match &config.led_path {
        Some(path) => Box::new(SysfsLed::new(path)),
        None => Box::new(NoIndicator),
    };
    let client = SignalClient::new(
        TcpConnector,
        Duration::from_secs(config.signal_timeout_seconds.unwrap_or(5)),
    );
    let mut node = node::SensorNode::new(
        detector,
        indicator,
        client,
        &config.server_host,
        port,
        Duration::from_millis(config.poll_interval_ms.unwrap_or(100)),
    );

    info!("Watching {}", config.device_path);
    tokio::select! {
        _ = node.run() => {}
        res = tokio::signal::ctrl_c() => res?,
    }
    info!("Shutting down sensor node");
    Ok(())
}
