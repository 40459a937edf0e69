use std::net::IpAddr;
use std::time::Duration;

use log::{info, warn};
use tokio::net::{UdpSocket, lookup_host};

use crate::detector::EdgeDetector;
use crate::sensor::{DistanceSensor, Indicator};
use crate::signal::{Connector, SignalClient, SignalOutcome};

const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Sensor-side loop: sample, detect the rising edge, signal the listener.
pub struct SensorNode<S, I, C> {
    detector: EdgeDetector<S>,
    indicator: I,
    client: SignalClient<C>,
    host: String,
    port: u16,
    poll_interval: Duration,
}

impl<S, I, C> SensorNode<S, I, C>
where
    S: DistanceSensor,
    I: Indicator,
    C: Connector,
{
    pub fn new(
        detector: EdgeDetector<S>,
        indicator: I,
        client: SignalClient<C>,
        host: impl Into<String>,
        port: u16,
        poll_interval: Duration,
    ) -> Self {
        SensorNode {
            detector,
            indicator,
            client,
            host: host.into(),
            port,
            poll_interval,
        }
    }

    pub async fn run(&mut self) {
        loop {
            self.tick().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One poll. Blocks for the whole send when an edge is detected.
    pub async fn tick(&mut self) -> Option<SignalOutcome> {
        self.detector.poll().await?;
        info!("--- New trigger detected ---");

        self.set_indicator(true).await;
        let outcome = self.client.send_trigger(&self.host, self.port).await;
        self.set_indicator(false).await;

        if !outcome.is_sent() {
            warn!("Trigger lost; it will not be resent");
        }
        Some(outcome)
    }

    async fn set_indicator(&mut self, on: bool) {
        if let Err(err) = self.indicator.set(on).await {
            warn!("Could not switch indicator {}: {}", if on { "on" } else { "off" }, err);
        }
    }
}

/// Waits until this host has an address it can reach `host:port` from.
///
/// Asks the kernel for a route by connecting a UDP socket; nothing is sent.
pub async fn wait_for_network(host: &str, port: u16) -> IpAddr {
    loop {
        match local_route(host, port).await {
            Ok(ip) => {
                info!("Connected on {}", ip);
                return ip;
            }
            Err(err) => {
                info!("Waiting for connection... ({})", err);
                tokio::time::sleep(NETWORK_RETRY_DELAY).await;
            }
        }
    }
}

async fn local_route(host: &str, port: u16) -> std::io::Result<IpAddr> {
    let target = lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address for host"))?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no local address yet",
        ));
    }
    Ok(ip)
}
