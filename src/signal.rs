use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::messages::TriggerEvent;

#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self, addr: &str) -> std::io::Result<Self::Stream>;
}

pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, addr: &str) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("send failed: {0}")]
    Send(std::io::Error),

    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),
}

#[derive(Debug)]
pub enum SignalOutcome {
    /// Fire byte written and the listener answered.
    Acknowledged(Vec<u8>),
    /// Fire byte written but no acknowledgment arrived. Still counts as sent.
    Unacknowledged(String),
    Failed(SignalError),
}

impl SignalOutcome {
    pub fn is_sent(&self) -> bool {
        !matches!(self, SignalOutcome::Failed(_))
    }
}

/// One-shot trigger sender: a fresh connection per event, no retry.
pub struct SignalClient<C = TcpConnector> {
    connector: C,
    timeout: Duration,
}

impl<C: Connector> SignalClient<C> {
    pub fn new(connector: C, timeout: Duration) -> Self {
        SignalClient { connector, timeout }
    }

    /// Never fails towards the caller; every outcome is logged here.
    pub async fn send_trigger(&self, host: &str, port: u16) -> SignalOutcome {
        let addr = format!("{host}:{port}");
        info!("Attempting to connect to {addr}");

        let mut stream = match timeout(self.timeout, self.connector.connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return log_outcome(SignalOutcome::Failed(SignalError::Connect(err))),
            Err(_) => {
                return log_outcome(SignalOutcome::Failed(SignalError::ConnectTimeout(
                    self.timeout,
                )));
            }
        };

        let outcome = self.exchange(&mut stream).await;

        if let Err(err) = stream.shutdown().await {
            debug!("Error shutting down signal connection: {}", err);
        }
        drop(stream);
        debug!("Signal connection closed");

        log_outcome(outcome)
    }

    async fn exchange(&self, stream: &mut C::Stream) -> SignalOutcome {
        let fire = [TriggerEvent::Fire.as_byte()];
        match timeout(self.timeout, stream.write_all(&fire)).await {
            Ok(Ok(())) => debug!("Fire byte sent"),
            Ok(Err(err)) => return SignalOutcome::Failed(SignalError::Send(err)),
            Err(_) => return SignalOutcome::Failed(SignalError::SendTimeout(self.timeout)),
        }

        let mut ack = [0u8; 1024];
        match timeout(self.timeout, stream.read(&mut ack)).await {
            Ok(Ok(0)) => SignalOutcome::Unacknowledged("connection closed by listener".into()),
            Ok(Ok(n)) => SignalOutcome::Acknowledged(ack[..n].to_vec()),
            Ok(Err(err)) => SignalOutcome::Unacknowledged(err.to_string()),
            Err(_) => SignalOutcome::Unacknowledged(format!("timed out after {:?}", self.timeout)),
        }
    }
}

fn log_outcome(outcome: SignalOutcome) -> SignalOutcome {
    match &outcome {
        SignalOutcome::Acknowledged(ack) => info!("Received acknowledgment: {:?}", ack),
        SignalOutcome::Unacknowledged(reason) => warn!("No acknowledgment received: {}", reason),
        SignalOutcome::Failed(err) => warn!("Trigger signal failed: {}", err),
    }
    outcome
}
