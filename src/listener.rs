use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, trace};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;

use crate::messages::{ACK, TriggerEvent};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn on_trigger(&self);
}

/// Source of inbound trigger connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Fired,
    Disconnected,
    IdleTimeout,
}

/// Serial single-connection acceptor for the trigger channel.
///
/// Connections are handled one at a time and dispatch runs inline, so at most one
/// trigger is ever in flight. Further clients wait in the kernel backlog.
pub struct TriggerListener<H, A = TcpListener> {
    listener: A,
    handler: H,
    idle_timeout: Duration,
}

impl<H: TriggerHandler> TriggerListener<H, TcpListener> {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        handler: H,
        idle_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(TriggerListener::new(listener, handler, idle_timeout))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl<H: TriggerHandler, A: Acceptor> TriggerListener<H, A> {
    /// `idle_timeout` bounds how long a connection may stay open without
    /// delivering a fire marker, however many other bytes it sends.
    pub fn new(listener: A, handler: H, idle_timeout: Duration) -> Self {
        TriggerListener {
            listener,
            handler,
            idle_timeout,
        }
    }

    pub async fn run(&self) {
        loop {
            if let Err(err) = self.serve_one().await {
                error!("Socket error: {}", err);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    /// Accepts a single connection and drives it to completion.
    ///
    /// Errors from the connection itself are logged here; only accept errors are
    /// returned.
    pub async fn serve_one(&self) -> io::Result<ConnectionOutcome> {
        let (stream, peer) = self.listener.accept().await?;
        info!("Connected by {}", peer);

        match self.handle_connection(stream).await {
            Ok(outcome) => {
                debug!("Connection from {} finished: {:?}", peer, outcome);
                Ok(outcome)
            }
            Err(err) => {
                error!("Unexpected error on connection from {}: {}", peer, err);
                Ok(ConnectionOutcome::Disconnected)
            }
        }
    }

    pub async fn handle_connection<S>(&self, mut stream: S) -> io::Result<ConnectionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let outcome = self.read_signal(&mut stream).await;
        if let Err(err) = stream.shutdown().await {
            trace!("Error shutting down connection: {}", err);
        }
        outcome
    }

    async fn read_signal<S>(&self, stream: &mut S) -> io::Result<ConnectionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // The deadline covers the whole wait, not each read; dispatch runs outside it.
        let fired = match timeout(self.idle_timeout, wait_for_fire(stream)).await {
            Ok(fired) => fired?,
            Err(_) => {
                info!("No signal within {:?}, closing connection", self.idle_timeout);
                return Ok(ConnectionOutcome::IdleTimeout);
            }
        };
        if !fired {
            return Ok(ConnectionOutcome::Disconnected);
        }

        info!("Update signal received!");
        if let Err(err) = stream.write_all(&[ACK]).await {
            debug!("Could not acknowledge signal: {}", err);
        }
        self.handler.on_trigger().await;
        Ok(ConnectionOutcome::Fired)
    }
}

/// Reads until a fire marker (`true`) or end of stream (`false`), skipping other bytes.
async fn wait_for_fire<S>(stream: &mut S) -> io::Result<bool>
where
    S: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 {
            return Ok(false);
        }
        match TriggerEvent::from_byte(byte[0]) {
            Some(TriggerEvent::Fire) => return Ok(true),
            None => trace!("Ignoring byte {:#04x}", byte[0]),
        }
    }
}
