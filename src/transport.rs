use crate::protocol::{self, AdbError, Command, Message, MAX_PAYLOAD};
use crate::tls::{self, TlsContext};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Byte stream an ADB session runs over
pub trait AdbStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AdbStream for T {}

pub type BoxedStream = Box<dyn AdbStream>;

/// Opens the raw byte stream to the daemon
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<BoxedStream>;
}

/// Plain TCP connector
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Bounded retry for the initial connect; the daemon's listener may still be starting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// Connect to `addr`, retrying with a fixed delay.
///
/// Returns [`AdbError::ConnectionFailed`] once every attempt has failed.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    addr: SocketAddr,
    policy: &RetryPolicy,
) -> Result<BoxedStream, AdbError> {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match connector.connect(addr).await {
            Ok(stream) => {
                log::debug!("Connected to {} on attempt {}", addr, attempt);
                return Ok(stream);
            }
            Err(e) => {
                log::warn!("Connection attempt {}/{} to {} failed: {}", attempt, attempts, addr, e);
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    Err(AdbError::ConnectionFailed(format!(
        "Could not connect to {} after {} attempts: {}",
        addr,
        attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

enum Channel {
    Plain(BoxedStream),
    Tls(Box<TlsStream<BoxedStream>>),
    Closed,
}

/// Frame-level transport over TCP, optionally upgraded to TLS in place
pub struct TcpTransport {
    channel: Channel,
    max_payload: u32,
}

impl TcpTransport {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            channel: Channel::Plain(stream),
            max_payload: MAX_PAYLOAD,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.channel, Channel::Tls(_))
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    pub fn set_max_payload(&mut self, max_payload: u32) {
        self.max_payload = max_payload;
    }

    /// Run the TLS client handshake over the current socket.
    pub async fn upgrade_tls(&mut self, tls: &TlsContext) -> Result<(), AdbError> {
        let server_name = tls::server_name()?;

        let stream = match std::mem::replace(&mut self.channel, Channel::Closed) {
            Channel::Plain(stream) => stream,
            other => {
                self.channel = other;
                return Err(AdbError::TlsError(
                    "TLS requested on a connection that is not plain TCP".to_string(),
                ));
            }
        };

        let stream = tls
            .connector()
            .connect(server_name, stream)
            .await
            .map_err(|e| AdbError::TlsError(format!("TLS handshake failed: {}", e)))?;

        log::debug!("TLS session established");
        self.channel = Channel::Tls(Box::new(stream));
        Ok(())
    }

    /// Send raw data to device
    pub async fn write(&mut self, data: &[u8]) -> Result<(), AdbError> {
        match &mut self.channel {
            Channel::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Channel::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Channel::Closed => return Err(AdbError::NotConnected),
        }
        Ok(())
    }

    /// Send an ADB message; checksums are zeroed once TLS is active
    pub async fn send_message(
        &mut self,
        command: Command,
        arg0: u32,
        arg1: u32,
        data: &[u8],
    ) -> Result<(), AdbError> {
        let message = if self.is_tls() {
            Message::without_checksum(command, arg0, arg1, data)
        } else {
            Message::new(command, arg0, arg1, data)
        };

        log::trace!("-> {} arg0={} arg1={} len={}", command, arg0, arg1, data.len());
        self.write(&protocol::encode(&message, data)).await
    }

    /// Receive an ADB message
    pub async fn recv_message(&mut self) -> Result<(Message, Vec<u8>), AdbError> {
        let max_payload = self.max_payload;
        let (message, data) = match &mut self.channel {
            Channel::Plain(stream) => protocol::decode(stream, max_payload).await?,
            Channel::Tls(stream) => protocol::decode(stream.as_mut(), max_payload).await?,
            Channel::Closed => return Err(AdbError::NotConnected),
        };

        // Daemons that negotiated a checksum-free version send zero; inside TLS
        // the record layer already guarantees integrity.
        if !self.is_tls() && message.data_crc32 != 0 && !message.verify_data(&data) {
            return Err(AdbError::InvalidMessage("Data checksum mismatch".to_string()));
        }

        log::trace!(
            "<- {} arg0={} arg1={} len={}",
            message.command,
            message.arg0,
            message.arg1,
            data.len()
        );
        Ok((message, data))
    }

    /// Close the connection. Shutdown failures are logged and swallowed.
    pub async fn close(&mut self) {
        let result = match &mut self.channel {
            Channel::Plain(stream) => stream.shutdown().await,
            Channel::Tls(stream) => stream.shutdown().await,
            Channel::Closed => return,
        };

        if let Err(e) = result {
            log::debug!("Error while closing connection: {}", e);
        }
        self.channel = Channel::Closed;
    }
}
