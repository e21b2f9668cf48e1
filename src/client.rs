use crate::auth::KeyIdentity;
use crate::protocol::{
    AdbError, AuthType, Command, ConnectionState, Message, Stream, ADB_STLS_VERSION, ADB_VERSION,
    MAX_PAYLOAD,
};
use crate::transport::{BoxedStream, TcpTransport};
use std::sync::Arc;

/// Banner sent in CNXN when none is configured
pub const DEFAULT_BANNER: &str = "host::features=shell_v2,cmd";

/// ADB client for a single wireless session
pub struct AdbClient {
    transport: TcpTransport,
    identity: Arc<KeyIdentity>,
    state: ConnectionState,
    next_local_id: u32,
    system_identity: String,
    max_payload: u32,
    device_banner: Option<String>,
}

impl AdbClient {
    /// Create a client over an already connected stream
    pub fn new(stream: BoxedStream, identity: Arc<KeyIdentity>, banner: &str) -> Self {
        Self {
            transport: TcpTransport::new(stream),
            identity,
            state: ConnectionState::Connecting,
            next_local_id: 1,
            system_identity: banner.to_string(),
            max_payload: MAX_PAYLOAD,
            device_banner: None,
        }
    }

    /// Advertise a smaller payload limit than [`MAX_PAYLOAD`]
    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload.clamp(1, MAX_PAYLOAD);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Payload limit agreed with the daemon
    pub fn max_payload(&self) -> u32 {
        self.transport.max_payload()
    }

    /// Banner the daemon sent in its CNXN, e.g. `device::ro.product.name=...;`
    pub fn device_banner(&self) -> Option<&str> {
        self.device_banner.as_deref()
    }

    /// Run the CNXN handshake, including STLS or legacy AUTH when requested
    pub async fn connect(&mut self) -> Result<(), AdbError> {
        self.state = ConnectionState::Negotiating;

        let banner = format!("{}\0", self.system_identity);
        self.transport
            .send_message(Command::Cnxn, ADB_VERSION, self.max_payload, banner.as_bytes())
            .await?;

        let (response, response_data) = self.transport.recv_message().await?;

        let result = match response.command {
            Command::Cnxn => {
                // Device accepted connection without auth
                self.on_connected(&response, &response_data);
                Ok(())
            }
            Command::Stls => self.start_tls().await,
            Command::Auth => self.authenticate(response, response_data).await,
            other => Err(AdbError::ConnectionFailed(format!(
                "Unexpected response: {}",
                other
            ))),
        };

        if result.is_err() {
            self.state = ConnectionState::Closed;
        }
        result
    }

    /// Answer STLS and wait for CNXN inside the TLS session
    async fn start_tls(&mut self) -> Result<(), AdbError> {
        self.transport
            .send_message(Command::Stls, ADB_STLS_VERSION, 0, &[])
            .await?;

        let tls = self.identity.tls_context().clone();
        self.transport.upgrade_tls(&tls).await?;

        let (response, response_data) = self.transport.recv_message().await?;
        match response.command {
            Command::Cnxn => {
                self.on_connected(&response, &response_data);
                Ok(())
            }
            other => Err(AdbError::ConnectionFailed(format!(
                "Expected CNXN after TLS handshake, got {}",
                other
            ))),
        }
    }

    /// Handle authentication
    async fn authenticate(&mut self, auth_message: Message, token: Vec<u8>) -> Result<(), AdbError> {
        if auth_message.arg0 != AuthType::Token as u32 {
            return Err(AdbError::AuthenticationFailed(format!(
                "Unknown auth type: {}",
                auth_message.arg0
            )));
        }

        let signature = self.identity.sign(&token)?;
        self.transport
            .send_message(Command::Auth, AuthType::Signature as u32, 0, &signature)
            .await?;

        let (response, response_data) = self.transport.recv_message().await?;

        match response.command {
            Command::Cnxn => {
                self.on_connected(&response, &response_data);
                Ok(())
            }
            // Signature not recognised; offer the public key instead
            Command::Auth if response.arg0 == AuthType::Token as u32 => self.send_public_key().await,
            other => Err(AdbError::AuthenticationFailed(format!(
                "Unexpected response: {}",
                other
            ))),
        }
    }

    /// Send public key to device
    async fn send_public_key(&mut self) -> Result<(), AdbError> {
        let public_key = self.identity.public_key_blob().to_vec();
        self.transport
            .send_message(Command::Auth, AuthType::RsaPublicKey as u32, 0, &public_key)
            .await?;

        // Blocks until the user accepts the key on the device
        let (response, response_data) = self.transport.recv_message().await?;

        match response.command {
            Command::Cnxn => {
                self.on_connected(&response, &response_data);
                Ok(())
            }
            _ => Err(AdbError::AuthenticationFailed(
                "Device rejected public key".to_string(),
            )),
        }
    }

    fn on_connected(&mut self, response: &Message, banner: &[u8]) {
        let max_payload = match response.arg1 {
            0 => self.max_payload,
            theirs => theirs.min(self.max_payload),
        };
        self.transport.set_max_payload(max_payload);

        let banner = String::from_utf8_lossy(banner)
            .trim_end_matches('\0')
            .to_string();
        log::info!(
            "Connected to {} (version 0x{:08x}, max payload {}, tls {})",
            banner,
            response.arg0,
            max_payload,
            self.transport.is_tls()
        );

        self.device_banner = Some(banner);
        self.state = ConnectionState::Ready;
    }

    /// Open a new stream
    async fn open_stream(&mut self, destination: &str) -> Result<u32, AdbError> {
        if self.state != ConnectionState::Ready {
            return Err(AdbError::NotConnected);
        }

        let local_id = self.next_local_id;
        self.next_local_id += 1;

        let data = format!("{}\0", destination);
        self.transport
            .send_message(Command::Open, local_id, 0, data.as_bytes())
            .await?;

        self.state = ConnectionState::Streaming;
        Ok(local_id)
    }

    /// Execute a shell command and return the first chunk of output.
    ///
    /// Returns an empty string when the daemon closes the stream before
    /// writing anything.
    pub async fn shell(&mut self, command: &str) -> Result<String, AdbError> {
        let local_id = self.open_stream(&format!("shell:{}", command)).await?;
        let mut stream = Stream {
            local_id,
            remote_id: 0,
        };

        let result = self.read_shell_output(&mut stream).await;
        self.state = match result {
            Ok(_) => ConnectionState::Ready,
            Err(_) => ConnectionState::Closed,
        };
        result
    }

    async fn read_shell_output(&mut self, stream: &mut Stream) -> Result<String, AdbError> {
        loop {
            let (message, data) = self.transport.recv_message().await?;

            if message.arg1 != stream.local_id {
                return Err(AdbError::StreamError(format!(
                    "{} for stream {} while waiting on stream {}",
                    message.command, message.arg1, stream.local_id
                )));
            }

            match message.command {
                Command::Okay => {
                    stream.remote_id = message.arg0;
                }
                Command::Wrte => {
                    stream.remote_id = message.arg0;
                    if !data.is_empty() {
                        return String::from_utf8(data)
                            .map_err(|e| AdbError::IoError(format!("Invalid UTF-8: {}", e)));
                    }
                    self.transport
                        .send_message(Command::Okay, stream.local_id, stream.remote_id, &[])
                        .await?;
                }
                Command::Clse => {
                    self.transport
                        .send_message(Command::Clse, stream.local_id, message.arg0, &[])
                        .await?;
                    return Ok(String::new());
                }
                other => {
                    return Err(AdbError::StreamError(format!(
                        "Unexpected message: {}",
                        other
                    )));
                }
            }
        }
    }

    /// Disconnect from device
    pub async fn disconnect(&mut self) {
        self.transport.close().await;
        self.state = ConnectionState::Closed;
    }
}
