use crate::auth::{AdbKeyStore, KeyIdentity, KeyStore};
use crate::client::AdbClient;
use crate::config::AdbConfig;
use crate::discovery::{AdbDiscovery, AdbServiceType, DiscoverySession, ServiceBrowser};
use crate::pairing::PairingClient;
use crate::protocol::AdbError;
use crate::transport::{connect_with_retry, Connector, TcpConnector};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

/// Errors surfaced by [`AdbManager`]
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("ADB server not found")]
    ServerNotFound,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS handshake failed: {0}")]
    SslHandshakeError(String),

    #[error("Failed to create key: {0}")]
    KeyCreationError(String),

    #[error("Pairing failed: {0}")]
    PairingError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<AdbError> for ManagerError {
    fn from(error: AdbError) -> Self {
        match error {
            AdbError::TlsError(msg) => ManagerError::SslHandshakeError(msg),
            AdbError::KeyError(msg) => ManagerError::KeyCreationError(msg),
            AdbError::PairingFailed(msg) => ManagerError::PairingError(msg),
            AdbError::DiscoveryError(_) => ManagerError::ServerNotFound,
            other @ (AdbError::InvalidMessage(_)
            | AdbError::AuthenticationFailed(_)
            | AdbError::ConnectionFailed(_)
            | AdbError::StreamError(_)
            | AdbError::Timeout
            | AdbError::IoError(_)
            | AdbError::NotConnected) => ManagerError::ConnectionError(other.to_string()),
        }
    }
}

/// Pairing codes are exactly six ASCII digits
pub fn validate_pairing_code(code: &str) -> Result<(), ManagerError> {
    if code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ManagerError::PairingError(
            "Pairing code must be 6 digits".to_string(),
        ))
    }
}

/// Runs shell commands and pairing against the wireless debugging daemon
/// on this device.
///
/// Commands are serialized by one lock and pairing by another, so a pairing
/// attempt never waits behind a command.
pub struct AdbManager {
    config: AdbConfig,
    key_store: AdbKeyStore,
    identity: OnceCell<Arc<KeyIdentity>>,
    connect_discovery: AdbDiscovery,
    pairing_discovery: AdbDiscovery,
    connector: Arc<dyn Connector>,
    command_lock: Mutex<()>,
    pairing_lock: Mutex<()>,
}

impl AdbManager {
    pub fn new(config: AdbConfig, store: Arc<dyn KeyStore>, browser: Arc<dyn ServiceBrowser>) -> Self {
        let key_store = AdbKeyStore::new(store, config.device_name.clone());
        Self {
            config,
            key_store,
            identity: OnceCell::new(),
            connect_discovery: AdbDiscovery::new(browser.clone(), AdbServiceType::Connect),
            pairing_discovery: AdbDiscovery::new(browser, AdbServiceType::Pairing),
            connector: Arc::new(TcpConnector),
            command_lock: Mutex::new(()),
            pairing_lock: Mutex::new(()),
        }
    }

    /// Replace the TCP connector used for ADB sessions
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn config(&self) -> &AdbConfig {
        &self.config
    }

    pub fn key_store(&self) -> &AdbKeyStore {
        &self.key_store
    }

    /// Load or create the installation identity once per manager.
    pub async fn identity(&self) -> Result<Arc<KeyIdentity>, ManagerError> {
        self.identity
            .get_or_try_init(|| async {
                let key_store = self.key_store.clone();
                // RSA generation takes long enough to stall the runtime
                let identity = tokio::task::spawn_blocking(move || key_store.get_or_create_key())
                    .await
                    .map_err(|e| ManagerError::Unknown(format!("Key task failed: {}", e)))?
                    .map_err(|e| ManagerError::KeyCreationError(e.to_string()))?;
                Ok::<_, ManagerError>(Arc::new(identity))
            })
            .await
            .cloned()
    }

    /// Run `command` in a fresh session and return its first output chunk.
    pub async fn execute_command(&self, command: &str) -> Result<String, ManagerError> {
        let _guard = self.command_lock.lock().await;

        let discovery = self.connect_discovery.session()?;
        let result = self.execute_locked(&discovery, command).await;
        drop(discovery);

        if let Err(e) = &result {
            log::warn!("Command failed: {}", e);
        }
        result
    }

    async fn execute_locked(
        &self,
        discovery: &DiscoverySession<'_>,
        command: &str,
    ) -> Result<String, ManagerError> {
        let port = discovery
            .wait_for_port(self.config.discovery_timeout())
            .await
            .ok_or(ManagerError::ServerNotFound)?;

        let identity = self.identity().await?;
        let addr = SocketAddr::new(self.config.host, port);
        log::debug!("Connecting to {}", addr);

        let stream =
            connect_with_retry(self.connector.as_ref(), addr, &self.config.retry_policy()).await?;

        let mut client = AdbClient::new(stream, identity, &self.config.banner)
            .with_max_payload(self.config.max_payload);
        let result = async {
            client.connect().await?;
            client.shell(command).await
        }
        .await;

        client.disconnect().await;
        result.map_err(ManagerError::from)
    }

    /// Pair with the daemon's pairing service on `port`.
    pub async fn pair(&self, port: u16, code: &str) -> Result<(), ManagerError> {
        let _guard = self.pairing_lock.lock().await;
        self.pair_locked(port, code).await
    }

    /// Discover the pairing port, then pair as [`pair`](Self::pair) does.
    pub async fn pair_with_code(&self, code: &str) -> Result<(), ManagerError> {
        let _guard = self.pairing_lock.lock().await;
        validate_pairing_code(code)?;

        let port = {
            let discovery = self.pairing_discovery.session()?;
            discovery
                .wait_for_port(self.config.discovery_timeout())
                .await
                .ok_or(ManagerError::ServerNotFound)?
        };
        self.pair_locked(port, code).await
    }

    async fn pair_locked(&self, port: u16, code: &str) -> Result<(), ManagerError> {
        validate_pairing_code(code)?;

        let identity = self.identity().await?;
        let addr = SocketAddr::new(self.config.host, port);

        PairingClient::new(identity)
            .pair(addr, code)
            .await
            .map_err(ManagerError::from)?;

        if let Err(e) = self.key_store.mark_paired() {
            log::warn!("Paired, but failed to record it: {}", e);
        }
        Ok(())
    }

    /// Whether the daemon currently accepts this installation's key.
    pub async fn is_paired(&self) -> bool {
        self.execute_command("exit").await.is_ok()
    }
}
