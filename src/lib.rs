//! wadb-rs - wireless ADB (Android Debug Bridge) client in Rust
//!
//! Talks to the wireless debugging daemon running on the same device: finds it
//! over mDNS, authenticates with an RSA key (TLS 1.3 or legacy AUTH), runs
//! shell commands and pairs new keys using the six-digit pairing code.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wadb_rs::{AdbConfig, AdbManager, FileKeyStore, MdnsBrowser};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = AdbManager::new(
//!     AdbConfig::default(),
//!     Arc::new(FileKeyStore::new("adbkey.json")),
//!     Arc::new(MdnsBrowser::new()?),
//! );
//!
//! // Pair once with the code shown under Developer options > Wireless debugging
//! manager.pair_with_code("123456").await?;
//!
//! let output = manager.execute_command("getprop ro.product.model").await?;
//! println!("{}", output);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod discovery;
pub mod manager;
pub mod mdns;
pub mod pairing;
pub mod protocol;
pub mod tls;
pub mod transport;

// Re-export main types
pub use auth::{AdbKeyPair, AdbKeyStore, FileKeyStore, KeyIdentity, KeyStore, MemoryKeyStore};
pub use client::AdbClient;
pub use config::AdbConfig;
pub use discovery::{
    AdbDiscovery, AdbServiceType, BrowseEvent, DiscoveredService, DiscoverySession, ServiceBrowser,
    ServiceRef,
};
pub use manager::{AdbManager, ManagerError};
pub use mdns::MdnsBrowser;
pub use pairing::PairingClient;
pub use protocol::{AdbError, Command, ConnectionState, Message};
pub use transport::{Connector, TcpConnector};
