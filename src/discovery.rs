//! Wireless debugging service discovery.
//!
//! A [`ServiceBrowser`] pushes found/lost events into a bounded queue. One
//! worker task drains it and resolves candidates strictly one at a time; a
//! resolved service only becomes the current port when it is announced by
//! this machine and something is actually listening on the port.

use crate::protocol::AdbError;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Capacity of the found/lost event queue
pub const EVENT_QUEUE_CAPACITY: usize = 16;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which wireless debugging endpoint to look for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdbServiceType {
    /// Daemon accepting ADB sessions
    Connect,
    /// Daemon accepting pairing requests
    Pairing,
}

impl AdbServiceType {
    /// DNS-SD service type without the domain
    pub fn id(&self) -> &'static str {
        match self {
            AdbServiceType::Connect => "_adb-tls-connect._tcp",
            AdbServiceType::Pairing => "_adb-tls-pairing._tcp",
        }
    }
}

/// A service instance reported by the browser, not yet resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub name: String,
    pub service_type: AdbServiceType,
}

/// A resolved service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub name: String,
    pub service_type: AdbServiceType,
    pub host: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Found(ServiceRef),
    Lost(ServiceRef),
}

/// Platform service browser.
///
/// Implementations push events with `try_send`; a full queue drops the event.
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    fn start_browsing(
        &self,
        service_type: AdbServiceType,
        events: mpsc::Sender<BrowseEvent>,
    ) -> Result<(), AdbError>;

    async fn resolve(&self, service: &ServiceRef) -> Option<DiscoveredService>;

    fn stop_browsing(&self, service_type: AdbServiceType);
}

/// Tracks the port of the local daemon for one service type
pub struct AdbDiscovery {
    browser: Arc<dyn ServiceBrowser>,
    service_type: AdbServiceType,
    port: Arc<watch::Sender<Option<u16>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AdbDiscovery {
    pub fn new(browser: Arc<dyn ServiceBrowser>, service_type: AdbServiceType) -> Self {
        let (port, _) = watch::channel(None);
        Self {
            browser,
            service_type,
            port: Arc::new(port),
            worker: Mutex::new(None),
        }
    }

    pub fn service_type(&self) -> AdbServiceType {
        self.service_type
    }

    /// Start browsing. Does nothing while already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), AdbError> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        self.port.send_replace(None);

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        self.browser.start_browsing(self.service_type, events_tx)?;

        log::debug!("Started discovery for {}", self.service_type.id());
        *worker = Some(tokio::spawn(run_resolver(
            self.browser.clone(),
            self.service_type,
            self.port.clone(),
            events_rx,
        )));
        Ok(())
    }

    /// Start browsing for as long as the returned guard lives.
    ///
    /// The guard stops discovery when dropped, including when the future
    /// holding it is cancelled.
    pub fn session(&self) -> Result<DiscoverySession<'_>, AdbError> {
        self.start()?;
        Ok(DiscoverySession { discovery: self })
    }

    /// Stop browsing and forget the current port.
    pub fn stop(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            handle.abort();
            self.browser.stop_browsing(self.service_type);
            log::debug!("Stopped discovery for {}", self.service_type.id());
        }
        self.port.send_replace(None);
    }

    pub fn current_port(&self) -> Option<u16> {
        *self.port.borrow()
    }

    /// Observe the current port as it changes
    pub fn subscribe(&self) -> watch::Receiver<Option<u16>> {
        self.port.subscribe()
    }

    /// Wait until a port is known, or give up after `timeout`
    pub async fn wait_for_port(&self, timeout: Duration) -> Option<u16> {
        let mut port = self.port.subscribe();
        let wait = async move {
            port.wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|value| *value)
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }
}

impl Drop for AdbDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Running discovery, stopped on drop
pub struct DiscoverySession<'a> {
    discovery: &'a AdbDiscovery,
}

impl DiscoverySession<'_> {
    pub async fn wait_for_port(&self, timeout: Duration) -> Option<u16> {
        self.discovery.wait_for_port(timeout).await
    }
}

impl Drop for DiscoverySession<'_> {
    fn drop(&mut self) {
        self.discovery.stop();
    }
}

async fn run_resolver(
    browser: Arc<dyn ServiceBrowser>,
    service_type: AdbServiceType,
    port: Arc<watch::Sender<Option<u16>>>,
    mut events: mpsc::Receiver<BrowseEvent>,
) {
    let mut active: Option<String> = None;

    while let Some(event) = events.recv().await {
        match event {
            BrowseEvent::Found(service) => {
                if service.service_type != service_type {
                    continue;
                }

                let resolved = match tokio::time::timeout(RESOLVE_TIMEOUT, browser.resolve(&service)).await {
                    Ok(Some(resolved)) => resolved,
                    Ok(None) => {
                        log::debug!("Could not resolve {}", service.name);
                        continue;
                    }
                    Err(_) => {
                        log::debug!("Timed out resolving {}", service.name);
                        continue;
                    }
                };

                let candidate = resolved.clone();
                let active_here = tokio::task::spawn_blocking(move || is_active_service(&candidate))
                    .await
                    .unwrap_or(false);
                if !active_here {
                    log::debug!(
                        "Ignoring {} at {}:{}",
                        resolved.name,
                        resolved.host,
                        resolved.port
                    );
                    continue;
                }

                log::info!(
                    "Found {} on port {}",
                    service_type.id(),
                    resolved.port
                );
                active = Some(resolved.name);
                port.send_replace(Some(resolved.port));
            }
            BrowseEvent::Lost(service) => {
                if active.as_deref() == Some(service.name.as_str()) {
                    log::info!("Lost {}", service.name);
                    active = None;
                    port.send_replace(None);
                }
            }
        }
    }
}

/// A candidate counts only if it lives on this host and its port is taken
pub fn is_active_service(service: &DiscoveredService) -> bool {
    is_local_address(service.host) && is_port_in_use(service.port)
}

/// Whether `host` is assigned to one of this machine's interfaces
pub fn is_local_address(host: IpAddr) -> bool {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.iter().any(|iface| iface.ip() == host),
        Err(e) => {
            log::warn!("Failed to enumerate network interfaces: {}", e);
            false
        }
    }
}

/// Whether something is listening on `127.0.0.1:port`
pub fn is_port_in_use(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_err()
}
