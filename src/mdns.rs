use crate::discovery::{AdbServiceType, BrowseEvent, DiscoveredService, ServiceBrowser, ServiceRef};
use crate::protocol::AdbError;
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// [`ServiceBrowser`] backed by the `mdns-sd` responder.
///
/// `mdns-sd` resolves services itself, so a `Found` event is only forwarded
/// once the instance's address and port are known; [`resolve`] then reads
/// from the cache.
///
/// [`resolve`]: ServiceBrowser::resolve
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    resolved: Arc<Mutex<HashMap<String, DiscoveredService>>>,
    tasks: Mutex<HashMap<AdbServiceType, JoinHandle<()>>>,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self, AdbError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| AdbError::DiscoveryError(format!("Failed to start mDNS daemon: {}", e)))?;

        Ok(Self {
            daemon,
            resolved: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
        })
    }
}

fn full_type(service_type: AdbServiceType) -> String {
    format!("{}.local.", service_type.id())
}

fn to_discovered(info: &ServiceInfo, service_type: AdbServiceType) -> Option<DiscoveredService> {
    let addresses = info.get_addresses();
    let host: IpAddr = addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()?;

    Some(DiscoveredService {
        name: info.get_fullname().to_string(),
        service_type,
        host,
        port: info.get_port(),
    })
}

#[async_trait]
impl ServiceBrowser for MdnsBrowser {
    fn start_browsing(
        &self,
        service_type: AdbServiceType,
        events: mpsc::Sender<BrowseEvent>,
    ) -> Result<(), AdbError> {
        let ty = full_type(service_type);
        let receiver = self
            .daemon
            .browse(&ty)
            .map_err(|e| AdbError::DiscoveryError(format!("Failed to browse {}: {}", ty, e)))?;

        let resolved = self.resolved.clone();
        let handle = tokio::spawn(async move {
            log::debug!("mDNS: browsing {}", ty);
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(service) = to_discovered(&info, service_type) else {
                            log::debug!("mDNS: {} resolved without address", info.get_fullname());
                            continue;
                        };

                        let name = service.name.clone();
                        resolved
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(name.clone(), service);

                        let found = BrowseEvent::Found(ServiceRef { name, service_type });
                        if let Err(e) = events.try_send(found) {
                            log::warn!("mDNS: dropping event, queue unavailable: {}", e);
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        resolved
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&fullname);

                        let lost = BrowseEvent::Lost(ServiceRef {
                            name: fullname,
                            service_type,
                        });
                        if let Err(e) = events.try_send(lost) {
                            log::warn!("mDNS: dropping event, queue unavailable: {}", e);
                        }
                    }
                    ServiceEvent::ServiceFound(_, fullname) => {
                        log::trace!("mDNS: service found: {}", fullname);
                    }
                    ServiceEvent::SearchStarted(s) => log::trace!("mDNS: search started: {}", s),
                    ServiceEvent::SearchStopped(s) => log::trace!("mDNS: search stopped: {}", s),
                    #[allow(unreachable_patterns)]
                    _ => {}
                }
            }
            log::debug!("mDNS: browse channel for {} closed", ty);
        });

        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service_type, handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn resolve(&self, service: &ServiceRef) -> Option<DiscoveredService> {
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&service.name)
            .cloned()
    }

    fn stop_browsing(&self, service_type: AdbServiceType) {
        let ty = full_type(service_type);
        if let Err(e) = self.daemon.stop_browse(&ty) {
            log::debug!("mDNS: failed to stop browsing {}: {}", ty, e);
        }

        if let Some(handle) = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&service_type)
        {
            handle.abort();
        }

        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, service| service.service_type != service_type);
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            log::debug!("mDNS: shutdown failed: {}", e);
        }
    }
}
