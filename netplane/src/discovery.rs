//! Default route discovery.
//!
//! [`Discovery`] runs the platform driver's discovery once in a background
//! task and hands the same [`NetworkState`] to every caller. A new handle
//! discovers again.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use ipnet::IpNet;
use tokio::sync::{oneshot, OnceCell};

use crate::driver::PlatformNetworkDriver;
use crate::error::{Error, Result};
use crate::kernel::KernelNetwork;
use crate::route::{AddressFamily, NetworkState, Route};

type Outcome = std::result::Result<Arc<NetworkState>, String>;

/// Single-flight handle to the host's discovered network state
pub struct Discovery {
    driver: Arc<dyn PlatformNetworkDriver>,
    pending: Mutex<Option<oneshot::Receiver<Result<NetworkState>>>>,
    result: OnceCell<Outcome>,
}

impl Discovery {
    /// Start discovering in the background. Must be called inside a
    /// tokio runtime.
    pub fn spawn(driver: Arc<dyn PlatformNetworkDriver>) -> Self {
        let (tx, rx) = oneshot::channel();
        let task_driver = driver.clone();
        tokio::spawn(async move {
            log::debug!("Discovering default routes ({})", task_driver.name());
            let result = task_driver.discover_default_route().await;
            // the handle may already be gone
            let _ = tx.send(result);
        });
        Self {
            driver,
            pending: Mutex::new(Some(rx)),
            result: OnceCell::new(),
        }
    }

    /// A handle that is already complete
    pub fn ready(driver: Arc<dyn PlatformNetworkDriver>, state: NetworkState) -> Self {
        Self {
            driver,
            pending: Mutex::new(None),
            result: OnceCell::new_with(Some(Ok(Arc::new(state)))),
        }
    }

    pub fn driver(&self) -> Arc<dyn PlatformNetworkDriver> {
        self.driver.clone()
    }

    /// Wait for discovery to finish. Every call returns the same outcome.
    pub async fn wait(&self) -> Result<Arc<NetworkState>> {
        let outcome = self
            .result
            .get_or_init(|| async {
                let rx = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                let Some(rx) = rx else {
                    return Err("discovery was abandoned".to_string());
                };
                match rx.await {
                    Ok(Ok(state)) => {
                        log::info!(
                            "Discovered default device {}",
                            state.device_name.as_deref().unwrap_or("(none)")
                        );
                        Ok(Arc::new(state))
                    }
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("discovery task ended without a result".to_string()),
                }
            })
            .await;
        outcome.clone().map_err(Error::Discovery)
    }
}

/// Build a [`NetworkState`] from a kernel route dump: IPv4 first, then
/// IPv6. Routes without a source address get the first address of their
/// interface, preferring the route's family.
pub async fn discover_with_kernel(kernel: &dyn KernelNetwork) -> Result<NetworkState> {
    let mut routes = kernel.list_routes(AddressFamily::V4).await?;
    match kernel.list_routes(AddressFamily::V6).await {
        Ok(v6) => routes.extend(v6),
        Err(e) => log::warn!("Failed to list IPv6 routes: {}", e),
    }

    let mut addresses: HashMap<String, Vec<IpNet>> = HashMap::new();
    for route in &mut routes {
        if route.source.is_some() {
            continue;
        }
        let Some(link) = route.link.clone() else {
            continue;
        };
        if !addresses.contains_key(&link.name) {
            let found = match kernel.interface_addresses(&link).await {
                Ok(found) => found,
                Err(e) => {
                    log::debug!("No addresses for {}: {}", link, e);
                    Vec::new()
                }
            };
            addresses.insert(link.name.clone(), found);
        }
        route.source = pick_source(route, &addresses[&link.name]);
    }

    Ok(NetworkState::from_routes(routes))
}

fn pick_source(route: &Route, addresses: &[IpNet]) -> Option<IpAddr> {
    let family = route.family();
    addresses
        .iter()
        .find(|a| AddressFamily::of_net(a) == family)
        .or_else(|| addresses.first())
        .map(IpNet::addr)
}
