//! The port mapping owned by a [`Session`].

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    num::NonZeroU16,
    sync::Arc,
};

use tracing::{debug, info, trace, warn};

use crate::{
    config::Config,
    gateway::{Discovery, Error as DiscoveryError, Gateway},
    metrics::Metrics,
    nat_pmp::protocol::{Request, Response},
};

/// A mapping sucessfully registered with a NAT-PMP server.
///
/// The internal and external port are always the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Port forwarded by the gateway.
    port: NonZeroU16,
    /// Public address of the gateway.
    public_ip: Ipv4Addr,
    /// Allowed time for this mapping as informed by the server.
    lifetime_seconds: u32,
}

impl Mapping {
    /// Port mapped on both sides of the gateway.
    pub fn port(&self) -> NonZeroU16 {
        self.port
    }

    /// Address on which peers can reach the mapped port.
    pub fn external_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.public_ip, self.port.get())
    }

    /// Lifetime granted by the gateway.
    pub fn lifetime_seconds(&self) -> u32 {
        self.lifetime_seconds
    }
}

/// State of the mapping owned by a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MappingState {
    /// No mapping exists.
    #[default]
    Unmapped,
    /// A mapping for this port is being negotiated.
    Requested(NonZeroU16),
    /// The gateway granted this mapping.
    Active(Mapping),
}

impl MappingState {
    /// The mapping, if it is active.
    pub fn active(&self) -> Option<&Mapping> {
        match self {
            MappingState::Active(mapping) => Some(mapping),
            _ => None,
        }
    }
}

/// Owns the gateway discovery and the single mapping.
///
/// Calls must not overlap; the [`Client`](crate::Client) serializes them on its worker.
#[derive(Debug)]
pub struct Session {
    discovery: Discovery,
    lifetime_seconds: u32,
    state: MappingState,
    metrics: Arc<Metrics>,
}

impl Session {
    /// Creates a session without a mapping.
    pub fn new(discovery: Discovery, config: &Config, metrics: Arc<Metrics>) -> Self {
        Session {
            discovery,
            lifetime_seconds: config.lifetime_seconds,
            state: MappingState::Unmapped,
            metrics,
        }
    }

    /// Current state of the mapping.
    pub fn state(&self) -> MappingState {
        self.state
    }

    /// Discovers the gateway, if not done yet, and returns its public address.
    pub async fn discover(&mut self) -> Result<Ipv4Addr, DiscoveryError> {
        self.discovery.discover().await.map(Gateway::public_ip)
    }

    /// Maps `port` on the gateway, releasing a mapping for any other port first.
    ///
    /// A request for the port that is already mapped is negotiated again. Returns whether the
    /// gateway granted the mapping.
    pub async fn request_mapping(&mut self, port: u16) -> bool {
        self.metrics.mapping_requests.inc();
        let Some(port) = NonZeroU16::new(port) else {
            warn!("refusing to map port 0");
            self.metrics.mappings_failed.inc();
            return false;
        };

        if let Some(old) = self.state.active() {
            if old.port != port {
                debug!(old = %old.port, new = %port, "replacing mapping");
                self.release_mapping().await;
            }
        }

        match self.try_map(port).await {
            Some(mapping) => {
                info!(
                    external = %mapping.external_addr(),
                    lifetime = mapping.lifetime_seconds,
                    "mapped port {port}"
                );
                self.metrics.mappings_created.inc();
                self.state = MappingState::Active(mapping);
                true
            }
            None => {
                warn!("failed to map port {port}");
                self.metrics.mappings_failed.inc();
                self.state = MappingState::Unmapped;
                false
            }
        }
    }

    /// Releases the active mapping, if any.
    ///
    /// The local state is cleared whether the gateway acknowledges the release or not.
    pub async fn release_mapping(&mut self) {
        let Some(mapping) = self.state.active().copied() else {
            trace!("no mapping to release");
            return;
        };
        self.state = MappingState::Unmapped;
        self.metrics.mappings_released.inc();

        let Some(gateway) = self.discovery.gateway() else {
            debug!("no gateway to release the mapping with");
            return;
        };
        let request = Request::symmetric_mapping(mapping.port.get(), 0);
        match gateway.transport().send(&request).await {
            Ok(response) => debug!(?response, "released mapping for port {}", mapping.port),
            Err(e) => debug!("failed to release mapping for port {}: {e}", mapping.port),
        }
    }

    async fn try_map(&mut self, port: NonZeroU16) -> Option<Mapping> {
        self.state = MappingState::Requested(port);
        let gateway = match self.discovery.discover().await {
            Ok(gateway) => gateway,
            Err(e) => {
                debug!("no gateway to map port {port}: {e}");
                return None;
            }
        };
        negotiate(gateway, port, self.lifetime_seconds).await
    }
}

async fn negotiate(gateway: &Gateway, port: NonZeroU16, lifetime_seconds: u32) -> Option<Mapping> {
    let request = Request::symmetric_mapping(port.get(), lifetime_seconds);
    match gateway.transport().send(&request).await {
        Ok(Response::PortMap {
            external_port,
            lifetime_seconds,
            ..
        }) if external_port == port.get() => Some(Mapping {
            port,
            public_ip: gateway.public_ip(),
            lifetime_seconds,
        }),
        Ok(response) => {
            warn!(?response, "gateway mapped port {port} to another port");
            None
        }
        Err(e) => {
            warn!("mapping port {port} failed: {e}");
            None
        }
    }
}
