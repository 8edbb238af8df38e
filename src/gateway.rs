//! Discovery of the NAT-PMP gateway.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    config::Config,
    metrics::Metrics,
    nat_pmp::{
        self,
        protocol::{self, Request, Response},
        Transport,
    },
};

/// Source of the address of the default gateway.
pub trait GatewayResolver: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the IPv4 address of the default gateway, if there is one.
    fn default_gateway(&self) -> Option<Ipv4Addr>;
}

/// Asks the operating system for the default gateway.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemGateway;

impl GatewayResolver for SystemGateway {
    fn default_gateway(&self) -> Option<Ipv4Addr> {
        match netdev::get_default_gateway() {
            Ok(gateway) => gateway.ipv4.first().copied(),
            Err(e) => {
                debug!("failed to read the default gateway: {e}");
                None
            }
        }
    }
}

/// Always returns the same gateway.
#[derive(Debug, Clone, Copy)]
pub struct FixedGateway(pub Ipv4Addr);

impl GatewayResolver for FixedGateway {
    fn default_gateway(&self) -> Option<Ipv4Addr> {
        Some(self.0)
    }
}

/// Errors that can occur when discovering the gateway.
///
/// Cloneable so a failed discovery can be reported again without probing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The system has no default IPv4 gateway.
    #[error("No default gateway")]
    NoDefaultGateway,
    /// The socket to talk to the gateway could not be created.
    #[error("Failed to bind a socket for {gateway}")]
    Bind {
        /// Address of the gateway.
        gateway: SocketAddrV4,
        /// Cause of the failure.
        source: Arc<std::io::Error>,
    },
    /// The gateway did not answer the public address probe.
    #[error("Gateway {gateway} does not speak NAT-PMP")]
    Probe {
        /// Address of the gateway.
        gateway: SocketAddrV4,
        /// Cause of the failure.
        source: Arc<nat_pmp::Error>,
    },
}

/// A gateway that answered a public address request.
#[derive(Debug)]
pub struct Gateway {
    transport: Transport,
    public_ip: Ipv4Addr,
}

impl Gateway {
    /// Address of the NAT-PMP server.
    pub fn addr(&self) -> SocketAddrV4 {
        self.transport.server()
    }

    /// Public address the gateway reported.
    pub fn public_ip(&self) -> Ipv4Addr {
        self.public_ip
    }

    /// Transport to send requests to this gateway.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

/// Discovers the gateway once and remembers the outcome.
///
/// A failed discovery is never retried for the lifetime of this value.
#[derive(Debug)]
pub struct Discovery {
    resolver: Box<dyn GatewayResolver>,
    config: Config,
    metrics: Arc<Metrics>,
    outcome: Option<Result<Gateway, Error>>,
}

impl Discovery {
    /// Creates a discovery that will ask `resolver` for the gateway.
    ///
    /// A gateway forced in the [`Config`] takes precedence over the resolver.
    pub fn new(resolver: Box<dyn GatewayResolver>, config: Config, metrics: Arc<Metrics>) -> Self {
        let resolver: Box<dyn GatewayResolver> = match config.gateway {
            Some(gateway) => Box::new(FixedGateway(gateway)),
            None => resolver,
        };
        Discovery {
            resolver,
            config,
            metrics,
            outcome: None,
        }
    }

    /// Returns the gateway, discovering it on the first call.
    pub async fn discover(&mut self) -> Result<&Gateway, Error> {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => {
                let outcome = self.probe().await;
                match &outcome {
                    Ok(gateway) => {
                        info!(
                            gateway = %gateway.addr(),
                            public_ip = %gateway.public_ip,
                            "NAT-PMP gateway found"
                        );
                        self.metrics.discovery_success.inc();
                    }
                    Err(e) => {
                        warn!("NAT-PMP discovery failed, not retrying: {e}");
                        self.metrics.discovery_failure.inc();
                    }
                }
                outcome
            }
        };

        match self.outcome.insert(outcome) {
            Ok(gateway) => Ok(&*gateway),
            Err(e) => Err(e.clone()),
        }
    }

    /// The gateway, if it was discovered successfully.
    pub fn gateway(&self) -> Option<&Gateway> {
        self.outcome.as_ref().and_then(|outcome| outcome.as_ref().ok())
    }

    async fn probe(&self) -> Result<Gateway, Error> {
        let ip = self
            .resolver
            .default_gateway()
            .ok_or(Error::NoDefaultGateway)?;
        let gateway = SocketAddrV4::new(ip, self.config.server_port);
        debug!(%gateway, "probing gateway for NAT-PMP");

        let transport = Transport::bind(
            gateway,
            self.config.retry_schedule(),
            self.metrics.clone(),
        )
        .await
        .map_err(|e| Error::Bind {
            gateway,
            source: Arc::new(e),
        })?;

        let response = transport
            .send(&Request::ExternalAddress)
            .await
            .map_err(|e| Error::Probe {
                gateway,
                source: Arc::new(e),
            })?;

        match response {
            Response::PublicAddress { public_ip, .. } => Ok(Gateway {
                transport,
                public_ip,
            }),
            Response::PortMap { .. } => Err(Error::Probe {
                gateway,
                source: Arc::new(nat_pmp::Error::Refused(protocol::Error::Malformed)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::test_utils::{RouterBehaviour, SimulatedRouter};

    #[derive(Debug)]
    struct NoGateway;

    impl GatewayResolver for NoGateway {
        fn default_gateway(&self) -> Option<Ipv4Addr> {
            None
        }
    }

    fn discovery(router: &SimulatedRouter) -> Discovery {
        Discovery::new(
            Box::new(FixedGateway(*router.addr().ip())),
            router.config(),
            Default::default(),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn test_discover_is_cached() {
        let router = SimulatedRouter::spawn(RouterBehaviour::compliant());
        let mut discovery = discovery(&router);

        let gateway = discovery.discover().await.unwrap();
        assert_eq!(gateway.addr(), router.addr());
        assert_eq!(gateway.public_ip(), SimulatedRouter::PUBLIC_IP);

        discovery.discover().await.unwrap();
        assert_eq!(
            discovery.gateway().map(Gateway::public_ip),
            Some(SimulatedRouter::PUBLIC_IP)
        );
        discovery.discover().await.unwrap();
        assert_eq!(router.requests(), vec![Request::ExternalAddress]);
        assert_eq!(discovery.metrics.discovery_success.get(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failure_is_permanent() {
        let router = SimulatedRouter::spawn(RouterBehaviour::Refusing { result_code: 5 });
        let mut discovery = discovery(&router);

        let err = discovery.discover().await.unwrap_err();
        assert!(matches!(err, Error::Probe { .. }), "{err:?}");
        assert!(discovery.gateway().is_none());

        let err = discovery.discover().await.unwrap_err();
        assert!(matches!(err, Error::Probe { .. }), "{err:?}");
        assert_eq!(router.requests().len(), 1);
        assert_eq!(discovery.metrics.discovery_failure.get(), 1);
        assert!(logs_contain("not retrying"));
    }

    #[tokio::test]
    async fn test_no_default_gateway() {
        let mut discovery =
            Discovery::new(Box::new(NoGateway), Config::default(), Default::default());
        assert!(matches!(
            discovery.discover().await,
            Err(Error::NoDefaultGateway)
        ));
    }

    #[tokio::test]
    async fn test_forced_gateway_wins() {
        let router = SimulatedRouter::spawn(RouterBehaviour::compliant());
        let config = Config {
            gateway: Some(*router.addr().ip()),
            ..router.config()
        };
        let mut discovery = Discovery::new(Box::new(NoGateway), config, Default::default());
        assert_eq!(discovery.discover().await.unwrap().addr(), router.addr());
    }
}
