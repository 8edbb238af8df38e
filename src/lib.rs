//! Port mapping over [NAT-PMP](https://datatracker.ietf.org/doc/html/rfc6886) for peer-to-peer
//! UDP sessions behind a home router.
//!
//! The [`Client`] hands every operation to a single worker thread, so at most one exchange with
//! the gateway is in flight at any time. Callers either block on the result
//! ([`Client::try_portmapping_blocking`], [`Client::stop_portmapping`]) or await it
//! ([`Client::request_mapping`], [`Client::release_mapping`]). Failures are logged and reduced
//! to a `bool`: not getting a mapping is never fatal.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

use std::{net::Ipv4Addr, sync::Arc, thread::JoinHandle};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info_span, trace, warn, Instrument};

pub mod config;
pub mod gateway;
pub mod mapping;
pub mod metrics;
pub mod nat_pmp;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::Config;
pub use gateway::{Error as DiscoveryError, FixedGateway, GatewayResolver, SystemGateway};
pub use mapping::{Mapping, MappingState};
pub use metrics::Metrics;
pub use nat_pmp::{protocol::Error as ProtocolError, Error as TransportError};

use gateway::Discovery;
use mapping::Session;

/// Number of requests that can wait for the worker before callers block on sending.
const SERVICE_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug)]
enum Message {
    /// Map a port, replacing any current mapping.
    ///
    /// The requester waits for the outcome at the [`oneshot::Receiver`] counterpart of the
    /// [`oneshot::Sender`].
    RequestMapping {
        port: u16,
        result_tx: oneshot::Sender<bool>,
    },
    /// Release the current mapping, if any.
    ReleaseMapping { done_tx: oneshot::Sender<()> },
    /// Discover the gateway and report its public address.
    Probe {
        result_tx: oneshot::Sender<Option<Ipv4Addr>>,
    },
}

/// A port mapping client.
///
/// Cloning is cheap; all clones share the worker. The worker stops once every clone is dropped,
/// and the last drop waits for an operation in flight to finish.
#[derive(Debug, Clone)]
pub struct Client {
    /// Channel used to communicate with the worker.
    service_tx: mpsc::Sender<Message>,
    /// A watcher over the current mapping.
    mapping: watch::Receiver<Option<Mapping>>,
    metrics: Arc<Metrics>,
    /// Declared last so the channel is closed before the worker is joined.
    _worker: Arc<Worker>,
}

impl Client {
    /// Creates a client mapping ports on the system's default gateway.
    pub fn new(config: Config) -> std::io::Result<Self> {
        Self::with_resolver(config, SystemGateway)
    }

    /// Creates a client asking `resolver` for the gateway.
    pub fn with_resolver(
        config: Config,
        resolver: impl GatewayResolver,
    ) -> std::io::Result<Self> {
        let metrics = Arc::new(Metrics::default());
        let discovery = Discovery::new(Box::new(resolver), config.clone(), metrics.clone());
        let session = Session::new(discovery, &config, metrics.clone());

        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let (mapping_tx, mapping) = watch::channel(None);
        let service = Service {
            session,
            rx: service_rx,
            mapping_tx,
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let thread = std::thread::Builder::new()
            .name("natpmp".into())
            .spawn(move || runtime.block_on(service.run().instrument(info_span!("natpmp"))))?;

        Ok(Client {
            service_tx,
            mapping,
            metrics,
            _worker: Arc::new(Worker {
                thread: Some(thread),
            }),
        })
    }

    /// Maps `port` on the gateway, blocking until the gateway answered or gave up.
    ///
    /// Waits for operations requested earlier to finish first. Returns whether the port is
    /// mapped.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context; use
    /// [`Client::request_mapping`] there.
    pub fn try_portmapping_blocking(&self, port: u16) -> bool {
        let (result_tx, result_rx) = oneshot::channel();
        if self
            .service_tx
            .blocking_send(Message::RequestMapping { port, result_tx })
            .is_err()
        {
            warn!("port mapping worker is gone");
            return false;
        }
        result_rx.blocking_recv().unwrap_or(false)
    }

    /// Releases the current mapping, blocking until done.
    ///
    /// Does nothing if no port is mapped. Never takes longer than one request's retry schedule
    /// after earlier operations finished.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context; use
    /// [`Client::release_mapping`] there.
    pub fn stop_portmapping(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .service_tx
            .blocking_send(Message::ReleaseMapping { done_tx })
            .is_err()
        {
            warn!("port mapping worker is gone");
            return;
        }
        let _ = done_rx.blocking_recv();
    }

    /// Maps `port` on the gateway. See [`Client::try_portmapping_blocking`].
    pub async fn request_mapping(&self, port: u16) -> bool {
        let (result_tx, result_rx) = oneshot::channel();
        if self
            .service_tx
            .send(Message::RequestMapping { port, result_tx })
            .await
            .is_err()
        {
            warn!("port mapping worker is gone");
            return false;
        }
        result_rx.await.unwrap_or(false)
    }

    /// Releases the current mapping. See [`Client::stop_portmapping`].
    pub async fn release_mapping(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .service_tx
            .send(Message::ReleaseMapping { done_tx })
            .await
            .is_err()
        {
            warn!("port mapping worker is gone");
            return;
        }
        let _ = done_rx.await;
    }

    /// Discovers the gateway, blocking until done, and returns its public address.
    ///
    /// Returns `None` if no gateway speaking NAT-PMP was found. Like mapping, discovery only
    /// happens once per client.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context; use [`Client::probe`]
    /// there.
    pub fn probe_blocking(&self) -> Option<Ipv4Addr> {
        let (result_tx, result_rx) = oneshot::channel();
        if self
            .service_tx
            .blocking_send(Message::Probe { result_tx })
            .is_err()
        {
            warn!("port mapping worker is gone");
            return None;
        }
        result_rx.blocking_recv().ok().flatten()
    }

    /// Discovers the gateway. See [`Client::probe_blocking`].
    pub async fn probe(&self) -> Option<Ipv4Addr> {
        let (result_tx, result_rx) = oneshot::channel();
        if self
            .service_tx
            .send(Message::Probe { result_tx })
            .await
            .is_err()
        {
            warn!("port mapping worker is gone");
            return None;
        }
        result_rx.await.ok().flatten()
    }

    /// The active mapping, if any.
    pub fn mapping(&self) -> Option<Mapping> {
        *self.mapping.borrow()
    }

    /// Watch the active mapping for changes.
    pub fn watch_mapping(&self) -> watch::Receiver<Option<Mapping>> {
        self.mapping.clone()
    }

    /// Metrics of this client.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Joins the worker thread when dropped.
#[derive(Debug)]
struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("port mapping worker panicked");
            }
        }
    }
}

/// Runs the [`Session`] on the worker, one message at a time.
#[derive(Debug)]
struct Service {
    session: Session,
    rx: mpsc::Receiver<Message>,
    mapping_tx: watch::Sender<Option<Mapping>>,
}

impl Service {
    async fn run(mut self) {
        debug!("port mapping worker starting");
        while let Some(msg) = self.rx.recv().await {
            self.handle_msg(msg).await;
        }
        match self.session.state().active() {
            Some(mapping) => debug!(
                port = %mapping.port(),
                "port mapping worker stopping, mapping left to expire"
            ),
            None => debug!("port mapping worker stopping"),
        }
    }

    async fn handle_msg(&mut self, msg: Message) {
        trace!("received message {msg:?}");
        match msg {
            Message::RequestMapping { port, result_tx } => {
                let mapped = self.session.request_mapping(port).await;
                self.publish();
                // We don't care if the requester is no longer there.
                let _ = result_tx.send(mapped);
            }
            Message::ReleaseMapping { done_tx } => {
                self.session.release_mapping().await;
                self.publish();
                let _ = done_tx.send(());
            }
            Message::Probe { result_tx } => {
                let public_ip = self.session.discover().await.ok();
                let _ = result_tx.send(public_ip);
            }
        }
    }

    /// Informs watchers of the mapping if it changed.
    fn publish(&self) {
        let mapping = self.session.state().active().copied();
        self.mapping_tx.send_if_modified(|current| {
            let changed = *current != mapping;
            *current = mapping;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::test_utils::{RouterBehaviour, SimulatedRouter};

    fn client(router: &SimulatedRouter) -> Client {
        Client::with_resolver(router.config(), FixedGateway(*router.addr().ip())).unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_async_facade() {
        let router = SimulatedRouter::spawn(RouterBehaviour::compliant());
        let client = client(&router);
        let mut watcher = client.watch_mapping();
        assert_eq!(*watcher.borrow_and_update(), None);

        assert!(client.request_mapping(51000).await);
        tokio::time::timeout(Duration::from_secs(1), watcher.changed())
            .await
            .unwrap()
            .unwrap();
        let mapping = (*watcher.borrow_and_update()).unwrap();
        assert_eq!(mapping.port().get(), 51000);
        assert_eq!(mapping.external_addr().ip(), &SimulatedRouter::PUBLIC_IP);

        client.release_mapping().await;
        assert_eq!(client.mapping(), None);
        assert_eq!(client.metrics().mappings_released.get(), 1);
    }

    #[test]
    #[traced_test]
    fn test_blocking_facade() {
        let router = SimulatedRouter::spawn(RouterBehaviour::compliant());
        let client = client(&router);

        assert!(client.try_portmapping_blocking(51000));
        assert_eq!(client.mapping().map(|m| m.port().get()), Some(51000));
        client.stop_portmapping();
        assert_eq!(client.mapping(), None);
        client.stop_portmapping();
        assert_eq!(router.requests().len(), 3);
    }

    #[test]
    fn test_probe() {
        let router = SimulatedRouter::spawn(RouterBehaviour::compliant());
        let client = client(&router);

        assert_eq!(client.probe_blocking(), Some(SimulatedRouter::PUBLIC_IP));
        assert_eq!(client.probe_blocking(), Some(SimulatedRouter::PUBLIC_IP));
        assert_eq!(router.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_probe_without_gateway() {
        let router = SimulatedRouter::spawn(RouterBehaviour::Refusing { result_code: 2 });
        let client = client(&router);

        assert_eq!(client.probe().await, None);
        assert!(!client.request_mapping(5000).await);
        assert_eq!(client.metrics().discovery_failure.get(), 1);
    }

    #[test]
    fn test_drop_stops_worker() {
        let router = SimulatedRouter::spawn(RouterBehaviour::compliant());
        let client = client(&router);
        let other = client.clone();

        assert!(client.try_portmapping_blocking(9000));
        drop(client);
        // the remaining clone still reaches the worker
        assert!(other.try_portmapping_blocking(9001));
        drop(other);
        // the mapping is left to expire at the gateway
        assert_eq!(
            router.requests().last(),
            Some(&nat_pmp::protocol::Request::symmetric_mapping(9001, 604800))
        );
    }
}
