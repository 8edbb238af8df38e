//! Internal utilities to support testing.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{
    config::Config,
    nat_pmp::protocol::{Opcode, Request, Response},
};

/// How a [`SimulatedRouter`] answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterBehaviour {
    /// Answers every request successfully.
    Compliant {
        /// Grant mappings on this external port instead of the requested one.
        remap_to: Option<u16>,
    },
    /// Never answers.
    Silent,
    /// Answers every request with this result code.
    Refusing {
        /// Result code sent back.
        result_code: u16,
    },
    /// Answers public address requests, refuses to create mappings with this result code.
    RefusingMappings {
        /// Result code sent back.
        result_code: u16,
    },
    /// Sends a truncated datagram and a response with the wrong opcode before each answer.
    /// Mapping requests also get a stale answer for the same port first, granting a lifetime
    /// to deletions and none to mappings.
    NoisyThenCompliant,
    /// Ignores requests until the `request`-th one (counting from 1) arrives.
    AnswerFrom {
        /// First request to answer.
        request: usize,
    },
    /// Answers every request, but deletions only after `delay`.
    SlowToDelete {
        /// Time a deletion is held before it is acknowledged.
        delay: Duration,
    },
}

impl RouterBehaviour {
    /// A router answering every request as requested.
    pub fn compliant() -> Self {
        RouterBehaviour::Compliant { remap_to: None }
    }
}

/// A request observed by a [`SimulatedRouter`].
#[derive(Debug, Clone, Copy)]
struct Observed {
    request: Request,
    at: Instant,
}

/// A NAT-PMP server on `127.0.0.1`, running on its own thread.
///
/// The router stops when dropped.
#[derive(Debug)]
pub struct SimulatedRouter {
    addr: SocketAddrV4,
    observed: Arc<Mutex<Vec<Observed>>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedRouter {
    /// Public address reported by the router.
    pub const PUBLIC_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

    /// Epoch reported by the router.
    pub const EPOCH: u32 = 1200;

    const POLL_INTERVAL: Duration = Duration::from_millis(20);

    /// Starts a router with the given behaviour.
    pub fn spawn(behaviour: RouterBehaviour) -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind router socket");
        socket
            .set_read_timeout(Some(Self::POLL_INTERVAL))
            .expect("set read timeout");
        let addr = match socket.local_addr().expect("router address") {
            std::net::SocketAddr::V4(addr) => addr,
            std::net::SocketAddr::V6(_) => unreachable!("bound to an ipv4 address"),
        };

        let observed = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("simulated-router".into())
            .spawn({
                let observed = observed.clone();
                let shutdown = shutdown.clone();
                move || serve(socket, behaviour, observed, shutdown)
            })
            .expect("spawn router thread");

        SimulatedRouter {
            addr,
            observed,
            shutdown,
            thread: Some(thread),
        }
    }

    /// Address of the NAT-PMP server.
    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// A configuration directing requests to this router.
    pub fn config(&self) -> Config {
        Config {
            gateway: Some(*self.addr.ip()),
            server_port: self.addr.port(),
            ..Default::default()
        }
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.observed().into_iter().map(|o| o.request).collect()
    }

    /// Arrival time of each request received so far.
    pub fn arrivals(&self) -> Vec<Instant> {
        self.observed().into_iter().map(|o| o.at).collect()
    }

    /// Waits up to two seconds for `count` requests to arrive and returns their arrival times.
    pub async fn wait_for_arrivals(&self, count: usize) -> Vec<Instant> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let arrivals = self.arrivals();
            if arrivals.len() >= count || Instant::now() >= deadline {
                return arrivals;
            }
            tokio::time::sleep(Self::POLL_INTERVAL).await;
        }
    }

    fn observed(&self) -> Vec<Observed> {
        self.observed.lock().expect("poisoned").clone()
    }
}

impl Drop for SimulatedRouter {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(
    socket: UdpSocket,
    behaviour: RouterBehaviour,
    observed: Arc<Mutex<Vec<Observed>>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 64];
    let mut held: Vec<(Instant, Vec<u8>, SocketAddr)> = Vec::new();
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) =
            held.drain(..).partition(|(due, _, _)| *due <= now);
        held = later;
        for (_, datagram, to) in due {
            trace!(%to, "simulated router sending held answer");
            if let Err(e) = socket.send_to(&datagram, to) {
                debug!("simulated router failed to answer: {e}");
            }
        }

        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(read) => read,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(e) => {
                debug!("simulated router stopped: {e}");
                return;
            }
        };
        let Some(request) = Request::decode(&buf[..len]) else {
            debug!(len, "simulated router ignoring undecodable request");
            continue;
        };
        let count = {
            let mut observed = observed.lock().expect("poisoned");
            observed.push(Observed {
                request,
                at: Instant::now(),
            });
            observed.len()
        };
        trace!(?request, count, "simulated router received request");

        if let Some(delay) = hold_for(behaviour, request) {
            let due = Instant::now() + delay;
            held.extend(
                replies(behaviour, request, count)
                    .into_iter()
                    .map(|datagram| (due, datagram, from)),
            );
            continue;
        }
        for datagram in replies(behaviour, request, count) {
            if let Err(e) = socket.send_to(&datagram, from) {
                debug!("simulated router failed to answer: {e}");
            }
        }
    }
}

fn hold_for(behaviour: RouterBehaviour, request: Request) -> Option<Duration> {
    match (behaviour, request) {
        (
            RouterBehaviour::SlowToDelete { delay },
            Request::Mapping {
                lifetime_seconds: 0,
                ..
            },
        ) => Some(delay),
        _ => None,
    }
}

fn replies(behaviour: RouterBehaviour, request: Request, count: usize) -> Vec<Vec<u8>> {
    match behaviour {
        RouterBehaviour::Compliant { remap_to } => vec![answer(request, remap_to).encode()],
        RouterBehaviour::SlowToDelete { .. } => vec![answer(request, None).encode()],
        RouterBehaviour::Silent => Vec::new(),
        RouterBehaviour::Refusing { result_code } => {
            vec![Response::encode_error(request.opcode(), result_code)]
        }
        RouterBehaviour::RefusingMappings { result_code } => match request {
            Request::Mapping {
                lifetime_seconds, ..
            } if lifetime_seconds > 0 => {
                vec![Response::encode_error(Opcode::MapUdp, result_code)]
            }
            _ => vec![answer(request, None).encode()],
        },
        RouterBehaviour::NoisyThenCompliant => {
            let mut truncated = answer(request, None).encode();
            truncated.truncate(3);
            let unrelated = match request.opcode() {
                Opcode::DetermineExternalAddress => answer(Request::symmetric_mapping(1, 1), None),
                Opcode::MapUdp => answer(Request::ExternalAddress, None),
            };
            let mut datagrams = vec![truncated, unrelated.encode()];
            if let Request::Mapping {
                local_port,
                lifetime_seconds,
                ..
            } = request
            {
                let stale_lifetime = if lifetime_seconds == 0 { 3600 } else { 0 };
                datagrams.push(
                    answer(Request::symmetric_mapping(local_port, stale_lifetime), None).encode(),
                );
            }
            datagrams.push(answer(request, None).encode());
            datagrams
        }
        RouterBehaviour::AnswerFrom { request: first } if count >= first => {
            vec![answer(request, None).encode()]
        }
        RouterBehaviour::AnswerFrom { .. } => Vec::new(),
    }
}

fn answer(request: Request, remap_to: Option<u16>) -> Response {
    match request {
        Request::ExternalAddress => Response::PublicAddress {
            epoch_time: SimulatedRouter::EPOCH,
            public_ip: SimulatedRouter::PUBLIC_IP,
        },
        // deletions are answered with zeroed external port and lifetime
        Request::Mapping {
            local_port,
            lifetime_seconds: 0,
            ..
        } => Response::PortMap {
            epoch_time: SimulatedRouter::EPOCH,
            private_port: local_port,
            external_port: 0,
            lifetime_seconds: 0,
        },
        Request::Mapping {
            local_port,
            external_port,
            lifetime_seconds,
        } => Response::PortMap {
            epoch_time: SimulatedRouter::EPOCH,
            private_port: local_port,
            external_port: remap_to.unwrap_or(external_port),
            lifetime_seconds,
        },
    }
}
