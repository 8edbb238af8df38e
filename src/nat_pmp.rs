//! Request/response exchanges with a NAT-PMP server over UDP.

use std::{net::SocketAddrV4, sync::Arc, time::Duration};

use tokio::{net::UdpSocket, time::Instant};
use tracing::{debug, trace};

use crate::metrics::Metrics;

pub mod protocol;

use protocol::{Request, Response};

/// Size of the receive buffer.
///
/// Responses are at most 16 bytes; the extra room lets us see oversized datagrams whole instead of
/// having them silently truncated.
const RECV_BUFFER_SIZE: usize = 1100;

/// Errors that can occur while exchanging a request with a NAT-PMP server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No valid response arrived after every attempt.
    #[error("No response from the server after {attempts} attempts")]
    Timeout {
        /// Number of times the request was sent.
        attempts: usize,
    },
    /// The server answered, refusing the request.
    #[error(transparent)]
    Refused(protocol::Error),
    /// The socket failed.
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Retransmission schedule of a [`Transport`].
///
/// The first attempt waits `initial_timeout`, and every retry waits twice as long as the previous
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Time to wait for a response to the first attempt.
    pub initial_timeout: Duration,
    /// Total number of times a request is sent.
    pub attempts: usize,
}

impl RetrySchedule {
    /// Timeouts of each attempt, in order.
    pub fn timeouts(&self) -> impl Iterator<Item = Duration> {
        let initial = self.initial_timeout;
        (0..self.attempts).map(move |attempt| {
            let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
            initial.saturating_mul(factor)
        })
    }

    /// Longest time a request can take before giving up.
    pub fn total(&self) -> Duration {
        self.timeouts().sum()
    }
}

/// Sends requests to a single NAT-PMP server and waits for the matching responses.
///
/// The socket is bound once to an ephemeral local port and reused by every exchange.
#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    server: SocketAddrV4,
    schedule: RetrySchedule,
    metrics: Arc<Metrics>,
}

impl Transport {
    /// Binds a socket to talk to the server at `server`.
    pub async fn bind(
        server: SocketAddrV4,
        schedule: RetrySchedule,
        metrics: Arc<Metrics>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(server).await?;
        trace!(local = ?socket.local_addr(), %server, "transport bound");
        Ok(Transport {
            socket,
            server,
            schedule,
            metrics,
        })
    }

    /// Address of the server this transport talks to.
    pub fn server(&self) -> SocketAddrV4 {
        self.server
    }

    /// Sends the request and waits for a valid response, retransmitting as needed.
    ///
    /// Datagrams that do not decode, or answer another request, are discarded without ending the
    /// current attempt. A response carrying a non-zero result code is returned as
    /// [`Error::Refused`] right away.
    pub async fn send(&self, request: &Request) -> Result<Response, Error> {
        let encoded = request.encode();
        let expected = request.opcode();
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        self.drain(&mut buffer);

        for (attempt, attempt_timeout) in self.schedule.timeouts().enumerate() {
            if attempt > 0 {
                debug!(server = %self.server, attempt, "retransmitting {expected:?} request");
                self.metrics.retransmissions.inc();
            }
            self.socket.send(&encoded).await?;
            self.metrics.requests_sent.inc();

            let deadline = Instant::now() + attempt_timeout;
            loop {
                let read =
                    match tokio::time::timeout_at(deadline, self.socket.recv(&mut buffer)).await {
                        Ok(read) => read?,
                        Err(_elapsed) => break,
                    };
                match Response::decode(&buffer[..read], expected) {
                    Ok(response) if response.answers(request) => {
                        trace!(?response, "received response");
                        return Ok(response);
                    }
                    Ok(response) => {
                        debug!(?response, "discarding response to another request");
                        self.metrics.stray_datagrams.inc();
                    }
                    Err(e) if e.is_stray() => {
                        debug!(len = read, "discarding datagram: {e}");
                        self.metrics.stray_datagrams.inc();
                    }
                    Err(e) => {
                        self.metrics.refusals.inc();
                        return Err(Error::Refused(e));
                    }
                }
            }
        }

        self.metrics.timeouts.inc();
        Err(Error::Timeout {
            attempts: self.schedule.attempts,
        })
    }

    /// Discards datagrams queued since the last exchange, such as late answers to a request that
    /// was given up on.
    fn drain(&self, buffer: &mut [u8]) {
        loop {
            match self.socket.try_recv(buffer) {
                Ok(read) => {
                    debug!(len = read, "discarding datagram left from an earlier exchange");
                    self.metrics.stray_datagrams.inc();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("error draining socket: {e}");
                    return;
                }
            }
        }
    }
}
