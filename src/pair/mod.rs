//! The rendezvous engine: an outbound connect loop raced against an
//! inbound accept loop on one shared local port.
//!
//! Behind common NATs an outbound SYN from one peer is dropped until
//! the peer's own NAT has seen traffic towards the other side. Both
//! halves therefore run at once from the same local endpoint: every
//! outbound SYN doubles as a punch packet, and the first half to
//! produce an established connection wins. The loser is cancelled
//! cooperatively and its socket dropped.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use futures_timer::Delay;
use log::{debug, info, warn};
use tokio::time;

use crate::error::*;
use crate::socket::{self, Listener, Socket};

// attempt budget per half
const RETRY: usize = 10;

// fixed backoff between connect attempts; shortening this below a few
// hundred milliseconds floods the peer's NAT to no benefit
const RETRY_DELAY: Duration = Duration::from_secs(1);

// per-attempt deadline on a single outbound connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

// how long the listener waits for one accept before spending a unit
// of its budget
const ACCEPT_WINDOW: Duration = Duration::from_secs(1);

/// Addressing for one punching run.
#[derive(Debug, Copy, Clone)]
pub struct PairConfig {
    /// Local port both sockets bind.
    pub local_port: u16,
    /// The peer's public address and remote port.
    pub peer: SocketAddr,
}

/// Single-shot cooperative cancellation observed by both workers at
/// their iteration boundaries.
#[derive(Clone, Default)]
struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Copy, Clone)]
enum Half {
    Connector,
    Listener,
}

impl Half {
    fn name(self) -> &'static str {
        match self {
            Half::Connector => "connect",
            Half::Listener => "accept",
        }
    }
}

enum Outcome {
    Won(Half, Socket),
    Exhausted(Half, Error),
}

/// Owns the two racing halves of a punching run.
pub struct SocketPair {
    local: SocketAddr,
    peer: SocketAddr,
    listener: Listener,
}

impl SocketPair {
    /// Binds the listening half to the wildcard address of the peer's
    /// family on the configured port. Setup failures are fatal.
    pub fn new(cfg: PairConfig) -> Result<Self> {
        let local = wildcard(cfg.peer.ip(), cfg.local_port);
        let listener = socket::listen(local)?;
        Ok(SocketPair {
            local,
            peer: cfg.peer,
            listener,
        })
    }

    /// Runs the race until one half produces an established connection
    /// to the configured peer, or both halves exhaust their budgets.
    ///
    /// The surviving socket is handed to the caller; the losing half is
    /// cancelled at its next iteration boundary and its file
    /// descriptor dropped. A connect that completes after cancellation
    /// is tolerated, its socket is discarded with the channel.
    pub async fn establish(self) -> Result<Socket> {
        // capacity for both workers, so a late publication from the
        // loser never blocks
        let (tx, mut rx) = mpsc::channel(2);
        let stop = StopFlag::default();

        tokio::spawn(connect_side(self.local, self.peer, stop.clone(), tx.clone()));
        tokio::spawn(accept_side(self.listener, self.peer, stop.clone(), tx));

        let mut first_failure: Option<Error> = None;

        while let Some(outcome) = rx.next().await {
            match outcome {
                Outcome::Won(half, sock) => {
                    stop.raise();
                    info!("{} side won the race", half.name());
                    return Ok(sock);
                }
                Outcome::Exhausted(half, e) => {
                    // one half giving up is not terminal while the
                    // other may still succeed
                    if first_failure.is_none() {
                        warn!("{} side gave up: {}", half.name(), e);
                        first_failure = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        // both senders dropped without a terminal event; only possible
        // after cancellation was raised, so this path is unreachable in
        // practice
        Err(first_failure.unwrap_or_else(|| Error::simple(ErrorKind::ConnectExhausted)))
    }
}

fn wildcard(peer: IpAddr, port: u16) -> SocketAddr {
    let ip = match peer {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}

async fn connect_side(
    local: SocketAddr,
    peer: SocketAddr,
    stop: StopFlag,
    mut tx: mpsc::Sender<Outcome>,
) {
    for _ in 0..RETRY {
        if stop.raised() {
            return;
        }

        // a fresh socket per attempt; a failed TCP connect poisons its fd
        match socket::connect(local, peer, CONNECT_TIMEOUT).await {
            Ok(sock) => {
                tx.send(Outcome::Won(Half::Connector, sock))
                    .await
                    .unwrap_or(());
                return;
            }
            Err(e) => debug!("connect to {} failed: {}", peer, e),
        }

        // sleep for 1 second and retry
        Delay::new(RETRY_DELAY).await;
    }

    let e = Error::simple(ErrorKind::ConnectExhausted);
    tx.send(Outcome::Exhausted(Half::Connector, e))
        .await
        .unwrap_or(());
}

async fn accept_side(
    listener: Listener,
    peer: SocketAddr,
    stop: StopFlag,
    mut tx: mpsc::Sender<Outcome>,
) {
    let mut budget = RETRY;

    while budget > 0 {
        if stop.raised() {
            return;
        }

        match time::timeout(ACCEPT_WINDOW, listener.accept_from(peer)).await {
            Ok(Ok(sock)) => {
                tx.send(Outcome::Won(Half::Listener, sock))
                    .await
                    .unwrap_or(());
                stop.raise();
                return;
            }
            // strays and scanners are discarded without spending budget
            Ok(Err(e)) if e.kind() == ErrorKind::PeerMismatch => warn!("{}", e),
            Ok(Err(e)) => {
                debug!("accept failed: {}", e);
                budget -= 1;
            }
            Err(_) => budget -= 1,
        }
    }

    let e = Error::simple(ErrorKind::AcceptExhausted);
    tx.send(Outcome::Exhausted(Half::Listener, e))
        .await
        .unwrap_or(());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn both_halves_exhaust_without_a_peer() {
        // nothing listens on the peer port and nothing connects to
        // ours, so both budgets burn down in around ten seconds
        let cfg = PairConfig {
            local_port: free_port(),
            peer: SocketAddr::from(([127, 0, 0, 1], free_port())),
        };

        let pair = SocketPair::new(cfg).unwrap();
        let err = pair.establish().await.unwrap_err();

        assert!(matches!(
            err.kind(),
            ErrorKind::ConnectExhausted | ErrorKind::AcceptExhausted
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_engines_converge_on_one_connection() {
        let (pa, pb) = (free_port(), free_port());

        let a = SocketPair::new(PairConfig {
            local_port: pa,
            peer: SocketAddr::from(([127, 0, 0, 1], pb)),
        })
        .unwrap();
        let b = SocketPair::new(PairConfig {
            local_port: pb,
            peer: SocketAddr::from(([127, 0, 0, 1], pa)),
        })
        .unwrap();

        let (sa, sb) = tokio::join!(a.establish(), b.establish());
        let (sa, sb) = (sa.unwrap(), sb.unwrap());

        // one connection, seen from both ends
        assert_eq!(sa.peer_addr().unwrap().port(), pb);
        assert_eq!(sb.peer_addr().unwrap().port(), pa);
        assert_eq!(sa.local_addr().unwrap().port(), pa);
        assert_eq!(sb.local_addr().unwrap().port(), pb);
    }
}
