//! Out-of-band exchange of address tuples.
//!
//! The connection protocol needs exactly one piece of remote information,
//! the peer's [`QueuePairEndpoint`], delivered before the
//! INIT→READY_TO_RECEIVE transition. Any reliable point-to-point
//! transport will do; the two shipped here are a bincode-framed TCP
//! exchange and an in-process channel pair for co-located endpoints and
//! tests.

use crate::error::{Error, Result};
use crate::queue_pair::QueuePairEndpoint;
use std::collections::HashMap;
use std::io;
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Duration;
use tracing::debug;

/// Identifies a peer in the surrounding process group, for example an
/// MPI-style rank.
pub type PeerId = u32;

/// A reliable point-to-point exchange of address tuples.
///
/// Scoping is per peer: a receive for peer X never yields a tuple some
/// other peer sent. Both calls block until the transport completes.
/// Failures surface as [`Error::Channel`], deliberately distinct from
/// device errors: a failed exchange can be retried, while a failed
/// allocation or transition means abandoning the queue pair.
pub trait Rendezvous {
    /// Deliver this side's tuple to `peer`.
    fn send(&self, peer: PeerId, endpoint: QueuePairEndpoint) -> Result<()>;

    /// Block until `peer`'s tuple arrives.
    fn receive(&self, peer: PeerId) -> Result<QueuePairEndpoint>;
}

/// Rendezvous over one TCP stream per peer, framed with bincode so the
/// tuple's u16/u32 fields keep their fixed widths on the wire.
pub struct TcpRendezvous {
    links: HashMap<PeerId, TcpStream>,
    read_timeout: Option<Duration>,
}

impl TcpRendezvous {
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            read_timeout: None,
        }
    }

    /// Bound every receive by `timeout` so a silent peer surfaces as a
    /// channel error instead of blocking forever.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            links: HashMap::new(),
            read_timeout: Some(timeout),
        }
    }

    /// Register the stream carrying the exchange with `peer`. Replaces
    /// any stream registered for the same peer.
    pub fn add_peer(&mut self, peer: PeerId, stream: TcpStream) -> Result<()> {
        stream
            .set_read_timeout(self.read_timeout)
            .map_err(|source| Error::channel(peer, source))?;
        self.links.insert(peer, stream);
        Ok(())
    }

    fn link(&self, peer: PeerId) -> Result<&TcpStream> {
        self.links.get(&peer).ok_or_else(|| {
            Error::channel(
                peer,
                io::Error::new(io::ErrorKind::NotConnected, "no stream registered"),
            )
        })
    }
}

impl Default for TcpRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous for TcpRendezvous {
    fn send(&self, peer: PeerId, endpoint: QueuePairEndpoint) -> Result<()> {
        let stream = self.link(peer)?;
        bincode::serialize_into(stream, &endpoint)
            .map_err(|err| Error::channel(peer, bincode_io(err)))?;
        debug!(peer, lid = endpoint.lid, qp_num = endpoint.qp_num, "sent endpoint");
        Ok(())
    }

    fn receive(&self, peer: PeerId) -> Result<QueuePairEndpoint> {
        let stream = self.link(peer)?;
        let endpoint: QueuePairEndpoint = bincode::deserialize_from(stream)
            .map_err(|err| Error::channel(peer, bincode_io(err)))?;
        debug!(
            peer,
            lid = endpoint.lid,
            qp_num = endpoint.qp_num,
            "received endpoint"
        );
        Ok(endpoint)
    }
}

fn bincode_io(err: bincode::Error) -> io::Error {
    match *err {
        bincode::ErrorKind::Io(err) => err,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// One end of an in-process rendezvous link.
pub struct LocalLink {
    tx: mpsc::Sender<QueuePairEndpoint>,
    rx: mpsc::Receiver<QueuePairEndpoint>,
}

/// Build a crossed pair of in-process links: tuples sent on one end
/// arrive at the other.
pub fn local_link() -> (LocalLink, LocalLink) {
    let (left_tx, right_rx) = mpsc::channel();
    let (right_tx, left_rx) = mpsc::channel();
    (
        LocalLink {
            tx: left_tx,
            rx: left_rx,
        },
        LocalLink {
            tx: right_tx,
            rx: right_rx,
        },
    )
}

/// In-process rendezvous over [`local_link`] pairs, for endpoints that
/// share a process.
pub struct LocalRendezvous {
    links: HashMap<PeerId, LocalLink>,
    recv_timeout: Option<Duration>,
}

impl LocalRendezvous {
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            recv_timeout: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            links: HashMap::new(),
            recv_timeout: Some(timeout),
        }
    }

    /// Register `link` as the exchange with `peer`.
    pub fn add_peer(&mut self, peer: PeerId, link: LocalLink) {
        self.links.insert(peer, link);
    }

    fn link(&self, peer: PeerId) -> Result<&LocalLink> {
        self.links.get(&peer).ok_or_else(|| {
            Error::channel(
                peer,
                io::Error::new(io::ErrorKind::NotConnected, "no link registered"),
            )
        })
    }
}

impl Default for LocalRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous for LocalRendezvous {
    fn send(&self, peer: PeerId, endpoint: QueuePairEndpoint) -> Result<()> {
        let link = self.link(peer)?;
        link.tx.send(endpoint).map_err(|_| {
            Error::channel(
                peer,
                io::Error::new(io::ErrorKind::BrokenPipe, "peer end dropped"),
            )
        })
    }

    fn receive(&self, peer: PeerId) -> Result<QueuePairEndpoint> {
        let link = self.link(peer)?;
        match self.recv_timeout {
            Some(timeout) => link.rx.recv_timeout(timeout).map_err(|err| {
                let source = match err {
                    mpsc::RecvTimeoutError::Timeout => {
                        io::Error::new(io::ErrorKind::TimedOut, "receive timed out")
                    }
                    mpsc::RecvTimeoutError::Disconnected => {
                        io::Error::new(io::ErrorKind::BrokenPipe, "peer end dropped")
                    }
                };
                Error::channel(peer, source)
            }),
            None => link.rx.recv().map_err(|_| {
                Error::channel(
                    peer,
                    io::Error::new(io::ErrorKind::BrokenPipe, "peer end dropped"),
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_crosses_a_local_link() {
        let (a, b) = local_link();
        let mut left = LocalRendezvous::new();
        left.add_peer(1, a);
        let mut right = LocalRendezvous::new();
        right.add_peer(0, b);

        let sent = QueuePairEndpoint { lid: 7, qp_num: 100 };
        left.send(1, sent).unwrap();
        let got = right.receive(0).unwrap();
        assert_eq!(got, sent);
    }

    #[test]
    fn wire_format_is_six_fixed_width_bytes() {
        let endpoint = QueuePairEndpoint {
            lid: 0xBEEF,
            qp_num: 0xDEAD_BEEF,
        };
        let bytes = bincode::serialize(&endpoint).unwrap();
        assert_eq!(bytes, [0xEF, 0xBE, 0xEF, 0xBE, 0xAD, 0xDE]);
        let back: QueuePairEndpoint = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, endpoint);
    }

    #[test]
    fn unknown_peer_is_a_channel_error() {
        let rendezvous = LocalRendezvous::new();
        let endpoint = QueuePairEndpoint { lid: 1, qp_num: 1 };
        match rendezvous.send(9, endpoint) {
            Err(Error::Channel { peer: 9, .. }) => {}
            other => panic!("expected Channel, got {other:?}"),
        }
        assert!(matches!(
            rendezvous.receive(9),
            Err(Error::Channel { peer: 9, .. })
        ));
    }

    #[test]
    fn dropped_peer_end_is_a_channel_error() {
        let (a, b) = local_link();
        let mut left = LocalRendezvous::new();
        left.add_peer(1, a);
        drop(b);

        let endpoint = QueuePairEndpoint { lid: 1, qp_num: 1 };
        assert!(matches!(
            left.send(1, endpoint),
            Err(Error::Channel { peer: 1, .. })
        ));
        assert!(matches!(
            left.receive(1),
            Err(Error::Channel { peer: 1, .. })
        ));
    }

    #[test]
    fn silent_peer_times_out() {
        let (a, _b) = local_link();
        let mut left = LocalRendezvous::with_timeout(Duration::from_millis(10));
        left.add_peer(1, a);
        match left.receive(1) {
            Err(Error::Channel { peer: 1, source }) => {
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("expected Channel, got {other:?}"),
        }
    }
}
