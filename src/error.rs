use crate::queue_pair::QueuePairState;
use crate::rendezvous::PeerId;
use std::io;
use thiserror::Error;

/// Errors raised while bringing a reliable-connected link up.
///
/// Device-facing failures carry the underlying `io::Error` (an OS errno for
/// the verbs backend, a synthesized one for the simulated backend).
/// Rendezvous failures are a separate kind on purpose: the caller can retry
/// an exchange, but an allocation or transition failure means abandoning the
/// queue pair.
#[derive(Debug, Error)]
pub enum Error {
    /// Device enumeration returned an empty list.
    #[error("no RDMA devices present on this host")]
    NoDevicesPresent,

    /// No enumerated device matched the selector.
    #[error("RDMA device {selector} not found among {available} device(s)")]
    DeviceNotFound { selector: String, available: usize },

    /// `Context::open_once` was called a second time in this process.
    #[error("device context already opened in this process")]
    AlreadyOpened,

    /// A port-attribute query failed, or the port number/state is unusable.
    #[error("port {port} query failed: {source}")]
    QueryFailed { port: u8, source: io::Error },

    /// The driver refused to produce a resource: a device context,
    /// completion queue, protection domain or queue pair.
    #[error("failed to allocate {resource}: {source}")]
    AllocationFailed {
        resource: &'static str,
        source: io::Error,
    },

    /// Memory registration was rejected.
    #[error("memory registration failed: {source}")]
    RegistrationFailed { source: io::Error },

    /// A queue-pair state transition was rejected. `reached` is the state
    /// the queue pair actually holds; `attempted` is the state it was asked
    /// to enter. A queue pair stuck between RESET and READY_TO_SEND is
    /// unusable for data operations.
    #[error("queue pair transition to {attempted} failed (reached {reached}): {source}")]
    TransitionFailed {
        reached: QueuePairState,
        attempted: QueuePairState,
        source: io::Error,
    },

    /// The out-of-band rendezvous exchange with `peer` failed.
    #[error("rendezvous channel with peer {peer}: {source}")]
    Channel { peer: PeerId, source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a transition rejected before or by the device layer.
    pub(crate) fn transition(
        reached: QueuePairState,
        attempted: QueuePairState,
        source: io::Error,
    ) -> Self {
        Error::TransitionFailed {
            reached,
            attempted,
            source,
        }
    }

    /// Shorthand for a rendezvous failure with `peer`.
    pub(crate) fn channel(peer: PeerId, source: io::Error) -> Self {
        Error::Channel { peer, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_failed_names_both_states() {
        let err = Error::transition(
            QueuePairState::Init,
            QueuePairState::ReadyToReceive,
            io::Error::new(io::ErrorKind::InvalidInput, "bad path"),
        );
        let msg = err.to_string();
        assert!(msg.contains("READY_TO_RECEIVE"), "{msg}");
        assert!(msg.contains("INIT"), "{msg}");
    }

    #[test]
    fn channel_error_names_peer() {
        let err = Error::channel(3, io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.to_string().contains("peer 3"));
    }
}
