//! Connection establishment for RDMA reliable-connected queue pairs:
//! device discovery, resource setup (completion queue, protection domain,
//! registered memory) and the RESET→INIT→READY_TO_RECEIVE→READY_TO_SEND
//! transition sequence, with the address-tuple exchange that links two
//! queue pairs together.
//!
//! The `verbs` feature links the real libibverbs stack through
//! `rdma-sys`; without it the crate runs against an in-process simulated
//! host (the `sim` module), which is what the test suite uses.

mod completion_queue;
mod config;
mod context;
mod device;
mod error;
mod gid;
mod memory_region;
mod protection_domain;
mod queue_pair;
mod rendezvous;

#[cfg(not(feature = "verbs"))]
pub mod sim;
#[cfg(not(feature = "verbs"))]
pub(crate) use sim as backend;

#[cfg(feature = "verbs")]
mod verbs;
#[cfg(feature = "verbs")]
pub(crate) use verbs as backend;

pub use completion_queue::*;
pub use config::*;
pub use context::*;
pub use device::*;
pub use error::*;
pub use gid::*;
pub use memory_region::*;
pub use protection_domain::*;
pub use queue_pair::*;
pub use rendezvous::*;

use std::alloc::Layout;
use std::sync::Arc;
use tracing::{info, warn};

/// Builder for a [`Node`].
pub struct NodeBuilder {
    selector: DeviceSelector,
    port: u8,
    cq_depth: u32,
}

impl NodeBuilder {
    pub fn set_device(&mut self, selector: DeviceSelector) -> &mut Self {
        self.selector = selector;
        self
    }

    pub fn set_port(&mut self, port: u8) -> &mut Self {
        self.port = port;
        self
    }

    pub fn set_cq_depth(&mut self, depth: u32) -> &mut Self {
        self.cq_depth = depth;
        self
    }

    pub fn build(&self) -> Result<Node> {
        Node::new(&self.selector, self.port, self.cq_depth)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self {
            selector: DeviceSelector::default(),
            port: DEFAULT_PORT,
            cq_depth: 256,
        }
    }
}

/// One process's stack of device-wide resources: an opened context plus
/// the completion queue and protection domain every queue pair it creates
/// will share.
///
/// A node plays either side of the establishment protocol. A leaf drives
/// one [`connect_leaf`](Node::connect_leaf) call against the hub; the hub
/// calls [`connect_hub`](Node::connect_hub) with the full peer list and
/// gets one queue pair per peer.
pub struct Node {
    ctx: Arc<Context>,
    cq: Arc<CompletionQueue>,
    pd: Arc<ProtectionDomain>,
}

impl Node {
    pub fn new(selector: &DeviceSelector, port: u8, cq_depth: u32) -> Result<Self> {
        let ctx = Arc::new(Context::open_port(selector, port)?);
        let cq = Arc::new(ctx.create_completion_queue(cq_depth)?);
        let pd = Arc::new(ctx.create_protection_domain()?);
        Ok(Self { ctx, cq, pd })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn completion_queue(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }

    pub fn protection_domain(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }

    /// Create a queue pair in RESET on the shared completion queue and
    /// protection domain.
    pub fn create_queue_pair(&self, config: &QueuePairConfig) -> Result<QueuePair> {
        let mut builder = self.pd.create_queue_pair_builder();
        builder.set_cq(&self.cq).set_config(config.clone());
        builder.build()
    }

    /// Register `layout.size()` bytes of fresh memory in this node's
    /// protection domain.
    pub fn register_memory(&self, layout: Layout, access: AccessFlags) -> Result<MemoryRegion> {
        self.pd.register_memory(layout, access)
    }

    /// Establish one reliable connection with `peer`: create a queue
    /// pair, exchange address tuples over `rendezvous` (send ours, then
    /// receive theirs), and drive the full transition sequence.
    ///
    /// On error the queue pair is dropped in whatever state it reached;
    /// nothing is retried.
    pub fn connect_leaf(
        &self,
        peer: PeerId,
        rendezvous: &impl Rendezvous,
        qp_config: &QueuePairConfig,
        connect_config: &ConnectConfig,
    ) -> Result<QueuePair> {
        let mut qp = self.create_queue_pair(qp_config)?;
        rendezvous.send(peer, qp.endpoint())?;
        let remote = rendezvous.receive(peer)?;
        qp.connect(remote, connect_config)?;
        info!(
            peer,
            qp_num = qp.qp_num(),
            dest_lid = remote.lid,
            dest_qp_num = remote.qp_num,
            "established reliable connection"
        );
        Ok(qp)
    }

    /// Establish one connection per peer in `peers`, sequentially, each
    /// through its own queue pair.
    ///
    /// A failure with one peer is reported in that peer's slot and does
    /// not stop the remaining exchanges. Queue-pair creation against the
    /// shared protection domain is kept sequential here; drivers do not
    /// promise concurrent creation on one domain is safe.
    pub fn connect_hub(
        &self,
        peers: &[PeerId],
        rendezvous: &impl Rendezvous,
        qp_config: &QueuePairConfig,
        connect_config: &ConnectConfig,
    ) -> Vec<(PeerId, Result<QueuePair>)> {
        peers
            .iter()
            .map(|&peer| {
                let result = self.connect_leaf(peer, rendezvous, qp_config, connect_config);
                if let Err(err) = &result {
                    warn!(peer, %err, "connection with peer failed");
                }
                (peer, result)
            })
            .collect()
    }
}
