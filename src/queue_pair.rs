use crate::backend;
use crate::completion_queue::CompletionQueue;
use crate::config::{ConnectConfig, InitConfig, QueuePairConfig, RtrConfig, RtsConfig};
use crate::error::{Error, Result};
use crate::protection_domain::ProtectionDomain;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// Connection state of a reliable-connected queue pair.
///
/// The four states form a strict linear sequence. No step may be skipped
/// and none re-entered once passed; a queue pair that fails mid-sequence
/// stays in the last state it reached and is unusable for data
/// operations. Discriminants match the verbs `ibv_qp_state` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairState {
    Reset = 0,
    Init = 1,
    ReadyToReceive = 2,
    ReadyToSend = 3,
}

impl fmt::Display for QueuePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueuePairState::Reset => "RESET",
            QueuePairState::Init => "INIT",
            QueuePairState::ReadyToReceive => "READY_TO_RECEIVE",
            QueuePairState::ReadyToSend => "READY_TO_SEND",
        };
        f.write_str(name)
    }
}

/// The address tuple one side must learn about its peer before the
/// INIT→READY_TO_RECEIVE transition: the peer port's local identifier and
/// the peer queue pair's number.
///
/// Exchanged once per queue pair over the rendezvous channel; bincode
/// keeps the two fields at their fixed widths on the wire (6 bytes total).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePairEndpoint {
    pub lid: u16,
    pub qp_num: u32,
}

/// Builder for a queue pair owned by one protection domain.
///
/// A completion queue must be attached before `build`; the same queue may
/// carry both directions.
pub struct QueuePairBuilder {
    pd: Arc<ProtectionDomain>,
    send_cq: Option<Arc<CompletionQueue>>,
    recv_cq: Option<Arc<CompletionQueue>>,
    config: QueuePairConfig,
}

impl QueuePairBuilder {
    pub fn new(pd: &Arc<ProtectionDomain>) -> Self {
        Self {
            pd: pd.clone(),
            send_cq: None,
            recv_cq: None,
            config: QueuePairConfig::default(),
        }
    }

    /// Use `cq` for both send and receive completions.
    pub fn set_cq(&mut self, cq: &Arc<CompletionQueue>) -> &mut Self {
        self.send_cq = Some(cq.clone());
        self.recv_cq = Some(cq.clone());
        self
    }

    pub fn set_send_cq(&mut self, cq: &Arc<CompletionQueue>) -> &mut Self {
        self.send_cq = Some(cq.clone());
        self
    }

    pub fn set_recv_cq(&mut self, cq: &Arc<CompletionQueue>) -> &mut Self {
        self.recv_cq = Some(cq.clone());
        self
    }

    pub fn set_config(&mut self, config: QueuePairConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Create the queue pair. It starts in RESET.
    ///
    /// # Errors
    ///
    /// `AllocationFailed` when no completion queue was attached, the
    /// queues belong to a different device context than the domain, or
    /// the device rejects the requested capacities.
    pub fn build(&self) -> Result<QueuePair> {
        let invalid = |msg: &str| Error::AllocationFailed {
            resource: "queue pair",
            source: io::Error::new(io::ErrorKind::InvalidInput, msg),
        };
        let send_cq = self
            .send_cq
            .clone()
            .ok_or_else(|| invalid("no send completion queue attached"))?;
        let recv_cq = self
            .recv_cq
            .clone()
            .ok_or_else(|| invalid("no receive completion queue attached"))?;
        if !Arc::ptr_eq(send_cq.context(), &self.pd.ctx)
            || !Arc::ptr_eq(recv_cq.context(), &self.pd.ctx)
        {
            return Err(invalid(
                "completion queue and protection domain come from different contexts",
            ));
        }
        let raw =
            backend::RawQueuePair::create(self.pd.raw(), send_cq.raw(), recv_cq.raw(), &self.config)
                .map_err(|source| Error::AllocationFailed {
                    resource: "queue pair",
                    source,
                })?;
        let qp_num = raw.qp_num();
        debug!(
            qp_num,
            max_send_wr = self.config.max_send_wr,
            max_recv_wr = self.config.max_recv_wr,
            "created queue pair"
        );
        Ok(QueuePair {
            raw,
            pd: self.pd.clone(),
            _send_cq: send_cq,
            _recv_cq: recv_cq,
            qp_num,
            state: QueuePairState::Reset,
            rq_psn: None,
        })
    }
}

/// A reliable-connected queue pair.
///
/// Created in RESET by [`QueuePairBuilder`]; [`connect`](Self::connect)
/// or the individual `modify_to_*` steps drive it to READY_TO_SEND. The
/// raw handle is declared first so the device object is destroyed before
/// the domain and queues it references.
pub struct QueuePair {
    raw: backend::RawQueuePair,
    pd: Arc<ProtectionDomain>,
    _send_cq: Arc<CompletionQueue>,
    _recv_cq: Arc<CompletionQueue>,
    qp_num: u32,
    state: QueuePairState,
    rq_psn: Option<u32>,
}

impl QueuePair {
    /// Number the device assigned at creation, unique per device.
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    pub fn state(&self) -> QueuePairState {
        self.state
    }

    /// This side's address tuple, exactly as the peer must learn it.
    pub fn endpoint(&self) -> QueuePairEndpoint {
        QueuePairEndpoint {
            lid: self.pd.ctx.local_identifier(),
            qp_num: self.qp_num,
        }
    }

    fn expect_state(&self, required: QueuePairState, attempted: QueuePairState) -> Result<()> {
        if self.state != required {
            return Err(Error::transition(
                self.state,
                attempted,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("queue pair is in {}, transition requires {required}", self.state),
                ),
            ));
        }
        Ok(())
    }

    /// RESET→INIT. Uses local information only, so it may run before the
    /// rendezvous completes.
    pub fn modify_to_init(&mut self, config: &InitConfig) -> Result<()> {
        self.expect_state(QueuePairState::Reset, QueuePairState::Init)?;
        let reject = |source| Error::transition(QueuePairState::Reset, QueuePairState::Init, source);
        config.validate().map_err(reject)?;
        let port_num = self.pd.ctx.port_num();
        self.raw.modify_to_init(config, port_num).map_err(reject)?;
        self.state = QueuePairState::Init;
        debug!(
            qp_num = self.qp_num,
            from = %QueuePairState::Reset,
            to = %self.state,
            "queue pair transition"
        );
        Ok(())
    }

    /// INIT→READY_TO_RECEIVE. Consumes the peer's address tuple; this is
    /// the step that cannot run until the rendezvous has delivered it.
    pub fn modify_to_rtr(&mut self, remote: QueuePairEndpoint, config: &RtrConfig) -> Result<()> {
        self.expect_state(QueuePairState::Init, QueuePairState::ReadyToReceive)?;
        let reject = |source| {
            Error::transition(QueuePairState::Init, QueuePairState::ReadyToReceive, source)
        };
        config.validate().map_err(reject)?;
        if remote.lid == 0 {
            return Err(reject(io::Error::new(
                io::ErrorKind::InvalidInput,
                "peer local identifier 0 is not a routable address",
            )));
        }
        let port_num = self.pd.ctx.port_num();
        self.raw
            .modify_to_rtr(remote, config, port_num)
            .map_err(reject)?;
        self.rq_psn = Some(config.rq_psn);
        self.state = QueuePairState::ReadyToReceive;
        debug!(
            qp_num = self.qp_num,
            dest_lid = remote.lid,
            dest_qp_num = remote.qp_num,
            from = %QueuePairState::Init,
            to = %self.state,
            "queue pair transition"
        );
        Ok(())
    }

    /// READY_TO_RECEIVE→READY_TO_SEND. Local tuning only, but `sq_psn`
    /// must equal the receive sequence number recorded by the previous
    /// transition; a mismatch is rejected here, before the device sees it.
    pub fn modify_to_rts(&mut self, config: &RtsConfig) -> Result<()> {
        self.expect_state(QueuePairState::ReadyToReceive, QueuePairState::ReadyToSend)?;
        let reject = |source| {
            Error::transition(
                QueuePairState::ReadyToReceive,
                QueuePairState::ReadyToSend,
                source,
            )
        };
        config.validate().map_err(reject)?;
        if self.rq_psn != Some(config.sq_psn) {
            return Err(reject(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "sq_psn {} does not match the rq_psn {} this queue pair was receiving with",
                    config.sq_psn,
                    self.rq_psn.unwrap_or_default(),
                ),
            )));
        }
        self.raw.modify_to_rts(config).map_err(reject)?;
        self.state = QueuePairState::ReadyToSend;
        debug!(
            qp_num = self.qp_num,
            from = %QueuePairState::ReadyToReceive,
            to = %self.state,
            "queue pair transition"
        );
        Ok(())
    }

    /// Drive the full RESET→READY_TO_SEND sequence against `remote`.
    ///
    /// The whole configuration is validated up front. A failure in any
    /// step is returned as-is, never retried; the queue pair remains in
    /// the state the error reports as `reached`.
    pub fn connect(&mut self, remote: QueuePairEndpoint, config: &ConnectConfig) -> Result<()> {
        config
            .validate()
            .map_err(|source| Error::transition(self.state, QueuePairState::ReadyToSend, source))?;
        self.modify_to_init(&config.init)?;
        self.modify_to_rtr(remote, &config.rtr)?;
        self.modify_to_rts(&config.rts)?;
        Ok(())
    }
}
