//! Tuning parameters for queue-pair creation and connection establishment.
//!
//! Every knob here is network/hardware-dependent tuning, not protocol
//! invariant, so each struct carries documented defaults instead of
//! hardcoding values at the call sites. The defaults are the conservative
//! single-port InfiniBand settings the crate was brought up with.

use crate::memory_region::AccessFlags;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Path MTU used for the INIT→READY_TO_RECEIVE transition.
///
/// Discriminants match the verbs `ibv_mtu` encoding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromPrimitive, ToPrimitive,
)]
pub enum PathMtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl PathMtu {
    /// MTU in bytes.
    pub fn bytes(self) -> u32 {
        256 << (self as u32 - 1)
    }
}

impl Default for PathMtu {
    fn default() -> Self {
        // Most conservative value that still interoperates everywhere.
        PathMtu::Mtu512
    }
}

impl fmt::Display for PathMtu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Capacity descriptor for a new queue pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePairConfig {
    /// Maximum outstanding work requests on the send queue.
    #[serde(default = "default_max_send_wr")]
    pub max_send_wr: u32,

    /// Maximum outstanding work requests on the receive queue. One is
    /// enough when only one-sided RDMA operations will follow.
    #[serde(default = "default_max_recv_wr")]
    pub max_recv_wr: u32,

    /// Maximum scatter/gather elements per send work request.
    #[serde(default = "default_max_sge")]
    pub max_send_sge: u32,

    /// Maximum scatter/gather elements per receive work request.
    #[serde(default = "default_max_sge")]
    pub max_recv_sge: u32,

    /// Payloads at or below this size are copied into the work descriptor
    /// by the device instead of fetched through a memory reference. A
    /// performance knob, not a correctness one.
    #[serde(default = "default_max_inline_data")]
    pub max_inline_data: u32,

    /// Whether every send work request generates a completion entry.
    #[serde(default = "default_true")]
    pub signal_all: bool,
}

fn default_max_send_wr() -> u32 {
    16
}
fn default_max_recv_wr() -> u32 {
    1
}
fn default_max_sge() -> u32 {
    1
}
fn default_max_inline_data() -> u32 {
    16
}
fn default_true() -> bool {
    true
}

impl Default for QueuePairConfig {
    fn default() -> Self {
        Self {
            max_send_wr: default_max_send_wr(),
            max_recv_wr: default_max_recv_wr(),
            max_send_sge: default_max_sge(),
            max_recv_sge: default_max_sge(),
            max_inline_data: default_max_inline_data(),
            signal_all: true,
        }
    }
}

/// Parameters for the RESET→INIT transition. Purely local; this transition
/// may run before any rendezvous completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    /// Partition key index. The default partition is the right choice on
    /// an unpartitioned fabric.
    #[serde(default)]
    pub pkey_index: u16,

    /// Access flags the queue pair enforces on incoming remote operations.
    /// Must match the flags on any memory region the peer will touch.
    #[serde(default = "AccessFlags::all_operations")]
    pub access: AccessFlags,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            pkey_index: 0,
            access: AccessFlags::all_operations(),
        }
    }
}

impl InitConfig {
    pub(crate) fn validate(&self) -> io::Result<()> {
        self.access.validate()
    }
}

/// Parameters for the INIT→READY_TO_RECEIVE transition. This is the
/// rendezvous synchronization point: it also consumes the peer's address
/// tuple, which is passed separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtrConfig {
    /// Path MTU for the connection.
    #[serde(default)]
    pub path_mtu: PathMtu,

    /// Starting receive packet sequence number. Both sides must agree;
    /// zero is the mutually derivable convention.
    #[serde(default)]
    pub rq_psn: u32,

    /// How many inbound RDMA read/atomic operations this side accepts as
    /// a destination.
    #[serde(default = "default_rd_atomic")]
    pub max_dest_rd_atomic: u8,

    /// Minimum receiver-not-ready NAK timer (5-bit encoded delay,
    /// device-vendor recommendation).
    #[serde(default = "default_min_rnr_timer")]
    pub min_rnr_timer: u8,
}

fn default_rd_atomic() -> u8 {
    16
}
fn default_min_rnr_timer() -> u8 {
    12
}

impl Default for RtrConfig {
    fn default() -> Self {
        Self {
            path_mtu: PathMtu::default(),
            rq_psn: 0,
            max_dest_rd_atomic: default_rd_atomic(),
            min_rnr_timer: default_min_rnr_timer(),
        }
    }
}

impl RtrConfig {
    pub(crate) fn validate(&self) -> io::Result<()> {
        if self.min_rnr_timer > 31 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("min_rnr_timer {} exceeds the 5-bit range", self.min_rnr_timer),
            ));
        }
        Ok(())
    }
}

/// Parameters for the READY_TO_RECEIVE→READY_TO_SEND transition. Purely
/// local tuning, but `sq_psn` must equal the `rq_psn` used in the previous
/// transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtsConfig {
    /// ACK timeout exponent: the wait is `4.096µs * 2^timeout`
    /// (device-vendor recommendation).
    #[serde(default = "default_timeout")]
    pub timeout: u8,

    /// Retries for unacknowledged sends (3-bit field).
    #[serde(default = "default_retry_cnt")]
    pub retry_cnt: u8,

    /// Retries after receiver-not-ready NAKs (3-bit field, 7 = infinite).
    #[serde(default)]
    pub rnr_retry: u8,

    /// Starting send packet sequence number. Must equal the receive psn.
    #[serde(default)]
    pub sq_psn: u32,

    /// How many outbound RDMA read/atomic operations this side may have
    /// in flight as an initiator.
    #[serde(default = "default_rd_atomic")]
    pub max_rd_atomic: u8,
}

fn default_timeout() -> u8 {
    0x12
}
fn default_retry_cnt() -> u8 {
    6
}

impl Default for RtsConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            retry_cnt: default_retry_cnt(),
            rnr_retry: 0,
            sq_psn: 0,
            max_rd_atomic: default_rd_atomic(),
        }
    }
}

impl RtsConfig {
    pub(crate) fn validate(&self) -> io::Result<()> {
        if self.timeout > 31 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("timeout exponent {} exceeds the 5-bit range", self.timeout),
            ));
        }
        if self.retry_cnt > 7 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("retry_cnt {} exceeds the 3-bit range", self.retry_cnt),
            ));
        }
        if self.rnr_retry > 7 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rnr_retry {} exceeds the 3-bit range", self.rnr_retry),
            ));
        }
        Ok(())
    }
}

/// Everything needed to drive one queue pair through the full
/// RESET→READY_TO_SEND sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectConfig {
    #[serde(default)]
    pub init: InitConfig,
    #[serde(default)]
    pub rtr: RtrConfig,
    #[serde(default)]
    pub rts: RtsConfig,
}

impl ConnectConfig {
    /// Check the whole configuration before any device call, including the
    /// cross-transition packet-sequence-number invariant.
    pub fn validate(&self) -> io::Result<()> {
        self.init.validate()?;
        self.rtr.validate()?;
        self.rts.validate()?;
        if self.rts.sq_psn != self.rtr.rq_psn {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "sq_psn {} must equal rq_psn {}",
                    self.rts.sq_psn, self.rtr.rq_psn
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tuning() {
        let qp = QueuePairConfig::default();
        assert_eq!(qp.max_send_wr, 16);
        assert_eq!(qp.max_recv_wr, 1);
        assert_eq!(qp.max_send_sge, 1);
        assert_eq!(qp.max_recv_sge, 1);
        assert_eq!(qp.max_inline_data, 16);
        assert!(qp.signal_all);

        let cfg = ConnectConfig::default();
        assert_eq!(cfg.init.pkey_index, 0);
        assert_eq!(cfg.rtr.path_mtu, PathMtu::Mtu512);
        assert_eq!(cfg.rtr.rq_psn, 0);
        assert_eq!(cfg.rtr.max_dest_rd_atomic, 16);
        assert_eq!(cfg.rtr.min_rnr_timer, 12);
        assert_eq!(cfg.rts.timeout, 0x12);
        assert_eq!(cfg.rts.retry_cnt, 6);
        assert_eq!(cfg.rts.rnr_retry, 0);
        assert_eq!(cfg.rts.sq_psn, 0);
        assert_eq!(cfg.rts.max_rd_atomic, 16);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let cfg: ConnectConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, ConnectConfig::default());

        let qp: QueuePairConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(qp, QueuePairConfig::default());
    }

    #[test]
    fn serde_roundtrip() {
        let mut cfg = ConnectConfig::default();
        cfg.rtr.path_mtu = PathMtu::Mtu4096;
        cfg.rtr.rq_psn = 77;
        cfg.rts.sq_psn = 77;
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ConnectConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn mismatched_psn_is_rejected() {
        let mut cfg = ConnectConfig::default();
        cfg.rts.sq_psn = 1;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("sq_psn"));
    }

    #[test]
    fn three_bit_fields_are_range_checked() {
        let mut cfg = RtsConfig::default();
        cfg.retry_cnt = 8;
        assert!(cfg.validate().is_err());

        let mut cfg = RtsConfig::default();
        cfg.rnr_retry = 9;
        assert!(cfg.validate().is_err());

        let mut cfg = RtrConfig::default();
        cfg.min_rnr_timer = 32;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn path_mtu_bytes() {
        assert_eq!(PathMtu::Mtu256.bytes(), 256);
        assert_eq!(PathMtu::Mtu512.bytes(), 512);
        assert_eq!(PathMtu::Mtu4096.bytes(), 4096);
        assert_eq!(PathMtu::Mtu1024.to_string(), "1024");
    }
}
