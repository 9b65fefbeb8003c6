//! In-process simulated host, the default backend.
//!
//! Stands in for libibverbs when the `verbs` feature is off: the same
//! resource calls and the same queue-pair transition ordering, backed by
//! a process-wide device table instead of hardware. The table mirrors
//! what device enumeration is on a real host, ambient process-wide state.
//! It is append-only, so concurrently running tests stay deterministic as
//! long as each uses device names of its own.

use crate::config::{InitConfig, PathMtu, QueuePairConfig, RtrConfig, RtsConfig};
use crate::context::PortAttr;
use crate::device::{DeviceInfo, PortState};
use crate::gid::Gid;
use crate::queue_pair::{QueuePairEndpoint, QueuePairState};
use lazy_static::lazy_static;
use std::io;
use std::sync::Mutex;

/// Deepest completion queue the simulated device accepts.
const MAX_CQ_DEPTH: u32 = 1 << 22;
/// Deepest per-direction work-request queue.
const MAX_QP_WR: u32 = 1 << 14;
/// Most scatter/gather elements per work request.
const MAX_SGE: u32 = 32;

/// Description of one simulated device: a single-port adapter addressed
/// by `lid`.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub name: String,
    pub lid: u16,
    pub qpn_base: u32,
    pub port_down: bool,
}

impl SimDevice {
    /// A device named `name` whose port carries local identifier `lid`.
    /// Queue-pair numbers start at `lid << 8` unless overridden.
    pub fn new(name: impl Into<String>, lid: u16) -> Self {
        Self {
            name: name.into(),
            lid,
            qpn_base: u32::from(lid) << 8,
            port_down: false,
        }
    }

    /// Start queue-pair numbering at `base`.
    pub fn qpn_base(mut self, base: u32) -> Self {
        self.qpn_base = base;
        self
    }

    /// Report the port as DOWN instead of ACTIVE.
    pub fn port_down(mut self) -> Self {
        self.port_down = true;
        self
    }
}

struct DeviceState {
    desc: SimDevice,
    next_qpn: u32,
    next_key: u32,
}

impl DeviceState {
    fn new(desc: SimDevice) -> Self {
        let next_qpn = desc.qpn_base;
        Self {
            desc,
            next_qpn,
            next_key: 1,
        }
    }
}

struct Host {
    devices: Vec<DeviceState>,
}

lazy_static! {
    static ref HOST: Mutex<Host> = Mutex::new(Host {
        devices: vec![
            DeviceState::new(SimDevice::new("sim0", 1)),
            DeviceState::new(SimDevice::new("sim1", 2)),
        ],
    });
}

/// Add a device to the simulated host's inventory.
///
/// Installation is append-only; enumeration lists devices in install
/// order after the seeded `sim0` and `sim1`.
pub fn install_device(device: SimDevice) {
    HOST.lock().unwrap().devices.push(DeviceState::new(device));
}

pub(crate) fn list_devices() -> io::Result<Vec<DeviceInfo>> {
    let host = HOST.lock().unwrap();
    Ok(host
        .devices
        .iter()
        .enumerate()
        .map(|(index, dev)| DeviceInfo {
            index,
            name: dev.desc.name.clone(),
        })
        .collect())
}

pub(crate) fn open_device(name: &str) -> io::Result<RawContext> {
    let host = HOST.lock().unwrap();
    let device_index = host
        .devices
        .iter()
        .position(|dev| dev.desc.name == name)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such device {name}")))?;
    Ok(RawContext { device_index })
}

pub(crate) struct RawContext {
    device_index: usize,
}

impl RawContext {
    pub(crate) fn query_port(&self, port: u8) -> io::Result<PortAttr> {
        let host = HOST.lock().unwrap();
        let dev = &host.devices[self.device_index];
        // simulated devices expose exactly one port
        if port != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("device has no port {port}"),
            ));
        }
        let state = if dev.desc.port_down {
            PortState::Down
        } else {
            PortState::Active
        };
        Ok(PortAttr {
            lid: dev.desc.lid,
            state,
            active_mtu: PathMtu::Mtu4096,
        })
    }

    pub(crate) fn query_gid(&self, port: u8) -> io::Result<Gid> {
        if port != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("device has no port {port}"),
            ));
        }
        let host = HOST.lock().unwrap();
        let dev = &host.devices[self.device_index];
        // link-local prefix with the lid folded into the interface id
        let mut raw = [0_u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[14..16].copy_from_slice(&dev.desc.lid.to_be_bytes());
        Ok(Gid::from_raw(raw))
    }
}

pub(crate) struct RawCompletionQueue {
    depth: u32,
}

impl RawCompletionQueue {
    pub(crate) fn create(_ctx: &RawContext, depth: u32) -> io::Result<Self> {
        if depth == 0 || depth > MAX_CQ_DEPTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("completion queue depth {depth} outside 1..={MAX_CQ_DEPTH}"),
            ));
        }
        Ok(Self { depth })
    }

    pub(crate) fn depth(&self) -> u32 {
        self.depth
    }
}

pub(crate) struct RawProtectionDomain {
    device_index: usize,
}

impl RawProtectionDomain {
    pub(crate) fn alloc(ctx: &RawContext) -> io::Result<Self> {
        Ok(Self {
            device_index: ctx.device_index,
        })
    }
}

pub(crate) struct RawMemoryRegion {
    lkey: u32,
    rkey: u32,
}

impl RawMemoryRegion {
    pub(crate) fn register(
        pd: &RawProtectionDomain,
        _addr: *const u8,
        len: usize,
        _access: u32,
    ) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot register a zero-length region",
            ));
        }
        let mut host = HOST.lock().unwrap();
        let dev = &mut host.devices[pd.device_index];
        let lkey = dev.next_key;
        let rkey = dev.next_key + 1;
        dev.next_key += 2;
        Ok(Self { lkey, rkey })
    }

    pub(crate) fn lkey(&self) -> u32 {
        self.lkey
    }

    pub(crate) fn rkey(&self) -> u32 {
        self.rkey
    }
}

pub(crate) struct RawQueuePair {
    qp_num: u32,
    state: QueuePairState,
}

impl RawQueuePair {
    pub(crate) fn create(
        pd: &RawProtectionDomain,
        _send_cq: &RawCompletionQueue,
        _recv_cq: &RawCompletionQueue,
        config: &QueuePairConfig,
    ) -> io::Result<Self> {
        if config.max_send_wr == 0
            || config.max_send_wr > MAX_QP_WR
            || config.max_recv_wr == 0
            || config.max_recv_wr > MAX_QP_WR
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "work request depth outside device limits",
            ));
        }
        if config.max_send_sge == 0
            || config.max_send_sge > MAX_SGE
            || config.max_recv_sge == 0
            || config.max_recv_sge > MAX_SGE
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "scatter/gather count outside device limits",
            ));
        }
        let mut host = HOST.lock().unwrap();
        let dev = &mut host.devices[pd.device_index];
        let qp_num = dev.next_qpn;
        dev.next_qpn += 1;
        Ok(Self {
            qp_num,
            state: QueuePairState::Reset,
        })
    }

    pub(crate) fn qp_num(&self) -> u32 {
        self.qp_num
    }

    // The same rejection a driver reports for an out-of-order modify.
    fn step(&mut self, from: QueuePairState, to: QueuePairState) -> io::Result<()> {
        if self.state != from {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("queue pair in {} cannot move to {to}", self.state),
            ));
        }
        self.state = to;
        Ok(())
    }

    pub(crate) fn modify_to_init(&mut self, _config: &InitConfig, port_num: u8) -> io::Result<()> {
        if port_num != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("device has no port {port_num}"),
            ));
        }
        self.step(QueuePairState::Reset, QueuePairState::Init)
    }

    pub(crate) fn modify_to_rtr(
        &mut self,
        _remote: QueuePairEndpoint,
        _config: &RtrConfig,
        _port_num: u8,
    ) -> io::Result<()> {
        self.step(QueuePairState::Init, QueuePairState::ReadyToReceive)
    }

    pub(crate) fn modify_to_rts(&mut self, _config: &RtsConfig) -> io::Result<()> {
        self.step(QueuePairState::ReadyToReceive, QueuePairState::ReadyToSend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_lists_installed_devices() {
        install_device(SimDevice::new("sim-enum", 91));
        let devices = list_devices().unwrap();
        assert!(devices.iter().any(|dev| dev.name == "sim0"));
        let found = devices.iter().find(|dev| dev.name == "sim-enum").unwrap();
        assert_eq!(devices[found.index].name, "sim-enum");
    }

    #[test]
    fn queue_pair_numbers_count_up_from_the_base() {
        install_device(SimDevice::new("sim-qpn", 92).qpn_base(7000));
        let ctx = open_device("sim-qpn").unwrap();
        let pd = RawProtectionDomain::alloc(&ctx).unwrap();
        let cq = RawCompletionQueue::create(&ctx, 16).unwrap();
        let config = QueuePairConfig::default();
        let a = RawQueuePair::create(&pd, &cq, &cq, &config).unwrap();
        let b = RawQueuePair::create(&pd, &cq, &cq, &config).unwrap();
        assert_eq!(a.qp_num(), 7000);
        assert_eq!(b.qp_num(), 7001);
    }

    #[test]
    fn out_of_order_modify_is_rejected_like_hardware() {
        install_device(SimDevice::new("sim-order", 93));
        let ctx = open_device("sim-order").unwrap();
        let pd = RawProtectionDomain::alloc(&ctx).unwrap();
        let cq = RawCompletionQueue::create(&ctx, 16).unwrap();
        let mut qp = RawQueuePair::create(&pd, &cq, &cq, &QueuePairConfig::default()).unwrap();
        let remote = QueuePairEndpoint { lid: 1, qp_num: 1 };
        let err = qp
            .modify_to_rtr(remote, &RtrConfig::default(), 1)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn oversized_work_queues_are_rejected() {
        install_device(SimDevice::new("sim-wr", 94));
        let ctx = open_device("sim-wr").unwrap();
        let pd = RawProtectionDomain::alloc(&ctx).unwrap();
        let cq = RawCompletionQueue::create(&ctx, 16).unwrap();
        let config = QueuePairConfig {
            max_send_wr: MAX_QP_WR + 1,
            ..QueuePairConfig::default()
        };
        assert!(RawQueuePair::create(&pd, &cq, &cq, &config).is_err());
    }
}
