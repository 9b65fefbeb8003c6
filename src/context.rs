use crate::backend;
use crate::completion_queue::CompletionQueue;
use crate::config::PathMtu;
use crate::device::{DeviceInfo, DeviceList, DeviceSelector, PortState};
use crate::error::{Error, Result};
use crate::gid::Gid;
use crate::protection_domain::ProtectionDomain;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Physical port used when none is chosen explicitly. Port numbers start
/// at 1.
pub const DEFAULT_PORT: u8 = 1;

static PROCESS_CONTEXT_OPENED: AtomicBool = AtomicBool::new(false);

/// Attributes of one physical device port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    /// Local identifier the subnet manager assigned to the port.
    pub lid: u16,
    pub state: PortState,
    /// MTU currently active on the link.
    pub active_mtu: PathMtu,
}

/// An opened RDMA device.
///
/// The context is an ordinary owned value: opening is freely repeatable,
/// and every dependent resource holds an `Arc` back to the context it was
/// created from. [`Context::open_once`] opts into a one-context-per-process
/// discipline instead.
///
/// The port is queried eagerly at open time, so the local identifier and
/// gid needed for the address tuple are cached here and a dead port fails
/// at open rather than at connection time.
pub struct Context {
    raw: backend::RawContext,
    device: DeviceInfo,
    port_num: u8,
    lid: u16,
    gid: Gid,
}

impl Context {
    /// Open the device matching `selector` on the default port.
    pub fn open(selector: &DeviceSelector) -> Result<Self> {
        Self::open_port(selector, DEFAULT_PORT)
    }

    /// Open the device matching `selector`, addressing through `port`.
    ///
    /// # Errors
    ///
    /// `NoDevicesPresent`/`DeviceNotFound` from enumeration,
    /// `AllocationFailed` when the driver refuses the open, `QueryFailed`
    /// when `port` is out of range or not active.
    pub fn open_port(selector: &DeviceSelector, port: u8) -> Result<Self> {
        let list = DeviceList::available()?;
        let device = list.resolve(selector)?.clone();
        let raw = backend::open_device(&device.name).map_err(|source| Error::AllocationFailed {
            resource: "device context",
            source,
        })?;
        let attr = Self::query_port_raw(&raw, port)?;
        let gid = raw
            .query_gid(port)
            .map_err(|source| Error::QueryFailed { port, source })?;
        info!(
            name = %device.name,
            index = device.index,
            port,
            lid = attr.lid,
            mtu = %attr.active_mtu,
            "opened RDMA device"
        );
        debug!(%gid, "port gid");
        Ok(Self {
            raw,
            device,
            port_num: port,
            lid: attr.lid,
            gid,
        })
    }

    /// Open like [`Context::open`], but allow at most one successful open
    /// per process.
    ///
    /// The guard is an explicit process-wide flag that only this
    /// constructor consults; [`Context::open`] never does. A failed open
    /// releases the claim so the caller may retry.
    pub fn open_once(selector: &DeviceSelector) -> Result<Self> {
        if PROCESS_CONTEXT_OPENED.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyOpened);
        }
        match Self::open(selector) {
            Ok(ctx) => Ok(ctx),
            Err(err) => {
                PROCESS_CONTEXT_OPENED.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn query_port_raw(raw: &backend::RawContext, port: u8) -> Result<PortAttr> {
        if port == 0 {
            return Err(Error::QueryFailed {
                port,
                source: io::Error::new(io::ErrorKind::InvalidInput, "port numbers start at 1"),
            });
        }
        let attr = raw
            .query_port(port)
            .map_err(|source| Error::QueryFailed { port, source })?;
        if !attr.state.is_active() {
            return Err(Error::QueryFailed {
                port,
                source: io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("port state is {}", attr.state),
                ),
            });
        }
        Ok(attr)
    }

    /// Query the attributes of `port`.
    ///
    /// # Errors
    ///
    /// `QueryFailed` when the port number is 0 or out of range, or when
    /// the port is not active.
    pub fn query_port(&self, port: u8) -> Result<PortAttr> {
        Self::query_port_raw(&self.raw, port)
    }

    /// Local identifier of the port this context addresses. One half of
    /// the tuple a peer needs.
    pub fn local_identifier(&self) -> u16 {
        self.lid
    }

    /// Global identifier of the port, kept for diagnostics. Connection
    /// establishment is LID-routed and never sends the gid to a peer.
    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    /// The enumeration entry this context was opened from.
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Convenience for [`CompletionQueue::create`].
    pub fn create_completion_queue(self: &Arc<Self>, depth: u32) -> Result<CompletionQueue> {
        CompletionQueue::create(self, depth)
    }

    /// Convenience for [`ProtectionDomain::create`].
    pub fn create_protection_domain(self: &Arc<Self>) -> Result<ProtectionDomain> {
        ProtectionDomain::create(self)
    }

    pub(crate) fn raw(&self) -> &backend::RawContext {
        &self.raw
    }
}

#[cfg(all(test, not(feature = "verbs")))]
mod tests {
    use super::*;
    use crate::sim::{install_device, SimDevice};

    #[test]
    fn open_caches_port_attributes() {
        install_device(SimDevice::new("ctx-open", 41));
        let ctx = Context::open(&"ctx-open".into()).unwrap();
        assert_eq!(ctx.local_identifier(), 41);
        assert_eq!(ctx.port_num(), DEFAULT_PORT);
        assert_eq!(ctx.device().name, "ctx-open");
        // the sim folds the lid into the gid interface id
        assert_eq!(ctx.gid().interface_id(), 41);
    }

    #[test]
    fn open_is_repeatable() {
        install_device(SimDevice::new("ctx-repeat", 42));
        let selector = DeviceSelector::from("ctx-repeat");
        let first = Context::open(&selector).unwrap();
        let second = Context::open(&selector).unwrap();
        assert_eq!(first.local_identifier(), second.local_identifier());
    }

    #[test]
    fn open_once_claims_the_process() {
        install_device(SimDevice::new("ctx-once", 43));
        let first = Context::open_once(&"ctx-once".into()).unwrap();
        match Context::open_once(&"ctx-once".into()) {
            Err(Error::AlreadyOpened) => {}
            other => panic!("expected AlreadyOpened, got {:?}", other.map(|_| ())),
        }
        // the first context stays fully usable
        assert_eq!(first.local_identifier(), 43);
        let ctx = Arc::new(first);
        assert!(ctx.create_completion_queue(16).is_ok());
    }

    #[test]
    fn unknown_device_is_not_found() {
        assert!(matches!(
            Context::open(&"ctx-missing".into()),
            Err(Error::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn port_zero_is_rejected() {
        install_device(SimDevice::new("ctx-port0", 44));
        let ctx = Context::open(&"ctx-port0".into()).unwrap();
        match ctx.query_port(0) {
            Err(Error::QueryFailed { port: 0, source }) => {
                assert_eq!(source.kind(), io::ErrorKind::InvalidInput);
            }
            other => panic!("expected QueryFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        install_device(SimDevice::new("ctx-port9", 45));
        let ctx = Context::open(&"ctx-port9".into()).unwrap();
        assert!(matches!(
            ctx.query_port(9),
            Err(Error::QueryFailed { port: 9, .. })
        ));
    }

    #[test]
    fn down_port_fails_at_open() {
        install_device(SimDevice::new("ctx-down", 46).port_down());
        match Context::open(&"ctx-down".into()) {
            Err(Error::QueryFailed { port, source }) => {
                assert_eq!(port, DEFAULT_PORT);
                assert!(source.to_string().contains("DOWN"), "{source}");
            }
            other => panic!("expected QueryFailed, got {:?}", other.map(|_| ())),
        }
    }
}
