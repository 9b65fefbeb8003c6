//! libibverbs backend, enabled by the `verbs` feature.
//!
//! Thin unsafe wrappers over `rdma-sys`: NonNull-owned resource handles
//! destroyed on drop, errno captured whenever a verbs call returns null,
//! and the exact attribute mask each `ibv_modify_qp` step requires.

use crate::config::{InitConfig, PathMtu, QueuePairConfig, RtrConfig, RtsConfig};
use crate::context::PortAttr;
use crate::device::{DeviceInfo, PortState};
use crate::gid::Gid;
use crate::queue_pair::QueuePairEndpoint;
use num_traits::FromPrimitive;
use rdma_sys::{
    ibv_alloc_pd, ibv_close_device, ibv_context, ibv_cq, ibv_create_cq, ibv_create_qp,
    ibv_dealloc_pd, ibv_dereg_mr, ibv_destroy_cq, ibv_destroy_qp, ibv_free_device_list,
    ibv_get_device_list, ibv_get_device_name, ibv_gid, ibv_modify_qp, ibv_mr, ibv_mtu,
    ibv_open_device, ibv_pd, ibv_port_attr, ibv_qp, ibv_qp_attr, ibv_qp_attr_mask,
    ibv_qp_init_attr, ibv_qp_state, ibv_qp_type, ibv_query_gid, ibv_reg_mr,
};
use std::ffi::CStr;
use std::io;
use std::ptr::{self, NonNull};

fn last_errno() -> io::Error {
    io::Error::from_raw_os_error(errno::errno().0)
}

// ibv_port_state values.
fn port_state_from_raw(state: u32) -> PortState {
    match state {
        0 => PortState::Nop,
        1 => PortState::Down,
        2 => PortState::Init,
        3 => PortState::Armed,
        4 => PortState::Active,
        5 => PortState::ActiveDefer,
        _ => PortState::Unknown,
    }
}

pub(crate) fn list_devices() -> io::Result<Vec<DeviceInfo>> {
    let mut num_devices = 0;
    let list = unsafe { ibv_get_device_list(&mut num_devices) };
    if list.is_null() {
        return Err(last_errno());
    }
    let mut devices = Vec::with_capacity(num_devices as usize);
    for index in 0..num_devices as usize {
        let dev = unsafe { *list.add(index) };
        let name = unsafe { CStr::from_ptr(ibv_get_device_name(dev)) };
        devices.push(DeviceInfo {
            index,
            name: name.to_string_lossy().into_owned(),
        });
    }
    unsafe { ibv_free_device_list(list) };
    Ok(devices)
}

pub(crate) fn open_device(name: &str) -> io::Result<RawContext> {
    let mut num_devices = 0;
    let list = unsafe { ibv_get_device_list(&mut num_devices) };
    if list.is_null() {
        return Err(last_errno());
    }
    let mut found = None;
    for index in 0..num_devices as usize {
        let dev = unsafe { *list.add(index) };
        let dev_name = unsafe { CStr::from_ptr(ibv_get_device_name(dev)) };
        if dev_name.to_string_lossy() == name {
            found = Some(dev);
            break;
        }
    }
    let result = match found {
        Some(dev) => NonNull::new(unsafe { ibv_open_device(dev) })
            .map(|ctx| RawContext { ctx })
            .ok_or_else(last_errno),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such device {name}"),
        )),
    };
    unsafe { ibv_free_device_list(list) };
    result
}

pub(crate) struct RawContext {
    ctx: NonNull<ibv_context>,
}

// libibverbs documents its resource handles as thread safe.
unsafe impl Send for RawContext {}
unsafe impl Sync for RawContext {}

impl RawContext {
    pub(crate) fn query_port(&self, port: u8) -> io::Result<PortAttr> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
        let errno = unsafe { rdma_sys::___ibv_query_port(self.ctx.as_ptr(), port, &mut attr) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(PortAttr {
            lid: attr.lid,
            state: port_state_from_raw(attr.state as u32),
            active_mtu: PathMtu::from_u32(attr.active_mtu as u32).unwrap_or_default(),
        })
    }

    pub(crate) fn query_gid(&self, port: u8) -> io::Result<Gid> {
        let mut gid = unsafe { std::mem::zeroed::<ibv_gid>() };
        let errno = unsafe { ibv_query_gid(self.ctx.as_ptr(), port, 0, &mut gid) };
        if errno != 0 {
            return Err(last_errno());
        }
        Ok(Gid::from(gid))
    }
}

impl Drop for RawContext {
    fn drop(&mut self) {
        let errno = unsafe { ibv_close_device(self.ctx.as_ptr()) };
        assert_eq!(errno, 0);
    }
}

pub(crate) struct RawCompletionQueue {
    cq: NonNull<ibv_cq>,
}

unsafe impl Send for RawCompletionQueue {}
unsafe impl Sync for RawCompletionQueue {}

impl RawCompletionQueue {
    pub(crate) fn create(ctx: &RawContext, depth: u32) -> io::Result<Self> {
        let cq = NonNull::new(unsafe {
            ibv_create_cq(
                ctx.ctx.as_ptr(),
                depth as _,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        })
        .ok_or_else(last_errno)?;
        Ok(Self { cq })
    }

    /// Capacity the device actually allocated, possibly rounded up from
    /// the request.
    pub(crate) fn depth(&self) -> u32 {
        unsafe { self.cq.as_ref() }.cqe as u32
    }

    pub(crate) fn as_ptr(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }
}

impl Drop for RawCompletionQueue {
    fn drop(&mut self) {
        let errno = unsafe { ibv_destroy_cq(self.cq.as_ptr()) };
        assert_eq!(errno, 0);
    }
}

pub(crate) struct RawProtectionDomain {
    pd: NonNull<ibv_pd>,
}

unsafe impl Send for RawProtectionDomain {}
unsafe impl Sync for RawProtectionDomain {}

impl RawProtectionDomain {
    pub(crate) fn alloc(ctx: &RawContext) -> io::Result<Self> {
        let pd = NonNull::new(unsafe { ibv_alloc_pd(ctx.ctx.as_ptr()) }).ok_or_else(last_errno)?;
        Ok(Self { pd })
    }
}

impl Drop for RawProtectionDomain {
    fn drop(&mut self) {
        let errno = unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
        assert_eq!(errno, 0);
    }
}

pub(crate) struct RawMemoryRegion {
    mr: NonNull<ibv_mr>,
}

unsafe impl Send for RawMemoryRegion {}
unsafe impl Sync for RawMemoryRegion {}

impl RawMemoryRegion {
    pub(crate) fn register(
        pd: &RawProtectionDomain,
        addr: *const u8,
        len: usize,
        access: u32,
    ) -> io::Result<Self> {
        let mr = NonNull::new(unsafe {
            ibv_reg_mr(pd.pd.as_ptr(), addr as _, len, access as _)
        })
        .ok_or_else(last_errno)?;
        Ok(Self { mr })
    }

    pub(crate) fn lkey(&self) -> u32 {
        unsafe { self.mr.as_ref() }.lkey
    }

    pub(crate) fn rkey(&self) -> u32 {
        unsafe { self.mr.as_ref() }.rkey
    }
}

impl Drop for RawMemoryRegion {
    fn drop(&mut self) {
        let errno = unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
        assert_eq!(errno, 0);
    }
}

pub(crate) struct RawQueuePair {
    qp: NonNull<ibv_qp>,
}

unsafe impl Send for RawQueuePair {}
unsafe impl Sync for RawQueuePair {}

impl RawQueuePair {
    pub(crate) fn create(
        pd: &RawProtectionDomain,
        send_cq: &RawCompletionQueue,
        recv_cq: &RawCompletionQueue,
        config: &QueuePairConfig,
    ) -> io::Result<Self> {
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.qp_context = ptr::null::<libc::c_void>() as *mut _;
        init_attr.send_cq = send_cq.as_ptr();
        init_attr.recv_cq = recv_cq.as_ptr();
        init_attr.srq = ptr::null_mut();
        init_attr.cap.max_send_wr = config.max_send_wr;
        init_attr.cap.max_recv_wr = config.max_recv_wr;
        init_attr.cap.max_send_sge = config.max_send_sge;
        init_attr.cap.max_recv_sge = config.max_recv_sge;
        init_attr.cap.max_inline_data = config.max_inline_data;
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.sq_sig_all = config.signal_all as _;
        let qp = NonNull::new(unsafe { ibv_create_qp(pd.pd.as_ptr(), &mut init_attr) })
            .ok_or_else(last_errno)?;
        Ok(Self { qp })
    }

    pub(crate) fn qp_num(&self) -> u32 {
        unsafe { self.qp.as_ref() }.qp_num
    }

    pub(crate) fn modify_to_init(&mut self, config: &InitConfig, port_num: u8) -> io::Result<()> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = config.pkey_index;
        attr.port_num = port_num;
        attr.qp_access_flags = config.access.bits();
        let flags = ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        let errno = unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut attr, flags.0 as _) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }

    pub(crate) fn modify_to_rtr(
        &mut self,
        remote: QueuePairEndpoint,
        config: &RtrConfig,
        port_num: u8,
    ) -> io::Result<()> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = match config.path_mtu {
            PathMtu::Mtu256 => ibv_mtu::IBV_MTU_256,
            PathMtu::Mtu512 => ibv_mtu::IBV_MTU_512,
            PathMtu::Mtu1024 => ibv_mtu::IBV_MTU_1024,
            PathMtu::Mtu2048 => ibv_mtu::IBV_MTU_2048,
            PathMtu::Mtu4096 => ibv_mtu::IBV_MTU_4096,
        };
        attr.dest_qp_num = remote.qp_num;
        attr.rq_psn = config.rq_psn;
        attr.max_dest_rd_atomic = config.max_dest_rd_atomic;
        attr.min_rnr_timer = config.min_rnr_timer;
        // LID-routed address vector, no global routing header
        attr.ah_attr.dlid = remote.lid;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.is_global = 0;
        attr.ah_attr.port_num = port_num;
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        let errno = unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut attr, flags.0 as _) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }

    pub(crate) fn modify_to_rts(&mut self, config: &RtsConfig) -> io::Result<()> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.timeout = config.timeout;
        attr.retry_cnt = config.retry_cnt;
        attr.rnr_retry = config.rnr_retry;
        attr.sq_psn = config.sq_psn;
        attr.max_rd_atomic = config.max_rd_atomic;
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        let errno = unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut attr, flags.0 as _) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }
}

impl Drop for RawQueuePair {
    fn drop(&mut self) {
        let errno = unsafe { ibv_destroy_qp(self.qp.as_ptr()) };
        assert_eq!(errno, 0);
    }
}
