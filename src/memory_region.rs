use crate::backend;
use crate::error::{Error, Result};
use crate::protection_domain::ProtectionDomain;
use bitflags::bitflags;
use std::alloc::Layout;
use std::io;
use std::sync::Arc;
use tracing::debug;

bitflags! {
    /// Access permissions granted on a memory region, and enforced by a
    /// queue pair on incoming remote operations.
    ///
    /// Bit values match the verbs `ibv_access_flags` encoding. Local read
    /// needs no flag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    #[serde(transparent)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1;
        const REMOTE_WRITE = 2;
        const REMOTE_READ = 4;
        const REMOTE_ATOMIC = 8;
    }
}

impl AccessFlags {
    /// All four permissions, the registration default.
    pub fn all_operations() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_WRITE | Self::REMOTE_READ | Self::REMOTE_ATOMIC
    }

    /// Remote write and remote atomic both require local write.
    pub(crate) fn validate(self) -> io::Result<()> {
        if self.intersects(Self::REMOTE_WRITE | Self::REMOTE_ATOMIC)
            && !self.contains(Self::LOCAL_WRITE)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "REMOTE_WRITE and REMOTE_ATOMIC require LOCAL_WRITE",
            ));
        }
        Ok(())
    }
}

/// A registered, pinned span of memory scoped to a protection domain.
///
/// The region owns its backing buffer for the whole registration
/// lifetime; `raw` is declared first so deregistration runs before the
/// buffer is released.
pub struct MemoryRegion {
    raw: backend::RawMemoryRegion,
    data: Vec<u8>,
    access: AccessFlags,
    _pd: Arc<ProtectionDomain>,
}

impl MemoryRegion {
    /// Register `layout.size()` bytes of fresh zeroed memory with `pd`.
    ///
    /// # Errors
    ///
    /// `RegistrationFailed` when the flags violate the local-write rule,
    /// the length is zero, or the device rejects the registration.
    pub fn new_from_pd(
        pd: &Arc<ProtectionDomain>,
        layout: Layout,
        access: AccessFlags,
    ) -> Result<Self> {
        access
            .validate()
            .map_err(|source| Error::RegistrationFailed { source })?;
        let data = vec![0_u8; layout.size()];
        let raw =
            backend::RawMemoryRegion::register(pd.raw(), data.as_ptr(), data.len(), access.bits())
                .map_err(|source| Error::RegistrationFailed { source })?;
        debug!(
            len = data.len(),
            lkey = raw.lkey(),
            rkey = raw.rkey(),
            "registered memory region"
        );
        Ok(Self {
            raw,
            data,
            access,
            _pd: pd.clone(),
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Key the owning process uses to reference the region in work
    /// requests.
    pub fn lkey(&self) -> u32 {
        self.raw.lkey()
    }

    /// Key a remote peer must present to touch the region.
    pub fn rkey(&self) -> u32 {
        self.raw.rkey()
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }
}
