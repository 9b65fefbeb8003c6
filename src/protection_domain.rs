use crate::backend;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::memory_region::{AccessFlags, MemoryRegion};
use crate::queue_pair::QueuePairBuilder;
use std::alloc::Layout;
use std::sync::Arc;

/// Authorization scope binding memory regions to the queue pairs allowed
/// to operate on them. One per process is sufficient; hub and leaf roles
/// share a single domain across all their queue pairs.
pub struct ProtectionDomain {
    raw: backend::RawProtectionDomain,
    pub(crate) ctx: Arc<Context>,
}

impl ProtectionDomain {
    /// Allocate a protection domain on `ctx`.
    pub fn create(ctx: &Arc<Context>) -> Result<Self> {
        let raw =
            backend::RawProtectionDomain::alloc(ctx.raw()).map_err(|source| {
                Error::AllocationFailed {
                    resource: "protection domain",
                    source,
                }
            })?;
        Ok(Self {
            raw,
            ctx: ctx.clone(),
        })
    }

    /// Start building a queue pair owned by this domain.
    pub fn create_queue_pair_builder(self: &Arc<Self>) -> QueuePairBuilder {
        QueuePairBuilder::new(self)
    }

    /// Register `layout.size()` bytes of fresh memory in this domain.
    pub fn register_memory(
        self: &Arc<Self>,
        layout: Layout,
        access: AccessFlags,
    ) -> Result<MemoryRegion> {
        MemoryRegion::new_from_pd(self, layout, access)
    }

    pub(crate) fn raw(&self) -> &backend::RawProtectionDomain {
        &self.raw
    }
}
