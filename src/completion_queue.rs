use crate::backend;
use crate::context::Context;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Fixed-capacity ring the device reports operation completions into.
///
/// One queue may serve as both the send and receive queue of every queue
/// pair a role creates; queue pairs hold an `Arc` so the ring outlives
/// them.
pub struct CompletionQueue {
    raw: backend::RawCompletionQueue,
    ctx: Arc<Context>,
}

impl CompletionQueue {
    /// Create a completion queue with room for at least `depth` entries.
    ///
    /// # Errors
    ///
    /// `AllocationFailed` when the device cannot satisfy the requested
    /// depth.
    pub fn create(ctx: &Arc<Context>, depth: u32) -> Result<Self> {
        let raw = backend::RawCompletionQueue::create(ctx.raw(), depth).map_err(|source| {
            Error::AllocationFailed {
                resource: "completion queue",
                source,
            }
        })?;
        debug!(
            requested = depth,
            depth = raw.depth(),
            "created completion queue"
        );
        Ok(Self {
            raw,
            ctx: ctx.clone(),
        })
    }

    /// Entry capacity of the ring. At least the depth requested at
    /// creation; the device may round up.
    pub fn depth(&self) -> u32 {
        self.raw.depth()
    }

    pub(crate) fn raw(&self) -> &backend::RawCompletionQueue {
        &self.raw
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

#[cfg(all(test, not(feature = "verbs")))]
mod tests {
    use super::*;
    use crate::sim::{install_device, SimDevice};

    fn ctx(name: &str, lid: u16) -> Arc<Context> {
        install_device(SimDevice::new(name, lid));
        Arc::new(Context::open(&name.into()).unwrap())
    }

    #[test]
    fn create_reports_depth() {
        let ctx = ctx("cq-depth", 51);
        let cq = CompletionQueue::create(&ctx, 256).unwrap();
        assert!(cq.depth() >= 256);
    }

    #[test]
    fn zero_depth_is_rejected() {
        let ctx = ctx("cq-zero", 52);
        match CompletionQueue::create(&ctx, 0) {
            Err(Error::AllocationFailed { resource, .. }) => {
                assert_eq!(resource, "completion queue");
            }
            other => panic!("expected AllocationFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn absurd_depth_is_rejected() {
        let ctx = ctx("cq-huge", 53);
        assert!(matches!(
            CompletionQueue::create(&ctx, u32::MAX),
            Err(Error::AllocationFailed { .. })
        ));
    }
}
