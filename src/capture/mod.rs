//! Access capture: serialises grants over the filesystem under a chosen
//! fairness policy.
//!
//! Two policies share one public contract. Read-priority lets readers
//! starve writers as long as new readers keep arriving; write-priority
//! makes an arriving writer block new readers while active readers drain.
//! Blocking variants never fail for capture reasons; `try_*` variants
//! fail with [`CapsuleError::ReadCapture`] / [`CapsuleError::WriteCapture`]
//! when another grant holds the needed access.
//!
//! Grants are RAII guards, so release runs on normal return, error, and
//! task cancellation alike. The capture layer never inspects the block it
//! runs; it does not retry, time out, or order beyond the policy.

mod read_priority;
mod write_priority;

pub use read_priority::ReadPriorityCapture;
pub use write_priority::WritePriorityCapture;

use crate::error::Result;
use std::future::Future;

/// Produces one context per grant. Read contexts snapshot state at grant
/// time; write contexts bind it by reference.
pub trait AccessProvider: Send + Sync {
    type Read: Send;
    type Write: Send;

    fn read_context(&self) -> Result<Self::Read>;
    fn write_context(&self) -> Result<Self::Write>;
}

/// Which fairness policy a coordinator applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapturePolicy {
    #[default]
    ReadPriority,
    WritePriority,
}

/// Policy-dispatching front over the two coordinator implementations.
pub enum CaptureCoordinator<P: AccessProvider> {
    ReadPriority(ReadPriorityCapture<P>),
    WritePriority(WritePriorityCapture<P>),
}

impl<P: AccessProvider> CaptureCoordinator<P> {
    pub fn new(policy: CapturePolicy, provider: P) -> Self {
        match policy {
            CapturePolicy::ReadPriority => {
                CaptureCoordinator::ReadPriority(ReadPriorityCapture::new(provider))
            }
            CapturePolicy::WritePriority => {
                CaptureCoordinator::WritePriority(WritePriorityCapture::new(provider))
            }
        }
    }

    pub fn policy(&self) -> CapturePolicy {
        match self {
            CaptureCoordinator::ReadPriority(_) => CapturePolicy::ReadPriority,
            CaptureCoordinator::WritePriority(_) => CapturePolicy::WritePriority,
        }
    }

    pub fn provider(&self) -> &P {
        match self {
            CaptureCoordinator::ReadPriority(c) => c.provider(),
            CaptureCoordinator::WritePriority(c) => c.provider(),
        }
    }

    pub async fn capture_read<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(P::Read) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        match self {
            CaptureCoordinator::ReadPriority(c) => c.capture_read(f).await,
            CaptureCoordinator::WritePriority(c) => c.capture_read(f).await,
        }
    }

    pub async fn capture_write<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(P::Write) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        match self {
            CaptureCoordinator::ReadPriority(c) => c.capture_write(f).await,
            CaptureCoordinator::WritePriority(c) => c.capture_write(f).await,
        }
    }

    pub async fn try_capture_read<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(P::Read) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        match self {
            CaptureCoordinator::ReadPriority(c) => c.try_capture_read(f).await,
            CaptureCoordinator::WritePriority(c) => c.try_capture_read(f).await,
        }
    }

    pub async fn try_capture_write<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(P::Write) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        match self {
            CaptureCoordinator::ReadPriority(c) => c.try_capture_write(f).await,
            CaptureCoordinator::WritePriority(c) => c.try_capture_write(f).await,
        }
    }
}
