//! Read-priority capture: a single control lock plus a reader counter.
//!
//! The first reader of a batch takes the control lock and the last one
//! returns it, so overlapping readers run together and a writer waits for
//! the whole batch. New readers joining while the batch runs extend it;
//! writers can wait indefinitely under sustained read load.

use super::AccessProvider;
use crate::error::{CapsuleError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

struct ReadState {
    /// Serialises reader entry so the counter check and the control-lock
    /// acquisition are one atomic step.
    entry: Mutex<()>,
    readers: parking_lot::Mutex<usize>,
    /// Held by the current reader batch or by the running writer.
    read_capture: Semaphore,
}

impl ReadState {
    fn new() -> Arc<Self> {
        Arc::new(ReadState {
            entry: Mutex::new(()),
            readers: parking_lot::Mutex::new(0),
            read_capture: Semaphore::new(1),
        })
    }

    async fn acquire_read(state: &Arc<Self>) -> ReadGrant {
        let gate = state.entry.lock().await;
        let active = *state.readers.lock();
        if active == 0 {
            // No reader can release while the entry gate is held and the
            // counter is zero, so waiting here races only with a writer.
            let permit = state
                .read_capture
                .acquire()
                .await
                .expect("capture semaphore closed");
            permit.forget();
        }
        *state.readers.lock() += 1;
        drop(gate);
        ReadGrant {
            state: Arc::clone(state),
        }
    }

    fn try_acquire_read(state: &Arc<Self>) -> Result<ReadGrant> {
        let mut readers = state.readers.lock();
        if *readers == 0 {
            match state.read_capture.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(CapsuleError::ReadCapture),
            }
        }
        *readers += 1;
        drop(readers);
        Ok(ReadGrant {
            state: Arc::clone(state),
        })
    }
}

/// Scoped read grant; dropping it releases the control lock when the last
/// reader of the batch leaves.
struct ReadGrant {
    state: Arc<ReadState>,
}

impl Drop for ReadGrant {
    fn drop(&mut self) {
        let mut readers = self.state.readers.lock();
        *readers -= 1;
        if *readers == 0 {
            self.state.read_capture.add_permits(1);
        }
    }
}

/// Coordinator applying the read-priority policy.
pub struct ReadPriorityCapture<P> {
    provider: P,
    state: Arc<ReadState>,
}

impl<P: AccessProvider> ReadPriorityCapture<P> {
    pub fn new(provider: P) -> Self {
        ReadPriorityCapture {
            provider,
            state: ReadState::new(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub async fn capture_read<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(P::Read) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let grant = ReadState::acquire_read(&self.state).await;
        let ctx = self.provider.read_context()?;
        let out = f(ctx).await;
        drop(grant);
        out
    }

    pub async fn capture_write<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(P::Write) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let permit = self
            .state
            .read_capture
            .acquire()
            .await
            .expect("capture semaphore closed");
        let ctx = self.provider.write_context()?;
        let out = f(ctx).await;
        drop(permit);
        out
    }

    /// Non-blocking read grant; fails with `ReadCapture` while a writer
    /// holds the control lock.
    pub async fn try_capture_read<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(P::Read) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let gate = self.state.entry.lock().await;
        let grant = ReadState::try_acquire_read(&self.state)?;
        drop(gate);
        let ctx = self.provider.read_context()?;
        let out = f(ctx).await;
        drop(grant);
        out
    }

    /// Non-blocking write grant; fails with `WriteCapture` while readers
    /// or another writer are active.
    pub async fn try_capture_write<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(P::Write) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let permit = self
            .state
            .read_capture
            .try_acquire()
            .map_err(|_| CapsuleError::WriteCapture)?;
        let ctx = self.provider.write_context()?;
        let out = f(ctx).await;
        drop(permit);
        out
    }
}
