//! Write-priority capture: two control locks plus reader and writer
//! counters.
//!
//! `write_captured` is held whenever any writer is waiting or running, and
//! readers must pass through it on entry, so a queued writer blocks new
//! readers. `can_write` is held whenever anyone is running: communally by
//! the active reader batch, exclusively by the running writer. An arriving
//! writer therefore waits for active readers to drain while later readers
//! queue behind it.

use super::AccessProvider;
use crate::error::{CapsuleError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

struct WriteState {
    /// Serialises writer entry (counter check plus `write_captured`).
    writer_entry: Mutex<()>,
    writers: parking_lot::Mutex<usize>,
    readers: parking_lot::Mutex<usize>,
    /// Held while any writer waits or runs; readers pass through it.
    write_captured: Semaphore,
    /// Held while any reader batch or writer runs.
    can_write: Semaphore,
}

impl WriteState {
    fn new() -> Arc<Self> {
        Arc::new(WriteState {
            writer_entry: Mutex::new(()),
            writers: parking_lot::Mutex::new(0),
            readers: parking_lot::Mutex::new(0),
            write_captured: Semaphore::new(1),
            can_write: Semaphore::new(1),
        })
    }

    /// Register a writer: the first of a wave takes `write_captured`, the
    /// last (via [`WriterCounted`]) returns it.
    async fn count_writer(state: &Arc<Self>) -> WriterCounted {
        let gate = state.writer_entry.lock().await;
        let active = *state.writers.lock();
        if active == 0 {
            let permit = state
                .write_captured
                .acquire()
                .await
                .expect("capture semaphore closed");
            permit.forget();
        }
        *state.writers.lock() += 1;
        drop(gate);
        WriterCounted {
            state: Arc::clone(state),
        }
    }

    async fn try_count_writer(state: &Arc<Self>) -> Result<WriterCounted> {
        let gate = state.writer_entry.lock().await;
        let mut writers = state.writers.lock();
        if *writers == 0 {
            match state.write_captured.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(CapsuleError::WriteCapture),
            }
        }
        *writers += 1;
        drop(writers);
        drop(gate);
        Ok(WriterCounted {
            state: Arc::clone(state),
        })
    }

    async fn acquire_read(state: &Arc<Self>) -> ReadGrant {
        // The pass-through permit serialises reader entry and makes a
        // queued writer visible to arriving readers.
        let pass = state
            .write_captured
            .acquire()
            .await
            .expect("capture semaphore closed");
        let active = *state.readers.lock();
        if active == 0 {
            let permit = state
                .can_write
                .acquire()
                .await
                .expect("capture semaphore closed");
            permit.forget();
        }
        *state.readers.lock() += 1;
        drop(pass);
        ReadGrant {
            state: Arc::clone(state),
        }
    }

    fn try_acquire_read(state: &Arc<Self>) -> Result<ReadGrant> {
        let pass = state
            .write_captured
            .try_acquire()
            .map_err(|_| CapsuleError::ReadCapture)?;
        let mut readers = state.readers.lock();
        if *readers == 0 {
            match state.can_write.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(CapsuleError::ReadCapture),
            }
        }
        *readers += 1;
        drop(readers);
        drop(pass);
        Ok(ReadGrant {
            state: Arc::clone(state),
        })
    }
}

/// Rollback guard for the writer counter; the last writer of a wave
/// releases `write_captured`.
struct WriterCounted {
    state: Arc<WriteState>,
}

impl Drop for WriterCounted {
    fn drop(&mut self) {
        let mut writers = self.state.writers.lock();
        *writers -= 1;
        if *writers == 0 {
            self.state.write_captured.add_permits(1);
        }
    }
}

/// Scoped read grant; the last reader of a batch releases `can_write`.
struct ReadGrant {
    state: Arc<WriteState>,
}

impl Drop for ReadGrant {
    fn drop(&mut self) {
        let mut readers = self.state.readers.lock();
        *readers -= 1;
        if *readers == 0 {
            self.state.can_write.add_permits(1);
        }
    }
}

/// Coordinator applying the write-priority policy.
pub struct WritePriorityCapture<P> {
    provider: P,
    state: Arc<WriteState>,
}

impl<P: AccessProvider> WritePriorityCapture<P> {
    pub fn new(provider: P) -> Self {
        WritePriorityCapture {
            provider,
            state: WriteState::new(),
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
        let grant = WriteState::acquire_read(&self.state).await;
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
        let counted = WriteState::count_writer(&self.state).await;
        // Cancellation while waiting here unwinds the writer count and,
        // for the last writer, returns `write_captured`.
        let permit = self
            .state
            .can_write
            .acquire()
            .await
            .expect("capture semaphore closed");
        let ctx = self.provider.write_context()?;
        let out = f(ctx).await;
        drop(permit);
        drop(counted);
        out
    }

    pub async fn try_capture_read<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(P::Read) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let grant = WriteState::try_acquire_read(&self.state)?;
        let ctx = self.provider.read_context()?;
        let out = f(ctx).await;
        drop(grant);
        out
    }

    pub async fn try_capture_write<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(P::Write) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let counted = WriteState::try_count_writer(&self.state).await?;
        let permit = match self.state.can_write.try_acquire() {
            Ok(permit) => permit,
            // `counted` unwinds the partial acquisition on this path.
            Err(_) => return Err(CapsuleError::WriteCapture),
        };
        let ctx = self.provider.write_context()?;
        let out = f(ctx).await;
        drop(permit);
        drop(counted);
        out
    }
}
