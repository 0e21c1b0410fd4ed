//! # Capsule - a filesystem inside a single file
//!
//! `capsule-fs` persists a hierarchical filesystem in one host file, the
//! *container*. The container is authoritative: reopening it reproduces
//! the same tree byte for byte.
//!
//! - **Typed record stream** - files, folders and raw data cells laid end
//!   to end, rewritten in place and reallocated on growth
//! - **Offset allocator** - size-fit reuse of freed holes with
//!   power-of-two growth for append-heavy cells
//! - **Streaming access** - bounded readers and positional writers over
//!   file content, with MD5 tags for integrity validation
//! - **Glob search** - `*`, `**`, `?` and `[...]` over absolute paths
//! - **Capture policies** - read-priority or write-priority reader/writer
//!   coordination with non-blocking `try` variants
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use capsule_fs::{Capsule, FileSystemReader, FileSystemWriter, Result};
//!
//! # async fn demo() -> Result<()> {
//! let capsule = Capsule::open("data.capsule")?;
//!
//! capsule
//!     .with_mutable_folder(|folder| async move {
//!         folder.create_folder("docs")?;
//!         folder.create_file("hello.txt", b"Hello, container!")?;
//!         Ok(())
//!     })
//!     .await?;
//!
//! let bytes = capsule
//!     .with_folder(|folder| async move { folder.read_file("hello.txt") })
//!     .await?;
//! assert_eq!(bytes, b"Hello, container!");
//! # Ok(())
//! # }
//! ```
//!
//! ## Picking a capture policy
//!
//! ```rust,no_run
//! use capsule_fs::{Capsule, CapturePolicy};
//!
//! # fn main() -> capsule_fs::Result<()> {
//! let capsule = Capsule::builder()
//!     .path("data.capsule")
//!     .policy(CapturePolicy::WritePriority)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod capture;
pub mod clock;
pub mod error;
pub mod fs;
pub mod glob;
pub mod navigator;
pub mod node;
pub mod record;
pub mod store;

pub use capture::{AccessProvider, CaptureCoordinator, CapturePolicy};
pub use clock::{Clock, SystemClock};
pub use error::{CapsuleError, Result};
pub use fs::{
    CopyImporter, FileSystemReader, FileSystemWriter, FindFiles, HostImporter, Importer,
    ReadContext, WriteContext,
};
pub use glob::GlobPattern;
pub use navigator::Navigator;
pub use node::{CapsulePath, FileLoader, FileNode, FolderLoader, FolderNode};
pub use store::{CellReader, CellWriter, DataCell, MutableDataCell, RecordStore, StoreStats};

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// High-level handle over one container: navigation plus captured grants.
pub struct Capsule {
    navigator: Navigator,
    coordinator: CaptureCoordinator<Navigator>,
}

impl Capsule {
    /// Open (or create) a container with the default configuration:
    /// read-priority capture and the system clock.
    pub fn open(path: impl Into<PathBuf>) -> Result<Capsule> {
        Capsule::builder().path(path).build()
    }

    pub fn builder() -> CapsuleBuilder {
        CapsuleBuilder::new()
    }

    /// Run `f` under a read grant. The context snapshots the current
    /// folder at grant time.
    pub async fn with_folder<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(ReadContext) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.coordinator.capture_read(f).await
    }

    /// Run `f` under a write grant. The context is bound to the live
    /// cursor, so its own mutations stay visible to it.
    pub async fn with_mutable_folder<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(WriteContext) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.coordinator.capture_write(f).await
    }

    /// Non-blocking variant of [`Capsule::with_folder`]; fails with
    /// [`CapsuleError::ReadCapture`] when a writer holds the container.
    pub async fn try_with_folder<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(ReadContext) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.coordinator.try_capture_read(f).await
    }

    /// Non-blocking variant of [`Capsule::with_mutable_folder`]; fails
    /// with [`CapsuleError::WriteCapture`] when the container is held.
    pub async fn try_with_mutable_folder<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(WriteContext) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.coordinator.try_capture_write(f).await
    }

    /// Change the current folder; see [`Navigator::cd`].
    pub fn cd(&self, target: &str) -> Result<()> {
        self.navigator.cd(target)
    }

    /// Reseat the cursor on the parent folder.
    pub fn back(&self) -> Result<()> {
        self.navigator.back()
    }

    /// Re-read the current folder from the container.
    pub fn reload(&self) -> Result<()> {
        self.navigator.reload()
    }

    pub fn current_path(&self) -> CapsulePath {
        self.navigator.current_path()
    }

    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    pub fn store(&self) -> &RecordStore {
        self.navigator.store()
    }

    /// Allocator-derived container numbers.
    pub fn stats(&self) -> StoreStats {
        self.store().stats()
    }
}

/// Configures and opens a [`Capsule`].
pub struct CapsuleBuilder {
    path: Option<PathBuf>,
    policy: CapturePolicy,
    clock: Arc<dyn Clock>,
}

impl CapsuleBuilder {
    pub fn new() -> Self {
        CapsuleBuilder {
            path: None,
            policy: CapturePolicy::ReadPriority,
            clock: Arc::new(SystemClock),
        }
    }

    /// Container file location. Required.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Fairness policy for concurrent grants.
    pub fn policy(mut self, policy: CapturePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Time source for record timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Capsule> {
        let path = self
            .path
            .ok_or_else(|| CapsuleError::Write("container path must be set".into()))?;
        let store = RecordStore::open(&path, self.clock)?;
        let navigator = Navigator::new(store);
        let coordinator = CaptureCoordinator::new(self.policy, navigator.clone());
        info!(
            "capsule ready at {} ({:?} capture)",
            path.display(),
            self.policy
        );
        Ok(Capsule {
            navigator,
            coordinator,
        })
    }
}

impl Default for CapsuleBuilder {
    fn default() -> Self {
        CapsuleBuilder::new()
    }
}
