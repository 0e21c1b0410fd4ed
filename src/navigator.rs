//! The navigator: a current-folder cursor over the store, and the context
//! provider for the capture layer.

use crate::capture::AccessProvider;
use crate::error::{CapsuleError, Result};
use crate::fs::{ReadContext, WriteContext};
use crate::node::{CachedFolderLoader, CapsulePath, FolderLoader, FolderNode};
use crate::store::RecordStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Shared cursor state: the loader of the current folder plus a memoised
/// node for it.
#[derive(Debug)]
pub(crate) struct Cursor {
    state: Mutex<CachedFolderLoader>,
}

impl Cursor {
    fn new(store: &RecordStore) -> Self {
        Cursor {
            state: Mutex::new(CachedFolderLoader::new(store.root_loader())),
        }
    }

    pub(crate) fn path(&self) -> CapsulePath {
        self.state.lock().path().clone()
    }

    pub(crate) fn folder(&self) -> Result<FolderNode> {
        self.state.lock().load()
    }

    /// Drop the memoised node so the next read sees fresh records.
    pub(crate) fn invalidate(&self) {
        self.state.lock().close();
    }

    fn loader(&self) -> FolderLoader {
        self.state.lock().loader().clone()
    }

    fn seat(&self, loader: FolderLoader) {
        *self.state.lock() = CachedFolderLoader::new(loader);
    }
}

/// Folder navigation over an open container.
///
/// Clones share the same cursor. Navigation reads the container directly;
/// embedders running concurrent grants should navigate between grants,
/// not during them.
#[derive(Clone)]
pub struct Navigator {
    store: RecordStore,
    cursor: Arc<Cursor>,
}

impl Navigator {
    /// A navigator seated at the container root.
    pub fn new(store: RecordStore) -> Self {
        let cursor = Arc::new(Cursor::new(&store));
        Navigator { store, cursor }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Absolute path of the current folder, with a trailing slash.
    pub fn current_path(&self) -> CapsulePath {
        self.cursor.path()
    }

    /// Change the current folder. Absolute targets walk from the root,
    /// relative targets from the current folder; each missing component
    /// fails with `DirectoryNotFound`.
    pub fn cd(&self, target: &str) -> Result<()> {
        let parsed = CapsulePath::parse(target);
        let mut loader = if parsed.is_absolute() {
            self.store.root_loader()
        } else {
            self.cursor.loader()
        };

        for component in parsed.components() {
            let node = loader.load()?;
            loader = node.folder(component).cloned().ok_or_else(|| {
                CapsuleError::DirectoryNotFound(node.path.add_folder(component).to_string())
            })?;
        }

        debug!("cd {} -> {}", target, loader.path());
        self.cursor.seat(loader);
        Ok(())
    }

    /// Reseat the cursor on the parent folder; a no-op at the root.
    pub fn back(&self) -> Result<()> {
        let node = self.cursor.folder()?;
        if let Some(parent) = node.parent {
            debug!("back -> {}", parent.path());
            self.cursor.seat(parent);
        }
        Ok(())
    }

    /// Re-read the current folder to observe external mutations.
    pub fn reload(&self) -> Result<()> {
        self.cursor.invalidate();
        self.cursor.folder().map(|_| ())
    }
}

impl AccessProvider for Navigator {
    type Read = ReadContext;
    type Write = WriteContext;

    fn read_context(&self) -> Result<ReadContext> {
        Ok(ReadContext {
            store: self.store.clone(),
            folder: self.cursor.folder()?,
        })
    }

    fn write_context(&self) -> Result<WriteContext> {
        Ok(WriteContext {
            store: self.store.clone(),
            cursor: Arc::clone(&self.cursor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tempfile::TempDir;

    fn navigator(dir: &TempDir) -> Navigator {
        let store = RecordStore::open(dir.path().join("nav.capsule"), Arc::new(SystemClock))
            .unwrap();
        store
            .create_folder(&CapsulePath::parse("/folder/"))
            .unwrap();
        store
            .create_folder(&CapsulePath::parse("/folder/empty_folder_2/"))
            .unwrap();
        Navigator::new(store)
    }

    #[test]
    fn test_cd_absolute_and_back() {
        let dir = TempDir::new().unwrap();
        let nav = navigator(&dir);

        nav.cd("/folder/empty_folder_2").unwrap();
        assert_eq!(nav.current_path().to_string(), "/folder/empty_folder_2/");

        nav.back().unwrap();
        assert_eq!(nav.current_path().to_string(), "/folder/");
    }

    #[test]
    fn test_cd_relative() {
        let dir = TempDir::new().unwrap();
        let nav = navigator(&dir);

        nav.cd("folder").unwrap();
        nav.cd("empty_folder_2").unwrap();
        assert_eq!(nav.current_path().to_string(), "/folder/empty_folder_2/");
    }

    #[test]
    fn test_cd_missing_component() {
        let dir = TempDir::new().unwrap();
        let nav = navigator(&dir);

        let err = nav.cd("/folder/nope").unwrap_err();
        assert!(matches!(err, CapsuleError::DirectoryNotFound(_)));
        // The cursor stays put on failure.
        assert_eq!(nav.current_path().to_string(), "/");
    }

    #[test]
    fn test_back_at_root_is_noop() {
        let dir = TempDir::new().unwrap();
        let nav = navigator(&dir);
        nav.back().unwrap();
        assert_eq!(nav.current_path().to_string(), "/");
    }

    #[test]
    fn test_reload_sees_external_mutation() {
        let dir = TempDir::new().unwrap();
        let nav = navigator(&dir);
        nav.cd("/folder").unwrap();

        // Warm the cursor cache, then mutate behind its back.
        assert_eq!(nav.cursor.folder().unwrap().files.len(), 0);
        nav.store()
            .create_file(&CapsulePath::parse("/folder/new.txt"))
            .unwrap();
        assert_eq!(nav.cursor.folder().unwrap().files.len(), 0);

        nav.reload().unwrap();
        assert_eq!(nav.cursor.folder().unwrap().files.len(), 1);
    }
}
