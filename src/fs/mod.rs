//! The filesystem service: read and write capability surfaces resolved
//! against the navigator cursor.
//!
//! [`FileSystemReader`] is the read surface; [`FileSystemWriter`] extends
//! it with mutations. [`ReadContext`] snapshots the cursor at grant time;
//! [`WriteContext`] binds the cursor by reference so mutations made during
//! the grant stay visible to it.

mod import;

pub use import::{CopyImporter, HostImporter, Importer};

use crate::error::{CapsuleError, Result};
use crate::glob::GlobPattern;
use crate::navigator::Cursor;
use crate::node::{CapsulePath, FileLoader, FolderLoader, FolderNode};
use crate::record::Record;
use crate::store::{CellReader, CellWriter, RecordStore};
use md5::{Digest, Md5};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

/// Read surface over the current folder.
pub trait FileSystemReader {
    /// Absolute path of the current folder.
    fn current_path(&self) -> CapsulePath;

    /// The current folder's node.
    fn current_folder(&self) -> Result<FolderNode>;

    /// Walk the tree below the current folder and yield each file whose
    /// absolute path matches the glob. The walk is lazy: folders are read
    /// as the sequence advances.
    fn find_files(&self, pattern: &str, recursive: bool) -> Result<FindFiles>;

    /// Open the named file in the current folder for reading.
    fn input_stream(&self, name: &str) -> Result<CellReader>;

    /// Read the named file's whole content.
    fn read_file(&self, name: &str) -> Result<Vec<u8>>;

    /// True iff every file under the current folder (recursively) has a
    /// stored MD5 equal to the digest of its content bytes.
    fn validate(&self) -> Result<bool>;
}

/// Write surface; extends the read surface.
pub trait FileSystemWriter: FileSystemReader {
    fn create_folder(&self, name: &str) -> Result<()>;

    /// Create a file with `data` and record its digest.
    fn create_file(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Recursively delete the named folder and everything below it.
    fn delete_folder(&self, name: &str) -> Result<()>;

    fn delete_file(&self, name: &str) -> Result<()>;

    /// Move a file. `dest` is absolute or relative; a trailing `/` keeps
    /// the source name, otherwise the last component is the new name.
    /// `overwrite` deletes an existing destination first.
    fn move_file(&self, name: &str, dest: &str, overwrite: bool) -> Result<()>;

    fn move_folder(&self, name: &str, dest: &str, overwrite: bool) -> Result<()>;

    fn copy_file(&self, name: &str, dest: &str, overwrite: bool) -> Result<()>;

    fn copy_folder(&self, name: &str, dest: &str, overwrite: bool) -> Result<()>;

    /// Open a positional write stream; `offset = -1` appends.
    fn output_stream(&self, name: &str, offset: i64) -> Result<CellWriter>;

    /// Recompute and store the named file's content digest.
    fn update_md5(&self, name: &str) -> Result<()>;

    /// Set the file's length to zero without releasing capacity.
    fn clear_file(&self, name: &str) -> Result<()>;

    fn append_into_file(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Import one external file under `dest` (a folder path).
    fn import_file<I: Importer + ?Sized>(
        &self,
        dest: &str,
        importer: &I,
        id: &I::FileId,
    ) -> Result<()>;

    /// Import an external folder tree under `dest`.
    fn import_directory<I: Importer + ?Sized>(
        &self,
        dest: &str,
        importer: &I,
        id: &I::FolderId,
    ) -> Result<()>;
}

/// Context handed to read grants; the folder snapshot is the one captured
/// at grant time.
#[derive(Debug, Clone)]
pub struct ReadContext {
    pub(crate) store: RecordStore,
    pub(crate) folder: FolderNode,
}

/// Context handed to write grants; bound to the live cursor.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub(crate) store: RecordStore,
    pub(crate) cursor: Arc<Cursor>,
}

trait ContextInternals {
    fn store(&self) -> &RecordStore;
    fn path(&self) -> CapsulePath;
    fn folder(&self) -> Result<FolderNode>;
    fn after_write(&self) {}
}

impl ContextInternals for ReadContext {
    fn store(&self) -> &RecordStore {
        &self.store
    }

    fn path(&self) -> CapsulePath {
        self.folder.path.clone()
    }

    fn folder(&self) -> Result<FolderNode> {
        Ok(self.folder.clone())
    }
}

impl ContextInternals for WriteContext {
    fn store(&self) -> &RecordStore {
        &self.store
    }

    fn path(&self) -> CapsulePath {
        self.cursor.path()
    }

    fn folder(&self) -> Result<FolderNode> {
        self.cursor.folder()
    }

    fn after_write(&self) {
        self.cursor.invalidate();
    }
}

impl<T: ContextInternals> FileSystemReader for T {
    fn current_path(&self) -> CapsulePath {
        self.path()
    }

    fn current_folder(&self) -> Result<FolderNode> {
        self.folder()
    }

    fn find_files(&self, pattern: &str, recursive: bool) -> Result<FindFiles> {
        let folder = self.folder()?;
        let start = FolderLoader::new(self.store().clone(), folder.offset, folder.path);
        Ok(FindFiles {
            pattern: GlobPattern::new(pattern),
            recursive,
            pending: Vec::new(),
            stack: vec![start],
        })
    }

    fn input_stream(&self, name: &str) -> Result<CellReader> {
        let folder = self.folder()?;
        let loader = file_in(&folder, name)?;
        let record = self.store().read_file_record(loader.offset())?;
        self.store().content_cell_readonly(&record)?.reader()
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.input_stream(name)?.read_to_end(&mut out)?;
        Ok(out)
    }

    fn validate(&self) -> Result<bool> {
        let folder = self.folder()?;
        let store = self.store();
        let mut stack = vec![FolderLoader::new(store.clone(), folder.offset, folder.path)];
        while let Some(loader) = stack.pop() {
            let node = loader.load()?;
            for file in &node.files {
                let record = store.read_file_record(file.offset())?;
                let reader = store.content_cell_readonly(&record)?.reader()?;
                if digest_reader(reader)? != record.md5 {
                    debug!("stale digest on {}", file.path());
                    return Ok(false);
                }
            }
            stack.extend(node.folders);
        }
        Ok(true)
    }
}

impl FileSystemWriter for WriteContext {
    fn create_folder(&self, name: &str) -> Result<()> {
        let path = self.path().add_folder(name);
        self.store.create_folder(&path)?;
        self.after_write();
        Ok(())
    }

    fn create_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path().add_file(name);
        self.store.create_file(&path)?;
        if !data.is_empty() {
            let mut cell = self.store.get_mutable_data_cell(&path)?;
            cell.write_at(0, data)?;
            self.store.set_md5(&path, Md5::digest(data).into())?;
        }
        self.after_write();
        Ok(())
    }

    fn delete_folder(&self, name: &str) -> Result<()> {
        let folder = self.folder()?;
        let target = folder.folder(name).cloned().ok_or_else(|| {
            CapsuleError::DirectoryNotFound(folder.path.add_folder(name).to_string())
        })?;
        delete_folder_recursive(&self.store, &target)?;
        self.after_write();
        Ok(())
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.path().add_file(name);
        self.store.delete_file(&path)?;
        self.after_write();
        Ok(())
    }

    fn move_file(&self, name: &str, dest: &str, overwrite: bool) -> Result<()> {
        let folder = self.folder()?;
        let src_path = folder.path.add_file(name);
        if folder.file(name).is_none() {
            return Err(CapsuleError::FileNotFound(src_path.to_string()));
        }

        let target = resolve_destination(&self.store, &folder.path, dest, name)?;
        let dst_path = target.folder_path.add_file(&target.name);
        if dst_path == src_path {
            return Ok(());
        }
        target.clear_existing(&self.store, overwrite)?;

        self.store.move_file(&src_path, &dst_path)?;
        self.after_write();
        Ok(())
    }

    fn move_folder(&self, name: &str, dest: &str, overwrite: bool) -> Result<()> {
        let folder = self.folder()?;
        let src_path = folder.path.add_folder(name);
        if folder.folder(name).is_none() {
            return Err(CapsuleError::DirectoryNotFound(src_path.to_string()));
        }

        let target = resolve_destination(&self.store, &folder.path, dest, name)?;
        let dst_path = target.folder_path.add_folder(&target.name);
        if dst_path == src_path {
            return Ok(());
        }
        if target.folder_path.starts_with(&src_path) {
            return Err(CapsuleError::Write(format!(
                "cannot move {src_path} into its own subtree {dst_path}"
            )));
        }
        target.clear_existing(&self.store, overwrite)?;

        self.store.move_folder(&src_path, &dst_path)?;
        self.after_write();
        Ok(())
    }

    fn copy_file(&self, name: &str, dest: &str, overwrite: bool) -> Result<()> {
        let folder = self.folder()?;
        let src_path = folder.path.add_file(name);
        let src = folder
            .file(name)
            .cloned()
            .ok_or_else(|| CapsuleError::FileNotFound(src_path.to_string()))?;

        let target = resolve_destination(&self.store, &folder.path, dest, name)?;
        // A self-targeted copy must not clear the source it reads from.
        let dst_path = target.folder_path.add_file(&target.name);
        if dst_path == src_path {
            return Ok(());
        }
        target.clear_existing(&self.store, overwrite)?;

        let dest_loader = target.folder_loader(&self.store);
        CopyImporter.import_file(&self.store, &dest_loader, &src, Some(&target.name))?;
        self.after_write();
        Ok(())
    }

    fn copy_folder(&self, name: &str, dest: &str, overwrite: bool) -> Result<()> {
        let folder = self.folder()?;
        let src_path = folder.path.add_folder(name);
        let src = folder
            .folder(name)
            .cloned()
            .ok_or_else(|| CapsuleError::DirectoryNotFound(src_path.to_string()))?;

        let target = resolve_destination(&self.store, &folder.path, dest, name)?;
        // A self-targeted copy must not clear the source it reads from.
        let dst_path = target.folder_path.add_folder(&target.name);
        if dst_path == src_path {
            return Ok(());
        }
        if target.folder_path.starts_with(&src_path) {
            return Err(CapsuleError::Write(format!(
                "cannot copy {src_path} into its own subtree"
            )));
        }
        target.clear_existing(&self.store, overwrite)?;

        let dest_loader = target.folder_loader(&self.store);
        CopyImporter.import_folder(&self.store, &dest_loader, &src, Some(&target.name))?;
        self.after_write();
        Ok(())
    }

    fn output_stream(&self, name: &str, offset: i64) -> Result<CellWriter> {
        let path = self.path().add_file(name);
        let cell = self.store.get_mutable_data_cell(&path)?;
        Ok(cell.writer(offset))
    }

    fn update_md5(&self, name: &str) -> Result<()> {
        let path = self.path().add_file(name);
        let cell = self.store.get_data_cell(&path)?;
        let md5 = digest_reader(cell.reader()?)?;
        self.store.set_md5(&path, md5)?;
        debug!("updated digest of {} to {}", path, hex::encode(md5));
        Ok(())
    }

    fn clear_file(&self, name: &str) -> Result<()> {
        let path = self.path().add_file(name);
        let mut cell = self.store.get_mutable_data_cell(&path)?;
        cell.clear()
    }

    fn append_into_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path().add_file(name);
        let mut cell = self.store.get_mutable_data_cell(&path)?;
        cell.append(data)
    }

    fn import_file<I: Importer + ?Sized>(
        &self,
        dest: &str,
        importer: &I,
        id: &I::FileId,
    ) -> Result<()> {
        let loader = self.import_target(dest)?;
        importer.import_file(&self.store, &loader, id, None)?;
        self.after_write();
        Ok(())
    }

    fn import_directory<I: Importer + ?Sized>(
        &self,
        dest: &str,
        importer: &I,
        id: &I::FolderId,
    ) -> Result<()> {
        let loader = self.import_target(dest)?;
        importer.import_folder(&self.store, &loader, id, None)?;
        self.after_write();
        Ok(())
    }
}

impl WriteContext {
    fn import_target(&self, dest: &str) -> Result<FolderLoader> {
        let folder_path = self.path().join(&CapsulePath::parse(dest)).as_folder();
        let record = self.store.find_folder(&folder_path)?;
        Ok(FolderLoader::new(self.store.clone(), record.offset, folder_path))
    }
}

/// Lazy walk over the files below a folder; cold until iterated.
pub struct FindFiles {
    pattern: GlobPattern,
    recursive: bool,
    pending: Vec<FileLoader>,
    stack: Vec<FolderLoader>,
}

impl Iterator for FindFiles {
    type Item = Result<FileLoader>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(file) = self.pending.pop() {
                return Some(Ok(file));
            }
            let folder = self.stack.pop()?;
            let node = match folder.load() {
                Ok(node) => node,
                Err(e) => return Some(Err(e)),
            };
            for file in node.files.into_iter().rev() {
                if self.pattern.matches(&file.path().to_string()) {
                    self.pending.push(file);
                }
            }
            if self.recursive {
                for sub in node.folders.into_iter().rev() {
                    self.stack.push(sub);
                }
            }
        }
    }
}

struct DestTarget {
    folder_offset: i64,
    folder_path: CapsulePath,
    name: String,
    existing: Option<Record>,
}

impl DestTarget {
    fn folder_loader(&self, store: &RecordStore) -> FolderLoader {
        FolderLoader::new(store.clone(), self.folder_offset, self.folder_path.clone())
    }

    /// Enforce the overwrite contract: an occupied destination either
    /// fails with the matching already-exists error or is deleted first.
    fn clear_existing(&self, store: &RecordStore, overwrite: bool) -> Result<()> {
        let existing = match &self.existing {
            Some(record) => record,
            None => return Ok(()),
        };
        match existing {
            Record::File(_) => {
                let path = self.folder_path.add_file(&self.name);
                if !overwrite {
                    return Err(CapsuleError::FileAlreadyExists(path.to_string()));
                }
                store.delete_file(&path)
            }
            Record::Folder(folder) => {
                let path = self.folder_path.add_folder(&self.name);
                if !overwrite {
                    return Err(CapsuleError::DirectoryAlreadyExists(path.to_string()));
                }
                let loader = FolderLoader::new(store.clone(), folder.offset, path);
                delete_folder_recursive(store, &loader)
            }
            _ => Err(CapsuleError::Parse(format!(
                "destination {} resolved to a non-entry record",
                self.folder_path
            ))),
        }
    }
}

/// Resolve a move/copy destination. A trailing `/` means "place under
/// this folder keeping the source name"; otherwise the last component is
/// the new name. Missing intermediate folders fail with
/// `DirectoryNotFound`.
fn resolve_destination(
    store: &RecordStore,
    current: &CapsulePath,
    dest: &str,
    source_name: &str,
) -> Result<DestTarget> {
    let parsed = CapsulePath::parse(dest);
    let base = current.join(&parsed);

    let (folder_path, name) = if base.is_folder() {
        (base, source_name.to_string())
    } else {
        (base.remove_last(), base.name().to_string())
    };

    let folder = store.find_folder(&folder_path)?;
    let mut existing = None;
    for child in store.read_children(&folder)? {
        let record = store.read_record(child)?;
        let child_name = match &record {
            Record::File(f) => f.name.as_str(),
            Record::Folder(f) => f.name.as_str(),
            _ => continue,
        };
        if child_name == name {
            existing = Some(record);
            break;
        }
    }

    Ok(DestTarget {
        folder_offset: folder.offset,
        folder_path,
        name,
        existing,
    })
}

fn file_in<'a>(folder: &'a FolderNode, name: &str) -> Result<&'a FileLoader> {
    folder
        .file(name)
        .ok_or_else(|| CapsuleError::FileNotFound(folder.path.add_file(name).to_string()))
}

/// Delete a folder and all its descendants, freeing every content row
/// through the store's own primitives.
fn delete_folder_recursive(store: &RecordStore, loader: &FolderLoader) -> Result<()> {
    let node = loader.load()?;
    for file in &node.files {
        store.delete_file(file.path())?;
    }
    for sub in &node.folders {
        delete_folder_recursive(store, sub)?;
    }
    store.delete_folder(loader.path())
}

pub(crate) fn digest_reader(mut reader: impl Read) -> Result<[u8; 16]> {
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}
