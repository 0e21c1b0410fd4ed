//! Importers: external sources of bytes and metadata that feed the
//! store's create/write paths.
//!
//! [`CopyImporter`] duplicates subtrees within the same store.
//! [`HostImporter`] pulls files and directory trees in from the host
//! filesystem, streaming bytes into fresh data cells and recording the
//! MD5 on completion.

use crate::error::{CapsuleError, Result};
use crate::node::{FileLoader, FolderLoader};
use crate::store::RecordStore;
use md5::{Digest, Md5};
use std::io::Read;
use std::path::Path;
use tracing::debug;

const COPY_CHUNK: usize = 8 * 1024;

/// An external source the service can pull entries from.
pub trait Importer {
    /// Identifies one importable file (e.g. a host path, a source loader).
    type FileId: ?Sized;
    /// Identifies one importable folder.
    type FolderId: ?Sized;

    /// Create one file under `parent` from `id`. `name` overrides the
    /// source-derived name when given.
    fn import_file(
        &self,
        store: &RecordStore,
        parent: &FolderLoader,
        id: &Self::FileId,
        name: Option<&str>,
    ) -> Result<()>;

    /// Create a folder tree under `parent` from `id`.
    fn import_folder(
        &self,
        store: &RecordStore,
        parent: &FolderLoader,
        id: &Self::FolderId,
        name: Option<&str>,
    ) -> Result<()>;
}

/// Duplicates files and subtrees within the same store through fresh data
/// cells. The source digest is carried over unchanged.
pub struct CopyImporter;

impl Importer for CopyImporter {
    type FileId = FileLoader;
    type FolderId = FolderLoader;

    fn import_file(
        &self,
        store: &RecordStore,
        parent: &FolderLoader,
        src: &FileLoader,
        name: Option<&str>,
    ) -> Result<()> {
        let src_record = store.read_file_record(src.offset())?;
        let dst_path = parent.path().add_file(name.unwrap_or(&src_record.name));
        store.create_file(&dst_path)?;

        let reader = store.content_cell_readonly(&src_record)?.reader()?;
        let mut cell = store.get_mutable_data_cell(&dst_path)?;
        stream_into_cell(reader, &mut cell)?;

        store.set_md5(&dst_path, src_record.md5)?;
        debug!("copied {} -> {}", src.path(), dst_path);
        Ok(())
    }

    fn import_folder(
        &self,
        store: &RecordStore,
        parent: &FolderLoader,
        src: &FolderLoader,
        name: Option<&str>,
    ) -> Result<()> {
        let node = src.load()?;
        let dst_path = parent.path().add_folder(name.unwrap_or(&node.name));
        let record = store.create_folder(&dst_path)?;
        let dst_loader = FolderLoader::new(store.clone(), record.offset, dst_path);

        for file in &node.files {
            self.import_file(store, &dst_loader, file, None)?;
        }
        for sub in &node.folders {
            self.import_folder(store, &dst_loader, sub, None)?;
        }
        Ok(())
    }
}

/// Imports files and directory trees from the host filesystem.
pub struct HostImporter;

impl Importer for HostImporter {
    type FileId = Path;
    type FolderId = Path;

    fn import_file(
        &self,
        store: &RecordStore,
        parent: &FolderLoader,
        host: &Path,
        name: Option<&str>,
    ) -> Result<()> {
        let file_name = match name {
            Some(n) => n.to_string(),
            None => host_entry_name(host)?,
        };
        let dst_path = parent.path().add_file(&file_name);
        store.create_file(&dst_path)?;

        let mut src = std::fs::File::open(host).map_err(wrap_import)?;
        let mut cell = store.get_mutable_data_cell(&dst_path)?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; COPY_CHUNK];
        let mut pos = 0i64;
        loop {
            let n = src.read(&mut buf).map_err(wrap_import)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            cell.write_at(pos, &buf[..n])?;
            pos += n as i64;
        }

        store.set_md5(&dst_path, hasher.finalize().into())?;
        debug!("imported host file {} -> {}", host.display(), dst_path);
        Ok(())
    }

    fn import_folder(
        &self,
        store: &RecordStore,
        parent: &FolderLoader,
        host: &Path,
        name: Option<&str>,
    ) -> Result<()> {
        let folder_name = match name {
            Some(n) => n.to_string(),
            None => host_entry_name(host)?,
        };
        let dst_path = parent.path().add_folder(&folder_name);
        let record = store.create_folder(&dst_path)?;
        let dst_loader = FolderLoader::new(store.clone(), record.offset, dst_path);

        let mut entries: Vec<std::fs::DirEntry> = std::fs::read_dir(host)
            .map_err(wrap_import)?
            .collect::<std::io::Result<_>>()
            .map_err(wrap_import)?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let kind = entry.file_type().map_err(wrap_import)?;
            if kind.is_dir() {
                self.import_folder(store, &dst_loader, &path, None)?;
            } else if kind.is_file() {
                self.import_file(store, &dst_loader, &path, None)?;
            }
            // Symlinks and specials are skipped.
        }
        Ok(())
    }
}

fn stream_into_cell(
    mut reader: impl Read,
    cell: &mut crate::store::MutableDataCell,
) -> Result<()> {
    let mut buf = [0u8; COPY_CHUNK];
    let mut pos = 0i64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        cell.write_at(pos, &buf[..n])?;
        pos += n as i64;
    }
}

fn host_entry_name(host: &Path) -> Result<String> {
    host.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            CapsuleError::Import(format!("host path has no usable name: {}", host.display()).into())
        })
}

fn wrap_import(e: std::io::Error) -> CapsuleError {
    CapsuleError::Import(Box::new(e))
}
