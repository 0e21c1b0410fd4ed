//! The record store: random-access read/write of container records.
//!
//! Owns the container path and the allocator. Record lookup walks the
//! folder graph by reading children rows; mutations rewrite records in
//! place or convert them to `FREE` holes. File handles are opened per
//! operation and closed on completion.

mod cell;

pub use cell::{CellReader, CellWriter, DataCell, MutableDataCell};
pub(crate) use cell::CellOwner;

use crate::allocator::{Allocator, Area};
use crate::clock::Clock;
use crate::error::{CapsuleError, Result};
use crate::node::{CapsulePath, FileLoader, FileNode, FolderLoader, FolderNode};
use crate::record::{
    self, FileRecord, FolderRecord, Record, RowRecord, FILE_PAYLOAD, FOLDER_PAYLOAD, HEADER_SIZE,
    NULL_PTR, ROW_PREFIX,
};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Offset of the implicit root folder record.
pub const ROOT_OFFSET: i64 = 0;

/// Initial content capacity granted to a fresh file's row.
const INITIAL_CONTENT_CAPACITY: i64 = 20;

/// Initial children capacity granted to a fresh folder's row (ten
/// pointers).
const INITIAL_CHILDREN_CAPACITY: i64 = 10 * 8;

struct StoreInner {
    path: PathBuf,
    allocator: Mutex<Allocator>,
    clock: Arc<dyn Clock>,
}

/// Handle to an open container. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordStore({})", self.inner.path.display())
    }
}

/// Aggregate allocator-derived numbers about a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub container_bytes: i64,
    pub live_records: usize,
    pub free_records: usize,
    pub free_bytes: i64,
}

impl RecordStore {
    /// Open the container at `path`, creating it with an empty root folder
    /// when it does not exist, or re-scanning it when it does.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<RecordStore> {
        let path = path.as_ref().to_path_buf();
        if path.is_dir() {
            return Err(CapsuleError::Write(format!(
                "container path is a directory: {}",
                path.display()
            )));
        }

        let store = RecordStore {
            inner: Arc::new(StoreInner {
                path: path.clone(),
                allocator: Mutex::new(Allocator::new()),
                clock,
            }),
        };

        let fresh = !path.exists() || std::fs::metadata(&path)?.len() == 0;
        if fresh {
            store.bootstrap()?;
            info!("created container {}", path.display());
        } else {
            store.scan()?;
            info!("opened container {}", path.display());
        }
        Ok(store)
    }

    pub fn container_path(&self) -> &Path {
        &self.inner.path
    }

    /// Re-read the whole container, rebuilding the allocator and checking
    /// structural linkage. Returns the root folder record.
    pub fn scan(&self) -> Result<FolderRecord> {
        let mut file = self.open_handle()?;
        let file_len = file.metadata()?.len() as i64;
        let mut alloc = self.inner.allocator.lock();
        alloc.clear();

        let mut records: HashMap<i64, Record> = HashMap::new();
        let mut pos: i64 = 0;
        while let Some(rec) = record::parse_next(&mut file, pos)? {
            let area = Area::new(pos, rec.total_size());
            match &rec {
                Record::Free(_) => alloc.register_free(area),
                _ => alloc.register_used(area),
            }
            pos = area.end();
            records.insert(rec.offset(), rec);
        }
        if pos != file_len {
            return Err(CapsuleError::Parse(format!(
                "records end at {pos} but the container holds {file_len} bytes"
            )));
        }
        drop(alloc);
        drop(file);

        let root = match records.get(&ROOT_OFFSET) {
            Some(Record::Folder(folder)) if folder.is_root() => folder.clone(),
            _ => {
                return Err(CapsuleError::Parse(
                    "container has no root folder at offset 0".into(),
                ))
            }
        };

        // Link pass: every folder's children row must reference live
        // entries that point back at the folder, each entry exactly once.
        let mut seen_children: HashSet<i64> = HashSet::new();
        for rec in records.values() {
            match rec {
                Record::Folder(folder) => {
                    match records.get(&folder.children) {
                        Some(Record::Row(_)) => {}
                        _ => {
                            return Err(CapsuleError::Parse(format!(
                                "folder at {} has no children row at {}",
                                folder.offset, folder.children
                            )))
                        }
                    }
                    for child in self.read_children(folder)? {
                        if !seen_children.insert(child) {
                            return Err(CapsuleError::Parse(format!(
                                "record at {child} is listed as a child twice"
                            )));
                        }
                        let parent = match records.get(&child) {
                            Some(Record::File(f)) => f.parent,
                            Some(Record::Folder(f)) => f.parent,
                            _ => {
                                return Err(CapsuleError::Parse(format!(
                                    "children row of folder at {} references {child}, \
                                     which is not a live entry",
                                    folder.offset
                                )))
                            }
                        };
                        if parent != folder.offset {
                            return Err(CapsuleError::Parse(format!(
                                "record at {child} claims parent {parent}, found under {}",
                                folder.offset
                            )));
                        }
                    }
                }
                Record::File(f) => match records.get(&f.content) {
                    Some(Record::Row(_)) => {}
                    _ => {
                        return Err(CapsuleError::Parse(format!(
                            "file at {} has no content row at {}",
                            f.offset, f.content
                        )))
                    }
                },
                _ => {}
            }
        }

        debug!(
            "scanned container {}: {} records",
            self.inner.path.display(),
            records.len()
        );
        Ok(root)
    }

    fn bootstrap(&self) -> Result<()> {
        let root_size = HEADER_SIZE + FOLDER_PAYLOAD;
        let children_area;
        {
            let mut alloc = self.inner.allocator.lock();
            alloc.register_used(Area::new(ROOT_OFFSET, root_size));
            children_area =
                alloc.allocate(HEADER_SIZE + ROW_PREFIX + INITIAL_CHILDREN_CAPACITY, false);
        }

        let children_row = RowRecord {
            offset: children_area.start,
            filled: 0,
            capacity: children_area.size - HEADER_SIZE - ROW_PREFIX,
        };
        let root = FolderRecord {
            offset: ROOT_OFFSET,
            name: String::new(),
            parent: NULL_PTR,
            children: children_row.offset,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.inner.path)?;
        record::write_record(&mut file, &Record::Folder(root), None)?;
        record::write_record(&mut file, &Record::Row(children_row), None)?;
        file.sync_all()?;
        Ok(())
    }

    pub(crate) fn open_handle(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.inner.path)?)
    }

    pub(crate) fn allocate(&self, min_size: i64, fitted: bool) -> Area {
        self.inner.allocator.lock().allocate(min_size, fitted)
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    // ------------------------------------------------------------------
    // Record primitives

    /// Read and parse the record starting at `offset`.
    pub fn read_record(&self, offset: i64) -> Result<Record> {
        let mut file = self.open_handle()?;
        file.seek(SeekFrom::Start(offset as u64))?;
        record::parse_next(&mut file, offset)?.ok_or_else(|| {
            CapsuleError::Parse(format!("no record at offset {offset}: end of container"))
        })
    }

    pub(crate) fn read_file_record(&self, offset: i64) -> Result<FileRecord> {
        match self.read_record(offset)? {
            Record::File(f) => Ok(f),
            other => Err(CapsuleError::Parse(format!(
                "expected a file record at {offset}, found {other:?}"
            ))),
        }
    }

    pub(crate) fn read_folder_record(&self, offset: i64) -> Result<FolderRecord> {
        match self.read_record(offset)? {
            Record::Folder(f) => Ok(f),
            other => Err(CapsuleError::Parse(format!(
                "expected a folder record at {offset}, found {other:?}"
            ))),
        }
    }

    pub(crate) fn read_row_record(&self, offset: i64) -> Result<RowRecord> {
        match self.read_record(offset)? {
            Record::Row(r) => Ok(r),
            other => Err(CapsuleError::Parse(format!(
                "expected a row record at {offset}, found {other:?}"
            ))),
        }
    }

    /// Serialise `record` at its own offset.
    pub(crate) fn write_record_at(&self, rec: &Record, data: Option<&[u8]>) -> Result<()> {
        let mut file = self.open_handle()?;
        file.seek(SeekFrom::Start(rec.offset() as u64))?;
        record::write_record(&mut file, rec, data)
    }

    /// Mirror a row's `filled` field to the container.
    pub(crate) fn write_row_filled(&self, row_offset: i64, filled: i64) -> Result<()> {
        let mut file = self.open_handle()?;
        file.seek(SeekFrom::Start((row_offset + HEADER_SIZE) as u64))?;
        file.write_all(&filled.to_be_bytes())?;
        Ok(())
    }

    /// Rewrite the record at `offset` as a `FREE` hole. Only the type byte
    /// changes; the header keeps the true size so later scans stay
    /// well-formed.
    pub(crate) fn free_record(&self, offset: i64) -> Result<()> {
        let area = self.inner.allocator.lock().unregister_used(offset)?;
        let mut file = self.open_handle()?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(&[0u8])?;
        self.inner.allocator.lock().register_free(area);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup

    /// Resolve an absolute path to its record, walking children rows from
    /// the root.
    pub fn find(&self, path: &CapsulePath) -> Result<Record> {
        let mut current = self.read_folder_record(ROOT_OFFSET)?;
        let comps = path.components();
        if comps.is_empty() {
            return Ok(Record::Folder(current));
        }

        let mut walked = CapsulePath::root();
        for (i, comp) in comps.iter().enumerate() {
            let last = i + 1 == comps.len();
            let mut matched: Option<Record> = None;
            for child_offset in self.read_children(&current)? {
                let rec = self.read_record(child_offset)?;
                let name = match &rec {
                    Record::File(f) => f.name.as_str(),
                    Record::Folder(f) => f.name.as_str(),
                    _ => {
                        return Err(CapsuleError::Parse(format!(
                            "children row of {walked} references a non-entry record \
                             at {child_offset}"
                        )))
                    }
                };
                if name == comp {
                    matched = Some(rec);
                    break;
                }
            }

            match matched {
                Some(rec) => {
                    if last {
                        if path.is_folder() && matches!(rec, Record::File(_)) {
                            return Err(CapsuleError::NotAFolder(path.to_string()));
                        }
                        return Ok(rec);
                    }
                    match rec {
                        Record::Folder(f) => {
                            walked = walked.add_folder(comp);
                            current = f;
                        }
                        _ => {
                            return Err(CapsuleError::NotAFolder(
                                walked.add_file(comp).to_string(),
                            ))
                        }
                    }
                }
                None => {
                    return Err(if last && !path.is_folder() {
                        CapsuleError::FileNotFound(path.to_string())
                    } else {
                        CapsuleError::DirectoryNotFound(path.to_string())
                    });
                }
            }
        }
        Ok(Record::Folder(current))
    }

    pub(crate) fn find_folder(&self, path: &CapsulePath) -> Result<FolderRecord> {
        match self.find(path)? {
            Record::Folder(f) => Ok(f),
            Record::File(_) => Err(CapsuleError::NotAFolder(path.to_string())),
            _ => Err(CapsuleError::Parse(format!(
                "path {path} resolved to a non-entry record"
            ))),
        }
    }

    pub(crate) fn find_file(&self, path: &CapsulePath) -> Result<FileRecord> {
        match self.find(path)? {
            Record::File(f) => Ok(f),
            Record::Folder(_) => Err(CapsuleError::FileNotFound(path.to_string())),
            _ => Err(CapsuleError::Parse(format!(
                "path {path} resolved to a non-entry record"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Children rows

    /// Read a folder's packed child-offset list.
    pub(crate) fn read_children(&self, folder: &FolderRecord) -> Result<Vec<i64>> {
        let row = self.read_row_record(folder.children)?;
        if row.filled % 8 != 0 {
            return Err(CapsuleError::Parse(format!(
                "children row at {} holds {} bytes, not a pointer multiple",
                row.offset, row.filled
            )));
        }
        let bytes = DataCell::new(self.clone(), row).read_all()?;
        let mut children = Vec::with_capacity(bytes.len() / 8);
        for chunk in bytes.chunks_exact(8) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            children.push(i64::from_be_bytes(buf));
        }
        Ok(children)
    }

    fn children_cell(&self, folder: &FolderRecord) -> Result<MutableDataCell> {
        let row = self.read_row_record(folder.children)?;
        Ok(MutableDataCell::new(
            self.clone(),
            row,
            CellOwner::FolderChildren {
                folder_offset: folder.offset,
            },
        ))
    }

    /// Append a child offset to a folder's children row, growing the row
    /// when it lacks capacity.
    pub(crate) fn add_child(&self, folder_offset: i64, child: i64) -> Result<()> {
        let folder = self.read_folder_record(folder_offset)?;
        let mut cell = self.children_cell(&folder)?;
        cell.append(&child.to_be_bytes())
    }

    /// Drop a child offset from a folder's children row.
    pub(crate) fn remove_child(&self, folder_offset: i64, child: i64) -> Result<()> {
        let folder = self.read_folder_record(folder_offset)?;
        let children = self.read_children(&folder)?;
        let remaining: Vec<i64> = children.iter().copied().filter(|&c| c != child).collect();
        if remaining.len() == children.len() {
            return Err(CapsuleError::Write(format!(
                "record at {child} is not a child of the folder at {folder_offset}"
            )));
        }

        let mut cell = self.children_cell(&folder)?;
        cell.clear()?;
        if !remaining.is_empty() {
            let mut buf = Vec::with_capacity(remaining.len() * 8);
            for offset in remaining {
                buf.extend_from_slice(&offset.to_be_bytes());
            }
            cell.write_at(0, &buf)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // File operations

    /// Create an empty file, allocating its content row, and link it under
    /// its parent folder.
    pub fn create_file(&self, path: &CapsulePath) -> Result<FileRecord> {
        let name = entry_name(path)?;
        let parent = self.find_folder(&path.remove_last())?;
        self.ensure_name_free(&parent, &name, path)?;

        let (content_area, file_area) = {
            let mut alloc = self.inner.allocator.lock();
            let content =
                alloc.allocate(HEADER_SIZE + ROW_PREFIX + INITIAL_CONTENT_CAPACITY, false);
            let file = alloc.allocate(HEADER_SIZE + FILE_PAYLOAD, true);
            (content, file)
        };

        let content_row = RowRecord {
            offset: content_area.start,
            filled: 0,
            capacity: content_area.size - HEADER_SIZE - ROW_PREFIX,
        };
        self.write_record_at(&Record::Row(content_row), None)?;

        let now = self.now();
        let file = FileRecord {
            offset: file_area.start,
            name,
            parent: parent.offset,
            content: content_row.offset,
            created: now,
            modified: now,
            md5: Md5::digest(b"").into(),
        };
        self.write_record_at(&Record::File(file.clone()), None)?;
        self.add_child(parent.offset, file.offset)?;

        debug!("created file {} at offset {}", path, file.offset);
        Ok(file)
    }

    /// Unlink a file and free both its record and its content row.
    pub fn delete_file(&self, path: &CapsulePath) -> Result<()> {
        let file = self.find_file(path)?;
        self.remove_child(file.parent, file.offset)?;
        self.free_record(file.offset)?;
        self.free_record(file.content)?;
        debug!("deleted file {}", path);
        Ok(())
    }

    /// Rewrite a file record in place with a new name and parent. The
    /// content row is untouched.
    pub fn move_file(&self, src: &CapsulePath, dst: &CapsulePath) -> Result<FileRecord> {
        let file = self.find_file(src)?;
        let new_parent = self.find_folder(&dst.remove_last())?;
        let name = entry_name(dst)?;
        self.ensure_name_free(&new_parent, &name, dst)?;

        let moved = FileRecord {
            name,
            parent: new_parent.offset,
            ..file.clone()
        };
        self.write_record_at(&Record::File(moved.clone()), None)?;
        self.remove_child(file.parent, file.offset)?;
        self.add_child(new_parent.offset, file.offset)?;

        debug!("moved file {} -> {}", src, dst);
        Ok(moved)
    }

    /// Record a new content digest, touching the modification timestamp.
    pub fn set_md5(&self, path: &CapsulePath, md5: [u8; 16]) -> Result<()> {
        let mut file = self.find_file(path)?;
        file.md5 = md5;
        file.modified = self.now();
        self.write_record_at(&Record::File(file), None)
    }

    pub fn get_file_loader(&self, path: &CapsulePath) -> Result<FileLoader> {
        let file = self.find_file(path)?;
        Ok(FileLoader::new(self.clone(), file.offset, path.clone()))
    }

    /// Read-only cell over a file's content row.
    pub fn get_data_cell(&self, path: &CapsulePath) -> Result<DataCell> {
        let file = self.find_file(path)?;
        let row = self.read_row_record(file.content)?;
        Ok(DataCell::new(self.clone(), row))
    }

    /// Writable cell over a file's content row; reallocation rewrites the
    /// file's content pointer.
    pub fn get_mutable_data_cell(&self, path: &CapsulePath) -> Result<MutableDataCell> {
        let file = self.find_file(path)?;
        self.content_cell(&file)
    }

    pub(crate) fn content_cell(&self, file: &FileRecord) -> Result<MutableDataCell> {
        let row = self.read_row_record(file.content)?;
        Ok(MutableDataCell::new(
            self.clone(),
            row,
            CellOwner::FileContent {
                file_offset: file.offset,
            },
        ))
    }

    pub(crate) fn content_cell_readonly(&self, file: &FileRecord) -> Result<DataCell> {
        let row = self.read_row_record(file.content)?;
        Ok(DataCell::new(self.clone(), row))
    }

    // ------------------------------------------------------------------
    // Folder operations

    /// Create an empty folder with a fresh children row.
    pub fn create_folder(&self, path: &CapsulePath) -> Result<FolderRecord> {
        let name = entry_name(path)?;
        let parent = self.find_folder(&path.remove_last())?;
        self.ensure_name_free(&parent, &name, path)?;

        let (children_area, folder_area) = {
            let mut alloc = self.inner.allocator.lock();
            let children =
                alloc.allocate(HEADER_SIZE + ROW_PREFIX + INITIAL_CHILDREN_CAPACITY, false);
            let folder = alloc.allocate(HEADER_SIZE + FOLDER_PAYLOAD, true);
            (children, folder)
        };

        let children_row = RowRecord {
            offset: children_area.start,
            filled: 0,
            capacity: children_area.size - HEADER_SIZE - ROW_PREFIX,
        };
        self.write_record_at(&Record::Row(children_row), None)?;

        let folder = FolderRecord {
            offset: folder_area.start,
            name,
            parent: parent.offset,
            children: children_row.offset,
        };
        self.write_record_at(&Record::Folder(folder.clone()), None)?;
        self.add_child(parent.offset, folder.offset)?;

        debug!("created folder {} at offset {}", path, folder.offset);
        Ok(folder)
    }

    /// Unlink a folder and free its record and children row. Descendants
    /// must already have been deleted by the caller; the store stays
    /// agnostic of recursion policy.
    pub fn delete_folder(&self, path: &CapsulePath) -> Result<()> {
        let folder = self.find_folder(path)?;
        if folder.is_root() {
            return Err(CapsuleError::Write("cannot delete the root folder".into()));
        }
        self.remove_child(folder.parent, folder.offset)?;
        self.free_record(folder.children)?;
        self.free_record(folder.offset)?;
        debug!("deleted folder {}", path);
        Ok(())
    }

    /// Rewrite a folder record in place with a new name and parent; the
    /// children row is preserved.
    pub fn move_folder(&self, src: &CapsulePath, dst: &CapsulePath) -> Result<FolderRecord> {
        let folder = self.find_folder(src)?;
        if folder.is_root() {
            return Err(CapsuleError::Write("cannot move the root folder".into()));
        }
        let new_parent = self.find_folder(&dst.remove_last())?;
        let name = entry_name(dst)?;
        self.ensure_name_free(&new_parent, &name, dst)?;

        let moved = FolderRecord {
            name,
            parent: new_parent.offset,
            ..folder.clone()
        };
        self.write_record_at(&Record::Folder(moved.clone()), None)?;
        self.remove_child(folder.parent, folder.offset)?;
        self.add_child(new_parent.offset, folder.offset)?;

        debug!("moved folder {} -> {}", src, dst);
        Ok(moved)
    }

    pub fn get_folder_loader(&self, path: &CapsulePath) -> Result<FolderLoader> {
        let folder = self.find_folder(path)?;
        Ok(FolderLoader::new(self.clone(), folder.offset, path.clone()))
    }

    pub fn root_loader(&self) -> FolderLoader {
        FolderLoader::new(self.clone(), ROOT_OFFSET, CapsulePath::root())
    }

    // ------------------------------------------------------------------
    // Node loading

    pub(crate) fn load_file_node(&self, offset: i64, path: &CapsulePath) -> Result<FileNode> {
        let file = self.read_file_record(offset)?;
        let parent = (file.parent != NULL_PTR)
            .then(|| FolderLoader::new(self.clone(), file.parent, path.remove_last()));
        Ok(FileNode {
            name: file.name,
            created: file.created,
            modified: file.modified,
            md5: file.md5,
            offset,
            parent,
        })
    }

    pub(crate) fn load_folder_node(&self, offset: i64, path: &CapsulePath) -> Result<FolderNode> {
        let folder = self.read_folder_record(offset)?;
        let parent = (folder.parent != NULL_PTR)
            .then(|| FolderLoader::new(self.clone(), folder.parent, path.remove_last()));

        let mut files = Vec::new();
        let mut folders = Vec::new();
        for child in self.read_children(&folder)? {
            match self.read_record(child)? {
                Record::File(f) => {
                    files.push(FileLoader::new(self.clone(), child, path.add_file(&f.name)));
                }
                Record::Folder(f) => {
                    folders.push(FolderLoader::new(
                        self.clone(),
                        child,
                        path.add_folder(&f.name),
                    ));
                }
                _ => {
                    return Err(CapsuleError::Parse(format!(
                        "children row of {path} references a non-entry record at {child}"
                    )))
                }
            }
        }

        Ok(FolderNode {
            name: folder.name,
            offset,
            path: path.clone(),
            parent,
            files,
            folders,
        })
    }

    // ------------------------------------------------------------------

    fn ensure_name_free(
        &self,
        parent: &FolderRecord,
        name: &str,
        target: &CapsulePath,
    ) -> Result<()> {
        for child in self.read_children(parent)? {
            match self.read_record(child)? {
                Record::File(f) if f.name == name => {
                    return Err(CapsuleError::FileAlreadyExists(target.to_string()));
                }
                Record::Folder(f) if f.name == name => {
                    return Err(CapsuleError::DirectoryAlreadyExists(target.to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let alloc = self.inner.allocator.lock();
        StoreStats {
            container_bytes: alloc.last_position(),
            live_records: alloc.used_area_count(),
            free_records: alloc.free_area_count(),
            free_bytes: alloc.free_bytes(),
        }
    }
}

/// Validate the final component of a path as an entry name.
fn entry_name(path: &CapsulePath) -> Result<String> {
    let name = path.name();
    if name == "." || name.is_empty() {
        return Err(CapsuleError::Write(format!(
            "path has no entry name: {path}"
        )));
    }
    // Length and NUL checks live in the codec; run them up front so no
    // record is touched for an invalid name.
    record::encode_name(name)?;
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::io::Read;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> RecordStore {
        let path = dir.path().join("test.capsule");
        RecordStore::open(path, Arc::new(SystemClock)).unwrap()
    }

    fn p(s: &str) -> CapsulePath {
        CapsulePath::parse(s)
    }

    #[test]
    fn test_new_container_has_empty_root() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let root = store.find_folder(&CapsulePath::root()).unwrap();
        assert!(root.is_root());
        assert_eq!(root.name, "");
        assert!(store.read_children(&root).unwrap().is_empty());
    }

    #[test]
    fn test_create_and_find_file() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let created = store.create_file(&p("/a.txt")).unwrap();
        let found = store.find_file(&p("/a.txt")).unwrap();
        assert_eq!(created, found);
        assert_eq!(found.name, "a.txt");
        assert_eq!(found.parent, ROOT_OFFSET);

        // The fresh content row is empty but has starter capacity.
        let cell = store.get_data_cell(&p("/a.txt")).unwrap();
        assert_eq!(cell.len(), 0);
    }

    #[test]
    fn test_missing_paths_report_kind() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        assert!(matches!(
            store.find(&p("/nope.txt")),
            Err(CapsuleError::FileNotFound(_))
        ));
        assert!(matches!(
            store.find(&p("/nope/")),
            Err(CapsuleError::DirectoryNotFound(_))
        ));
        assert!(matches!(
            store.find(&p("/nope/deeper.txt")),
            Err(CapsuleError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn test_file_in_the_middle_of_a_path() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.create_file(&p("/a")).unwrap();
        assert!(matches!(
            store.find(&p("/a/b.txt")),
            Err(CapsuleError::NotAFolder(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.create_file(&p("/a")).unwrap();
        assert!(matches!(
            store.create_file(&p("/a")),
            Err(CapsuleError::FileAlreadyExists(_))
        ));
        assert!(matches!(
            store.create_folder(&p("/a/")),
            Err(CapsuleError::FileAlreadyExists(_))
        ));

        store.create_folder(&p("/d/")).unwrap();
        assert!(matches!(
            store.create_file(&p("/d")),
            Err(CapsuleError::DirectoryAlreadyExists(_))
        ));
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.create_file(&p("/data.bin")).unwrap();
        let mut cell = store.get_mutable_data_cell(&p("/data.bin")).unwrap();
        cell.write_at(0, b"hello, container").unwrap();

        let cell = store.get_data_cell(&p("/data.bin")).unwrap();
        assert_eq!(cell.read_all().unwrap(), b"hello, container");
    }

    #[test]
    fn test_content_grows_past_capacity() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let file = store.create_file(&p("/grow.bin")).unwrap();
        let initial_row = store.read_row_record(file.content).unwrap();

        let big = vec![0x5A; (initial_row.capacity + 100) as usize];
        let mut cell = store.get_mutable_data_cell(&p("/grow.bin")).unwrap();
        cell.write_at(0, &big).unwrap();

        // The content row moved and the file record follows it.
        let relocated = store.find_file(&p("/grow.bin")).unwrap();
        assert_ne!(relocated.content, file.content);
        assert_eq!(
            store.get_data_cell(&p("/grow.bin")).unwrap().read_all().unwrap(),
            big
        );

        // The old row is a reusable hole now.
        assert!(matches!(
            store.read_record(file.content).unwrap(),
            Record::Free(_)
        ));
    }

    #[test]
    fn test_children_row_grows_past_ten_entries() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let root_before = store.find_folder(&CapsulePath::root()).unwrap();
        for i in 0..20 {
            store.create_file(&p(&format!("/f{i:02}"))).unwrap();
        }
        let root_after = store.find_folder(&CapsulePath::root()).unwrap();
        assert_ne!(root_before.children, root_after.children);
        assert_eq!(store.read_children(&root_after).unwrap().len(), 20);
    }

    #[test]
    fn test_delete_file_frees_both_records() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let file = store.create_file(&p("/gone.txt")).unwrap();
        store.delete_file(&p("/gone.txt")).unwrap();

        assert!(matches!(
            store.read_record(file.offset).unwrap(),
            Record::Free(_)
        ));
        assert!(matches!(
            store.read_record(file.content).unwrap(),
            Record::Free(_)
        ));
        assert!(store.find(&p("/gone.txt")).is_err());
    }

    #[test]
    fn test_deleted_space_is_reused() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.create_file(&p("/one")).unwrap();
        let size_before = store.stats().container_bytes;

        store.delete_file(&p("/one")).unwrap();
        store.create_file(&p("/two")).unwrap();
        assert_eq!(store.stats().container_bytes, size_before);
    }

    #[test]
    fn test_move_file_keeps_offset_and_content() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.create_folder(&p("/dst/")).unwrap();
        let file = store.create_file(&p("/a.txt")).unwrap();
        let mut cell = store.get_mutable_data_cell(&p("/a.txt")).unwrap();
        cell.write_at(0, b"payload").unwrap();

        let moved = store.move_file(&p("/a.txt"), &p("/dst/b.txt")).unwrap();
        assert_eq!(moved.offset, file.offset);
        assert_eq!(moved.content, store.find_file(&p("/dst/b.txt")).unwrap().content);
        assert!(store.find(&p("/a.txt")).is_err());
        assert_eq!(
            store.get_data_cell(&p("/dst/b.txt")).unwrap().read_all().unwrap(),
            b"payload"
        );
    }

    #[test]
    fn test_move_folder_preserves_children() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.create_folder(&p("/src/")).unwrap();
        store.create_file(&p("/src/inner.txt")).unwrap();
        store.create_folder(&p("/dst/")).unwrap();

        store.move_folder(&p("/src/"), &p("/dst/renamed/")).unwrap();
        assert!(store.find_file(&p("/dst/renamed/inner.txt")).is_ok());
        assert!(store.find(&p("/src/")).is_err());
    }

    #[test]
    fn test_root_cannot_be_deleted_or_moved() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.delete_folder(&CapsulePath::root()).is_err());
        assert!(store.move_folder(&CapsulePath::root(), &p("/x/")).is_err());
    }

    #[test]
    fn test_scan_after_reopen_sees_same_tree() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reopen.capsule");

        {
            let store = RecordStore::open(&path, Arc::new(SystemClock)).unwrap();
            store.create_folder(&p("/docs/")).unwrap();
            store.create_file(&p("/docs/a.txt")).unwrap();
            let mut cell = store.get_mutable_data_cell(&p("/docs/a.txt")).unwrap();
            cell.write_at(0, b"persisted").unwrap();
        }

        let store = RecordStore::open(&path, Arc::new(SystemClock)).unwrap();
        let cell = store.get_data_cell(&p("/docs/a.txt")).unwrap();
        assert_eq!(cell.read_all().unwrap(), b"persisted");
    }

    #[test]
    fn test_scan_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.capsule");
        std::fs::write(&path, b"definitely not a container").unwrap();

        let err = RecordStore::open(&path, Arc::new(SystemClock)).unwrap_err();
        assert!(matches!(err, CapsuleError::Parse(_)));
    }

    #[test]
    fn test_container_path_must_not_be_directory() {
        let dir = TempDir::new().unwrap();
        let err = RecordStore::open(dir.path(), Arc::new(SystemClock)).unwrap_err();
        assert!(matches!(err, CapsuleError::Write(_)));
    }

    #[test]
    fn test_cell_writer_appends_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.create_file(&p("/file")).unwrap();
        let cell = store.get_mutable_data_cell(&p("/file")).unwrap();
        let mut writer = cell.writer(-1);
        writer.write_all(b"This is file.").unwrap();

        let cell = store.get_mutable_data_cell(&p("/file")).unwrap();
        let mut writer = cell.writer(8);
        writer.write_all(b"FILE").unwrap();

        let mut out = String::new();
        store
            .get_data_cell(&p("/file"))
            .unwrap()
            .reader()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "This is FILE.");
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.create_file(&p("/file")).unwrap();
        let mut cell = store.get_mutable_data_cell(&p("/file")).unwrap();
        cell.write_at(0, b"0123456789").unwrap();
        let capacity = cell.capacity();

        cell.clear().unwrap();
        assert_eq!(cell.filled(), 0);
        assert_eq!(cell.capacity(), capacity);
        assert!(store.get_data_cell(&p("/file")).unwrap().is_empty());
    }

    #[test]
    fn test_name_validation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let long = "x".repeat(31);
        assert!(matches!(
            store.create_file(&CapsulePath::root().add_file(&long)),
            Err(CapsuleError::Write(_))
        ));
        // A slash inside a single component would create an entry that
        // path navigation could never reach.
        assert!(matches!(
            store.create_file(&CapsulePath::root().add_file("a/b")),
            Err(CapsuleError::Write(_))
        ));
        assert!(store
            .create_file(&CapsulePath::root().add_file(&"x".repeat(30)))
            .is_ok());
    }
}
