//! Data cells: stream views over `ROW` records.
//!
//! A read cell produces a length-bounded input stream. A mutable cell
//! additionally supports positional writes that transparently reallocate
//! the underlying row when a write exceeds its capacity, rewriting the
//! owning record's pointer and freeing the old row.

use crate::error::{CapsuleError, Result};
use crate::record::{Record, RowRecord, HEADER_SIZE, ROW_PREFIX};
use crate::store::RecordStore;
use std::io::{Read, Seek, SeekFrom, Write};

/// The record whose pointer field tracks a relocatable row.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CellOwner {
    /// A FILE record's `content_ptr`.
    FileContent { file_offset: i64 },
    /// A FOLDER record's `children_ptr`.
    FolderChildren { folder_offset: i64 },
}

/// Read-only view of a row.
#[derive(Debug, Clone)]
pub struct DataCell {
    store: RecordStore,
    row: RowRecord,
}

impl DataCell {
    pub(crate) fn new(store: RecordStore, row: RowRecord) -> Self {
        DataCell { store, row }
    }

    /// Number of meaningful payload bytes.
    pub fn len(&self) -> i64 {
        self.row.filled
    }

    pub fn is_empty(&self) -> bool {
        self.row.filled == 0
    }

    /// Open a stream over the first `filled` bytes of the row.
    pub fn reader(&self) -> Result<CellReader> {
        CellReader::open(&self.store, &self.row)
    }

    /// Read the whole cell into memory.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.row.filled as usize);
        self.reader()?.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Bounded input stream over a row's filled bytes.
pub struct CellReader {
    file: std::fs::File,
    remaining: u64,
}

impl CellReader {
    fn open(store: &RecordStore, row: &RowRecord) -> Result<Self> {
        let mut file = store.open_handle()?;
        file.seek(SeekFrom::Start(row.data_offset() as u64))?;
        Ok(CellReader {
            file,
            remaining: row.filled as u64,
        })
    }
}

impl Read for CellReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let take = (buf.len() as u64).min(self.remaining) as usize;
        if take == 0 {
            return Ok(0);
        }
        let n = self.file.read(&mut buf[..take])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Writable view of a row, bound to the record that owns it.
#[derive(Debug)]
pub struct MutableDataCell {
    store: RecordStore,
    row: RowRecord,
    owner: CellOwner,
}

impl MutableDataCell {
    pub(crate) fn new(store: RecordStore, row: RowRecord, owner: CellOwner) -> Self {
        MutableDataCell { store, row, owner }
    }

    pub fn filled(&self) -> i64 {
        self.row.filled
    }

    pub fn capacity(&self) -> i64 {
        self.row.capacity
    }

    /// Reset `filled` to zero without releasing capacity.
    pub fn clear(&mut self) -> Result<()> {
        self.row.filled = 0;
        self.store.write_row_filled(self.row.offset, 0)
    }

    /// Open a bounded reader over the current contents.
    pub fn reader(&self) -> Result<CellReader> {
        CellReader::open(&self.store, &self.row)
    }

    /// Write `data` at byte position `offset` within the cell, growing the
    /// backing row if the write runs past its capacity. `filled` only ever
    /// grows: `filled = max(filled, offset + data.len())`, mirrored to the
    /// container immediately.
    pub fn write_at(&mut self, offset: i64, data: &[u8]) -> Result<()> {
        if offset < 0 {
            return Err(CapsuleError::Write(format!(
                "negative cell write offset {offset}"
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let end = offset + data.len() as i64;
        if end > self.row.capacity {
            self.reallocate(end)?;
        }

        let mut file = self.store.open_handle()?;
        file.seek(SeekFrom::Start((self.row.data_offset() + offset) as u64))?;
        file.write_all(data)?;

        if end > self.row.filled {
            self.row.filled = end;
            self.store.write_row_filled(self.row.offset, end)?;
        }
        Ok(())
    }

    /// Append `data` after the last filled byte.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.write_at(self.row.filled, data)
    }

    /// Turn the cell into a positional output stream. A negative `offset`
    /// means "append"; positive offsets are clamped to `[0, filled]`.
    pub fn writer(self, offset: i64) -> CellWriter {
        let pos = if offset < 0 {
            self.row.filled
        } else {
            offset.min(self.row.filled)
        };
        CellWriter { cell: self, pos }
    }

    /// Move the contents into a freshly allocated row of at least
    /// `min_payload` bytes, rewrite the owner's pointer and free the old
    /// row.
    fn reallocate(&mut self, min_payload: i64) -> Result<()> {
        let old = self.row;
        let mut existing = vec![0u8; old.filled as usize];
        if old.filled > 0 {
            self.reader()?.read_exact(&mut existing).map_err(|e| {
                CapsuleError::Parse(format!("short read while relocating row: {e}"))
            })?;
        }

        let area = self
            .store
            .allocate(HEADER_SIZE + ROW_PREFIX + min_payload, false);
        let new_row = RowRecord {
            offset: area.start,
            filled: old.filled,
            capacity: area.size - HEADER_SIZE - ROW_PREFIX,
        };
        self.store
            .write_record_at(&Record::Row(new_row), Some(&existing))?;

        match self.owner {
            CellOwner::FileContent { file_offset } => {
                let mut file = self.store.read_file_record(file_offset)?;
                file.content = new_row.offset;
                self.store.write_record_at(&Record::File(file), None)?;
            }
            CellOwner::FolderChildren { folder_offset } => {
                let mut folder = self.store.read_folder_record(folder_offset)?;
                folder.children = new_row.offset;
                self.store.write_record_at(&Record::Folder(folder), None)?;
            }
        }

        self.store.free_record(old.offset)?;
        self.row = new_row;
        Ok(())
    }
}

/// Positional output stream over a mutable cell.
#[derive(Debug)]
pub struct CellWriter {
    cell: MutableDataCell,
    pos: i64,
}

impl CellWriter {
    pub fn position(&self) -> i64 {
        self.pos
    }

    pub fn into_cell(self) -> MutableDataCell {
        self.cell
    }
}

impl Write for CellWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.cell
            .write_at(self.pos, buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.pos += buf.len() as i64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
