//! Typed records and the binary codec for the container stream.
//!
//! Every record starts with a one-byte type tag and a big-endian `i64`
//! payload size. Four record types exist:
//!
//! - `FREE (0)` - an unused hole whose payload bytes are undefined
//! - `ROW (1)` - a raw data cell: `filled`, `capacity`, then `capacity` bytes
//! - `FILE (2)` - fixed 82-byte payload with name, pointers, timestamps, MD5
//! - `FOLDER (3)` - fixed 46-byte payload with name, parent and children pointers
//!
//! All integers are big-endian. Names occupy exactly [`NAME_SIZE`] bytes,
//! zero-padded; the decoder stops at the first zero byte. A pointer is the
//! absolute offset of the referenced record; [`NULL_PTR`] denotes null.

use crate::error::{CapsuleError, Result};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

/// Null pointer value for `parent_ptr`, `content_ptr` and `children_ptr`.
pub const NULL_PTR: i64 = -1;

/// Record header: type tag plus payload size.
pub const HEADER_SIZE: i64 = 1 + 8;

/// Fixed width of an encoded name.
pub const NAME_SIZE: usize = 30;

/// ROW payload prefix: `filled` and `capacity`.
pub const ROW_PREFIX: i64 = 16;

/// FILE payload: name, four pointers/timestamps, length-prefixed digest.
pub const FILE_PAYLOAD: i64 = NAME_SIZE as i64 + 8 * 4 + 4 + 16;

/// FOLDER payload: name, parent pointer, children pointer.
pub const FOLDER_PAYLOAD: i64 = NAME_SIZE as i64 + 8 * 2;

const TYPE_FREE: u8 = 0;
const TYPE_ROW: u8 = 1;
const TYPE_FILE: u8 = 2;
const TYPE_FOLDER: u8 = 3;

/// An unused hole in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRecord {
    pub offset: i64,
    /// Payload capacity; the total hole is `HEADER_SIZE + capacity` bytes.
    pub capacity: i64,
}

/// A raw data cell backing file content or a folder's children list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRecord {
    pub offset: i64,
    pub filled: i64,
    pub capacity: i64,
}

impl RowRecord {
    /// Absolute offset of the first payload data byte.
    pub fn data_offset(&self) -> i64 {
        self.offset + HEADER_SIZE + ROW_PREFIX
    }
}

/// A file entry: name, linkage, timestamps and content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub offset: i64,
    pub name: String,
    pub parent: i64,
    pub content: i64,
    pub created: i64,
    pub modified: i64,
    pub md5: [u8; 16],
}

/// A folder entry: name, parent linkage and a pointer to its children row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRecord {
    pub offset: i64,
    pub name: String,
    pub parent: i64,
    pub children: i64,
}

impl FolderRecord {
    pub fn is_root(&self) -> bool {
        self.parent == NULL_PTR
    }
}

/// One typed unit of the container stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Free(FreeRecord),
    Row(RowRecord),
    File(FileRecord),
    Folder(FolderRecord),
}

impl Record {
    pub fn offset(&self) -> i64 {
        match self {
            Record::Free(r) => r.offset,
            Record::Row(r) => r.offset,
            Record::File(r) => r.offset,
            Record::Folder(r) => r.offset,
        }
    }

    pub fn data_size(&self) -> i64 {
        match self {
            Record::Free(r) => r.capacity,
            Record::Row(r) => ROW_PREFIX + r.capacity,
            Record::File(_) => FILE_PAYLOAD,
            Record::Folder(_) => FOLDER_PAYLOAD,
        }
    }

    /// Total on-disk footprint including the header.
    pub fn total_size(&self) -> i64 {
        HEADER_SIZE + self.data_size()
    }
}

fn read_exact_or_parse(input: &mut impl Read, buf: &mut [u8], what: &str) -> Result<()> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            CapsuleError::Parse(format!("short read while decoding {what}"))
        } else {
            CapsuleError::Io(e)
        }
    })
}

fn read_i64(input: &mut impl Read, what: &str) -> Result<i64> {
    let mut buf = [0u8; 8];
    read_exact_or_parse(input, &mut buf, what)?;
    Ok(i64::from_be_bytes(buf))
}

fn read_u32(input: &mut impl Read, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact_or_parse(input, &mut buf, what)?;
    Ok(u32::from_be_bytes(buf))
}

/// Encode a name into its fixed-width zero-padded form.
///
/// Rejects names longer than [`NAME_SIZE`] UTF-8 bytes instead of
/// truncating them, and names containing `/`, which could never be
/// reached by path navigation.
pub fn encode_name(name: &str) -> Result<[u8; NAME_SIZE]> {
    let bytes = name.as_bytes();
    if bytes.len() > NAME_SIZE {
        return Err(CapsuleError::Write(format!(
            "name exceeds {NAME_SIZE} bytes: {name}"
        )));
    }
    if name.contains('/') {
        return Err(CapsuleError::Write(format!("name contains '/': {name}")));
    }
    if bytes.contains(&0) {
        return Err(CapsuleError::Write(format!("name contains NUL: {name:?}")));
    }
    let mut out = [0u8; NAME_SIZE];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn decode_name(buf: &[u8]) -> Result<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec())
        .map_err(|e| CapsuleError::Parse(format!("record name is not UTF-8: {e}")))
}

/// Parse the record starting at `offset`, where the stream is already
/// positioned. Returns `None` on a clean end of stream and leaves the
/// stream positioned immediately after the parsed record.
pub fn parse_next<R: Read + Seek>(input: &mut R, offset: i64) -> Result<Option<Record>> {
    let mut tag = [0u8; 1];
    match input.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CapsuleError::Io(e)),
    }

    let data_size = read_i64(input, "record size")?;
    if data_size < 0 {
        return Err(CapsuleError::Parse(format!(
            "negative record size {data_size} at offset {offset}"
        )));
    }

    let record = match tag[0] {
        TYPE_FREE => {
            input
                .seek(SeekFrom::Current(data_size))
                .map_err(CapsuleError::Io)?;
            Record::Free(FreeRecord {
                offset,
                capacity: data_size,
            })
        }
        TYPE_ROW => {
            let filled = read_i64(input, "row filled")?;
            let capacity = read_i64(input, "row capacity")?;
            if data_size != ROW_PREFIX + capacity {
                return Err(CapsuleError::Parse(format!(
                    "row at {offset} declares size {data_size} but capacity {capacity}"
                )));
            }
            if filled < 0 || filled > capacity {
                return Err(CapsuleError::Parse(format!(
                    "row at {offset} has filled {filled} outside [0, {capacity}]"
                )));
            }
            input
                .seek(SeekFrom::Current(capacity))
                .map_err(CapsuleError::Io)?;
            Record::Row(RowRecord {
                offset,
                filled,
                capacity,
            })
        }
        TYPE_FILE => {
            if data_size != FILE_PAYLOAD {
                return Err(CapsuleError::Parse(format!(
                    "file record at {offset} has payload {data_size}, expected {FILE_PAYLOAD}"
                )));
            }
            let mut name_buf = [0u8; NAME_SIZE];
            read_exact_or_parse(input, &mut name_buf, "file name")?;
            let name = decode_name(&name_buf)?;
            let parent = read_i64(input, "file parent pointer")?;
            let content = read_i64(input, "file content pointer")?;
            let created = read_i64(input, "file creation timestamp")?;
            let modified = read_i64(input, "file modification timestamp")?;
            let md5_len = read_u32(input, "file digest length")?;
            if md5_len != 16 {
                return Err(CapsuleError::Parse(format!(
                    "file record at {offset} carries a {md5_len}-byte digest"
                )));
            }
            let mut md5 = [0u8; 16];
            read_exact_or_parse(input, &mut md5, "file digest")?;
            Record::File(FileRecord {
                offset,
                name,
                parent,
                content,
                created,
                modified,
                md5,
            })
        }
        TYPE_FOLDER => {
            if data_size != FOLDER_PAYLOAD {
                return Err(CapsuleError::Parse(format!(
                    "folder record at {offset} has payload {data_size}, expected {FOLDER_PAYLOAD}"
                )));
            }
            let mut name_buf = [0u8; NAME_SIZE];
            read_exact_or_parse(input, &mut name_buf, "folder name")?;
            let name = decode_name(&name_buf)?;
            let parent = read_i64(input, "folder parent pointer")?;
            let children = read_i64(input, "folder children pointer")?;
            Record::Folder(FolderRecord {
                offset,
                name,
                parent,
                children,
            })
        }
        other => {
            return Err(CapsuleError::Parse(format!(
                "unknown record type {other} at offset {offset}"
            )));
        }
    };

    Ok(Some(record))
}

/// Emit a record at the stream's current position.
///
/// For `ROW` records, `data` supplies up to `filled` payload bytes; the
/// remainder of the capacity is zero-padded. Other record types ignore
/// `data`. `FREE` emits the header only, leaving payload bytes untouched.
pub fn write_record<W: Write + Seek>(
    output: &mut W,
    record: &Record,
    data: Option<&[u8]>,
) -> Result<()> {
    match record {
        Record::Free(free) => {
            output.write_all(&[TYPE_FREE])?;
            output.write_all(&free.capacity.to_be_bytes())?;
        }
        Record::Row(row) => {
            output.write_all(&[TYPE_ROW])?;
            output.write_all(&(ROW_PREFIX + row.capacity).to_be_bytes())?;
            output.write_all(&row.filled.to_be_bytes())?;
            output.write_all(&row.capacity.to_be_bytes())?;
            let body = data.unwrap_or(&[]);
            let take = body.len().min(row.filled.max(0) as usize);
            output.write_all(&body[..take])?;
            let padding = row.capacity as usize - take;
            if padding > 0 {
                write_zeros(output, padding)?;
            }
        }
        Record::File(file) => {
            output.write_all(&[TYPE_FILE])?;
            output.write_all(&FILE_PAYLOAD.to_be_bytes())?;
            output.write_all(&encode_name(&file.name)?)?;
            output.write_all(&file.parent.to_be_bytes())?;
            output.write_all(&file.content.to_be_bytes())?;
            output.write_all(&file.created.to_be_bytes())?;
            output.write_all(&file.modified.to_be_bytes())?;
            output.write_all(&(file.md5.len() as u32).to_be_bytes())?;
            output.write_all(&file.md5)?;
        }
        Record::Folder(folder) => {
            output.write_all(&[TYPE_FOLDER])?;
            output.write_all(&FOLDER_PAYLOAD.to_be_bytes())?;
            output.write_all(&encode_name(&folder.name)?)?;
            output.write_all(&folder.parent.to_be_bytes())?;
            output.write_all(&folder.children.to_be_bytes())?;
        }
    }
    Ok(())
}

fn write_zeros<W: Write>(output: &mut W, mut count: usize) -> Result<()> {
    let zeros = [0u8; 4096];
    while count > 0 {
        let chunk = count.min(zeros.len());
        output.write_all(&zeros[..chunk])?;
        count -= chunk;
    }
    Ok(())
}
