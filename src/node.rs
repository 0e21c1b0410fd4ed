//! Paths, transient nodes and lazy loaders.
//!
//! The tree is represented by offsets plus loaders that re-read the
//! container on demand; nodes never hold a strong cross-reference graph
//! in memory.

use crate::error::Result;
use crate::store::RecordStore;
use parking_lot::Mutex;
use std::fmt;

/// A path inside the container: ordered name components, an absolute
/// marker (leading `/`) and a folder marker (trailing `/`).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CapsulePath {
    components: Vec<String>,
    absolute: bool,
    folder: bool,
}

impl CapsulePath {
    /// The absolute root folder path, `/`.
    pub fn root() -> Self {
        CapsulePath {
            components: Vec::new(),
            absolute: true,
            folder: true,
        }
    }

    /// Parse a path string. `.` components are dropped.
    pub fn parse(s: &str) -> Self {
        let absolute = s.starts_with('/');
        let components: Vec<String> = s
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .map(str::to_string)
            .collect();
        let folder = s.ends_with('/') || components.is_empty();
        CapsulePath {
            components,
            absolute,
            folder,
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn is_folder(&self) -> bool {
        self.folder
    }

    pub fn is_root(&self) -> bool {
        self.absolute && self.components.is_empty()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// The last component, or `.` for an empty path.
    pub fn name(&self) -> &str {
        self.components.last().map(String::as_str).unwrap_or(".")
    }

    pub fn add_file(&self, name: &str) -> Self {
        let mut components = self.components.clone();
        components.push(name.to_string());
        CapsulePath {
            components,
            absolute: self.absolute,
            folder: false,
        }
    }

    pub fn add_folder(&self, name: &str) -> Self {
        let mut components = self.components.clone();
        components.push(name.to_string());
        CapsulePath {
            components,
            absolute: self.absolute,
            folder: true,
        }
    }

    /// The same components, marked folder-valued.
    pub fn as_folder(&self) -> Self {
        let mut path = self.clone();
        path.folder = true;
        path
    }

    /// Drop the last component; the result is folder-valued.
    pub fn remove_last(&self) -> Self {
        let mut components = self.components.clone();
        components.pop();
        CapsulePath {
            components,
            absolute: self.absolute,
            folder: true,
        }
    }

    /// Resolve `other` against this folder path. Absolute paths are
    /// returned unchanged.
    pub fn join(&self, other: &CapsulePath) -> Self {
        if other.absolute {
            return other.clone();
        }
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        CapsulePath {
            components,
            absolute: self.absolute,
            folder: other.folder,
        }
    }

    /// True when `self` equals `other` or lies underneath it.
    pub fn starts_with(&self, other: &CapsulePath) -> bool {
        self.absolute == other.absolute
            && self.components.len() >= other.components.len()
            && self.components[..other.components.len()] == other.components[..]
    }
}

impl fmt::Display for CapsulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "{}", if self.absolute { "/" } else { "./" });
        }
        if self.absolute {
            write!(f, "/")?;
        }
        write!(f, "{}", self.components.join("/"))?;
        if self.folder {
            write!(f, "/")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CapsulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapsulePath({self})")
    }
}

/// A transient view of a file entry.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub name: String,
    pub created: i64,
    pub modified: i64,
    pub md5: [u8; 16],
    pub offset: i64,
    pub parent: Option<FolderLoader>,
}

/// A transient view of a folder entry with loaders for its children.
#[derive(Debug, Clone)]
pub struct FolderNode {
    pub name: String,
    pub offset: i64,
    pub path: CapsulePath,
    pub parent: Option<FolderLoader>,
    pub files: Vec<FileLoader>,
    pub folders: Vec<FolderLoader>,
}

impl FolderNode {
    pub fn file(&self, name: &str) -> Option<&FileLoader> {
        self.files.iter().find(|f| f.name() == name)
    }

    pub fn folder(&self, name: &str) -> Option<&FolderLoader> {
        self.folders.iter().find(|f| f.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.folders.is_empty()
    }
}

/// Lazy handle to a file entry: path and name are available without
/// touching the container; `load` re-reads the backing records.
#[derive(Clone)]
pub struct FileLoader {
    store: RecordStore,
    offset: i64,
    path: CapsulePath,
}

impl FileLoader {
    pub(crate) fn new(store: RecordStore, offset: i64, path: CapsulePath) -> Self {
        FileLoader {
            store,
            offset,
            path,
        }
    }

    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub fn path(&self) -> &CapsulePath {
        &self.path
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn load(&self) -> Result<FileNode> {
        self.store.load_file_node(self.offset, &self.path)
    }
}

impl fmt::Debug for FileLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileLoader({} @ {})", self.path, self.offset)
    }
}

/// Lazy handle to a folder entry.
#[derive(Clone)]
pub struct FolderLoader {
    store: RecordStore,
    offset: i64,
    path: CapsulePath,
}

impl FolderLoader {
    pub(crate) fn new(store: RecordStore, offset: i64, path: CapsulePath) -> Self {
        FolderLoader {
            store,
            offset,
            path,
        }
    }

    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub fn path(&self) -> &CapsulePath {
        &self.path
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn load(&self) -> Result<FolderNode> {
        self.store.load_folder_node(self.offset, &self.path)
    }
}

impl fmt::Debug for FolderLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderLoader({} @ {})", self.path, self.offset)
    }
}

/// Wraps a [`FolderLoader`] and memoises a single `load` until closed.
pub struct CachedFolderLoader {
    inner: FolderLoader,
    cached: Mutex<Option<FolderNode>>,
}

impl CachedFolderLoader {
    pub fn new(inner: FolderLoader) -> Self {
        CachedFolderLoader {
            inner,
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &CapsulePath {
        self.inner.path()
    }

    pub fn loader(&self) -> &FolderLoader {
        &self.inner
    }

    pub fn load(&self) -> Result<FolderNode> {
        let mut cached = self.cached.lock();
        if let Some(node) = cached.as_ref() {
            return Ok(node.clone());
        }
        let node = self.inner.load()?;
        *cached = Some(node.clone());
        Ok(node)
    }

    /// Drop the memoised node; the next `load` re-reads the container.
    pub fn close(&self) {
        *self.cached.lock() = None;
    }
}

impl Clone for CachedFolderLoader {
    fn clone(&self) -> Self {
        CachedFolderLoader::new(self.inner.clone())
    }
}

impl fmt::Debug for CachedFolderLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CachedFolderLoader({:?})", self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!(CapsulePath::parse("/").to_string(), "/");
        assert_eq!(CapsulePath::parse("/a/b").to_string(), "/a/b");
        assert_eq!(CapsulePath::parse("/a/b/").to_string(), "/a/b/");
        assert_eq!(CapsulePath::parse("a/b/").to_string(), "a/b/");
        assert_eq!(CapsulePath::parse("./").to_string(), "./");
        assert_eq!(CapsulePath::parse("./a").to_string(), "a");
    }

    #[test]
    fn test_markers() {
        assert!(CapsulePath::parse("/a/").is_folder());
        assert!(!CapsulePath::parse("/a").is_folder());
        assert!(CapsulePath::parse("/a").is_absolute());
        assert!(!CapsulePath::parse("a").is_absolute());
        assert!(CapsulePath::root().is_root());
        assert!(!CapsulePath::parse("/a/").is_root());
    }

    #[test]
    fn test_name_of_empty_path_is_dot() {
        assert_eq!(CapsulePath::root().name(), ".");
        assert_eq!(CapsulePath::parse("/a/b").name(), "b");
    }

    #[test]
    fn test_add_and_remove() {
        let root = CapsulePath::root();
        let file = root.add_folder("docs").add_file("a.txt");
        assert_eq!(file.to_string(), "/docs/a.txt");
        assert_eq!(file.remove_last().to_string(), "/docs/");
        assert_eq!(file.remove_last().remove_last().to_string(), "/");
    }

    #[test]
    fn test_join_relative_and_absolute() {
        let base = CapsulePath::parse("/folder/");
        assert_eq!(base.join(&CapsulePath::parse("sub/")).to_string(), "/folder/sub/");
        assert_eq!(base.join(&CapsulePath::parse("a.txt")).to_string(), "/folder/a.txt");
        assert_eq!(base.join(&CapsulePath::parse("/other/")).to_string(), "/other/");
    }

    #[test]
    fn test_starts_with() {
        let a = CapsulePath::parse("/a/b/");
        assert!(CapsulePath::parse("/a/b/c").starts_with(&a));
        assert!(CapsulePath::parse("/a/b/").starts_with(&a));
        assert!(!CapsulePath::parse("/a/x/c").starts_with(&a));
        assert!(!CapsulePath::parse("/a/").starts_with(&a));
    }
}
