use thiserror::Error;

/// Errors surfaced by container and filesystem operations.
#[derive(Error, Debug)]
pub enum CapsuleError {
    #[error("directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("directory already exists: {0}")]
    DirectoryAlreadyExists(String),

    #[error("file already exists: {0}")]
    FileAlreadyExists(String),

    #[error("path component is not a folder: {0}")]
    NotAFolder(String),

    #[error("container parse error: {0}")]
    Parse(String),

    #[error("container write error: {0}")]
    Write(String),

    #[error("read capture unavailable")]
    ReadCapture,

    #[error("write capture unavailable")]
    WriteCapture,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("import failed: {0}")]
    Import(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl CapsuleError {
    /// True for both `DirectoryNotFound` and `FileNotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CapsuleError::DirectoryNotFound(_) | CapsuleError::FileNotFound(_)
        )
    }

    /// True for both `DirectoryAlreadyExists` and `FileAlreadyExists`.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            CapsuleError::DirectoryAlreadyExists(_) | CapsuleError::FileAlreadyExists(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CapsuleError>;
