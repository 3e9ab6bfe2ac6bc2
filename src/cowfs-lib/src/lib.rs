mod digest;
mod marker;

pub use digest::*;
pub use marker::*;

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CowFsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    #[error("no such inode: {0}")]
    StaleInode(u64),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl CowFsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CowFsError::NotFound(_))
    }
}

impl From<std::io::Error> for CowFsError {
    fn from(err: std::io::Error) -> Self {
        CowFsError::IoError(err.to_string())
    }
}

pub type CowFsResult<T> = std::result::Result<T, CowFsError>;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Join a child name onto a parent path from the inode tree. The root is "/",
/// every other path has no trailing slash.
pub fn join_child_path(parent_path: &str, name: &str) -> String {
    if parent_path == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent_path, name)
    }
}

/// Normalize a user-supplied file path: leading slash required, trailing
/// slash stripped (except for the root itself).
pub fn normalize_path(path: &str) -> String {
    let mut out = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}
