//! Handoff verification: a path only counts as an input once it is a
//! readable, non-empty regular file.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    Missing,
    Empty,
    NotAFile,
    Unreadable(String),
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("missing"),
            Self::Empty => f.write_str("empty"),
            Self::NotAFile => f.write_str("not a regular file"),
            Self::Unreadable(reason) => write!(f, "unreadable ({})", reason),
        }
    }
}

/// Check one output. Returns its size in bytes.
pub async fn verify_output(path: &Path) -> Result<u64, VerifyFailure> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(VerifyFailure::Missing),
        Err(e) => return Err(VerifyFailure::Unreadable(e.to_string())),
    };
    if !meta.is_file() {
        return Err(VerifyFailure::NotAFile);
    }
    if meta.len() == 0 {
        return Err(VerifyFailure::Empty);
    }
    Ok(meta.len())
}

/// Check several paths, reporting the first failure.
pub async fn verify_inputs(paths: &[PathBuf]) -> Result<(), (PathBuf, VerifyFailure)> {
    for path in paths {
        verify_output(path).await.map_err(|reason| (path.clone(), reason))?;
    }
    Ok(())
}
