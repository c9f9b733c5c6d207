//! Frame artifacts
//!
//! The execution side writes sequentially named image files into a shared
//! directory. Lexical file name order is capture order, so names are
//! expected to carry a zero-padded frame index.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur while enumerating or reading frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Failed to list frames in {}: {source}", .dir.display())]
    List {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read frame {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;

/// A single rendered image file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameArtifact {
    /// File name, used for ordering
    pub name: String,
    /// Full path to the file
    pub path: PathBuf,
}

impl FrameArtifact {
    /// Read the raw image bytes
    pub async fn read(&self) -> FrameResult<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| FrameError::Read {
                path: self.path.clone(),
                source,
            })
    }
}

/// List the frame artifacts currently in `dir`, in ascending file name order
///
/// Only regular files are considered; dot files (editor swap files, partial
/// writes) are skipped.
pub async fn list_frames(dir: &Path) -> FrameResult<Vec<FrameArtifact>> {
    let list_err = |source| FrameError::List {
        dir: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(list_err)?;
    let mut frames = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
        let file_type = entry.file_type().await.map_err(list_err)?;
        if !file_type.is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        frames.push(FrameArtifact {
            name,
            path: entry.path(),
        });
    }

    frames.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(frames)
}
