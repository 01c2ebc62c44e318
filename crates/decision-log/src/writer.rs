use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::entry::DecisionEntry;

/// Errors that can occur during decision log I/O.
#[derive(Debug, thiserror::Error)]
pub enum DecisionWriteError {
    #[error("failed to create parent directories: {0}")]
    CreateDir(std::io::Error),

    #[error("failed to open decision log: {0}")]
    OpenFile(std::io::Error),

    #[error("failed to serialize decision entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write to decision log: {0}")]
    Write(std::io::Error),

    #[error("failed to flush decision log: {0}")]
    Flush(std::io::Error),

    #[error("failed to read decision log: {0}")]
    Read(std::io::Error),
}

/// Append-only writer producing one JSON object per line.
pub struct DecisionWriter {
    file: tokio::fs::File,
}

impl DecisionWriter {
    /// Open (or create) the log at `path` in append mode, creating parent
    /// directories as needed.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, DecisionWriteError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(DecisionWriteError::CreateDir)?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(DecisionWriteError::OpenFile)?;

        Ok(Self { file })
    }

    pub async fn write(&mut self, entry: &DecisionEntry) -> Result<(), DecisionWriteError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .await
            .map_err(DecisionWriteError::Write)
    }

    pub async fn flush(&mut self) -> Result<(), DecisionWriteError> {
        self.file.flush().await.map_err(DecisionWriteError::Flush)
    }
}
