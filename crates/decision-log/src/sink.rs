use std::path::Path;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::DecisionEntry;
use crate::writer::{DecisionWriteError, DecisionWriter};

/// Channel buffer size used between producers and the background writer task.
const CHANNEL_BUFFER: usize = 1024;

/// Flush the writer at most every this many seconds when the channel is idle.
const FLUSH_INTERVAL_SECS: u64 = 1;

/// A cloneable handle used to submit [`DecisionEntry`] values into the
/// background writer.
#[derive(Clone)]
pub struct DecisionSink {
    tx: mpsc::Sender<DecisionEntry>,
}

impl DecisionSink {
    /// Spawn the background writer task and return a `(sink, join_handle)` pair.
    ///
    /// The task writes each entry as a JSON line, flushes after about a
    /// second without new entries, and flushes once more before exiting when
    /// the last `DecisionSink` clone is dropped. I/O errors are logged via
    /// `tracing::error` and the entry is skipped.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), DecisionWriteError> {
        let (tx, rx) = mpsc::channel::<DecisionEntry>(CHANNEL_BUFFER);

        let mut writer = DecisionWriter::new(path).await?;

        let handle = tokio::spawn(async move {
            run_writer_loop(&mut writer, rx).await;
        });

        Ok((Self { tx }, handle))
    }

    /// Send an entry to the background writer, waiting while the channel is
    /// full. If the writer task has exited the entry is dropped with a
    /// warning.
    pub async fn log(&self, entry: DecisionEntry) {
        if let Err(err) = self.tx.send(entry).await {
            tracing::warn!(
                event_type = ?err.0.event_type,
                scope = %err.0.scope,
                "decision sink channel closed, entry dropped"
            );
        }
    }
}

/// Record entries until every sink is dropped. A write failure skips that
/// one decision; the entries already written stay queued for the next flush.
async fn run_writer_loop(writer: &mut DecisionWriter, mut rx: mpsc::Receiver<DecisionEntry>) {
    let flush_interval = tokio::time::Duration::from_secs(FLUSH_INTERVAL_SECS);
    let mut pending = 0usize;

    loop {
        match tokio::time::timeout(flush_interval, rx.recv()).await {
            Ok(Some(entry)) => match writer.write(&entry).await {
                Ok(()) => pending += 1,
                Err(err) => tracing::error!(
                    %err,
                    id = %entry.id,
                    event_type = ?entry.event_type,
                    scope = %entry.scope,
                    method = ?entry.candidate.as_ref().map(|c| c.method_kind().as_str()),
                    "failed to record decision, entry skipped"
                ),
            },
            Ok(None) => {
                flush_pending(writer, &mut pending, "shutdown").await;
                tracing::debug!("decision writer task shutting down");
                return;
            }
            Err(_) => flush_pending(writer, &mut pending, "idle").await,
        }
    }
}

async fn flush_pending(writer: &mut DecisionWriter, pending: &mut usize, reason: &'static str) {
    if *pending == 0 {
        return;
    }
    match writer.flush().await {
        Ok(()) => {
            tracing::trace!(entries = *pending, reason, "flushed decision log");
            *pending = 0;
        }
        Err(err) => {
            tracing::error!(%err, entries = *pending, reason, "failed to flush decision log")
        }
    }
}
