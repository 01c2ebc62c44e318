use std::path::Path;

use crate::entry::DecisionEntry;
use crate::writer::DecisionWriteError;

/// Load every entry recorded at `path`, oldest first.
///
/// Blank lines are skipped. A line that does not parse fails the whole read
/// so a truncated or foreign file is never mistaken for a short history.
pub async fn read_entries(path: impl AsRef<Path>) -> Result<Vec<DecisionEntry>, DecisionWriteError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(DecisionWriteError::Read)?;

    let mut entries = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        entries.push(serde_json::from_str(line)?);
    }
    Ok(entries)
}
