//! Append-only JSON-lines log of rule decisions.
//!
//! Every resolved request, detected shadow, applied change and configuration
//! refresh can be recorded as one newline-terminated JSON object. Records
//! carry the full decision so they can be reloaded with [`read_entries`] and
//! reviewed or applied out of process.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use decision_log::{DecisionEntry, DecisionSink};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = DecisionSink::start("/var/log/rulewright/decisions.jsonl").await?;
//! sink.log(DecisionEntry::shadowed("shared", "allow-web")).await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod reader;
pub mod sink;
pub mod writer;

pub use entry::{DecisionEntry, DecisionEventType};
pub use reader::read_entries;
pub use sink::DecisionSink;
pub use writer::{DecisionWriteError, DecisionWriter};
