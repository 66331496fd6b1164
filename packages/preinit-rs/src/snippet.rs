//! Snippet normalization: calls queued by a bootstrap stub before this
//! process took over.
//!
//! A snippet is a JSON array of tuples, `[operationName, ...args]`:
//!
//! ```json
//! [["track", "foo", {"bar": 123}], ["page"], ["on", "ready"]]
//! ```
//!
//! Each well-formed tuple becomes a detached [`CallRecord`]. Nothing here
//! fails: a missing or malformed snippet yields no records, and a malformed
//! entry is skipped with a warning.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::PreInitConfig;
use crate::operation::Operation;
use crate::record::CallRecord;

static IMPORTED: AtomicBool = AtomicBool::new(false);

/// A well-known place a bootstrap stub leaves its snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnippetSource {
    /// An environment variable holding the JSON array.
    Env(String),
    /// A file holding the JSON array.
    File(PathBuf),
}

impl SnippetSource {
    /// The raw snippet text, or `None` if nothing is there.
    pub fn read(&self) -> Option<String> {
        match self {
            Self::Env(var) => env::var(var).ok(),
            Self::File(path) => match fs::read_to_string(path) {
                Ok(text) => Some(text),
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "no snippet file");
                    None
                }
            },
        }
    }
}

/// Turn a raw snippet value into call records, in order.
pub fn normalize_snippet(raw: &Value) -> Vec<CallRecord> {
    let Some(entries) = raw.as_array() else {
        debug!("snippet is not an array, ignoring");
        return Vec::new();
    };

    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| match normalize_entry(entry) {
            Ok(record) => Some(record),
            Err(reason) => {
                warn!(index, %entry, reason, "skipping malformed snippet entry");
                None
            }
        })
        .collect()
}

fn normalize_entry(entry: &Value) -> Result<CallRecord, &'static str> {
    let tuple = entry.as_array().ok_or("entry is not an array")?;
    let (name, args) = tuple.split_first().ok_or("entry is empty")?;
    let name = name.as_str().ok_or("operation name is not a string")?;
    let operation: Operation = name.parse().map_err(|_| "unknown operation")?;
    Ok(CallRecord::detached(operation, args.to_vec()))
}

/// Parse and normalize snippet text. Invalid JSON yields no records.
pub fn parse_snippet(text: &str) -> Vec<CallRecord> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(text) {
        Ok(raw) => normalize_snippet(&raw),
        Err(err) => {
            warn!(error = %err, "snippet is not valid JSON, ignoring");
            Vec::new()
        }
    }
}

/// Read the first source that holds a snippet and normalize it.
///
/// A source that exists but is blank counts as holding nothing.
pub fn read_snippet(sources: &[SnippetSource]) -> Vec<CallRecord> {
    for source in sources {
        if let Some(text) = source.read().filter(|text| !text.trim().is_empty()) {
            let records = parse_snippet(&text);
            debug!(?source, count = records.len(), "read snippet");
            return records;
        }
    }
    Vec::new()
}

/// Import the snippet named by `config`, once per process.
///
/// Later calls return nothing: the snippet describes calls made before this
/// process started, so replaying it twice would duplicate them.
pub fn import_snippet(config: &PreInitConfig) -> Vec<CallRecord> {
    if IMPORTED.swap(true, Ordering::AcqRel) {
        debug!("snippet already imported");
        return Vec::new();
    }
    read_snippet(&config.snippet_sources())
}
