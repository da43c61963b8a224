//! Resume cursors persisted on the sync run.
//!
//! Cursors are stored as JSON in the run's `cursor` column. Each names the
//! source it belongs to so that a resumed run can refuse a different file or
//! directory.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Position inside one mbox file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MboxCursor {
    /// Resolved path of the file.
    pub file: String,
    /// Offset of the next separator still to be read.
    pub offset: u64,
    /// Number of messages read before `offset`.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq: u64,
}

/// Position inside an Apple Mail tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmlxCursor {
    pub root_dir: String,
    pub mailbox_index: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mailbox_path: String,
    /// Last file handled in the mailbox at `mailbox_index`; empty for none.
    #[serde(default)]
    pub last_file: String,
}

pub fn encode<C: Serialize>(cursor: &C) -> Result<String, serde_json::Error> {
    serde_json::to_string(cursor)
}

/// Decode a stored cursor; `None` when it is not a cursor of this kind.
pub fn decode<C: DeserializeOwned>(raw: &str) -> Option<C> {
    match serde_json::from_str(raw) {
        Ok(cursor) => Some(cursor),
        Err(err) => {
            log::warn!("ignoring malformed checkpoint {:?}: {}", raw, err);
            None
        }
    }
}
