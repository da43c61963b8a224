use std::env;
use std::path::PathBuf;

pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 200;
pub const DEFAULT_BATCH_MESSAGES: usize = 200;
pub const DEFAULT_BATCH_BYTES: u64 = 32 * 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: u64 = 128 * 1024 * 1024;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Process-level defaults for import runs.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub checkpoint_interval: usize,
    pub batch_messages: usize,
    pub batch_bytes: u64,
    pub max_message_bytes: u64,
    pub attachments_dir: PathBuf,
    pub unescape_from: bool,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            checkpoint_interval: env_usize(
                "ARCHIVE_IMPORT_CHECKPOINT_INTERVAL",
                DEFAULT_CHECKPOINT_INTERVAL,
            ),
            batch_messages: env_usize("ARCHIVE_IMPORT_BATCH_MESSAGES", DEFAULT_BATCH_MESSAGES),
            batch_bytes: env_u64("ARCHIVE_IMPORT_BATCH_BYTES", DEFAULT_BATCH_BYTES),
            max_message_bytes: env_u64(
                "ARCHIVE_IMPORT_MAX_MESSAGE_BYTES",
                DEFAULT_MAX_MESSAGE_BYTES,
            ),
            attachments_dir: PathBuf::from(env_string(
                "ARCHIVE_IMPORT_ATTACHMENTS_DIR",
                "./attachments",
            )),
            unescape_from: env_bool("ARCHIVE_IMPORT_UNESCAPE_FROM", true),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
