use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Outcome of one import invocation. Counters cover this invocation only;
/// the sync run carries the cumulative totals across resumes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub was_resumed: bool,
    /// Stored cursor the run resumed from.
    pub resumed_from: Option<String>,
    /// Completion cursor recorded on the run, when it completed.
    pub final_cursor: Option<String>,
    pub bytes_processed: u64,
    pub processed: u64,
    pub added: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    /// A message commit failed; the run was marked failed.
    pub hard_errors: bool,
    /// Cancelled before the source was drained; the run is still running.
    pub interrupted: bool,
    pub duration: Duration,
    pub mailboxes_total: usize,
    pub mailboxes_imported: usize,
}

impl ImportSummary {
    pub fn failed(&self) -> bool {
        self.hard_errors
    }
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {} (added {}, updated {}, skipped {}), {} errors in {:.1}s",
            self.processed,
            self.added,
            self.updated,
            self.skipped,
            self.errors,
            self.duration.as_secs_f64()
        )?;
        if self.mailboxes_total > 0 {
            write!(
                f,
                ", mailboxes {}/{}",
                self.mailboxes_imported, self.mailboxes_total
            )?;
        }
        if self.was_resumed {
            write!(f, " [resumed]")?;
        }
        if self.interrupted {
            write!(f, " [interrupted]")?;
        } else if self.hard_errors {
            write!(f, " [failed]")?;
        }
        Ok(())
    }
}
