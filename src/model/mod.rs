mod job;
mod ledger_entry;
mod target;

pub use job::{Job, JobStatus};
pub use ledger_entry::LedgerEntry;
pub use target::{BackupTarget, TargetKind, TargetKindColumn};
