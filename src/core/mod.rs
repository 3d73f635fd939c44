pub mod bundle;
pub mod checksum;
pub mod comparator;
pub mod engine;
pub mod prompt;
pub mod reconcile;
pub mod report;
pub mod staging;
pub mod target;
pub mod transfer;
pub mod walker;

pub use bundle::{Bundle, BundleEntry};
pub use checksum::{ChecksumAlgorithm, FileHasher, LocalHasher};
pub use comparator::{Action, DecisionEngine, DirAction, SkipReason};
pub use engine::{BputEngine, SyncReport};
pub use prompt::{NonInteractivePrompter, Prompter, ScriptedPrompter, TerminalPrompter};
pub use reconcile::Reconciler;
pub use report::{
    JsonLinesReport, MemoryReport, NullReport, ReportSink, TransferMethod, TransferReportRecord,
};
pub use staging::{StagingDirectory, StagingResolver};
pub use target::{TargetMapper, TouchedPaths};
pub use transfer::{BundleTransferManager, TransferSummary};
pub use walker::{SourceEntry, TreeWalker, WalkStats};
