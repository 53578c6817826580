pub mod comparator;
pub mod engine;
pub mod ignore;
pub mod scanner;
pub mod transfer;

pub use comparator::{CompareConfig, FallbackPolicy, FileComparator, FileRelation, SyncPlan};
pub use engine::{
    FailedItem, Side, SyncAction, SyncDirection, SyncEngine, SyncPhase, SyncProgress, SyncReport,
};
pub use ignore::{IgnoreFilter, IgnoreRules};
pub use scanner::{Catalog, FileScanner};
pub use transfer::{
    PartAccumulator, RetryState, TransferExecutor, TransferOptions, TransferResult,
    TransferStatus, Verification,
};
