pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{JobConfig, StorageConfig, StorageType, SyncConfig};
pub use crate::core::engine::sync_folder;
pub use crate::core::{SyncDirection, SyncEngine, SyncReport};
pub use error::{StorageError, SyncError};
pub use storage::{Endpoint, FileEntry, Fingerprint, Storage};
