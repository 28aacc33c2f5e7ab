//! Persistent artifact cache
//!
//! - [`format`]: the record layout
//! - [`store`]: per-unit locked cache files

pub mod format;
pub mod store;

pub use format::{instruction_hash, scan_records, RecordHeader, RecordInfo, CACHE_SUFFIX};
pub use store::{cache_path, source_timestamp, ArtifactCache, CacheError};
