//! moltdex core - domain model and pure index logic
//!
//! This crate provides the building blocks that never touch the network
//! or the filesystem:
//! - Posts, agents, snapshots and fetch watermarks
//! - Credential redaction applied to every text field
//! - The snapshot builder (merge, dedup, author resolution)
//! - Ranked keyword search over a loaded snapshot

pub mod model;
pub mod sanitize;
pub mod builder;
pub mod search;

pub use model::*;
pub use sanitize::*;
pub use builder::*;
pub use search::*;

/// Version written into every snapshot document
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Default number of search results shown by front ends
pub const DEFAULT_RESULT_LIMIT: usize = 20;
