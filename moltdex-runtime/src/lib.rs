//! moltdex runtime
//!
//! Configuration, the on-disk snapshot store and the indexing pipeline
//! that ties the fetcher, sanitizer and builder together.

pub mod config;
pub mod pipeline;
pub mod store;

pub use config::*;
pub use pipeline::*;
pub use store::*;
