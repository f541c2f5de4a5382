//! moltdex fetch layer
//!
//! Reads the Moltbook public API:
//! - HTTP client with bounded retry, backoff and rate-limit handling
//! - Lenient decoding of post listings into raw records
//! - Incremental, watermark-bounded pagination of the post feeds

pub mod client;
pub mod records;
pub mod fetcher;

pub use client::*;
pub use records::*;
pub use fetcher::*;
