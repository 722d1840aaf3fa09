//! BFD Common Library
//!
//! Shared building blocks for the BFD ingestion pipeline.
//!
//! - **Error Handling**: [`BfdError`] and the crate-wide [`Result`] alias
//! - **Checksums**: MD5 digests used to validate downloaded extracts
//! - **Logging**: `tracing` subscriber setup driven by `BFD_LOG_*` variables
//! - **Hashing**: PBKDF2 identifier pseudonymisation with a bounded cache
//!
//! # Example
//!
//! ```no_run
//! use bfd_common::hashing::{CachedIdHasher, IdHasher};
//!
//! fn main() -> bfd_common::Result<()> {
//!     let hasher = CachedIdHasher::new(IdHasher::new(b"pepper".to_vec(), 1000)?, 10_000);
//!     let digest = hasher.hash("1S00E00AA00")?;
//!     assert_eq!(digest.len(), 64);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod hashing;
pub mod logging;

// Re-export commonly used types
pub use error::{BfdError, Result};
