//! optmirror common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the optmirror workspace members:
//!
//! - **Error Handling**: the shared [`CommonError`] type
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Units**: human-readable sizes and the size tolerance used to verify downloads
//!
//! # Example
//!
//! ```no_run
//! use optmirror_common::units::{parse_size, SizeTolerance};
//!
//! fn check(listing_size: &str, on_disk: u64) -> optmirror_common::Result<bool> {
//!     let declared = parse_size(listing_size)?;
//!     Ok(SizeTolerance::default().matches(declared, on_disk))
//! }
//! ```

pub mod error;
pub mod logging;
pub mod units;

// Re-export commonly used types
pub use error::{CommonError, Result};
