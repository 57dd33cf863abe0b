//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function returning the job status.

pub mod convert;
pub mod fetch;
pub mod index;
pub mod query;
pub mod run;
