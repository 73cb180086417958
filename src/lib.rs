//! Guarded execution of `dotnet` CLI operations.
//!
//! SDK commands run as child processes with bounded output capture.
//! Conflicting operations on one project are refused up front, and
//! long-running commands are tracked as stoppable sessions. Failures come
//! back as classified errors with secrets redacted.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod error_codes;
pub mod error_taxonomy;
pub mod guard;
pub mod logging;
pub mod process;
pub mod redact;
pub mod serve;
pub mod service;
pub mod sessions;
