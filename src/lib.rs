// AnchorDB - transaction durability core
//
// This crate implements the two-phase commit machinery of the AnchorDB
// storage engine: the shared registry of prepared global transactions,
// the on-WAL prepare-state format, the commit/rollback-prepared pipelines,
// and the crash-recovery path that rebuilds prepared state from the log.
//
// Collaborating subsystems (WAL, commit log, process array, storage
// manager) live in their own modules and are consumed by the two-phase
// core strictly through their public APIs.

pub mod clog;
pub mod common;
pub mod error;
pub mod faults;
pub mod procarray;
pub mod smgr;
pub mod twophase;
pub mod wal;

pub use error::{DbError, Result};
