//! AVC Core Library
//!
//! Append-only versioning for large binary files:
//! - Object model (Commit, CommitChange, StagedChange)
//! - Global and local store traits with SQLite and in-memory backends
//! - Staging tracker and commit builder with blob packing
//! - Apply/checkout engine with resumable I/O
//! - Virtual add operations and the concatenated byte-range stream

pub mod error;
pub mod object;
pub mod store;
pub mod sqlite_store;
pub mod memory_store;
pub mod layout;
pub mod operation;
pub mod byte_range;
pub mod repository;
pub mod staging;
pub mod commit_builder;
pub mod apply;
pub mod verify;

pub use error::{AvcError, Result};
pub use object::{ChangeType, Commit, CommitChange, CommitId, StagedChange};
pub use store::{GlobalStore, LocalStore, HEAD_REF, MAIN_REF};
pub use sqlite_store::{SqliteGlobalStore, SqliteLocalStore};
pub use memory_store::{MemoryGlobalStore, MemoryLocalStore};
pub use layout::{discover_toplevel, AvcConfig, Layout};
pub use operation::{check_unique_destinations, load_plan, save_plan, ReadSource, VirtualAddOperation};
pub use byte_range::{ByteRange, ByteRangeStream, StreamCursor};
pub use repository::{Avc, Status};
pub use staging::StageOutcome;
pub use commit_builder::{CommitBuilder, CommitPlan, MAX_BLOB_SIZE};
pub use apply::{ApplyReport, IoStep, StepOutcome};
pub use verify::{FileState, VerifyEntry, VerifyReport};
