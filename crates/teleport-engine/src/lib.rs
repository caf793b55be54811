//! Resumable export and import engines for Teleport
//!
//! Both engines run as a series of short, budgeted calls. A job's record in
//! the [`JobStore`](teleport_core::JobStore) is the only state carried
//! between calls, so a job survives process restarts and may be advanced
//! by any caller holding the id.
//!
//! - [`ExportEngine`]: enumerate files, chunk them, dump tables as SQL,
//!   write the manifest and assemble the zip package
//! - [`ImportEngine`]: verify, stage, check the environment, restore the
//!   database, swap files into place, with rollback from snapshots

#![forbid(unsafe_code)]

pub mod budget;
pub mod chunker;
pub mod dump;
pub mod enumerate;
pub mod error;
pub mod export;
pub mod import;
pub mod job;
pub mod sql;
pub mod status;
pub mod store;

pub use budget::Budget;
pub use error::{EngineError, EngineResult};
pub use export::{ExportEngine, ExportJob, ExportPhase};
pub use import::{ImportEngine, ImportJob, PROGRESS_TABLE, Phase};
pub use job::{JobError, JobStatus, Timestamps};
pub use status::{JobReport, JobStatusView, ProgressCounts};
pub use store::{FileJobStore, prune_history};
