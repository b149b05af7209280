//! Archival of a single claimed job.
//!
//! - [`Archiver`]: the stage pipeline, from scratch directory to archived record
//! - [`export`]: resumable, duplicate-free export of paginated result streams
//! - [`Heartbeater`]: keeps the claim fresh while the pipeline runs
//! - [`ScratchDir`]: per-job local staging area
//!
//! # Restarts
//!
//! The scratch directory is recreated and every export truncates its target
//! file, so running the pipeline again for a job whose previous attempt
//! crashed produces the same uploads as a single clean run.

pub mod export;
pub mod heartbeat;
pub mod pipeline;
pub mod scratch;

pub use export::{export_stream, ExportCursor, ExportSummary};
pub use heartbeat::Heartbeater;
pub use pipeline::{ArchiveReport, Archiver, ArchiverSettings, Stage, STAGES};
pub use scratch::ScratchDir;
