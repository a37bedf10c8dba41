//! Reelforge-Common: error types and the worker supervision tree.
//!
//! This crate provides the pieces every other reelforge crate builds on:
//!
//! - **Error Handling**: the [`Error`] taxonomy (configuration, time limit,
//!   broken pipe, parent death, system defects) and the [`Result`] alias
//! - **Supervision**: [`Worker`] handles forming a parent/child tree in which
//!   no worker may outlive its parent's active supervision
//!
//! # Examples
//!
//! ```no_run
//! use reelforge_common::{Result, Worker};
//!
//! # async fn example() -> Result<()> {
//! let root = Worker::root("main");
//! let child = root.spawn("counting", |worker| async move {
//!     worker.live()?;
//!     Ok(42)
//! });
//! assert_eq!(child.join().await?, 42);
//! root.join_children(None, root.timeout()).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod supervisor;

pub use error::{error_chain, Error, ErrorKind, Result};
pub use supervisor::{timeout_or_live, Worker, WorkerHandle, DEFAULT_TIMEOUT};
