//! # reelforge-av
//!
//! The leaves of the reelforge pipeline engine:
//!
//! - **Command execution** ([`ToolCommand`]) -- supervised external process
//!   runs with liveness-checked waits, broken-pipe classification and
//!   escalating termination.
//! - **FIFO buffering** ([`FifoBuffer`]) -- named-pipe pairs that decouple
//!   one stage's writer from the next stage's reader.
//! - **Silence detection** ([`SilenceDetector`], [`parse_silence`]).
//! - **Filter graphs** ([`filter`]) -- the graph IR and the fragment library
//!   the timeline compiler is built from.
//! - **Tool discovery** ([`ToolRegistry`]) and scratch space ([`Workspace`]).

pub mod command;
pub mod fifo;
pub mod filter;
pub mod silence;
pub mod tools;
pub mod workspace;

// ---- Re-exports for convenience ----

pub use command::{Diagnostics, Termination, TerminationPolicy, ToolCommand, ToolOutput};
pub use fifo::{FifoBuffer, FifoConfig};
pub use filter::{ChannelKind, Filter, FilterGraph, FilterOp, Label, Pad, Resolution, VolumeEnvelope};
pub use silence::{parse_silence, SilenceConfig, SilenceDetector, SilenceInterval};
pub use tools::{ToolInfo, ToolRegistry, ToolsConfig};
pub use workspace::{intermediate_extension, Workspace};
