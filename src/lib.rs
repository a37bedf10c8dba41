//! Reelforge - timeline assembly over supervised ffmpeg pipelines
//!
//! A [`process::Process`] owns inputs and outputs. Each
//! [`output::Output`] carries a timeline of [`timeline::Layer`]s and
//! [`timeline::Overlay`]s that compiles into one filter graph; ducking
//! overlays splice a silence-driven sub-pipeline onto the output's sink.
//!
//! Workers and subprocesses live in the supervision tree of
//! `reelforge_common`; media tools, FIFOs and the graph IR come from
//! `reelforge_av`.

pub mod channel;
pub mod config;
pub mod duck;
pub mod output;
pub mod process;
pub mod reel;
pub mod timeline;
