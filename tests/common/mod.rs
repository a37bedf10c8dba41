//! Shared helpers for integration tests.
//!
//! Provides [`TestHarness`], which owns a supervision root with short
//! timeouts, a scratch workspace and run settings, plus small builders for
//! shell commands and input reels.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reelforge::process::{CompileContext, ProcessSettings};
use reelforge::reel::{Input, InputReel};
use reelforge_av::{TerminationPolicy, ToolCommand, ToolRegistry, ToolsConfig, Workspace};
use reelforge_common::Worker;

/// Per-attempt timeout used throughout the tests.
pub const TICK: Duration = Duration::from_millis(100);

/// A supervision root plus everything a compile needs.
pub struct TestHarness {
    pub root: Worker,
    pub workspace: Arc<Workspace>,
    pub settings: Arc<ProcessSettings>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_ffmpeg("/nonexistent/ffmpeg")
    }

    pub fn with_ffmpeg(ffmpeg: impl Into<PathBuf>) -> Self {
        let mut settings = ProcessSettings::new(ffmpeg);
        settings.timeout = TICK;
        settings.command_timeout = TICK;
        settings.termination = TerminationPolicy {
            grace: Some(TICK),
            term_attempts: 2,
        };
        Self {
            root: Worker::root("test").with_timeout(TICK),
            workspace: Arc::new(Workspace::new().expect("workspace")),
            settings: Arc::new(settings),
        }
    }

    pub fn compile_context(&self) -> CompileContext {
        CompileContext::new(
            self.root.clone(),
            self.workspace.clone(),
            self.settings.clone(),
            false,
        )
    }

    /// Tear the tree down, giving stragglers a few seconds.
    pub async fn shutdown(&self) {
        let _ = self.root.shutdown(Some(Duration::from_secs(5))).await;
    }
}

/// A `/bin/sh -c` command with test timeouts.
pub fn sh(script: &str) -> ToolCommand {
    let mut cmd = ToolCommand::new("/bin/sh");
    cmd.args(["-c", script]).timeout(TICK).termination(TerminationPolicy {
        grace: Some(TICK),
        term_attempts: 2,
    });
    cmd
}

pub fn av_reel(index: usize) -> InputReel {
    reel(index, true, true)
}

pub fn audio_reel(index: usize) -> InputReel {
    reel(index, false, true)
}

pub fn reel(index: usize, video: bool, audio: bool) -> InputReel {
    InputReel::new(
        index,
        &Input {
            path: PathBuf::from(format!("input{index}.mkv")),
            video,
            audio,
        },
    )
}

/// The ffmpeg binary, if installed.
pub fn ffmpeg() -> Option<PathBuf> {
    ToolRegistry::discover(&ToolsConfig::default())
        .ffmpeg()
        .ok()
        .map(|p| p.to_path_buf())
}
