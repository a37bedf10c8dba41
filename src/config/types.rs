use std::path::PathBuf;
use std::time::Duration;

use reelforge_av::{FifoConfig, SilenceConfig, TerminationPolicy, ToolsConfig};
use serde::{Deserialize, Serialize};

use crate::channel::{AudioChannel, VideoChannel};
use crate::duck::DuckingConfig;
use crate::process::ProcessSettings;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub termination: TerminationPolicy,

    #[serde(default)]
    pub fifo: FifoConfig,

    #[serde(default)]
    pub silence: SilenceConfig,

    #[serde(default)]
    pub ducking: DuckingConfig,

    #[serde(default)]
    pub output: OutputDefaults,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    /// Per-attempt wait for a subprocess, in seconds
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,

    /// Per-attempt wait for joins and liveness checks, in seconds
    #[serde(default = "default_worker_secs")]
    pub worker_secs: u64,

    /// Hard deadline for a whole process run (none = unlimited)
    #[serde(default)]
    pub limit_secs: Option<u64>,
}

fn default_command_secs() -> u64 {
    15
}

fn default_worker_secs() -> u64 {
    15
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            worker_secs: default_worker_secs(),
            limit_secs: None,
        }
    }
}

impl TimeoutsConfig {
    pub fn worker(&self) -> Duration {
        Duration::from_secs(self.worker_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit_secs.map(Duration::from_secs)
    }
}

/// Channel options used when a script does not give its own.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputDefaults {
    #[serde(default)]
    pub video: VideoChannel,

    #[serde(default)]
    pub audio: AudioChannel,
}

impl Config {
    /// Run settings for a process using the given ffmpeg binary.
    pub fn process_settings(&self, ffmpeg: impl Into<PathBuf>) -> ProcessSettings {
        ProcessSettings {
            ffmpeg: ffmpeg.into(),
            timeout: self.timeouts.worker(),
            command_timeout: self.timeouts.command(),
            limit: self.timeouts.limit(),
            termination: self.termination,
            fifo: self.fifo.clone(),
            silence: self.silence,
            ducking: self.ducking,
        }
    }
}
