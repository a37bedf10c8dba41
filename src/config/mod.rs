mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)
        .with_context(|| format!("Invalid config file: {:?}", path))?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./reelforge.toml",
        "~/.config/reelforge/config.toml",
        "/etc/reelforge/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Using config file {:?}", path);
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.timeouts.command_secs == 0 {
        anyhow::bail!("timeouts.command_secs cannot be 0");
    }
    if config.timeouts.worker_secs == 0 {
        anyhow::bail!("timeouts.worker_secs cannot be 0");
    }
    if config.timeouts.limit_secs == Some(0) {
        anyhow::bail!("timeouts.limit_secs cannot be 0 (leave it out for no limit)");
    }

    if config.termination.grace.is_some_and(|g| g.is_zero()) {
        anyhow::bail!("termination.grace_secs must be positive");
    }

    if config.fifo.chunk_size == 0 {
        anyhow::bail!("fifo.chunk_size cannot be 0");
    }
    if config.fifo.reader_open_limit_secs == Some(0) {
        anyhow::bail!("fifo.reader_open_limit_secs cannot be 0");
    }

    if config.silence.duration <= 0.0 {
        anyhow::bail!("silence.duration must be positive");
    }

    let ducking = &config.ducking;
    if ducking.volume_hi < 0.0 || ducking.volume_lo < 0.0 {
        anyhow::bail!("ducking volumes cannot be negative");
    }
    if ducking.transition_length <= 0.0 {
        anyhow::bail!("ducking.transition_length must be positive");
    }
    if ducking.volume_lo > ducking.volume_hi {
        tracing::warn!(
            "ducking.volume_lo ({}) is above volume_hi ({}); the overlay will dip in silences",
            ducking.volume_lo,
            ducking.volume_hi
        );
    }

    let video = &config.output.video;
    if !video.resolution.is_even() {
        anyhow::bail!(
            "output.video.resolution {} must have both dimensions divisible by 2",
            video.resolution
        );
    }
    if video.fps <= 0.0 {
        anyhow::bail!("output.video.fps must be positive");
    }
    if config.output.audio.sampling_freq == 0 {
        anyhow::bail!("output.audio.sampling_freq cannot be 0");
    }

    for (name, path) in [
        ("ffmpeg", &config.tools.ffmpeg_path),
        ("ffprobe", &config.tools.ffprobe_path),
    ] {
        if let Some(path) = path {
            if !path.exists() {
                tracing::warn!("Configured {} path does not exist: {:?}", name, path);
            }
        }
    }

    Ok(())
}
