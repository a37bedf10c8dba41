//! Configuration loading and validation.

use std::time::Duration;

use reelforge::config::{load_config, load_config_or_default, validate_config, Config};
use reelforge_av::Resolution;
use tempfile::tempdir;

fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reelforge.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}

#[test]
fn defaults_are_valid() {
    let config = Config::default();
    validate_config(&config).unwrap();
    assert_eq!(config.timeouts.command_secs, 15);
    assert_eq!(config.fifo.chunk_size, 64 * 1024);
    assert_eq!(config.silence.noise, -30.0);
    assert_eq!(config.ducking.silent_min, 3.0);
    assert_eq!(config.output.video.resolution, Resolution::new(1280, 720));
}

#[test]
fn full_config_round_trips_into_settings() {
    let (_dir, path) = write_config(
        r#"
[timeouts]
command_secs = 30
worker_secs = 5
limit_secs = 600

[termination]
grace_secs = 2.5
term_attempts = 3

[fifo]
memory_chunks = 16
reader_open_limit_secs = 20

[silence]
noise = -40
duration = 0.5

[ducking]
volume_hi = 1.0
volume_lo = 0.2

[output.video]
resolution = "1920x1080"
fps = 25
encoder = "libx265"

[output.audio]
sampling_freq = 48000
"#,
    );

    let config = load_config(&path).unwrap();
    let settings = config.process_settings("/usr/bin/ffmpeg");

    assert_eq!(settings.command_timeout, Duration::from_secs(30));
    assert_eq!(settings.timeout, Duration::from_secs(5));
    assert_eq!(settings.limit, Some(Duration::from_secs(600)));
    assert_eq!(settings.termination.grace, Some(Duration::from_millis(2500)));
    assert_eq!(settings.termination.term_attempts, 3);
    assert_eq!(settings.fifo.memory_chunks, 16);
    assert_eq!(settings.fifo.chunk_size, 64 * 1024);
    assert_eq!(settings.silence.duration, 0.5);
    assert_eq!(settings.ducking.volume_lo, 0.2);
    assert_eq!(settings.ducking.transition_length, 1.0);

    assert_eq!(config.output.video.resolution, Resolution::new(1920, 1080));
    assert_eq!(config.output.video.encoder.as_deref(), Some("libx265"));
    assert_eq!(config.output.video.pixel_format.as_deref(), Some("yuv420p"));
    assert_eq!(config.output.audio.sampling_freq, 48000);
}

#[test]
fn odd_resolution_is_rejected() {
    let (_dir, path) = write_config("[output.video]\nresolution = \"1281x720\"\n");
    let err = load_config(&path).unwrap_err();
    assert!(format!("{err:#}").contains("divisible by 2"));
}

#[test]
fn zero_timeouts_are_rejected() {
    let (_dir, path) = write_config("[timeouts]\nworker_secs = 0\n");
    assert!(load_config(&path).is_err());

    let (_dir, path) = write_config("[timeouts]\nlimit_secs = 0\n");
    assert!(load_config(&path).is_err());
}

#[test]
fn malformed_toml_names_the_file() {
    let (_dir, path) = write_config("[timeouts\n");
    let err = load_config(&path).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn explicit_missing_path_is_an_error() {
    let dir = tempdir().unwrap();
    assert!(load_config_or_default(Some(&dir.path().join("absent.toml"))).is_err());
}
