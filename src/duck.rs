//! Audio ducking.
//!
//! Ducking mixes an overlay (typically music) over the main timeline so that
//! it stays low while the main audio is busy and swells during the main
//! audio's silences. The silences are found by a detection pass over the
//! main media; the mix itself is a second, nested [`Process`] writing to the
//! sink the main output was originally routed to.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use reelforge_av::{FifoBuffer, SilenceDetector, SilenceInterval, VolumeEnvelope, Workspace};
use reelforge_common::{Result, Worker};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::{AudioChannel, VideoChannel};
use crate::process::{Process, ProcessSettings};
use crate::timeline::{Layer, Overlay};

/// Overlay volume shaping (the `[ducking]` config section).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DuckingConfig {
    /// Overlay volume during silences of the main audio.
    #[serde(default = "default_volume_hi")]
    pub volume_hi: f64,
    /// Overlay volume while the main audio is busy.
    #[serde(default = "default_volume_lo")]
    pub volume_lo: f64,
    /// Silences shorter than this (seconds) are ignored.
    #[serde(default = "default_silent_min")]
    pub silent_min: f64,
    /// Ramp-up offset from the start of a silence.
    #[serde(default = "default_transition_in_start")]
    pub transition_in_start: f64,
    /// Ramp-down offset from the end of a silence.
    #[serde(default = "default_transition_out_start")]
    pub transition_out_start: f64,
    /// Ramp length in seconds.
    #[serde(default = "default_transition_length")]
    pub transition_length: f64,
}

fn default_volume_hi() -> f64 {
    0.9
}
fn default_volume_lo() -> f64 {
    0.1
}
fn default_silent_min() -> f64 {
    3.0
}
fn default_transition_in_start() -> f64 {
    0.4
}
fn default_transition_out_start() -> f64 {
    -0.6
}
fn default_transition_length() -> f64 {
    1.0
}

impl Default for DuckingConfig {
    fn default() -> Self {
        Self {
            volume_hi: default_volume_hi(),
            volume_lo: default_volume_lo(),
            silent_min: default_silent_min(),
            transition_in_start: default_transition_in_start(),
            transition_out_start: default_transition_out_start(),
            transition_length: default_transition_length(),
        }
    }
}

/// Overlay volume keyframes for the given silences of the main audio.
pub fn duck_envelope(silence: &[SilenceInterval], config: &DuckingConfig) -> VolumeEnvelope {
    let mut points = vec![(0.0, config.volume_lo)];

    for interval in silence {
        if interval
            .duration()
            .is_some_and(|duration| duration < config.silent_min)
        {
            continue;
        }

        let rise = (interval.start_at + config.transition_in_start).max(0.0);
        points.push((rise, config.volume_lo));
        points.push((rise + config.transition_length, config.volume_hi));

        if let Some(end_at) = interval.end_at {
            let last = points.last().map_or(0.0, |p| p.0);
            let fall = (end_at + config.transition_out_start).max(last);
            points.push((fall, config.volume_hi));
            points.push((fall + config.transition_length, config.volume_lo));
        }
    }

    VolumeEnvelope::new(points)
}

/// What a ducking pass needs to rebuild the main output.
#[derive(Debug, Clone)]
pub struct DuckRequest {
    /// Materialised main media.
    pub main: PathBuf,
    /// Overlay audio.
    pub overlay: PathBuf,
    pub silence: Vec<SilenceInterval>,
    /// Where the main output was originally headed.
    pub sink: PathBuf,
    pub video: Option<VideoChannel>,
    pub audio: AudioChannel,
    pub ignore_broken_pipes: bool,
    pub settings: Arc<ProcessSettings>,
}

/// Mix the overlay over the main media with a ducking envelope, as a nested
/// process under `parent`.
pub fn duck_audio(parent: &Worker, request: DuckRequest) -> BoxFuture<'static, Result<()>> {
    let parent = parent.clone();
    async move {
        let envelope = duck_envelope(&request.silence, &request.settings.ducking);
        debug!(
            "Ducking {} under {} with {} keyframes",
            request.overlay.display(),
            request.main.display(),
            envelope.points().len()
        );

        let mut process = Process::shared(request.settings.clone());
        process.ignore_broken_pipes(request.ignore_broken_pipes);
        let main = process.input(&request.main, request.video.is_some(), true);
        let overlay = process.input(&request.overlay, false, true).volume(envelope);

        process
            .output(&request.sink, request.video.clone(), Some(request.audio.clone()))?
            .roll(Layer::new(main))?
            .overlay(Overlay::new(overlay))?;

        process.run(&parent).await
    }
    .boxed()
}

/// The "audio ducking" worker body spawned by the compiler.
pub(crate) struct DuckJob {
    pub main: FifoBuffer,
    pub overlay: FifoBuffer,
    pub sink: PathBuf,
    pub video: Option<VideoChannel>,
    pub audio: AudioChannel,
    pub ignore_broken_pipes: bool,
    pub settings: Arc<ProcessSettings>,
    pub workspace: Arc<Workspace>,
}

impl DuckJob {
    pub(crate) async fn run(self, worker: Worker) -> Result<()> {
        let has_video = self.video.is_some();
        let materialised = self.workspace.unique_path(
            "main",
            reelforge_av::intermediate_extension(has_video, true),
        );

        let detector = SilenceDetector::new(&self.settings.ffmpeg, self.settings.silence)
            .with_timeouts(self.settings.command_timeout, self.settings.limit)
            .with_termination(self.settings.termination);
        let silence = detector
            .find_silence(&worker, self.main.output(), Some(&materialised), has_video)
            .await?;

        debug!(
            "Audio ducking with silence: [{}]",
            silence
                .iter()
                .map(|s| format!("{}-{}", s.start_at, s.end_at.map(|e| e.to_string()).unwrap_or_default()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        duck_audio(
            &worker,
            DuckRequest {
                main: materialised,
                overlay: self.overlay.output().to_path_buf(),
                silence,
                sink: self.sink,
                video: self.video,
                audio: self.audio,
                ignore_broken_pipes: self.ignore_broken_pipes,
                settings: self.settings,
            },
        )
        .await?;

        self.main.join().await?;
        self.overlay.join().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent(start_at: f64, end_at: Option<f64>) -> SilenceInterval {
        SilenceInterval { start_at, end_at }
    }

    fn assert_close(actual: (f64, f64), expected: (f64, f64)) {
        assert!(
            (actual.0 - expected.0).abs() < 1e-9 && (actual.1 - expected.1).abs() < 1e-9,
            "{actual:?} != {expected:?}"
        );
    }

    #[test]
    fn test_no_silence_keeps_overlay_low() {
        let env = duck_envelope(&[], &DuckingConfig::default());
        assert_eq!(env.points(), &[(0.0, 0.1)]);
    }

    #[test]
    fn test_long_silence_raises_overlay() {
        let config = DuckingConfig::default();
        let env = duck_envelope(&[silent(10.0, Some(20.0))], &config);
        let points = env.points();
        assert_eq!(points.len(), 5);
        assert_close(points[1], (10.4, 0.1));
        assert_close(points[2], (11.4, 0.9));
        assert_close(points[3], (19.4, 0.9));
        assert_close(points[4], (20.4, 0.1));
    }

    #[test]
    fn test_short_silence_is_skipped() {
        let env = duck_envelope(&[silent(1.0, Some(2.0))], &DuckingConfig::default());
        assert_eq!(env.points().len(), 1);
    }

    #[test]
    fn test_open_silence_runs_to_the_end() {
        let env = duck_envelope(&[silent(5.0, None)], &DuckingConfig::default());
        let last = *env.points().last().unwrap();
        assert_close(last, (6.4, 0.9));
    }
}
