//! Media sources a timeline is assembled from.

use std::fmt;
use std::path::{Path, PathBuf};

use reelforge_av::filter::{self, ChannelKind, Filter, Label, Pad, VolumeEnvelope};
use reelforge_common::{Error, Result};

use crate::channel::{AudioChannel, VideoChannel};

/// A source that can render itself into a filter graph.
pub trait Reel: Send + Sync + fmt::Debug {
    /// Whether the source carries the given channel.
    fn has_channel(&self, kind: ChannelKind) -> bool;

    /// Filters producing `label` on every requested channel, adapted to the
    /// given channel options.
    fn filters_for(
        &self,
        label: &Label,
        video: Option<&VideoChannel>,
        audio: Option<&AudioChannel>,
    ) -> Result<Vec<Filter>>;

    /// Identity for diagnostics.
    fn describe(&self) -> String;
}

/// An `-i` input of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub path: PathBuf,
    pub video: bool,
    pub audio: bool,
}

/// A reel reading one process input, optionally with a volume envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct InputReel {
    index: usize,
    path: PathBuf,
    video: bool,
    audio: bool,
    volume: Option<VolumeEnvelope>,
}

impl InputReel {
    pub fn new(index: usize, input: &Input) -> Self {
        Self {
            index,
            path: input.path.clone(),
            video: input.video,
            audio: input.audio,
            volume: None,
        }
    }

    /// The same input with its audio following `envelope`.
    pub fn volume(&self, envelope: VolumeEnvelope) -> Self {
        Self {
            volume: Some(envelope),
            ..self.clone()
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Reel for InputReel {
    fn has_channel(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Video => self.video,
            ChannelKind::Audio => self.audio,
        }
    }

    fn filters_for(
        &self,
        label: &Label,
        video: Option<&VideoChannel>,
        audio: Option<&AudioChannel>,
    ) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();

        if let Some(video) = video {
            if !self.video {
                return Err(Error::configuration(format!(
                    "{} has no video channel",
                    self.describe()
                )));
            }
            filters.push(filter::scale_pad_fps(
                Pad::stream(self.index, ChannelKind::Video),
                video.resolution,
                video.fps,
                label.pad(ChannelKind::Video),
            ));
        }

        if let Some(audio) = audio {
            if !self.audio {
                return Err(Error::configuration(format!(
                    "{} has no audio channel",
                    self.describe()
                )));
            }
            let mut resample = filter::aformat_resample(
                Pad::stream(self.index, ChannelKind::Audio),
                audio.sampling_freq,
                label.pad(ChannelKind::Audio),
            );
            if let Some(envelope) = &self.volume {
                resample.chain.push(filter::volume_op(envelope));
            }
            filters.push(resample);
        }

        Ok(filters)
    }

    fn describe(&self) -> String {
        format!("input #{} ({})", self.index, self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(video: bool, audio: bool) -> InputReel {
        InputReel::new(
            1,
            &Input {
                path: PathBuf::from("clip.mp4"),
                video,
                audio,
            },
        )
    }

    #[test]
    fn test_filters_for_both_channels() {
        let reel = input(true, true);
        let filters = reel
            .filters_for(
                &Label::new("o0rl0"),
                Some(&VideoChannel::default()),
                Some(&AudioChannel::default()),
            )
            .unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].inputs, vec![Pad::stream(1, ChannelKind::Video)]);
        assert_eq!(filters[0].param("w"), Some("1280"));
        assert_eq!(filters[1].outputs, vec![Label::new("o0rl0").pad(ChannelKind::Audio)]);
        assert_eq!(filters[1].param("osr"), Some("44100"));
    }

    #[test]
    fn test_missing_channel_is_rejected() {
        let reel = input(false, true);
        let err = reel
            .filters_for(&Label::new("x"), Some(&VideoChannel::default()), None)
            .unwrap_err();
        assert!(err.to_string().contains("no video channel"));
    }

    #[test]
    fn test_volume_is_appended_to_audio() {
        let reel = input(false, true).volume(VolumeEnvelope::new(vec![(0.0, 0.1), (2.0, 0.9)]));
        let filters = reel
            .filters_for(&Label::new("l0"), None, Some(&AudioChannel::default()))
            .unwrap();
        assert_eq!(filters.len(), 1);
        let last = filters[0].chain.last().unwrap();
        assert_eq!(last.name(), "volume");
        assert_eq!(last.get("eval"), Some("frame"));
    }
}
