//! Per-channel output options.

use reelforge_av::Resolution;
use serde::{Deserialize, Serialize};

/// Video options of an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoChannel {
    #[serde(default = "default_resolution")]
    pub resolution: Resolution,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_video_encoder")]
    pub encoder: Option<String>,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: Option<String>,
}

fn default_resolution() -> Resolution {
    Resolution::new(1280, 720)
}

fn default_fps() -> f64 {
    30.0
}

fn default_video_encoder() -> Option<String> {
    Some("libx264".to_string())
}

fn default_pixel_format() -> Option<String> {
    Some("yuv420p".to_string())
}

impl Default for VideoChannel {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            fps: default_fps(),
            encoder: default_video_encoder(),
            pixel_format: default_pixel_format(),
        }
    }
}

impl VideoChannel {
    /// Encoder arguments; resolution and rate are handled by the graph.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(encoder) = &self.encoder {
            args.extend(["-c:v".to_string(), encoder.clone()]);
        }
        if let Some(pixel_format) = &self.pixel_format {
            args.extend(["-pix_fmt".to_string(), pixel_format.clone()]);
        }
        args
    }
}

/// Audio options of an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChannel {
    #[serde(default = "default_audio_encoder")]
    pub encoder: Option<String>,
    #[serde(default = "default_sampling_freq")]
    pub sampling_freq: u32,
}

fn default_audio_encoder() -> Option<String> {
    Some("aac".to_string())
}

fn default_sampling_freq() -> u32 {
    44100
}

impl Default for AudioChannel {
    fn default() -> Self {
        Self {
            encoder: default_audio_encoder(),
            sampling_freq: default_sampling_freq(),
        }
    }
}

impl AudioChannel {
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(encoder) = &self.encoder {
            args.extend(["-c:a".to_string(), encoder.clone()]);
        }
        args.extend(["-ar".to_string(), self.sampling_freq.to_string()]);
        args
    }
}
