//! Silence detection.
//!
//! ffmpeg's `silencedetect` filter reports its findings on standard error as
//! bracketed diagnostic lines:
//!
//! ```text
//! [silencedetect @ 0x55d0c8a4e2c0] silence_start: 1.5
//! [silencedetect @ 0x55d0c8a4e2c0] silence_end: 3.0 | silence_duration: 1.5
//! ```
//!
//! [`parse_silence`] folds those markers into [`SilenceInterval`]s and
//! [`SilenceDetector`] runs the analysis pass itself.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reelforge_common::{Error, Result, Worker};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::{TerminationPolicy, ToolCommand};
use crate::filter;

// Times are printed with `%g`, so small values carry an exponent.
static SILENCE_MARK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[silencedetect\s.*\]\s*silence_(\w+):\s*(-?\d+(?:\.\d*)?(?:[eE][-+]?\d+)?)")
        .expect("silence marker pattern")
});

/// One stretch of silence, in seconds. An open `end_at` runs to the end of
/// the stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SilenceInterval {
    pub start_at: f64,
    pub end_at: Option<f64>,
}

impl SilenceInterval {
    pub fn duration(&self) -> Option<f64> {
        self.end_at.map(|end| end - self.start_at)
    }
}

/// Parse `silence_start`/`silence_end` markers out of diagnostic text.
///
/// A `silence_end` with no interval before it opens one at zero. Unknown
/// markers are logged and skipped.
pub fn parse_silence(text: &str) -> Result<Vec<SilenceInterval>> {
    let mut silence: Vec<SilenceInterval> = Vec::new();

    for caps in SILENCE_MARK.captures_iter(text) {
        let mark = &caps[1];
        let time: f64 = caps[2]
            .parse()
            .map_err(|_| Error::silence(format!("bad silence time: {}", &caps[2])))?;

        match mark {
            "start" => {
                if let Some(last) = silence.last() {
                    if last.end_at.is_none() {
                        return Err(Error::silence(format!(
                            "silence_start at {time} inside the silence started at {}",
                            last.start_at
                        )));
                    }
                    if time <= last.start_at {
                        return Err(Error::silence(format!(
                            "silence_start at {time} does not follow {}",
                            last.start_at
                        )));
                    }
                }
                silence.push(SilenceInterval {
                    start_at: time,
                    end_at: None,
                });
            }
            "end" => match silence.last_mut() {
                None => silence.push(SilenceInterval {
                    start_at: 0.0,
                    end_at: Some(time),
                }),
                Some(last) if last.end_at.is_some() => {
                    return Err(Error::silence("silence_end with no silence_start"));
                }
                Some(last) => last.end_at = Some(time),
            },
            other => warn!("Unknown silence mark: {}", other),
        }
    }

    Ok(silence)
}

/// Detection thresholds (the `[silence]` config section).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SilenceConfig {
    /// Noise floor in dB.
    #[serde(default = "default_noise")]
    pub noise: f64,
    /// Minimum silence length in seconds.
    #[serde(default = "default_duration")]
    pub duration: f64,
}

fn default_noise() -> f64 {
    -30.0
}

fn default_duration() -> f64 {
    1.0
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            noise: default_noise(),
            duration: default_duration(),
        }
    }
}

/// Runs `silencedetect` analysis passes.
#[derive(Debug, Clone)]
pub struct SilenceDetector {
    ffmpeg: PathBuf,
    config: SilenceConfig,
    timeout: Duration,
    limit: Option<Duration>,
    termination: TerminationPolicy,
}

impl SilenceDetector {
    pub fn new(ffmpeg: impl Into<PathBuf>, config: SilenceConfig) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            config,
            timeout: reelforge_common::DEFAULT_TIMEOUT,
            limit: None,
            termination: TerminationPolicy::default(),
        }
    }

    pub fn with_timeouts(mut self, timeout: Duration, limit: Option<Duration>) -> Self {
        self.timeout = timeout;
        self.limit = limit;
        self
    }

    pub fn with_termination(mut self, termination: TerminationPolicy) -> Self {
        self.termination = termination;
        self
    }

    /// Scan `input` for silence.
    ///
    /// With an `output`, the media passes through to it unchanged (video
    /// copied) so the scan doubles as a materialising copy; otherwise the
    /// result is discarded.
    pub async fn find_silence(
        &self,
        parent: &Worker,
        input: &Path,
        output: Option<&Path>,
        has_video: bool,
    ) -> Result<Vec<SilenceInterval>> {
        let route = match output {
            Some(out) => format!("{}->{}", input.display(), out.display()),
            None => input.display().to_string(),
        };
        debug!("Finding silence ({})", route);

        let mut cmd = ToolCommand::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-nostdin", "-y", "-i"])
            .arg(input.to_string_lossy())
            .arg("-af")
            .arg(filter::silencedetect(self.config.noise, self.config.duration).to_string());
        match output {
            Some(out) => {
                if has_video {
                    cmd.args(["-c:v", "copy"]);
                }
                cmd.arg(out.to_string_lossy());
            }
            None => {
                cmd.args(["-f", "null", "-"]);
            }
        }
        cmd.timeout(self.timeout)
            .limit(self.limit)
            .termination(self.termination);

        let out = cmd.execute(parent).await?;
        let silence = parse_silence(&out.stderr)?;

        debug!(
            "Found silence ({}): [{}]",
            route,
            silence
                .iter()
                .map(|s| match s.end_at {
                    Some(end) => format!("{}-{}", s.start_at, end),
                    None => format!("{}-", s.start_at),
                })
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(silence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn start_then_end() {
        let text = "\
[silencedetect @ 0x1] silence_start: 1.5
size=N/A time=00:00:02.00 bitrate=N/A
[silencedetect @ 0x1] silence_end: 3.0 | silence_duration: 1.5
";
        let silence = parse_silence(text).unwrap();
        assert_eq!(
            silence,
            vec![SilenceInterval {
                start_at: 1.5,
                end_at: Some(3.0)
            }]
        );
        assert_eq!(silence[0].duration(), Some(1.5));
    }

    #[test]
    fn leading_end_opens_at_zero() {
        let silence = parse_silence("[silencedetect @ 0x1] silence_end: 2.0").unwrap();
        assert_eq!(
            silence,
            vec![SilenceInterval {
                start_at: 0.0,
                end_at: Some(2.0)
            }]
        );
    }

    #[test]
    fn exponent_times() {
        let text = "\
[silencedetect @ 0x1] silence_start: 2.5e-05
[silencedetect @ 0x1] silence_end: 3 | silence_duration: 2.99998
[silencedetect @ 0x1] silence_start: 1.2E+03
";
        let silence = parse_silence(text).unwrap();
        assert_eq!(
            silence,
            vec![
                SilenceInterval {
                    start_at: 2.5e-5,
                    end_at: Some(3.0)
                },
                SilenceInterval {
                    start_at: 1200.0,
                    end_at: None
                },
            ]
        );
    }

    #[test]
    fn second_end_is_an_error() {
        let text = "\
[silencedetect @ 0x1] silence_end: 2.0
[silencedetect @ 0x1] silence_end: 4.0
";
        let err = parse_silence(text).unwrap_err();
        assert_matches!(&err, Error::Silence(msg) if msg == "silence_end with no silence_start");
    }

    #[test]
    fn trailing_start_stays_open() {
        let text = "\
[silencedetect @ 0x1] silence_start: 0.5
[silencedetect @ 0x1] silence_end: 1.75
[silencedetect @ 0x1] silence_start: 9
";
        let silence = parse_silence(text).unwrap();
        assert_eq!(silence.len(), 2);
        assert_eq!(silence[1].end_at, None);
        assert_eq!(silence[1].duration(), None);
    }

    #[test]
    fn non_increasing_start_is_an_error() {
        let text = "\
[silencedetect @ 0x1] silence_start: 5
[silencedetect @ 0x1] silence_end: 6
[silencedetect @ 0x1] silence_start: 4
";
        assert!(parse_silence(text).is_err());
    }

    #[test]
    fn unknown_marks_are_skipped() {
        let text = "[silencedetect @ 0x1] silence_middle: 1.0";
        assert!(parse_silence(text).unwrap().is_empty());
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        let text = "silence_start: 1.0 without the filter tag";
        assert!(parse_silence(text).unwrap().is_empty());
    }
}
