//! Filter graph IR and the library of graph fragments.
//!
//! A [`FilterGraph`] is an ordered list of [`Filter`] operations connected by
//! [`Pad`]s. Pads are either input stream pads (`[0:a]`) or labelled node
//! pads (`[o0rl1:v]`). The graph is kept structured until it is rendered to
//! `-filter_complex` text, so dangling or doubly-produced labels are caught
//! by [`FilterGraph::validate`] rather than by ffmpeg.
//!
//! The free functions at the bottom are pure fragment constructors: each
//! takes explicit input/output pads and numeric parameters and returns one
//! filter chain.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use reelforge_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// A media channel of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Video,
    Audio,
}

impl ChannelKind {
    /// Both channels, video first.
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Video, ChannelKind::Audio];

    /// Pad suffix used in rendered labels (`v` or `a`).
    pub fn suffix(self) -> &'static str {
        match self {
            ChannelKind::Video => "v",
            ChannelKind::Audio => "a",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Video => write!(f, "video"),
            ChannelKind::Audio => write!(f, "audio"),
        }
    }
}

/// Opaque name of an intermediate node in a compiled graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(String);

impl Label {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a sibling label by appending `suffix`.
    pub fn suffixed(&self, suffix: &str) -> Self {
        Self(format!("{}{}", self.0, suffix))
    }

    /// The pad of this label on the given channel.
    pub fn pad(&self, kind: ChannelKind) -> Pad {
        Pad::Node {
            label: self.clone(),
            kind,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One end of a graph edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pad {
    /// A stream of the `input`-th `-i` argument.
    Stream { input: usize, kind: ChannelKind },
    /// A labelled pad produced inside the graph.
    Node { label: Label, kind: ChannelKind },
}

impl Pad {
    pub fn stream(input: usize, kind: ChannelKind) -> Self {
        Pad::Stream { input, kind }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Pad::Stream { kind, .. } | Pad::Node { kind, .. } => *kind,
        }
    }

    pub fn label(&self) -> Option<&Label> {
        match self {
            Pad::Stream { .. } => None,
            Pad::Node { label, .. } => Some(label),
        }
    }
}

impl fmt::Display for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pad::Stream { input, kind } => write!(f, "{}:{}", input, kind.suffix()),
            Pad::Node { label, kind } => write!(f, "{}:{}", label, kind.suffix()),
        }
    }
}

/// A single filter invocation with named arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOp {
    name: String,
    args: Vec<(String, String)>,
}

impl FilterOp {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append a `key=value` argument.
    pub fn arg(mut self, key: &str, value: impl ToString) -> Self {
        self.args.push((key.to_string(), value.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an argument value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (i, (key, value)) in self.args.iter().enumerate() {
            let sep = if i == 0 { '=' } else { ':' };
            if value.contains([',', ':', ';', '[', ']', '=']) {
                write!(f, "{sep}{key}='{value}'")?;
            } else {
                write!(f, "{sep}{key}={value}")?;
            }
        }
        Ok(())
    }
}

/// One graph operation: a filter chain from input pads to output pads.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub inputs: Vec<Pad>,
    pub chain: Vec<FilterOp>,
    pub outputs: Vec<Pad>,
}

impl Filter {
    pub fn new(inputs: Vec<Pad>, chain: Vec<FilterOp>, outputs: Vec<Pad>) -> Self {
        Self {
            inputs,
            chain,
            outputs,
        }
    }

    /// Name of the head operator of the chain.
    pub fn name(&self) -> &str {
        self.chain.first().map_or("", FilterOp::name)
    }

    /// First value of `key` along the chain.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.chain.iter().find_map(|op| op.get(key))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pad in &self.inputs {
            write!(f, "[{pad}]")?;
        }
        for (i, op) in self.chain.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{op}")?;
        }
        for pad in &self.outputs {
            write!(f, "[{pad}]")?;
        }
        Ok(())
    }
}

/// An ordered list of filter operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterGraph {
    filters: Vec<Filter>,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Filter> {
        self.filters.iter()
    }

    /// The operation producing `pad`, if any.
    pub fn producer_of(&self, pad: &Pad) -> Option<&Filter> {
        self.filters.iter().find(|f| f.outputs.contains(pad))
    }

    /// Check that every labelled input was produced by an earlier operation,
    /// is consumed at most once, and that no pad has two producers.
    pub fn validate(&self) -> Result<()> {
        let mut produced = HashSet::new();
        let mut consumed = HashSet::new();

        for (i, filter) in self.filters.iter().enumerate() {
            for pad in filter.inputs.iter().filter(|p| p.label().is_some()) {
                if !produced.contains(pad) {
                    return Err(Error::system(format!(
                        "filter #{i} ({}) reads dangling pad [{pad}]",
                        filter.name()
                    )));
                }
                if !consumed.insert(pad.clone()) {
                    return Err(Error::system(format!("pad [{pad}] is consumed twice")));
                }
            }
            for pad in &filter.outputs {
                if pad.label().is_none() {
                    return Err(Error::system(format!(
                        "filter #{i} ({}) writes to input stream [{pad}]",
                        filter.name()
                    )));
                }
                if !produced.insert(pad.clone()) {
                    return Err(Error::system(format!(
                        "pad [{pad}] has more than one producer"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Produced pads nothing in the graph consumes, in production order.
    pub fn unconsumed(&self) -> Vec<Pad> {
        let consumed: HashSet<&Pad> = self.filters.iter().flat_map(|f| &f.inputs).collect();
        self.filters
            .iter()
            .flat_map(|f| &f.outputs)
            .filter(|p| !consumed.contains(p))
            .cloned()
            .collect()
    }

    /// Render as `-filter_complex` text.
    pub fn render(&self) -> String {
        self.filters
            .iter()
            .map(Filter::to_string)
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl Extend<Filter> for FilterGraph {
    fn extend<I: IntoIterator<Item = Filter>>(&mut self, iter: I) {
        self.filters.extend(iter);
    }
}

impl<'a> IntoIterator for &'a FilterGraph {
    type Item = &'a Filter;
    type IntoIter = std::slice::Iter<'a, Filter>;

    fn into_iter(self) -> Self::IntoIter {
        self.filters.iter()
    }
}

/// Frame dimensions, written `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether both dimensions are divisible by 2.
    pub fn is_even(&self) -> bool {
        self.width % 2 == 0 && self.height % 2 == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| format!("invalid resolution: {s}"))?;
        let width = w.trim().parse().map_err(|_| format!("invalid width: {w}"))?;
        let height = h.trim().parse().map_err(|_| format!("invalid height: {h}"))?;
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

/// Piecewise-linear volume keyframes `(time, volume)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeEnvelope {
    points: Vec<(f64, f64)>,
}

impl VolumeEnvelope {
    /// Build an envelope; keyframes are ordered by time.
    pub fn new(mut points: Vec<(f64, f64)>) -> Self {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { points }
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Render as an ffmpeg expression of `t`, holding the first and last
    /// values outside the keyframe range.
    pub fn expression(&self) -> String {
        let (Some(&(t_first, v_first)), Some(&(_, v_last))) =
            (self.points.first(), self.points.last())
        else {
            return "1".to_string();
        };

        let mut expr = num(v_last);
        for pair in self.points.windows(2).rev() {
            let ((t0, v0), (t1, v1)) = (pair[0], pair[1]);
            let dt = t1 - t0;
            if dt <= 0.0 {
                continue;
            }
            expr = format!(
                "if(lt(t,{}),{}+({})*(t-{})/{},{})",
                num(t1),
                num(v0),
                num(v1 - v0),
                num(t0),
                num(dt),
                expr
            );
        }
        if t_first > 0.0 {
            expr = format!("if(lt(t,{}),{},{})", num(t_first), num(v_first), expr);
        }
        expr
    }
}

/// Format a number the way filter arguments expect it (no float noise).
pub fn num(x: f64) -> String {
    let s = format!("{x:.6}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

// ---- Graph fragments ----

/// Black frames of `duration` seconds.
pub fn blank_source(duration: f64, resolution: Resolution, fps: f64, output: Pad) -> Filter {
    Filter::new(
        vec![],
        vec![
            FilterOp::new("color")
                .arg("c", "black")
                .arg("s", resolution)
                .arg("r", num(fps))
                .arg("d", num(duration)),
            FilterOp::new("setsar").arg("sar", 1),
        ],
        vec![output],
    )
}

/// Stereo silence of `duration` seconds.
pub fn silent_source(duration: f64, sample_rate: u32, output: Pad) -> Filter {
    Filter::new(
        vec![],
        vec![FilterOp::new("anullsrc")
            .arg("r", sample_rate)
            .arg("cl", "stereo")
            .arg("d", num(duration))],
        vec![output],
    )
}

/// Video frames in `[start, end)`, timestamps reset to zero.
pub fn trim(start: f64, end: f64, input: Pad, output: Pad) -> Filter {
    Filter::new(
        vec![input],
        vec![
            FilterOp::new("trim")
                .arg("start", num(start))
                .arg("end", num(end)),
            FilterOp::new("setpts").arg("expr", "PTS-STARTPTS"),
        ],
        vec![output],
    )
}

/// Audio samples in `[start, end)`, timestamps reset to zero.
pub fn atrim(start: f64, end: f64, input: Pad, output: Pad) -> Filter {
    Filter::new(
        vec![input],
        vec![
            FilterOp::new("atrim")
                .arg("start", num(start))
                .arg("end", num(end)),
            FilterOp::new("asetpts").arg("expr", "PTS-STARTPTS"),
        ],
        vec![output],
    )
}

pub fn split(input: Pad, outputs: Vec<Pad>) -> Filter {
    let n = outputs.len();
    Filter::new(
        vec![input],
        vec![FilterOp::new("split").arg("outputs", n)],
        outputs,
    )
}

pub fn asplit(input: Pad, outputs: Vec<Pad>) -> Filter {
    let n = outputs.len();
    Filter::new(
        vec![input],
        vec![FilterOp::new("asplit").arg("outputs", n)],
        outputs,
    )
}

pub fn concat_v(inputs: Vec<Pad>, output: Pad) -> Filter {
    let n = inputs.len();
    Filter::new(
        inputs,
        vec![FilterOp::new("concat").arg("n", n).arg("v", 1).arg("a", 0)],
        vec![output],
    )
}

pub fn concat_a(inputs: Vec<Pad>, output: Pad) -> Filter {
    let n = inputs.len();
    Filter::new(
        inputs,
        vec![FilterOp::new("concat").arg("n", n).arg("v", 0).arg("a", 1)],
        vec![output],
    )
}

/// Cross-blend from `inputs[0]` into `inputs[1]` over `duration` seconds.
pub fn blend_v(duration: f64, inputs: [Pad; 2], output: Pad) -> Filter {
    let d = num(duration);
    Filter::new(
        inputs.into(),
        vec![FilterOp::new("blend").arg(
            "all_expr",
            format!("A*(1-min(T/{d},1))+B*min(T/{d},1)"),
        )],
        vec![output],
    )
}

/// Audio cross-fade from `inputs[0]` into `inputs[1]` over `duration` seconds.
pub fn blend_a(duration: f64, inputs: [Pad; 2], output: Pad) -> Filter {
    Filter::new(
        inputs.into(),
        vec![FilterOp::new("acrossfade").arg("d", num(duration))],
        vec![output],
    )
}

pub fn copy(input: Pad, output: Pad) -> Filter {
    Filter::new(vec![input], vec![FilterOp::new("copy")], vec![output])
}

pub fn acopy(input: Pad, output: Pad) -> Filter {
    Filter::new(vec![input], vec![FilterOp::new("acopy")], vec![output])
}

/// Mix every input into the first at unchanged volume, lasting as long as
/// the first.
pub fn amix_to_first_same_volume(inputs: Vec<Pad>, output: Pad) -> Filter {
    let n = inputs.len();
    Filter::new(
        inputs,
        vec![FilterOp::new("amix")
            .arg("inputs", n)
            .arg("duration", "first")
            .arg("dropout_transition", 0)
            .arg("normalize", 0)],
        vec![output],
    )
}

/// The `volume` operator following `envelope`, evaluated per frame.
pub fn volume_op(envelope: &VolumeEnvelope) -> FilterOp {
    FilterOp::new("volume")
        .arg("volume", envelope.expression())
        .arg("eval", "frame")
}

pub fn volume(envelope: &VolumeEnvelope, input: Pad, output: Pad) -> Filter {
    Filter::new(vec![input], vec![volume_op(envelope)], vec![output])
}

/// Fit video into `resolution` (letterboxed) at a constant `fps`.
pub fn scale_pad_fps(input: Pad, resolution: Resolution, fps: f64, output: Pad) -> Filter {
    Filter::new(
        vec![input],
        vec![
            FilterOp::new("scale")
                .arg("w", resolution.width)
                .arg("h", resolution.height)
                .arg("force_original_aspect_ratio", "decrease"),
            FilterOp::new("pad")
                .arg("w", resolution.width)
                .arg("h", resolution.height)
                .arg("x", "(ow-iw)/2")
                .arg("y", "(oh-ih)/2"),
            FilterOp::new("setsar").arg("sar", 1),
            FilterOp::new("fps").arg("fps", num(fps)),
            FilterOp::new("setpts").arg("expr", "PTS-STARTPTS"),
        ],
        vec![output],
    )
}

/// Resample audio to stereo at `sample_rate`.
pub fn aformat_resample(input: Pad, sample_rate: u32, output: Pad) -> Filter {
    Filter::new(
        vec![input],
        vec![
            FilterOp::new("aresample").arg("osr", sample_rate),
            FilterOp::new("aformat").arg("channel_layouts", "stereo"),
            FilterOp::new("asetpts").arg("expr", "PTS-STARTPTS"),
        ],
        vec![output],
    )
}

/// The `silencedetect` operator, for use as a simple `-af` filter.
pub fn silencedetect(noise_db: f64, duration: f64) -> FilterOp {
    FilterOp::new("silencedetect")
        .arg("n", format!("{}dB", num(noise_db)))
        .arg("d", num(duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lbl(name: &str, kind: ChannelKind) -> Pad {
        Label::new(name).pad(kind)
    }

    #[test]
    fn test_trim_render() {
        let f = trim(
            0.0,
            2.5,
            lbl("pd1", ChannelKind::Video),
            lbl("tm1", ChannelKind::Video),
        );
        assert_eq!(
            f.to_string(),
            "[pd1:v]trim=start=0:end=2.5,setpts=expr=PTS-STARTPTS[tm1:v]"
        );
    }

    #[test]
    fn test_quoted_arguments() {
        let f = blend_v(
            1.0,
            [lbl("a", ChannelKind::Video), lbl("b", ChannelKind::Video)],
            lbl("c", ChannelKind::Video),
        );
        assert_eq!(
            f.to_string(),
            "[a:v][b:v]blend=all_expr='A*(1-min(T/1,1))+B*min(T/1,1)'[c:v]"
        );
    }

    #[test]
    fn test_stream_pad_render() {
        let f = aformat_resample(
            Pad::stream(2, ChannelKind::Audio),
            44100,
            lbl("o0rl0", ChannelKind::Audio),
        );
        assert!(f.to_string().starts_with("[2:a]aresample=osr=44100,"));
    }

    #[test]
    fn test_num_formatting() {
        assert_eq!(num(3.0), "3");
        assert_eq!(num(1.5 + 0.4), "1.9");
        assert_eq!(num(-0.0), "0");
        assert_eq!(num(0.125), "0.125");
    }

    #[test]
    fn test_validate_rejects_dangling_pad() {
        let mut graph = FilterGraph::new();
        graph.push(copy(lbl("ghost", ChannelKind::Video), lbl("out", ChannelKind::Video)));
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("dangling"));
    }

    #[test]
    fn test_validate_rejects_duplicate_producer() {
        let mut graph = FilterGraph::new();
        let out = lbl("x", ChannelKind::Audio);
        graph.push(silent_source(1.0, 44100, out.clone()));
        graph.push(silent_source(2.0, 44100, out));
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("more than one producer"));
    }

    #[test]
    fn test_validate_rejects_double_consumption() {
        let mut graph = FilterGraph::new();
        let src = lbl("s", ChannelKind::Audio);
        graph.push(silent_source(1.0, 44100, src.clone()));
        graph.push(acopy(src.clone(), lbl("c1", ChannelKind::Audio)));
        graph.push(acopy(src, lbl("c2", ChannelKind::Audio)));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_unconsumed_and_render() {
        let mut graph = FilterGraph::new();
        let src = lbl("s", ChannelKind::Audio);
        let out = lbl("o", ChannelKind::Audio);
        graph.push(silent_source(1.0, 48000, src.clone()));
        graph.push(acopy(src, out.clone()));
        graph.validate().unwrap();
        assert_eq!(graph.unconsumed(), vec![out]);
        assert_eq!(
            graph.render(),
            "anullsrc=r=48000:cl=stereo:d=1[s:a];[s:a]acopy[o:a]"
        );
    }

    #[test]
    fn test_resolution_parse() {
        let r: Resolution = "1280x720".parse().unwrap();
        assert_eq!(r, Resolution::new(1280, 720));
        assert!(r.is_even());
        assert!(!Resolution::new(1279, 720).is_even());
        assert!("1280".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_volume_envelope_expression() {
        let env = VolumeEnvelope::new(vec![(2.0, 1.0), (0.0, 0.5)]);
        assert_eq!(env.points()[0], (0.0, 0.5));
        assert_eq!(env.expression(), "if(lt(t,2),0.5+(0.5)*(t-0)/2,1)");

        let held = VolumeEnvelope::new(vec![(1.0, 0.1)]);
        assert_eq!(held.expression(), "if(lt(t,1),0.1,0.1)");

        assert_eq!(VolumeEnvelope::default().expression(), "1");
    }
}
