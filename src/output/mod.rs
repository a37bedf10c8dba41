//! Outputs: a timeline of layers and overlays bound to a sink.
//!
//! Layers and overlays are checked as they are declared. Compiling an output
//! turns its timeline into a [`FilterGraph`] plus a [`Routing`] of the
//! graph's final pads, and can happen exactly once.

mod compile;
mod routing;

pub use routing::{Routing, Sink};

use std::path::PathBuf;

use reelforge_av::{ChannelKind, FilterGraph};
use reelforge_common::{Error, Result};
use tracing::warn;

use crate::channel::{AudioChannel, VideoChannel};
use crate::process::CompileContext;
use crate::timeline::{Layer, Overlay};

#[derive(Debug)]
enum State {
    Uncompiled,
    Compiled { graph: FilterGraph, routing: Routing },
}

/// One output of a process.
#[derive(Debug)]
pub struct Output {
    index: usize,
    sink: Sink,
    video: Option<VideoChannel>,
    audio: Option<AudioChannel>,
    layers: Vec<Layer>,
    overlays: Vec<Overlay>,
    state: State,
}

impl Output {
    /// Declare output number `index` writing to `sink`.
    ///
    /// A channel left as `None` is not produced.
    pub fn new(
        index: usize,
        sink: impl Into<PathBuf>,
        video: Option<VideoChannel>,
        audio: Option<AudioChannel>,
    ) -> Result<Self> {
        if let Some(video) = &video {
            if !video.resolution.is_even() {
                return Err(Error::configuration(format!(
                    "Both dimensions of a resolution must be divisible by 2 (got {})",
                    video.resolution
                )));
            }
        }
        if video.is_none() && audio.is_none() {
            return Err(Error::configuration("An output needs a video or an audio channel"));
        }

        let sink = Sink::detect(sink);
        if !sink.is_intermediate() && sink.path().exists() {
            warn!(
                "Output file exists ({}), will probably overwrite",
                sink.path().display()
            );
        }

        Ok(Self {
            index,
            sink,
            video,
            audio,
            layers: Vec::new(),
            overlays: Vec::new(),
            state: State::Uncompiled,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sink(&self) -> &Sink {
        &self.sink
    }

    pub fn video(&self) -> Option<&VideoChannel> {
        self.video.as_ref()
    }

    pub fn audio(&self) -> Option<&AudioChannel> {
        self.audio.as_ref()
    }

    pub fn has_channel(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Video => self.video.is_some(),
            ChannelKind::Audio => self.audio.is_some(),
        }
    }

    /// Channels this output produces, video first.
    pub fn channels(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL
            .into_iter()
            .filter(|kind| self.has_channel(*kind))
            .collect()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn overlays(&self) -> &[Overlay] {
        &self.overlays
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.state, State::Compiled { .. })
    }

    /// Append a layer to the timeline.
    pub fn roll(&mut self, layer: Layer) -> Result<&mut Self> {
        self.ensure_uncompiled()?;

        if let Some(after) = layer.after_secs() {
            if !after.is_finite() || after <= 0.0 {
                return Err(Error::configuration(format!("No time to roll (after: {after})")));
            }
        }
        if layer.transition_spec().is_some()
            && layer.after_secs().is_none()
            && !self.layers.is_empty()
        {
            return Err(Error::configuration(
                "Supporting transition with after only",
            ));
        }
        if !self.overlays.is_empty() {
            warn!("Overlays are over all the layers, so they'd better be after all the layers in the script");
        }

        self.layers.push(layer);
        Ok(self)
    }

    /// Put an overlay over the whole timeline.
    pub fn overlay(&mut self, overlay: Overlay) -> Result<&mut Self> {
        self.ensure_uncompiled()?;

        if self.layers.is_empty() {
            return Err(Error::configuration(
                "Overlays are over all the layers; roll a layer first",
            ));
        }
        if overlay.at_secs() != 0.0 {
            return Err(Error::configuration(format!(
                "Partial overlays are not supported (at: {})",
                overlay.at_secs()
            )));
        }
        match overlay.ducking() {
            Some(ChannelKind::Video) => {
                return Err(Error::configuration("Don't know how to duck video"));
            }
            None if self.overlays.last().is_some_and(|o| o.ducking().is_some()) => {
                return Err(Error::configuration("Ducking overlays should come last"));
            }
            _ => {}
        }

        self.overlays.push(overlay);
        Ok(self)
    }

    /// Compile the timeline; a second call fails with
    /// [`Error::AlreadyCompiled`].
    pub fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        self.ensure_uncompiled()?;

        let (graph, routing) = compile::compile(self, ctx)?;
        graph.validate()?;

        let mut routed: Vec<_> = routing.pads().cloned().collect();
        let mut open = graph.unconsumed();
        routed.sort_by_key(ToString::to_string);
        open.sort_by_key(ToString::to_string);
        if routed != open {
            return Err(Error::system(format!(
                "output #{} routes [{}] but leaves [{}] open",
                self.index,
                join_pads(&routed),
                join_pads(&open)
            )));
        }

        self.state = State::Compiled { graph, routing };
        Ok(())
    }

    pub fn graph(&self) -> Option<&FilterGraph> {
        match &self.state {
            State::Compiled { graph, .. } => Some(graph),
            State::Uncompiled => None,
        }
    }

    pub fn routing(&self) -> Option<&Routing> {
        match &self.state {
            State::Compiled { routing, .. } => Some(routing),
            State::Uncompiled => None,
        }
    }

    /// `-map` arguments per destination, then codec options, then the path.
    pub fn args(&self) -> Result<Vec<String>> {
        let routing = self
            .routing()
            .ok_or_else(|| Error::configuration("Must compile the output first"))?;

        let mut args = Vec::new();
        for (sink, pads) in routing.by_destination() {
            for pad in pads {
                args.push("-map".to_string());
                args.push(format!("[{pad}]"));
            }
            if !sink.is_intermediate() {
                if let Some(video) = &self.video {
                    args.extend(video.args());
                }
                if let Some(audio) = &self.audio {
                    args.extend(audio.args());
                }
            }
            args.push(sink.path().to_string_lossy().to_string());
        }
        Ok(args)
    }

    fn ensure_uncompiled(&self) -> Result<()> {
        if self.is_compiled() {
            return Err(Error::AlreadyCompiled { output: self.index });
        }
        Ok(())
    }
}

fn join_pads(pads: &[reelforge_av::Pad]) -> String {
    pads.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
