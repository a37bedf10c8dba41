//! Timeline to filter graph compilation.
//!
//! Layers are folded into a stack of segment labels. A layer starting
//! `after` seconds into the previous one pads the previous segment with a
//! blank filler and trims it back, so the compiler never needs to know how
//! long a source really is. Transitions blend the tail of the padded previous
//! segment into the head of the new layer.
//!
//! Labels are derived from the output index and the layer or overlay
//! position. The output index is always followed by a non-digit, so labels
//! stay unique across every output of a process.

use std::sync::Arc;

use reelforge_av::filter::{self, ChannelKind, FilterGraph, Label};
use reelforge_av::{intermediate_extension, FifoBuffer};
use reelforge_common::{Error, Result};
use tracing::{debug, info};

use super::{Output, Routing, Sink};
use crate::channel::{AudioChannel, VideoChannel};
use crate::duck::DuckJob;
use crate::process::CompileContext;

/// Emits per-channel fragments for the channels an output carries.
struct Emitter<'a> {
    video: Option<&'a VideoChannel>,
    audio: Option<&'a AudioChannel>,
    graph: FilterGraph,
}

impl Emitter<'_> {
    fn filler(&mut self, duration: f64, out: &Label) {
        if let Some(video) = self.video {
            self.graph.push(filter::blank_source(
                duration,
                video.resolution,
                video.fps,
                out.pad(ChannelKind::Video),
            ));
        }
        if let Some(audio) = self.audio {
            self.graph.push(filter::silent_source(
                duration,
                audio.sampling_freq,
                out.pad(ChannelKind::Audio),
            ));
        }
    }

    fn concat(&mut self, inputs: &[Label], out: &Label) {
        if self.video.is_some() {
            let pads = inputs.iter().map(|l| l.pad(ChannelKind::Video)).collect();
            self.graph.push(filter::concat_v(pads, out.pad(ChannelKind::Video)));
        }
        if self.audio.is_some() {
            let pads = inputs.iter().map(|l| l.pad(ChannelKind::Audio)).collect();
            self.graph.push(filter::concat_a(pads, out.pad(ChannelKind::Audio)));
        }
    }

    fn split(&mut self, input: &Label, outs: [&Label; 2]) {
        if self.video.is_some() {
            let pads = outs.iter().map(|l| l.pad(ChannelKind::Video)).collect();
            self.graph.push(filter::split(input.pad(ChannelKind::Video), pads));
        }
        if self.audio.is_some() {
            let pads = outs.iter().map(|l| l.pad(ChannelKind::Audio)).collect();
            self.graph.push(filter::asplit(input.pad(ChannelKind::Audio), pads));
        }
    }

    fn trim(&mut self, start: f64, end: f64, input: &Label, out: &Label) {
        if self.video.is_some() {
            self.graph.push(filter::trim(
                start,
                end,
                input.pad(ChannelKind::Video),
                out.pad(ChannelKind::Video),
            ));
        }
        if self.audio.is_some() {
            self.graph.push(filter::atrim(
                start,
                end,
                input.pad(ChannelKind::Audio),
                out.pad(ChannelKind::Audio),
            ));
        }
    }

    fn blend(&mut self, length: f64, from: &Label, into: &Label, out: &Label) {
        if self.video.is_some() {
            self.graph.push(filter::blend_v(
                length,
                [from.pad(ChannelKind::Video), into.pad(ChannelKind::Video)],
                out.pad(ChannelKind::Video),
            ));
        }
        if self.audio.is_some() {
            self.graph.push(filter::blend_a(
                length,
                [from.pad(ChannelKind::Audio), into.pad(ChannelKind::Audio)],
                out.pad(ChannelKind::Audio),
            ));
        }
    }
}

pub(super) fn compile(output: &Output, ctx: &mut CompileContext) -> Result<(FilterGraph, Routing)> {
    let idx = output.index;
    if output.layers.is_empty() {
        return Err(Error::configuration("Nothing to roll"));
    }
    if let Some(i) = output.layers.iter().position(|l| !l.is_full_screen()) {
        return Err(Error::configuration(format!(
            "Layer #{i} of output #{idx} is not full-screen; only full-screen layers are implemented"
        )));
    }

    let mut emit = Emitter {
        video: output.video.as_ref(),
        audio: output.audio.as_ref(),
        graph: FilterGraph::new(),
    };

    // Concatenation
    let mut segments: Vec<Option<Label>> = Vec::new();

    for (i, layer) in output.layers.iter().enumerate() {
        let mut lbl = None;

        if let Some(reel) = layer.reel() {
            let reel_lbl = Label::new(format!("o{idx}rl{i}"));
            debug!(
                "output #{idx} asking for filters of {} (video: {}, audio: {})",
                reel.describe(),
                emit.video.is_some(),
                emit.audio.is_some()
            );
            emit.graph
                .extend(reel.filters_for(&reel_lbl, emit.video, emit.audio)?);
            lbl = Some(reel_lbl);
        }

        let transition_length = layer.transition_spec().map_or(0.0, |t| t.length());
        let trim_prev_at = layer
            .after_secs()
            .or_else(|| layer.transition_spec().map(|_| 0.0));

        if let Some(trim_prev_at) = trim_prev_at {
            let prev = segments.pop().flatten();
            let stem = prev
                .as_ref()
                .map_or_else(|| format!("o{idx}"), |p| p.to_string());

            // Pad the previous segment generously, then trim it to size.
            let mut padded = Label::new(format!("bl{stem}_{i}"));
            emit.filler(trim_prev_at + transition_length, &padded);
            if let Some(prev) = &prev {
                let filler = padded;
                padded = Label::new(format!("pd{stem}_{i}"));
                emit.concat(&[prev.clone(), filler], &padded);
            }

            let (kept, tail) = match layer.transition_spec() {
                Some(_) if trim_prev_at > 0.0 => {
                    let (a, b) = (padded.suffixed("a"), padded.suffixed("b"));
                    emit.split(&padded, [&a, &b]);
                    (Some(a), Some(b))
                }
                Some(_) => (None, Some(padded)),
                None => (Some(padded), None),
            };

            if let Some(kept) = kept {
                let trimmed = Label::new(format!("tm{stem}_{i}a"));
                emit.trim(0.0, trim_prev_at, &kept, &trimmed);
                debug!("Concatting segments: {trimmed} pushed");
                segments.push(Some(trimmed));
            }

            if let Some(tail) = tail {
                let incoming = match lbl.take() {
                    Some(lbl) => lbl,
                    None => {
                        let blank = Label::new(format!("o{idx}bk{i}"));
                        emit.filler(transition_length, &blank);
                        blank
                    }
                };
                let tail_end = Label::new(format!("o{idx}tm{i}b"));
                emit.trim(
                    trim_prev_at,
                    trim_prev_at + transition_length,
                    &tail,
                    &tail_end,
                );
                let blended = Label::new(format!("o{idx}tn{i}"));
                emit.blend(transition_length, &tail_end, &incoming, &blended);
                lbl = Some(blended);
            }
        }

        segments.push(lbl);
    }

    let segments: Vec<Label> = segments.into_iter().flatten().collect();
    debug!("output #{idx}: {} segment(s) to concat", segments.len());
    let mut out = match segments.as_slice() {
        [] => return Err(Error::configuration("Nothing to roll (every layer is blank)")),
        [single] => single.clone(),
        _ => {
            let out = Label::new(format!("o{idx}o"));
            emit.concat(&segments, &out);
            out
        }
    };

    // In-process overlays first
    for (i, overlay) in output.overlays.iter().enumerate() {
        if overlay.ducking().is_some() {
            continue;
        }
        if overlay.reel().has_channel(ChannelKind::Video) {
            return Err(Error::configuration(format!(
                "Video overlays are not implemented ({})",
                overlay.reel().describe()
            )));
        }
        let Some(audio) = emit.audio else {
            return Err(Error::configuration(format!(
                "Output #{idx} has no audio to overlay {} on",
                overlay.reel().describe()
            )));
        };

        let over = Label::new(format!("o{idx}l{i}"));
        let next = Label::new(format!("o{idx}o{i}"));
        emit.graph
            .extend(overlay.reel().filters_for(&over, None, Some(audio))?);
        if emit.video.is_some() {
            emit.graph.push(filter::copy(
                out.pad(ChannelKind::Video),
                next.pad(ChannelKind::Video),
            ));
        }
        emit.graph.push(filter::amix_to_first_same_volume(
            vec![out.pad(ChannelKind::Audio), over.pad(ChannelKind::Audio)],
            next.pad(ChannelKind::Audio),
        ));
        out = next;
    }

    let mut routing = Routing::new();
    for kind in output.channels() {
        routing.route(out.pad(kind), output.sink.clone());
    }

    // Cross-process overlays last
    for (i, overlay) in output.overlays.iter().enumerate() {
        if overlay.ducking() != Some(ChannelKind::Audio) {
            continue;
        }
        let audio = emit
            .audio
            .ok_or_else(|| Error::configuration("Main output does not contain audio to duck"))?;
        let main_sink = routing
            .sink_of(&out.pad(ChannelKind::Audio))
            .cloned()
            .ok_or_else(|| Error::configuration("Main output does not contain audio to duck"))?;

        info!("ATTENTION: ducking audio does not stream the main input; it is materialised first");

        let main_video = routing
            .pads_into(&main_sink)
            .iter()
            .any(|pad| pad.kind() == ChannelKind::Video);
        let main_fifo = FifoBuffer::spawn(
            &ctx.worker,
            &ctx.workspace,
            intermediate_extension(main_video, true),
            &ctx.settings.fifo,
        )?;
        routing.reroute(&main_sink, Sink::intermediate(main_fifo.input()));
        debug!(
            "Re-routed the main audio output ({}->...->{}) through the process of audio ducking",
            main_fifo.input().display(),
            main_sink.path().display()
        );

        let over_fifo = FifoBuffer::spawn(
            &ctx.worker,
            &ctx.workspace,
            intermediate_extension(false, true),
            &ctx.settings.fifo,
        )?;
        let over = Label::new(format!("o{idx}l{i}"));
        emit.graph
            .extend(overlay.reel().filters_for(&over, None, Some(audio))?);
        routing.route(
            over.pad(ChannelKind::Audio),
            Sink::intermediate(over_fifo.input()),
        );
        debug!(
            "Routed and buffering auxiliary output fifos ({}>{}) for overlay",
            over_fifo.input().display(),
            over_fifo.output().display()
        );

        // The ducking pass may close the overlay pipe early.
        let ignore_broken_pipes_was = ctx.ignore_broken_pipes;
        ctx.ignore_broken_pipes = true;

        let job = DuckJob {
            main: main_fifo,
            overlay: over_fifo,
            sink: main_sink.path().to_path_buf(),
            video: emit.video.filter(|_| main_video).cloned(),
            audio: audio.clone(),
            ignore_broken_pipes: ignore_broken_pipes_was,
            settings: Arc::clone(&ctx.settings),
            workspace: Arc::clone(&ctx.workspace),
        };
        let handle = ctx
            .worker
            .spawn("audio ducking", move |worker| job.run(worker));
        ctx.pending.push(handle);
    }

    Ok((emit.graph, routing))
}
