//! Routing of compiled output pads to their destinations.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use reelforge_av::Pad;

/// Where routed pads are written.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sink {
    path: PathBuf,
    intermediate: bool,
}

impl Sink {
    /// A final media file, encoded with the output's channel options.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            intermediate: false,
        }
    }

    /// An inter-stage pipe, left to the container's default codecs.
    pub fn intermediate(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            intermediate: true,
        }
    }

    /// A named pipe is intermediate, anything else is a file.
    pub fn detect(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let intermediate = std::fs::metadata(&path)
            .map(|m| m.file_type().is_fifo())
            .unwrap_or(false);
        Self { path, intermediate }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_intermediate(&self) -> bool {
        self.intermediate
    }
}

/// Ordered map from output pads to sinks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routing {
    routes: Vec<(Pad, Sink)>,
}

impl Routing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `pad` to `sink`, replacing an earlier route of the same pad.
    pub fn route(&mut self, pad: Pad, sink: Sink) {
        match self.routes.iter_mut().find(|(p, _)| *p == pad) {
            Some(route) => route.1 = sink,
            None => self.routes.push((pad, sink)),
        }
    }

    pub fn sink_of(&self, pad: &Pad) -> Option<&Sink> {
        self.routes.iter().find(|(p, _)| p == pad).map(|(_, s)| s)
    }

    /// Point every route into `from` at `to` instead; returns how many moved.
    pub fn reroute(&mut self, from: &Sink, to: Sink) -> usize {
        let mut moved = 0;
        for (_, sink) in self.routes.iter_mut().filter(|(_, s)| s == from) {
            *sink = to.clone();
            moved += 1;
        }
        moved
    }

    /// Pads routed into `sink`, in routing order.
    pub fn pads_into(&self, sink: &Sink) -> Vec<&Pad> {
        self.routes
            .iter()
            .filter(|(_, s)| s == sink)
            .map(|(p, _)| p)
            .collect()
    }

    /// Routes grouped by sink, sinks in order of first appearance.
    pub fn by_destination(&self) -> Vec<(&Sink, Vec<&Pad>)> {
        let mut groups: Vec<(&Sink, Vec<&Pad>)> = Vec::new();
        for (pad, sink) in &self.routes {
            match groups.iter_mut().find(|(s, _)| *s == sink) {
                Some((_, pads)) => pads.push(pad),
                None => groups.push((sink, vec![pad])),
            }
        }
        groups
    }

    pub fn pads(&self) -> impl Iterator<Item = &Pad> {
        self.routes.iter().map(|(p, _)| p)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelforge_av::{ChannelKind, Label};

    #[test]
    fn test_reroute_keeps_positions() {
        let out = Label::new("o0o");
        let over = Label::new("o0l0");
        let file = Sink::file("/tmp/out.mp4");
        let fifo = Sink::intermediate("/tmp/ws/in-0.mkv");

        let mut routing = Routing::new();
        routing.route(out.pad(ChannelKind::Video), file.clone());
        routing.route(out.pad(ChannelKind::Audio), file.clone());
        assert_eq!(routing.reroute(&file, fifo.clone()), 2);
        routing.route(over.pad(ChannelKind::Audio), Sink::intermediate("/tmp/ws/in-1.wav"));

        let groups = routing.by_destination();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, &fifo);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(routing.sink_of(&out.pad(ChannelKind::Audio)), Some(&fifo));
        assert!(routing.pads_into(&file).is_empty());
    }

    #[test]
    fn test_detect_regular_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(!Sink::detect(file.path()).is_intermediate());
        assert!(!Sink::detect("/nonexistent/out.mp4").is_intermediate());
    }
}
