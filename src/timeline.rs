//! Timeline entries: layers, overlays and transitions.
//!
//! These are plain values. They are built up front, handed to an
//! [`Output`](crate::output::Output) and never changed afterwards; the output
//! checks them as they are declared.

use std::fmt;
use std::sync::Arc;

use reelforge_av::ChannelKind;
use reelforge_common::{Error, Result};

use crate::reel::Reel;

/// A cross-blend between the end of the previous layer and the start of the
/// next one. Blending is the only transition there is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    length: f64,
}

impl Transition {
    /// A cross-blend lasting `length` seconds.
    pub fn blend(length: f64) -> Result<Self> {
        if !length.is_finite() || length <= 0.0 {
            return Err(Error::configuration(format!(
                "Transition length must be positive (length: {length})"
            )));
        }
        Ok(Self { length })
    }

    /// A transition by kind name; only `blend` is known.
    pub fn new(kind: &str, length: f64) -> Result<Self> {
        match kind {
            "blend" => Self::blend(length),
            other => Err(Error::configuration(format!(
                "Unknown transition `{other}`; only `blend` is supported"
            ))),
        }
    }

    pub fn length(&self) -> f64 {
        self.length
    }
}

/// One sequential entry of an output's timeline.
#[derive(Clone)]
pub struct Layer {
    reel: Option<Arc<dyn Reel>>,
    after: Option<f64>,
    transition: Option<Transition>,
    full_screen: bool,
}

impl Layer {
    pub fn new(reel: impl Reel + 'static) -> Self {
        Self::shared(Arc::new(reel))
    }

    pub fn shared(reel: Arc<dyn Reel>) -> Self {
        Self {
            reel: Some(reel),
            after: None,
            transition: None,
            full_screen: true,
        }
    }

    /// A layer without a source: blank video and silent audio.
    pub fn blank() -> Self {
        Self {
            reel: None,
            after: None,
            transition: None,
            full_screen: true,
        }
    }

    /// Start this layer `secs` into the previous one, cutting it there.
    pub fn after(mut self, secs: f64) -> Self {
        self.after = Some(secs);
        self
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.transition = Some(transition);
        self
    }

    /// Place the layer inside the frame instead of over all of it.
    pub fn windowed(mut self) -> Self {
        self.full_screen = false;
        self
    }

    pub fn reel(&self) -> Option<&Arc<dyn Reel>> {
        self.reel.as_ref()
    }

    pub fn after_secs(&self) -> Option<f64> {
        self.after
    }

    pub fn transition_spec(&self) -> Option<&Transition> {
        self.transition.as_ref()
    }

    pub fn is_full_screen(&self) -> bool {
        self.full_screen
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("reel", &self.reel.as_ref().map(|r| r.describe()))
            .field("after", &self.after)
            .field("transition", &self.transition)
            .field("full_screen", &self.full_screen)
            .finish()
    }
}

/// A source mixed over the whole assembled timeline.
#[derive(Clone)]
pub struct Overlay {
    reel: Arc<dyn Reel>,
    at: f64,
    duck: Option<ChannelKind>,
}

impl Overlay {
    pub fn new(reel: impl Reel + 'static) -> Self {
        Self::shared(Arc::new(reel))
    }

    pub fn shared(reel: Arc<dyn Reel>) -> Self {
        Self {
            reel,
            at: 0.0,
            duck: None,
        }
    }

    /// Start the overlay `secs` into the timeline.
    pub fn at(mut self, secs: f64) -> Self {
        self.at = secs;
        self
    }

    /// Duck the given channel of the main timeline under this overlay.
    pub fn duck(mut self, kind: ChannelKind) -> Self {
        self.duck = Some(kind);
        self
    }

    pub fn reel(&self) -> &Arc<dyn Reel> {
        &self.reel
    }

    pub fn at_secs(&self) -> f64 {
        self.at
    }

    pub fn ducking(&self) -> Option<ChannelKind> {
        self.duck
    }
}

impl fmt::Debug for Overlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overlay")
            .field("reel", &self.reel.describe())
            .field("at", &self.at)
            .field("duck", &self.duck)
            .finish()
    }
}
