#![forbid(unsafe_code)]

//! Collaborator interfaces: fragment loading and transmuxing.
//!
//! Both are fire-and-forget from the scheduler's point of view;
//! completions are delivered back by the collaborator's owner through
//! [`Scheduler::on_frag_loaded`], [`Scheduler::on_init_loaded`],
//! [`Scheduler::on_transmux_complete`], or an `Error` event on the bus.
//!
//! [`Scheduler::on_frag_loaded`]: crate::Scheduler::on_frag_loaded
//! [`Scheduler::on_init_loaded`]: crate::Scheduler::on_init_loaded
//! [`Scheduler::on_transmux_complete`]: crate::Scheduler::on_transmux_complete

use bytes::Bytes;
use segue_core::{FragKey, TrackInfo, TrackKind};
use url::Url;

/// Why a fragment is being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    /// Codec-init bytes for the level.
    Init,
    /// Start-up bandwidth probe; the payload is measured, not buffered.
    BitrateTest,
    Playback,
}

/// One fragment fetch handed to the loader.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub frag: FragKey,
    pub url: Url,
    pub kind: LoadKind,
}

/// Fetches fragment payloads. At most one load is in flight per
/// scheduler; `abort` cancels it.
pub trait FragmentLoader: Send {
    fn load(&mut self, request: LoadRequest);
    fn abort(&mut self);
}

/// One fragment payload handed to the transmuxer.
#[derive(Debug, Clone)]
pub struct TransmuxJob {
    pub frag: FragKey,
    pub cc: u32,
    pub data: Bytes,
    /// Level init segment bytes, when the container needs them.
    pub init_data: Option<Bytes>,
}

/// Repackages fragment payloads into sink-ready track data.
pub trait Transmuxer: Send {
    fn push(&mut self, job: TransmuxJob);
    /// Drop demuxer state so the next fragment regenerates init segments.
    fn destroy(&mut self);
}

/// Parsed samples for one elementary stream.
#[derive(Debug, Clone)]
pub struct TrackPayload {
    pub kind: TrackKind,
    pub data: Bytes,
    pub start_pts: f64,
    pub end_pts: f64,
    pub start_dts: f64,
    pub end_dts: f64,
    /// Frames dropped before the first keyframe (video only).
    pub dropped: u32,
}

/// One generated init track: codec description plus init bytes.
#[derive(Debug, Clone)]
pub struct InitTrack {
    pub info: TrackInfo,
    pub data: Option<Bytes>,
}

/// Init information produced while parsing a fragment.
#[derive(Debug, Clone)]
pub struct ParsedInit {
    pub tracks: Vec<InitTrack>,
    /// `(cc, pts)` of the first sample after a discontinuity.
    pub init_pts: Option<(u32, f64)>,
}

/// Completion payload of one transmux job.
#[derive(Debug, Clone)]
pub struct TransmuxResult {
    pub frag: FragKey,
    pub init: Option<ParsedInit>,
    pub audio: Option<TrackPayload>,
    pub video: Option<TrackPayload>,
    /// Timed ID3 samples, passed through opaquely.
    pub id3: Option<Bytes>,
    /// Subtitle/caption samples, passed through opaquely.
    pub text: Option<Bytes>,
}

impl TransmuxResult {
    pub fn new(frag: FragKey) -> Self {
        Self {
            frag,
            init: None,
            audio: None,
            video: None,
            id3: None,
            text: None,
        }
    }
}
