#![forbid(unsafe_code)]

//! Event taxonomy for the scheduling core.

use bytes::Bytes;
use segue_core::{FragKey, FragStats, LevelDetails, LevelSummary, StreamTarget, TrackInfo, TrackKind};
use url::Url;

/// What went wrong, as seen by the component that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    FragLoadError,
    FragLoadTimeout,
    KeyLoadError,
    KeyLoadTimeout,
    LevelLoadError,
    LevelLoadTimeout,
    BufferFullError,
    BufferAppendError,
}

/// Error report delivered on the bus.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub fatal: bool,
    /// Fragment the error concerns, when applicable.
    pub frag: Option<FragKey>,
    /// Which stream's buffer the error concerns, when applicable.
    pub parent: Option<StreamTarget>,
    /// Set when the level controller is already retrying the failed
    /// playlist load itself.
    pub level_retry: bool,
}

/// Events exchanged between the scheduling core and its collaborators.
///
/// The same enum carries both directions: playlist/media/sink components
/// publish the events the scheduler consumes, and the scheduler publishes
/// the buffer/fragment events they consume.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    // Collaborators -> scheduler.
    MediaAttached,
    MediaDetaching,
    ManifestLoading,
    ManifestParsed {
        levels: Vec<LevelSummary>,
    },
    LevelLoaded {
        level: usize,
        details: LevelDetails,
    },
    LevelsUpdated {
        levels: Vec<LevelSummary>,
    },
    KeyLoaded {
        frag: FragKey,
    },
    FragLoadEmergencyAborted,
    BufferCreated {
        tracks: Vec<TrackKind>,
    },
    BufferAppended {
        parent: StreamTarget,
        /// Appends still queued in the sink after this one.
        pending: usize,
    },
    BufferFlushed,
    AudioTrackSwitching {
        id: usize,
        /// `None` when the track lives in the main stream (no alternate
        /// rendition fetch required).
        url: Option<Url>,
    },
    AudioTrackSwitched {
        id: usize,
    },
    Error(ErrorEvent),

    // Scheduler -> collaborators.
    BufferReset,
    BufferCodecs {
        tracks: Vec<TrackInfo>,
    },
    BufferAppending {
        kind: TrackKind,
        data: Bytes,
        parent: StreamTarget,
        frag: FragKey,
    },
    BufferFlushing {
        start_offset: f64,
        end_offset: f64,
        /// `None` flushes every track.
        kind: Option<TrackKind>,
    },
    BufferEos {
        kind: Option<TrackKind>,
    },
    KeyLoading {
        frag: FragKey,
    },
    FragLoading {
        frag: FragKey,
    },
    FragChanged {
        frag: FragKey,
    },
    FragBuffered {
        frag: FragKey,
        stats: FragStats,
    },
    FragParsingInitSegment {
        frag: FragKey,
    },
    FragParsingMetadata {
        frag: FragKey,
        samples: Bytes,
    },
    FragParsingUserdata {
        frag: FragKey,
        samples: Bytes,
    },
    InitPtsFound {
        cc: u32,
        init_pts: f64,
    },
    LevelUpdated {
        level: usize,
    },
    LevelPtsUpdated {
        level: usize,
        drift: f64,
    },
    LevelSwitched {
        level: usize,
    },
}

impl StreamEvent {
    /// Shorthand used by error paths.
    pub fn error(kind: ErrorKind, fatal: bool, frag: Option<FragKey>) -> Self {
        Self::Error(ErrorEvent {
            kind,
            fatal,
            frag,
            parent: None,
            level_retry: false,
        })
    }
}
