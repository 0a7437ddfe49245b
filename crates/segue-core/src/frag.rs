#![forbid(unsafe_code)]

//! Fragment identity, timing attributes, and load statistics.

use std::time::Instant;

use url::Url;

/// Identity of a fragment: quality level index plus sequence number.
///
/// Sequence numbers are monotone within a level, so `(level, sn)` is a
/// stable handle even while a live playlist slides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragKey {
    pub level: usize,
    pub sn: u64,
}

impl FragKey {
    pub fn new(level: usize, sn: u64) -> Self {
        Self { level, sn }
    }
}

/// One elementary stream kind inside a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementaryStream {
    Audio,
    Video,
}

/// Which elementary streams a parsed fragment carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElementaryStreams {
    pub audio: bool,
    pub video: bool,
}

impl ElementaryStreams {
    pub fn contains(&self, kind: ElementaryStream) -> bool {
        match kind {
            ElementaryStream::Audio => self.audio,
            ElementaryStream::Video => self.video,
        }
    }

    pub fn insert(&mut self, kind: ElementaryStream) {
        match kind {
            ElementaryStream::Audio => self.audio = true,
            ElementaryStream::Video => self.video = true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

/// Timing marks and byte counters for one fragment load.
#[derive(Debug, Clone, Copy, Default)]
pub struct FragStats {
    pub requested_at: Option<Instant>,
    pub first_byte_at: Option<Instant>,
    pub loaded_at: Option<Instant>,
    pub parsed_at: Option<Instant>,
    pub buffered_at: Option<Instant>,
    pub loaded_bytes: u64,
    pub total_bytes: u64,
}

/// One fetchable media fragment from a level playlist.
///
/// `start`/`duration`/`cc` come from the playlist; the PTS/DTS fields are
/// filled in after the fragment has been demuxed and stay attached across
/// live playlist reloads (see `LevelDetails` merging).
#[derive(Debug, Clone)]
pub struct Fragment {
    pub key: FragKey,
    /// Playlist-relative start time in seconds.
    pub start: f64,
    pub duration: f64,
    /// Discontinuity counter, non-decreasing within a level.
    pub cc: u32,
    /// Wall-clock timestamp of the first sample, seconds since the epoch.
    pub program_date_time: Option<f64>,
    pub end_program_date_time: Option<f64>,
    pub encrypted: bool,
    pub url: Url,

    /// Presentation timestamp bounds, known once parsed.
    pub start_pts: Option<f64>,
    pub end_pts: Option<f64>,
    pub start_dts: Option<f64>,
    pub end_dts: Option<f64>,
    /// Largest per-track start PTS seen for this fragment (audio and video
    /// tracks may not start at the same instant).
    pub max_start_pts: Option<f64>,
    /// Audio/video start gap in seconds.
    pub delta_pts: f64,
    /// Video frames dropped before the first keyframe.
    pub dropped: u32,
    /// Set when the fragment parsed with dropped leading frames and its
    /// predecessor must be reloaded to recover the keyframe.
    pub backtracked: bool,
    pub elementary_streams: ElementaryStreams,
    pub stats: FragStats,
}

impl Fragment {
    pub fn new(key: FragKey, start: f64, duration: f64, cc: u32, url: Url) -> Self {
        Self {
            key,
            start,
            duration,
            cc,
            program_date_time: None,
            end_program_date_time: None,
            encrypted: false,
            url,
            start_pts: None,
            end_pts: None,
            start_dts: None,
            end_dts: None,
            max_start_pts: None,
            delta_pts: 0.0,
            dropped: 0,
            backtracked: false,
            elementary_streams: ElementaryStreams::default(),
            stats: FragStats::default(),
        }
    }

    pub fn sn(&self) -> u64 {
        self.key.sn
    }

    pub fn level(&self) -> usize {
        self.key.level
    }

    /// Playlist end time (`start + duration`).
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Whether `pos` falls inside the playlist time range of this fragment.
    pub fn covers(&self, pos: f64) -> bool {
        pos >= self.start && pos < self.end()
    }

    /// Copy parse-derived attributes from a previous incarnation of the
    /// same `(sn, cc)` fragment. Used when live playlist reloads replace
    /// the fragment object.
    pub fn inherit_from(&mut self, prev: &Fragment) {
        self.start_pts = prev.start_pts;
        self.end_pts = prev.end_pts;
        self.start_dts = prev.start_dts;
        self.end_dts = prev.end_dts;
        self.max_start_pts = prev.max_start_pts;
        self.delta_pts = prev.delta_pts;
        self.dropped = prev.dropped;
        self.backtracked = prev.backtracked;
        self.elementary_streams = prev.elementary_streams;
        self.stats = prev.stats;
        if let Some(start_pts) = prev.start_pts {
            self.start = start_pts;
        }
    }
}
