#![forbid(unsafe_code)]

//! Per-fragment lifecycle state, keyed by `(level, sn)`.

use std::collections::HashMap;

use segue_core::{ElementaryStream, ElementaryStreams, FragKey};
use tracing::debug;

use crate::buffer::TimeRanges;

/// Boundary slack when deciding whether a fragment's PTS range is fully
/// present in the buffer.
const COVERAGE_TOLERANCE: f64 = 0.2;

/// Load/append lifecycle of one fragment.
///
/// Only `NotLoaded` and `Partial` fragments are eligible for scheduling
/// (backtracked fragments bypass the gate entirely).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragState {
    NotLoaded,
    Loading,
    /// Appended, but part of its time range has since been evicted.
    Partial,
    /// Payloads handed to the sink, append completion still pending.
    Appending,
    Ok,
}

/// Tracked PTS extent of a fragment, as last reported by the parser.
#[derive(Debug, Clone, Copy)]
pub struct BufferedFrag {
    pub key: FragKey,
    pub start_pts: f64,
    pub end_pts: f64,
    pub max_start_pts: Option<f64>,
}

#[derive(Debug)]
struct TrackedFragment {
    state: FragState,
    start_pts: Option<f64>,
    end_pts: Option<f64>,
    max_start_pts: Option<f64>,
    streams: ElementaryStreams,
}

/// Tracks fragment lifecycle state and evicts entries whose time range
/// has left the buffered set.
#[derive(Debug, Default)]
pub struct FragmentTracker {
    frags: HashMap<FragKey, TrackedFragment>,
}

impl FragmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduling gate: state of the fragment, `NotLoaded` when untracked.
    pub fn state(&self, key: FragKey) -> FragState {
        self.frags.get(&key).map_or(FragState::NotLoaded, |f| f.state)
    }

    /// A load has been issued for the fragment.
    pub fn loading(&mut self, key: FragKey) {
        let entry = self.frags.entry(key).or_insert(TrackedFragment {
            state: FragState::Loading,
            start_pts: None,
            end_pts: None,
            max_start_pts: None,
            streams: ElementaryStreams::default(),
        });
        entry.state = FragState::Loading;
    }

    /// Parsed payloads have been handed to the sink.
    pub fn appending(
        &mut self,
        key: FragKey,
        start_pts: f64,
        end_pts: f64,
        max_start_pts: Option<f64>,
        streams: ElementaryStreams,
    ) {
        self.frags.insert(
            key,
            TrackedFragment {
                state: FragState::Appending,
                start_pts: Some(start_pts),
                end_pts: Some(end_pts),
                max_start_pts,
                streams,
            },
        );
    }

    /// All sub-appends for the fragment have drained. Returns the new
    /// state: `Ok` when the full PTS range is present, `Partial` when part
    /// of it is already missing.
    pub fn buffered(&mut self, key: FragKey, buffered: &TimeRanges) -> FragState {
        let Some(entry) = self.frags.get_mut(&key) else {
            return FragState::NotLoaded;
        };
        let state = match (entry.start_pts, entry.end_pts) {
            (Some(start), Some(end)) if buffered.covers(start, end, COVERAGE_TOLERANCE) => {
                FragState::Ok
            }
            _ => FragState::Partial,
        };
        entry.state = state;
        state
    }

    /// Downgrade tracked fragments whose time range has left the buffered
    /// set for the given elementary stream.
    pub fn detect_evicted(&mut self, kind: ElementaryStream, buffered: &TimeRanges) {
        self.frags.retain(|key, entry| {
            if !entry.streams.contains(kind) {
                return true;
            }
            if !matches!(entry.state, FragState::Ok | FragState::Partial) {
                return true;
            }
            let (Some(start), Some(end)) = (entry.start_pts, entry.end_pts) else {
                return true;
            };
            if buffered.intersects(start, end) {
                if !buffered.covers(start, end, COVERAGE_TOLERANCE) {
                    entry.state = FragState::Partial;
                }
                true
            } else {
                debug!(level = key.level, sn = key.sn, "tracker: fragment evicted");
                false
            }
        });
    }

    /// The appended fragment whose PTS range contains `pos`.
    pub fn buffered_frag_at(&self, pos: f64) -> Option<BufferedFrag> {
        self.frags
            .iter()
            .filter(|(_, e)| matches!(e.state, FragState::Ok | FragState::Partial))
            .filter_map(|(key, e)| {
                let (start, end) = (e.start_pts?, e.end_pts?);
                (pos >= start && pos < end).then_some(BufferedFrag {
                    key: *key,
                    start_pts: start,
                    end_pts: end,
                    max_start_pts: e.max_start_pts,
                })
            })
            .min_by(|a, b| a.start_pts.total_cmp(&b.start_pts))
    }

    /// Drop one fragment's state entirely (it becomes fetchable again).
    pub fn remove(&mut self, key: FragKey) {
        self.frags.remove(&key);
    }

    pub fn clear(&mut self) {
        self.frags.clear();
    }
}
