#![forbid(unsafe_code)]

//! Per-level playlist state: installing and merging playlist snapshots,
//! and keeping fragment PTS attributes consistent across reloads.

use segue_core::{LevelDetails, LevelSummary};
use tracing::{debug, warn};
use url::Url;

use crate::config::StreamConfig;

/// One quality level: static attributes plus the latest playlist snapshot.
#[derive(Debug, Clone)]
pub struct Level {
    pub url: Url,
    pub bitrate: Option<u64>,
    pub audio_codec: Option<String>,
    pub details: Option<LevelDetails>,
}

impl From<LevelSummary> for Level {
    fn from(summary: LevelSummary) -> Self {
        Self {
            url: summary.url,
            bitrate: summary.bitrate,
            audio_codec: summary.audio_codec,
            details: None,
        }
    }
}

/// Outcome of installing a playlist snapshot.
#[derive(Debug, Clone, Copy)]
pub struct LevelUpdate {
    pub level: usize,
    /// Whether the snapshot was merged with prior details (live reload).
    pub merged: bool,
    /// Start of the sliding window after installation.
    pub sliding: f64,
    /// Target playback position behind the live edge, live levels only.
    pub live_sync_position: Option<f64>,
}

/// Registry owning every level's details. All other components reference
/// fragments by `(level, sn)` and resolve them here at call time.
#[derive(Debug, Default)]
pub struct Levels {
    levels: Vec<Level>,
    last_loaded: Option<usize>,
}

impl Levels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_summaries(summaries: Vec<LevelSummary>) -> Self {
        Self {
            levels: summaries.into_iter().map(Level::from).collect(),
            last_loaded: None,
        }
    }

    pub fn reset(&mut self) {
        self.levels.clear();
        self.last_loaded = None;
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn get(&self, level: usize) -> Option<&Level> {
        self.levels.get(level)
    }

    pub fn bitrate(&self, level: usize) -> Option<u64> {
        self.levels.get(level).and_then(|l| l.bitrate)
    }

    pub fn details(&self, level: usize) -> Option<&LevelDetails> {
        self.levels.get(level).and_then(|l| l.details.as_ref())
    }

    pub fn details_mut(&mut self, level: usize) -> Option<&mut LevelDetails> {
        self.levels.get_mut(level).and_then(|l| l.details.as_mut())
    }

    pub fn any_details(&self) -> bool {
        self.levels.iter().any(|l| l.details.is_some())
    }

    pub fn last_loaded(&self) -> Option<usize> {
        self.last_loaded
    }

    /// Refresh static attributes after a multivariant playlist reload,
    /// keeping any details already installed.
    pub fn update_summaries(&mut self, summaries: Vec<LevelSummary>) {
        for (idx, summary) in summaries.into_iter().enumerate() {
            match self.levels.get_mut(idx) {
                Some(level) => {
                    level.url = summary.url;
                    level.bitrate = summary.bitrate;
                    level.audio_codec = summary.audio_codec;
                }
                None => self.levels.push(Level::from(summary)),
            }
        }
    }

    /// Install a playlist snapshot for `level`.
    ///
    /// Live reloads merge with the prior snapshot so that fragments
    /// present in both keep their parsed PTS; first loads are aligned
    /// against the last loaded level to estimate timeline drift.
    pub fn on_level_loaded(
        &mut self,
        level: usize,
        mut new: LevelDetails,
        cfg: &StreamConfig,
    ) -> Option<LevelUpdate> {
        if level >= self.levels.len() {
            warn!(level, "level loaded for unknown index, ignoring");
            return None;
        }

        let merged = match self.levels[level].details.take() {
            Some(old) if new.live => {
                let inherited = merge_details(&old, &mut new);
                // Re-installed snapshots keep whatever init data was loaded.
                if let (Some(new_init), Some(old_init)) =
                    (new.init_segment.as_mut(), old.init_segment.as_ref())
                    && new_init.data.is_none()
                {
                    new_init.data = old_init.data.clone();
                }
                inherited
            }
            prior => {
                let reference = self
                    .last_loaded
                    .filter(|&l| l != level)
                    .and_then(|l| self.levels[l].details.clone())
                    .or(prior);
                align_stream(reference.as_ref(), &mut new);
                false
            }
        };

        let sliding = new.start();
        let live_sync_position = new.live.then(|| {
            let latency = cfg.live_sync_latency(new.target_duration);
            sliding + (new.total_duration() - latency).max(0.0)
        });

        debug!(
            level,
            merged,
            sliding,
            start_sn = new.start_sn,
            end_sn = new.end_sn,
            live = new.live,
            "level details installed"
        );

        self.levels[level].details = Some(new);
        self.last_loaded = Some(level);

        Some(LevelUpdate {
            level,
            merged,
            sliding,
            live_sync_position,
        })
    }
}

/// Merge a reloaded live playlist with the prior snapshot.
///
/// Fragments present in both (same `(sn, cc)`) inherit parsed PTS/DTS,
/// backtrack flags, and load stats; fragments only in the new snapshot
/// are chained off the nearest inherited neighbor so that
/// `start[i + 1] = start[i] + duration[i]` holds throughout.
///
/// Returns whether any PTS was inherited.
pub fn merge_details(old: &LevelDetails, new: &mut LevelDetails) -> bool {
    if new.end_sn < old.start_sn || new.start_sn > old.end_sn {
        return false;
    }

    let mut inherited = false;
    let mut first_matched = None;
    let mut last_matched = None;
    for (idx, frag) in new.fragments.iter_mut().enumerate() {
        let Some(old_frag) = old.frag(frag.sn()) else {
            continue;
        };
        if old_frag.cc != frag.cc {
            continue;
        }
        if old_frag.start_pts.is_some() {
            frag.inherit_from(old_frag);
            inherited = true;
        } else {
            frag.start = old_frag.start;
            frag.stats = old_frag.stats;
        }
        first_matched.get_or_insert(idx);
        last_matched = Some(idx);
    }

    // Fragments outside the matched run chain off its edges so that
    // `start[i + 1] = start[i] + duration[i]` holds throughout.
    if let Some(first) = first_matched {
        for i in (0..first).rev() {
            new.fragments[i].start = new.fragments[i + 1].start - new.fragments[i].duration;
        }
    }
    if let Some(last) = last_matched {
        for i in last + 1..new.fragments.len() {
            new.fragments[i].start = new.fragments[i - 1].end();
        }
    }

    new.pts_known = inherited;
    inherited
}

/// Place a freshly loaded level onto the timeline of a reference level.
///
/// Used on level switches before any PTS is known: anchors by shared
/// discontinuity counter when possible, by program-date-time otherwise.
pub fn align_stream(reference: Option<&LevelDetails>, new: &mut LevelDetails) {
    let Some(reference) = reference else {
        return;
    };
    if new.fragments.is_empty() {
        return;
    }

    let delta = if let Some(anchor) = reference.fragments.iter().find(|f| f.cc == new.start_cc) {
        Some(anchor.start - new.start())
    } else if reference.has_program_date_time && new.has_program_date_time {
        let anchor = reference
            .fragments
            .iter()
            .find(|f| f.program_date_time.is_some());
        match (anchor, new.fragments[0].program_date_time) {
            (Some(anchor), Some(pdt)) => anchor
                .program_date_time
                .map(|anchor_pdt| anchor.start + (pdt - anchor_pdt) - new.start()),
            _ => None,
        }
    } else {
        None
    };

    if let Some(delta) = delta
        && delta.abs() > f64::EPSILON
    {
        debug!(delta, "aligning level timeline against reference");
        for frag in &mut new.fragments {
            frag.start += delta;
        }
    }
}

/// Fold parsed track timing into the fragment and re-chain its neighbors.
///
/// Audio and video report separately; the fragment keeps the widest PTS
/// envelope and records the audio/video start gap in `delta_pts`. Returns
/// the drift between the parsed start and the playlist start.
pub fn update_frag_pts(
    details: &mut LevelDetails,
    sn: u64,
    start_pts: f64,
    end_pts: f64,
    start_dts: f64,
    end_dts: f64,
) -> Option<f64> {
    let idx = details.index_of(sn)?;
    let frag = &mut details.fragments[idx];

    let (start, end) = match (frag.start_pts, frag.end_pts) {
        (Some(cur_start), Some(cur_end)) => {
            frag.delta_pts = frag.delta_pts.max((start_pts - cur_start).abs());
            (cur_start.min(start_pts), cur_end.max(end_pts))
        }
        _ => (start_pts, end_pts),
    };

    let drift = start - frag.start;
    frag.start = start;
    frag.start_pts = Some(start);
    frag.end_pts = Some(end);
    frag.start_dts = Some(frag.start_dts.map_or(start_dts, |v| v.min(start_dts)));
    frag.end_dts = Some(frag.end_dts.map_or(end_dts, |v| v.max(end_dts)));
    frag.max_start_pts = Some(frag.max_start_pts.map_or(start_pts, |v| v.max(start_pts)));
    frag.duration = end - start;

    for i in idx + 1..details.fragments.len() {
        details.fragments[i].start = details.fragments[i - 1].end();
    }
    for i in (0..idx).rev() {
        details.fragments[i].start = details.fragments[i + 1].start - details.fragments[i].duration;
    }

    details.pts_known = true;
    Some(drift)
}
