#![forbid(unsafe_code)]

//! The tick-driven scheduling state machine.
//!
//! Couples the playback position, the buffered ranges, and the selected
//! level's playlist into fragment-load / parse / append decisions. All
//! async completions are validated against the current `(level, sn)`
//! before they are applied, so late or abandoned completions are
//! harmless.

use std::collections::HashSet;
use std::time::Instant;

use bytes::Bytes;
use segue_core::{ElementaryStream, FragKey, Fragment, LevelDetails, StreamTarget, TrackKind};
use segue_events::{ErrorEvent, ErrorKind, EventBus, StreamEvent};
use tracing::{debug, trace, warn};

use crate::{
    buffer::{BufferInfo, TimeRanges, buffer_info},
    config::StreamConfig,
    gap::GapController,
    index::{find_fragment_by_cc, find_fragment_by_pdt, find_fragment_by_pts},
    level::{Levels, update_frag_pts},
    loader::{FragmentLoader, LoadKind, LoadRequest, TransmuxJob, TransmuxResult, Transmuxer},
    media::{Media, ready_state},
    tracker::{FragState, FragmentTracker},
};

/// Position probe offset when the exact playhead misses a fragment edge.
const PLAYHEAD_PROBE_OFFSET: f64 = 0.1;
/// Backwards nudge that forces the decoder to pick up freshly flushed data.
const SWITCH_NUDGE: f64 = 0.0001;

/// Scheduler states. See the crate docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Idle,
    WaitingLevel,
    KeyLoading,
    FragLoading,
    FragLoadingWaitingRetry,
    Parsing,
    Parsed,
    BufferFlushing,
    Ended,
    Error,
}

/// What one selection pass decided, applied after the playlist borrow ends.
#[derive(Debug, Default)]
struct Selection {
    frag: Option<Fragment>,
    load_init: bool,
    /// Live catch-up target for `current_time`.
    live_sync_seek: Option<f64>,
    /// Fragment whose `dropped` counter is consumed by stepping back.
    clear_dropped: Option<u64>,
    /// Predecessor to mark `backtracked` before loading it.
    mark_backtracked: Option<u64>,
}

/// The stream scheduler: decides which fragment to fetch next, sequences
/// key and fragment loads, drives the transmuxer, and feeds the buffer
/// sink, reacting to a 100 ms tick and to collaborator events.
pub struct Scheduler {
    config: StreamConfig,
    bus: EventBus,
    levels: Levels,
    tracker: FragmentTracker,
    gap: GapController,
    loader: Box<dyn FragmentLoader>,
    transmuxer: Box<dyn Transmuxer>,
    media: Option<Box<dyn Media>>,

    state: SchedulerState,
    level: usize,
    frag_current: Option<Fragment>,
    frag_previous: Option<Fragment>,
    frag_playing: Option<FragKey>,

    started: bool,
    start_position: f64,
    next_load_position: f64,
    last_current_time: f64,
    loaded_metadata: bool,
    start_frag_requested: bool,
    bitrate_test: bool,
    loading_init: Option<usize>,
    keys_loaded: HashSet<FragKey>,

    frag_load_error: u32,
    retry_date: Option<Instant>,
    frag_last_kbps: f64,
    /// Runtime copy of the configured cap, halved under buffer pressure.
    max_max_buffer_length: f64,

    immediate_switch: bool,
    previously_paused: bool,
    alt_audio: bool,
    appended: bool,
}

impl Scheduler {
    pub fn new(
        config: StreamConfig,
        bus: EventBus,
        loader: Box<dyn FragmentLoader>,
        transmuxer: Box<dyn Transmuxer>,
    ) -> Self {
        let max_max_buffer_length = config.max_max_buffer_length;
        Self {
            config,
            bus,
            levels: Levels::new(),
            tracker: FragmentTracker::new(),
            gap: GapController::new(),
            loader,
            transmuxer,
            media: None,
            state: SchedulerState::Stopped,
            level: 0,
            frag_current: None,
            frag_previous: None,
            frag_playing: None,
            started: false,
            start_position: 0.0,
            next_load_position: 0.0,
            last_current_time: 0.0,
            loaded_metadata: false,
            start_frag_requested: false,
            bitrate_test: false,
            loading_init: None,
            keys_loaded: HashSet::new(),
            frag_load_error: 0,
            retry_date: None,
            frag_last_kbps: 0.0,
            max_max_buffer_length,
            immediate_switch: false,
            previously_paused: false,
            alt_audio: false,
            appended: false,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn frag_current(&self) -> Option<&Fragment> {
        self.frag_current.as_ref()
    }

    pub fn frag_previous(&self) -> Option<&Fragment> {
        self.frag_previous.as_ref()
    }

    pub fn levels(&self) -> &Levels {
        &self.levels
    }

    pub fn is_bitrate_test(&self) -> bool {
        self.bitrate_test
    }

    pub fn max_max_buffer_length(&self) -> f64 {
        self.max_max_buffer_length
    }

    // Lifecycle

    /// Hand the media element to the scheduler. The owner publishes
    /// `MediaAttached` on the bus separately.
    pub fn attach_media(&mut self, media: Box<dyn Media>, now: Instant) {
        self.media = Some(media);
        self.loaded_metadata = false;
        self.gap.reset();
        self.tick(now);
    }

    /// Take the media element back; stops in-flight work.
    pub fn detach_media(&mut self) {
        self.stop_load();
        self.media = None;
        self.loaded_metadata = false;
    }

    /// Begin (or resume) fragment scheduling at the given position.
    pub fn start_load(&mut self, position: Option<f64>, now: Instant) {
        if self.levels.is_empty() {
            warn!("start requested before manifest parsed, ignoring");
            return;
        }
        let pos = position.or(self.config.start_position).unwrap_or(0.0);
        debug!(pos, level = self.level, "start load");
        self.started = true;
        self.start_position = pos;
        self.next_load_position = pos;
        self.last_current_time = pos;
        self.start_frag_requested = false;
        self.frag_load_error = 0;
        self.retry_date = None;
        self.state = SchedulerState::Idle;
        self.tick(now);
    }

    /// Abort in-flight work and halt scheduling until the next start.
    pub fn stop_load(&mut self) {
        self.loader.abort();
        self.loading_init = None;
        if let Some(frag) = self.frag_current.take() {
            self.tracker.remove(frag.key);
        }
        self.frag_previous = None;
        self.retry_date = None;
        self.started = false;
        self.state = SchedulerState::Stopped;
    }

    /// Point the scheduler at another quality level; the next selection
    /// draws from its playlist.
    pub fn set_level(&mut self, level: usize, now: Instant) {
        if level >= self.levels.len() || level == self.level {
            return;
        }
        debug!(from = self.level, to = level, "level changed");
        self.level = level;
        self.tick(now);
    }

    // Tick

    /// Advance the state machine. Fired every 100 ms by the driver and
    /// after every relevant event.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            SchedulerState::Idle => self.do_tick_idle(now),
            SchedulerState::WaitingLevel => {
                if self.levels.details(self.level).is_some() {
                    self.state = SchedulerState::Idle;
                    self.do_tick_idle(now);
                }
            }
            SchedulerState::FragLoadingWaitingRetry => {
                let due = self.retry_date.is_none_or(|d| now >= d);
                let seeking = self.media.as_ref().is_some_and(|m| m.seeking());
                if due || seeking {
                    debug!("retry window elapsed, back to idle");
                    self.retry_date = None;
                    self.state = SchedulerState::Idle;
                    self.do_tick_idle(now);
                }
            }
            SchedulerState::BufferFlushing => {
                self.frag_load_error = 0;
            }
            _ => {}
        }

        self.check_buffer(now);
        self.check_fragment_changed();
    }

    fn do_tick_idle(&mut self, now: Instant) {
        if !self.started {
            return;
        }
        // A fragment may be fetched before media attaches only when
        // prefetch is on and nothing has been requested yet.
        if self.media.is_none() && !(self.config.start_frag_prefetch && !self.start_frag_requested)
        {
            return;
        }
        if !self.levels.any_details() {
            return;
        }

        let pos = if self.loaded_metadata {
            self.media
                .as_ref()
                .map_or(self.next_load_position, |m| m.current_time())
        } else {
            self.next_load_position
        };

        let max_buf_len = self.max_buffer_target();
        let buffered = self.buffered();
        let buf = buffer_info(&buffered, pos, self.config.max_buffer_hole);
        if buf.len >= max_buf_len {
            trace!(len = buf.len, target = max_buf_len, "buffer target reached");
            return;
        }

        let Some(details) = self.levels.details(self.level) else {
            self.state = SchedulerState::WaitingLevel;
            return;
        };
        if details.live && self.levels.last_loaded() != Some(self.level) {
            // A live level must be freshly loaded before its fragments
            // are trusted.
            self.state = SchedulerState::WaitingLevel;
            return;
        }

        if self.stream_ended(&buf, details) {
            debug!("all fragments buffered, signalling end of stream");
            self.bus.publish(StreamEvent::BufferEos { kind: None });
            self.state = SchedulerState::Ended;
            return;
        }

        let media_ready = self
            .media
            .as_ref()
            .is_some_and(|m| m.ready_state() >= ready_state::HAVE_METADATA);
        let selection = self.select_fragment(details, buf.end, media_ready);
        self.apply_selection(selection, now);
    }

    /// Ahead-buffer target in seconds, converting the byte cap through
    /// the level bitrate and clamping to the (possibly reduced) hard cap.
    fn max_buffer_target(&self) -> f64 {
        let base = match self.levels.bitrate(self.level) {
            Some(bitrate) if bitrate > 0 => {
                let by_size = 8.0 * self.config.max_buffer_size as f64 / bitrate as f64;
                by_size.max(self.config.max_buffer_length)
            }
            _ => self.config.max_buffer_length,
        };
        base.clamp(0.0, self.max_max_buffer_length)
    }

    fn buffered(&self) -> TimeRanges {
        self.media
            .as_ref()
            .map(|m| m.buffered())
            .unwrap_or_default()
    }

    fn stream_ended(&self, buf: &BufferInfo, details: &LevelDetails) -> bool {
        if details.live || buf.next_start.is_some() || details.fragments.is_empty() {
            return false;
        }
        buf.end >= details.edge() - self.config.max_frag_lookup_tolerance
    }

    // Fragment choice

    fn select_fragment(
        &self,
        details: &LevelDetails,
        mut buffer_end: f64,
        media_ready: bool,
    ) -> Selection {
        let mut out = Selection::default();
        let fragments = &details.fragments;
        if fragments.is_empty() {
            return out;
        }

        // An unparsed init segment always goes first; one whose data is
        // already present is skipped, never re-fetched.
        if details
            .init_segment
            .as_ref()
            .is_some_and(|init| init.data.is_none())
        {
            out.load_init = true;
            return out;
        }

        let start = details.start();
        let end = details.edge();
        let tol_max = self.config.max_frag_lookup_tolerance;
        let mut frag: Option<&Fragment> = None;

        if details.live {
            if fragments.len() < self.config.initial_live_manifest_size {
                trace!(
                    have = fragments.len(),
                    need = self.config.initial_live_manifest_size,
                    "live playlist too short, not loading yet"
                );
                return out;
            }

            // Too far behind the live edge: resync to the target latency.
            let threshold = match self.config.live_max_latency(details.target_duration) {
                Some(max_latency) => (start - tol_max).max(end - max_latency),
                None => start - tol_max,
            };
            if buffer_end < threshold {
                let latency = self.config.live_sync_latency(details.target_duration);
                let target = start + (details.total_duration() - latency).max(0.0);
                warn!(
                    buffer_end,
                    target, "buffer end outside the live window, syncing to live position"
                );
                out.live_sync_seek = Some(target);
                buffer_end = target;
            }

            if details.pts_known && buffer_end > end && media_ready {
                // Playlist momentarily slid back; wait for the next reload.
                return out;
            }

            if !details.pts_known && let Some(prev) = &self.frag_previous {
                // Level switch on a live playlist with no PTS reference:
                // rejoin at the previous fragment's position.
                frag = self.find_switch_fragment(details, prev);
            }
        } else if buffer_end < start {
            frag = fragments.first();
        }

        if frag.is_none() {
            let tolerance = if buffer_end > end - tol_max { 0.0 } else { tol_max };
            frag = find_fragment_by_pts(
                self.frag_previous.as_ref(),
                fragments,
                buffer_end,
                tolerance,
            );
            if frag.is_none() && buffer_end >= end {
                frag = fragments.last();
            }
        }

        let Some(mut chosen) = frag.cloned() else {
            return out;
        };

        if let Some(prev) = &self.frag_previous
            && chosen.sn() == prev.sn()
            && chosen.level() == prev.level()
        {
            let idx = details
                .index_of(chosen.sn())
                .expect("selected fragment belongs to the level");
            let prev_frag = (idx > 0).then(|| &fragments[idx - 1]);
            let next_frag = fragments.get(idx + 1);

            if !chosen.backtracked {
                if chosen.sn() >= details.end_sn {
                    return out;
                }
                if prev.delta_pts > self.config.max_buffer_hole && prev.dropped > 0 {
                    // Large audio/video gap plus dropped frames: the
                    // fragment may not start with a keyframe, try its
                    // predecessor.
                    match prev_frag {
                        Some(p) => {
                            warn!(sn = chosen.sn(), "possible missing keyframe, stepping back");
                            chosen = p.clone();
                        }
                        None => return out,
                    }
                } else {
                    chosen = next_frag
                        .expect("sn < end_sn implies a successor")
                        .clone();
                }
            } else if next_frag.is_some_and(|n| n.backtracked) {
                // Already backtracked from the successor once; give up
                // and move forward instead of ping-ponging.
                warn!(sn = chosen.sn(), "successor already backtracked, advancing");
                chosen = next_frag.expect("checked above").clone();
            } else {
                out.clear_dropped = Some(chosen.sn());
                match prev_frag {
                    Some(p) => {
                        warn!(
                            sn = chosen.sn(),
                            "dropped frames, backtracking one fragment for a keyframe"
                        );
                        out.mark_backtracked = Some(p.sn());
                        let mut p = p.clone();
                        p.backtracked = true;
                        chosen = p;
                    }
                    None => return out,
                }
            }
        }

        out.frag = Some(chosen);
        out
    }

    /// Rejoin point after a live level switch without PTS information.
    fn find_switch_fragment<'a>(
        &self,
        details: &'a LevelDetails,
        prev: &Fragment,
    ) -> Option<&'a Fragment> {
        let fragments = &details.fragments;

        if details.has_program_date_time
            && let Some(pdt) = prev.end_program_date_time
        {
            return find_fragment_by_pdt(fragments, pdt, self.config.max_frag_lookup_tolerance);
        }

        let target_sn = prev.sn() + 1;
        if let Some(next) = details.frag(target_sn)
            && next.cc == prev.cc
        {
            return Some(next);
        }

        if let Some(same_cc) = find_fragment_by_cc(fragments, prev.cc) {
            return Some(same_cc);
        }

        // No shared reference at all: join in the middle of the window.
        let mid = (fragments.len() / 2).min(fragments.len() - 1);
        fragments.get(mid)
    }

    fn apply_selection(&mut self, selection: Selection, now: Instant) {
        if let Some(target) = selection.live_sync_seek {
            if let Some(media) = self.media.as_mut()
                && media.ready_state() >= ready_state::HAVE_METADATA
            {
                media.set_current_time(target);
            }
            self.next_load_position = target;
            if !self.loaded_metadata {
                self.start_position = target;
                self.last_current_time = target;
            }
        }
        if let Some(sn) = selection.clear_dropped
            && let Some(frag) = self
                .levels
                .details_mut(self.level)
                .and_then(|d| d.frag_mut(sn))
        {
            frag.dropped = 0;
        }
        if let Some(sn) = selection.mark_backtracked
            && let Some(frag) = self
                .levels
                .details_mut(self.level)
                .and_then(|d| d.frag_mut(sn))
        {
            frag.backtracked = true;
        }

        if selection.load_init {
            self.load_init_segment();
            return;
        }
        if let Some(frag) = selection.frag {
            self.load_fragment(frag, now);
        }
    }

    // Load sequencing

    fn load_init_segment(&mut self) {
        let Some(details) = self.levels.details(self.level) else {
            return;
        };
        let Some(init) = &details.init_segment else {
            return;
        };
        let key = FragKey::new(self.level, details.start_sn);
        debug!(level = self.level, url = %init.url, "loading init segment");
        self.loading_init = Some(self.level);
        self.loader.load(LoadRequest {
            frag: key,
            url: init.url.clone(),
            kind: LoadKind::Init,
        });
        self.state = SchedulerState::FragLoading;
    }

    fn load_fragment(&mut self, mut frag: Fragment, now: Instant) {
        if frag.encrypted && !self.keys_loaded.contains(&frag.key) {
            debug!(level = frag.level(), sn = frag.sn(), "key required, loading");
            self.frag_current = Some(frag.clone());
            self.state = SchedulerState::KeyLoading;
            self.bus.publish(StreamEvent::KeyLoading { frag: frag.key });
            return;
        }

        let tracked = self.tracker.state(frag.key);
        let fetchable =
            matches!(tracked, FragState::NotLoaded | FragState::Partial) || frag.backtracked;

        if fetchable {
            debug!(
                level = frag.level(),
                sn = frag.sn(),
                start = frag.start,
                bitrate_test = self.bitrate_test,
                "loading fragment"
            );
            frag.stats.requested_at = Some(now);
            self.start_frag_requested = true;
            if !self.bitrate_test {
                self.next_load_position = frag.end();
            }
            self.tracker.loading(frag.key);
            let kind = if self.bitrate_test {
                LoadKind::BitrateTest
            } else {
                LoadKind::Playback
            };
            self.loader.load(LoadRequest {
                frag: frag.key,
                url: frag.url.clone(),
                kind,
            });
            self.bus.publish(StreamEvent::FragLoading { frag: frag.key });
            self.frag_current = Some(frag);
            self.state = SchedulerState::FragLoading;
        } else if tracked == FragState::Appending {
            // The sink is still digesting this fragment; shrink the cap
            // and let the next tick retry with a detached entry.
            if self.reduce_max_buffer_length(frag.duration) {
                self.tracker.remove(frag.key);
            }
        }
    }

    fn reduce_max_buffer_length(&mut self, min_length: f64) -> bool {
        if self.max_max_buffer_length >= min_length {
            self.max_max_buffer_length =
                (self.max_max_buffer_length / 2.0).max(self.config.max_buffer_length);
            warn!(
                max_max_buffer_length = self.max_max_buffer_length,
                "reduced max buffer length"
            );
            true
        } else {
            false
        }
    }

    // Completions

    /// Init segment payload arrived from the loader.
    pub fn on_init_loaded(&mut self, level: usize, data: Bytes, now: Instant) {
        if self.loading_init != Some(level) || self.state != SchedulerState::FragLoading {
            debug!(level, "discarding stale init segment payload");
            return;
        }
        self.loading_init = None;
        if let Some(init) = self
            .levels
            .details_mut(level)
            .and_then(|d| d.init_segment.as_mut())
        {
            init.data = Some(data);
        }
        self.state = SchedulerState::Idle;
        self.tick(now);
    }

    /// Fragment payload arrived from the loader.
    pub fn on_frag_loaded(&mut self, frag: FragKey, data: Bytes, now: Instant) {
        if self.state != SchedulerState::FragLoading
            || self.frag_current.as_ref().map(|f| f.key) != Some(frag)
        {
            debug!(level = frag.level, sn = frag.sn, "discarding stale fragment payload");
            return;
        }
        self.frag_load_error = 0;

        let current = self.frag_current.as_mut().expect("checked above");
        current.stats.first_byte_at.get_or_insert(now);
        current.stats.loaded_at = Some(now);
        current.stats.loaded_bytes = data.len() as u64;
        current.stats.total_bytes = data.len() as u64;

        if self.bitrate_test {
            // Probe complete: the payload is discarded, the measured
            // throughput steers the real start level externally.
            debug!(sn = frag.sn, bytes = data.len(), "bandwidth probe fragment loaded");
            self.tracker.remove(frag);
            self.frag_current = None;
            self.bitrate_test = false;
            self.start_frag_requested = false;
            self.state = SchedulerState::Idle;
            return;
        }

        let cc = current.cc;
        let init_data = self
            .levels
            .details(frag.level)
            .and_then(|d| d.init_segment.as_ref())
            .and_then(|i| i.data.clone());

        self.state = SchedulerState::Parsing;
        self.appended = false;
        self.transmuxer.push(TransmuxJob {
            frag,
            cc,
            data,
            init_data,
        });
    }

    /// Parsed output arrived from the transmuxer.
    pub fn on_transmux_complete(&mut self, result: TransmuxResult, now: Instant) {
        if self.state != SchedulerState::Parsing
            || self.frag_current.as_ref().map(|f| f.key) != Some(result.frag)
        {
            debug!(
                level = result.frag.level,
                sn = result.frag.sn,
                "discarding transmux output for abandoned fragment"
            );
            return;
        }
        let mut frag = self.frag_current.take().expect("checked above");

        if let Some(init) = &result.init {
            self.bus
                .publish(StreamEvent::FragParsingInitSegment { frag: frag.key });
            let tracks = init
                .tracks
                .iter()
                .map(|t| {
                    let mut info = t.info.clone();
                    if info.kind == TrackKind::Audio
                        && let Some(codec) = &self.config.default_audio_codec
                    {
                        info.codec = Some(codec.clone());
                    }
                    info
                })
                .collect();
            self.bus.publish(StreamEvent::BufferCodecs { tracks });
            if let Some((cc, init_pts)) = init.init_pts {
                self.bus.publish(StreamEvent::InitPtsFound { cc, init_pts });
            }
            for track in &init.tracks {
                if let Some(data) = &track.data {
                    self.bus.publish(StreamEvent::BufferAppending {
                        kind: track.info.kind,
                        data: data.clone(),
                        parent: StreamTarget::Main,
                        frag: frag.key,
                    });
                    self.appended = true;
                }
            }
        }

        // Dropped leading frames: reload the predecessor for a keyframe
        // instead of appending a fragment that cannot decode cleanly.
        if let Some(video) = &result.video {
            let start_sn = self
                .levels
                .details(frag.level())
                .map_or(frag.sn(), |d| d.start_sn);
            if video.dropped > 0 {
                frag.dropped = video.dropped;
                if frag.sn() != start_sn && !frag.backtracked {
                    warn!(
                        sn = frag.sn(),
                        dropped = video.dropped,
                        "video frames dropped before keyframe, backtracking"
                    );
                    self.tracker.remove(frag.key);
                    frag.backtracked = true;
                    if let Some(reg) = self
                        .levels
                        .details_mut(frag.level())
                        .and_then(|d| d.frag_mut(frag.sn()))
                    {
                        reg.backtracked = true;
                        reg.dropped = video.dropped;
                    }
                    self.next_load_position = video.start_pts;
                    self.frag_previous = Some(frag);
                    self.state = SchedulerState::Idle;
                    return;
                }
                warn!(sn = frag.sn(), "appending fragment with leading gap");
            } else {
                // A clean video parse resolves any earlier backtrack.
                frag.backtracked = false;
                if let Some(reg) = self
                    .levels
                    .details_mut(frag.level())
                    .and_then(|d| d.frag_mut(frag.sn()))
                {
                    reg.backtracked = false;
                }
            }
        }

        for payload in [&result.audio, &result.video].into_iter().flatten() {
            let stream = match payload.kind {
                TrackKind::Audio => ElementaryStream::Audio,
                _ => ElementaryStream::Video,
            };
            frag.elementary_streams.insert(stream);
            if let Some(details) = self.levels.details_mut(frag.level())
                && let Some(drift) = update_frag_pts(
                    details,
                    frag.sn(),
                    payload.start_pts,
                    payload.end_pts,
                    payload.start_dts,
                    payload.end_dts,
                )
            {
                self.bus.publish(StreamEvent::LevelPtsUpdated {
                    level: frag.level(),
                    drift,
                });
            }
            self.bus.publish(StreamEvent::BufferAppending {
                kind: payload.kind,
                data: payload.data.clone(),
                parent: StreamTarget::Main,
                frag: frag.key,
            });
            self.appended = true;
        }

        if let Some(samples) = &result.id3 {
            self.bus.publish(StreamEvent::FragParsingMetadata {
                frag: frag.key,
                samples: samples.clone(),
            });
        }
        if let Some(samples) = &result.text {
            self.bus.publish(StreamEvent::FragParsingUserdata {
                frag: frag.key,
                samples: samples.clone(),
            });
        }

        // Mirror the parsed timing onto the scheduler's working copy.
        if let Some(reg) = self.levels.details(frag.level()).and_then(|d| d.frag(frag.sn())) {
            let updated = reg.clone();
            frag.start = updated.start;
            frag.duration = updated.duration;
            frag.start_pts = updated.start_pts;
            frag.end_pts = updated.end_pts;
            frag.start_dts = updated.start_dts;
            frag.end_dts = updated.end_dts;
            frag.max_start_pts = updated.max_start_pts;
            frag.delta_pts = updated.delta_pts;
        }
        if let (Some(start_pts), Some(end_pts)) = (frag.start_pts, frag.end_pts) {
            self.tracker.appending(
                frag.key,
                start_pts,
                end_pts,
                frag.max_start_pts,
                frag.elementary_streams,
            );
        }
        frag.stats.parsed_at = Some(now);
        self.frag_current = Some(frag);
        self.state = SchedulerState::Parsed;
    }

    // Buffer sink feedback

    fn on_buffer_appended(&mut self, parent: StreamTarget, pending: usize, now: Instant) {
        let buffered = self.buffered();
        self.tracker
            .detect_evicted(ElementaryStream::Audio, &buffered);
        self.tracker
            .detect_evicted(ElementaryStream::Video, &buffered);

        if parent != StreamTarget::Main
            || pending > 0
            || !self.appended
            || self.state != SchedulerState::Parsed
        {
            return;
        }
        let Some(mut frag) = self.frag_current.take() else {
            return;
        };

        frag.stats.buffered_at = Some(now);
        if let (Some(first), Some(buffered_at)) = (
            frag.stats.first_byte_at.or(frag.stats.requested_at),
            frag.stats.buffered_at,
        ) {
            let ms = buffered_at.saturating_duration_since(first).as_millis() as f64;
            if ms > 0.0 {
                self.frag_last_kbps = 8.0 * frag.stats.total_bytes as f64 / ms;
            }
        }

        self.tracker.buffered(frag.key, &buffered);
        self.bus.publish(StreamEvent::FragBuffered {
            frag: frag.key,
            stats: frag.stats,
        });
        debug!(
            level = frag.level(),
            sn = frag.sn(),
            kbps = self.frag_last_kbps,
            "fragment buffered"
        );
        self.appended = false;
        self.frag_previous = Some(frag);
        self.state = SchedulerState::Idle;
        self.tick(now);
    }

    // Buffer health

    fn check_buffer(&mut self, now: Instant) {
        let Some(media) = self.media.as_mut() else {
            return;
        };
        if media.ready_state() < ready_state::HAVE_METADATA {
            return;
        }
        let buffered = media.buffered();

        if !self.loaded_metadata {
            if !buffered.is_empty() {
                self.loaded_metadata = true;
                let start = self.start_position;
                if (media.current_time() - start).abs() > f64::EPSILON {
                    debug!(start, "first data buffered, seeking to start position");
                    media.set_current_time(start);
                }
            }
        } else if self.immediate_switch {
            // Wait until the post-switch fragment covers the playhead,
            // then nudge backwards to flush the decoder pipeline.
            let pos = media.current_time();
            if buffered.contains(pos) || buffered.contains(pos + PLAYHEAD_PROBE_OFFSET) {
                media.set_current_time(pos - SWITCH_NUDGE);
                if !self.previously_paused {
                    media.play();
                }
                self.immediate_switch = false;
            }
        } else {
            self.gap
                .poll(media.as_mut(), self.config.max_buffer_hole, now);
        }
    }

    // Fragment change detection

    fn check_fragment_changed(&mut self) {
        let Some(media) = self.media.as_ref() else {
            return;
        };
        if media.ready_state() < ready_state::HAVE_METADATA || media.seeking() {
            return;
        }
        let pos = media.current_time();
        if pos > self.last_current_time {
            self.last_current_time = pos;
        }

        let playing = self
            .tracker
            .buffered_frag_at(pos)
            .or_else(|| self.tracker.buffered_frag_at(pos + PLAYHEAD_PROBE_OFFSET));
        let Some(playing) = playing else {
            return;
        };
        if Some(playing.key) == self.frag_playing {
            return;
        }

        self.bus.publish(StreamEvent::FragChanged { frag: playing.key });
        let level_changed = self
            .frag_playing
            .is_none_or(|prev| prev.level != playing.key.level);
        if level_changed {
            self.bus.publish(StreamEvent::LevelSwitched {
                level: playing.key.level,
            });
        }
        self.frag_playing = Some(playing.key);
    }

    // Level switching

    /// Hard switch: pause, drop everything buffered, and restart at the
    /// playhead from the new level.
    pub fn immediate_level_switch(&mut self, _now: Instant) {
        debug!(level = self.level, "immediate level switch");
        match self.media.as_mut() {
            Some(media) => {
                self.previously_paused = media.paused();
                media.pause();
            }
            // No media yet; don't auto-resume when it appears.
            None => self.previously_paused = true,
        }
        if self.frag_current.take().is_some() {
            self.loader.abort();
        }
        self.frag_previous = None;
        self.immediate_switch = true;
        self.flush_main_buffer(0.0, f64::INFINITY);
    }

    /// Soft switch: keep playing the old level, flush only past the point
    /// the new level can reach in time.
    pub fn next_level_switch(&mut self, _now: Instant) {
        let Some(media) = self.media.as_ref() else {
            return;
        };
        let pos = media.current_time();

        let fetchdelay = if media.paused() || self.frag_last_kbps <= 0.0 {
            0.0
        } else {
            let duration = self
                .frag_current
                .as_ref()
                .or(self.frag_previous.as_ref())
                .map_or(0.0, |f| f.duration);
            let bitrate = self.levels.bitrate(self.level).unwrap_or(0) as f64;
            duration * bitrate / (1000.0 * self.frag_last_kbps) + 1.0
        };

        let Some(at_delay) = self.tracker.buffered_frag_at(pos + fetchdelay) else {
            return;
        };
        let Some(successor) = self
            .tracker
            .buffered_frag_at(at_delay.end_pts + self.config.max_frag_lookup_tolerance)
        else {
            return;
        };

        debug!(
            fetchdelay,
            flush_from = successor.start_pts,
            "smooth level switch, flushing forward buffer"
        );
        if self.frag_current.take().is_some() {
            self.loader.abort();
        }
        let flush_start = successor.max_start_pts.unwrap_or(successor.start_pts);
        self.flush_main_buffer(flush_start, f64::INFINITY);
    }

    fn flush_main_buffer(&mut self, start: f64, end: f64) {
        self.state = SchedulerState::BufferFlushing;
        self.bus.publish(StreamEvent::BufferFlushing {
            start_offset: start,
            end_offset: end,
            kind: None,
        });
    }

    // Event handling

    /// React to a bus event. Variants the scheduler emits itself (or that
    /// concern other components) are ignored.
    pub fn handle_event(&mut self, event: &StreamEvent, now: Instant) {
        match event {
            StreamEvent::MediaAttached => self.tick(now),
            StreamEvent::MediaDetaching => {
                self.loader.abort();
                self.frag_current = None;
            }
            StreamEvent::ManifestLoading => self.reset(),
            StreamEvent::ManifestParsed { levels } => {
                self.levels = Levels::from_summaries(levels.clone());
                let count = self.levels.len();
                self.level = self
                    .config
                    .start_level
                    .unwrap_or(0)
                    .min(count.saturating_sub(1));
                self.bitrate_test =
                    self.config.start_level.is_none() && self.config.test_bandwidth && count > 1;
                debug!(
                    levels = count,
                    start_level = self.level,
                    bitrate_test = self.bitrate_test,
                    "manifest parsed"
                );
            }
            StreamEvent::LevelLoaded { level, details } => {
                self.on_level_loaded(*level, details.clone(), now);
            }
            StreamEvent::LevelsUpdated { levels } => {
                self.levels.update_summaries(levels.clone());
            }
            StreamEvent::KeyLoaded { frag } => {
                if self.state == SchedulerState::KeyLoading
                    && self.frag_current.as_ref().map(|f| f.key) == Some(*frag)
                {
                    self.keys_loaded.insert(*frag);
                    self.frag_current = None;
                    self.state = SchedulerState::Idle;
                    self.tick(now);
                }
            }
            StreamEvent::FragLoadEmergencyAborted => {
                if self.state == SchedulerState::FragLoading {
                    if let Some(frag) = self.frag_current.take() {
                        self.tracker.remove(frag.key);
                        self.next_load_position = frag.start;
                    }
                    self.state = SchedulerState::Idle;
                    self.tick(now);
                }
            }
            StreamEvent::BufferCreated { .. } => {}
            StreamEvent::BufferAppended { parent, pending } => {
                self.on_buffer_appended(*parent, *pending, now);
            }
            StreamEvent::BufferFlushed => {
                let buffered = self.buffered();
                self.tracker
                    .detect_evicted(ElementaryStream::Audio, &buffered);
                self.tracker
                    .detect_evicted(ElementaryStream::Video, &buffered);
                if self.state == SchedulerState::BufferFlushing {
                    self.frag_previous = None;
                    self.state = SchedulerState::Idle;
                    self.tick(now);
                }
            }
            StreamEvent::AudioTrackSwitching { url, .. } => {
                if url.is_none() {
                    // Audio comes from the main stream again: restart the
                    // pipeline so init segments are regenerated.
                    self.alt_audio = false;
                    self.loader.abort();
                    if let Some(frag) = self.frag_current.take() {
                        self.tracker.remove(frag.key);
                        self.next_load_position = frag.start;
                    }
                    self.frag_previous = None;
                    self.transmuxer.destroy();
                    if self.started {
                        self.state = SchedulerState::Idle;
                        self.tick(now);
                    }
                } else {
                    self.alt_audio = true;
                }
            }
            StreamEvent::AudioTrackSwitched { .. } => {
                if self.alt_audio {
                    self.transmuxer.destroy();
                }
                self.tick(now);
            }
            StreamEvent::Error(err) => self.on_error(err, now),
            _ => {}
        }
    }

    fn on_level_loaded(&mut self, level: usize, details: LevelDetails, now: Instant) {
        let Some(update) = self.levels.on_level_loaded(level, details, &self.config) else {
            return;
        };
        self.bus.publish(StreamEvent::LevelUpdated { level });
        if self.state == SchedulerState::WaitingLevel && level == self.level {
            self.state = SchedulerState::Idle;
        }
        trace!(
            level,
            sliding = update.sliding,
            live_sync_position = ?update.live_sync_position,
            "level loaded"
        );
        self.tick(now);
    }

    fn reset(&mut self) {
        self.stop_load();
        self.levels.reset();
        self.tracker.clear();
        self.keys_loaded.clear();
        self.gap.reset();
        self.frag_playing = None;
        self.frag_last_kbps = 0.0;
        self.loaded_metadata = false;
        self.immediate_switch = false;
        self.bitrate_test = false;
        self.max_max_buffer_length = self.config.max_max_buffer_length;
        self.bus.publish(StreamEvent::BufferReset);
    }

    // Errors and retry

    fn on_error(&mut self, err: &ErrorEvent, now: Instant) {
        if self.state == SchedulerState::Error {
            return;
        }
        if err.fatal {
            warn!(kind = ?err.kind, "fatal error, halting scheduler");
            self.loader.abort();
            self.frag_current = None;
            self.state = SchedulerState::Error;
            return;
        }

        match err.kind {
            ErrorKind::FragLoadError
            | ErrorKind::FragLoadTimeout
            | ErrorKind::KeyLoadError
            | ErrorKind::KeyLoadTimeout => self.on_frag_load_error(err, now),
            ErrorKind::LevelLoadError | ErrorKind::LevelLoadTimeout => {
                if self.state == SchedulerState::WaitingLevel && !err.level_retry {
                    self.state = SchedulerState::Idle;
                }
            }
            ErrorKind::BufferFullError => self.on_buffer_full(err),
            ErrorKind::BufferAppendError => {
                if matches!(
                    self.state,
                    SchedulerState::Parsing | SchedulerState::Parsed
                ) {
                    warn!("buffer append failed, halting scheduler");
                    self.bus.publish(StreamEvent::error(
                        ErrorKind::BufferAppendError,
                        true,
                        err.frag,
                    ));
                    self.state = SchedulerState::Error;
                }
            }
        }
    }

    fn on_frag_load_error(&mut self, err: &ErrorEvent, now: Instant) {
        let Some(frag) = err.frag else {
            return;
        };
        if self.frag_current.as_ref().map(|f| f.key) != Some(frag) {
            return;
        }

        if self.frag_load_error < self.config.frag_loading_max_retry {
            let exponent = self.frag_load_error.min(16);
            let delay = (self.config.frag_loading_retry_delay * 2u32.pow(exponent))
                .min(self.config.frag_loading_max_retry_timeout);
            warn!(
                level = frag.level,
                sn = frag.sn,
                attempt = self.frag_load_error + 1,
                delay_ms = delay.as_millis() as u64,
                "fragment load failed, scheduling retry"
            );
            self.retry_date = Some(now + delay);
            self.frag_load_error += 1;
            self.tracker.remove(frag);
            // Reselect the failed fragment, not its successor.
            if let Some(cur) = &self.frag_current {
                self.next_load_position = cur.start;
            }
            self.state = SchedulerState::FragLoadingWaitingRetry;
        } else {
            warn!(
                level = frag.level,
                sn = frag.sn,
                retries = self.frag_load_error,
                "fragment load retries exhausted"
            );
            self.bus
                .publish(StreamEvent::error(err.kind, true, Some(frag)));
            self.loader.abort();
            self.frag_current = None;
            self.state = SchedulerState::Error;
        }
    }

    fn on_buffer_full(&mut self, err: &ErrorEvent) {
        if matches!(err.parent, Some(StreamTarget::Audio)) {
            return;
        }
        let position_buffered = self
            .media
            .as_ref()
            .is_some_and(|m| m.buffered().contains(m.current_time()));

        if position_buffered {
            // The sink is full but playback can proceed; shrink the
            // ahead-buffer target and carry on.
            self.reduce_max_buffer_length(self.config.max_buffer_length);
            self.state = SchedulerState::Idle;
        } else {
            warn!("buffer full with playhead unbuffered, flushing everything");
            self.loader.abort();
            self.frag_current = None;
            self.flush_main_buffer(0.0, f64::INFINITY);
        }
    }

    // Media element notifications

    /// Explicit seek request: move the playhead (when media is attached)
    /// and retarget loading at `position`.
    pub fn seek(&mut self, position: f64, now: Instant) {
        debug!(position, "seek requested");
        match self.media.as_mut() {
            Some(media) => {
                media.set_current_time(position);
                self.on_media_seeking(now);
            }
            None => {
                self.next_load_position = position;
                self.start_position = position;
                self.last_current_time = position;
                if self.state == SchedulerState::Ended {
                    self.state = SchedulerState::Idle;
                }
                self.tick(now);
            }
        }
    }

    pub fn on_media_seeking(&mut self, now: Instant) {
        let Some(pos) = self.media.as_ref().map(|m| m.current_time()) else {
            return;
        };
        if self.state == SchedulerState::FragLoading {
            if let Some(frag) = &self.frag_current
                && !frag.covers(pos)
            {
                debug!(pos, sn = frag.sn(), "seek outside in-flight fragment, aborting");
                self.loader.abort();
                self.tracker.remove(frag.key);
                self.frag_current = None;
                self.state = SchedulerState::Idle;
            }
        } else if self.state == SchedulerState::Ended {
            self.state = SchedulerState::Idle;
            self.frag_previous = None;
        }
        self.last_current_time = pos;
        if !self.loaded_metadata {
            self.next_load_position = pos;
            self.start_position = pos;
        }
        self.tick(now);
    }

    pub fn on_media_seeked(&mut self, now: Instant) {
        self.tick(now);
    }

    pub fn on_media_ended(&mut self, _now: Instant) {
        // Replays restart from the beginning.
        self.start_position = 0.0;
    }
}
