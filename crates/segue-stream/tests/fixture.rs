#![forbid(unsafe_code)]
#![allow(dead_code)]

//! Shared test fixtures: scripted media element, recording collaborators,
//! and a harness that drives the scheduler with explicit time.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use segue_core::{FragKey, Fragment, InitSegment, LevelDetails, LevelSummary, StreamTarget, TrackKind};
use segue_events::{ErrorEvent, ErrorKind, EventBus, StreamEvent};
use segue_stream::{
    FragmentLoader, LoadRequest, Media, Scheduler, StreamConfig, TimeRanges, TrackPayload,
    TransmuxJob, TransmuxResult, Transmuxer,
};
use tokio::sync::broadcast;
use url::Url;

pub fn seg_url(level: usize, sn: u64) -> Url {
    Url::parse(&format!("https://cdn.example.com/l{level}/seg{sn}.ts")).unwrap()
}

pub fn level_summaries(bitrates: &[u64]) -> Vec<LevelSummary> {
    bitrates
        .iter()
        .enumerate()
        .map(|(i, &bitrate)| LevelSummary {
            url: Url::parse(&format!("https://cdn.example.com/l{i}/playlist.m3u8")).unwrap(),
            bitrate: Some(bitrate),
            audio_codec: None,
        })
        .collect()
}

pub fn make_details(
    level: usize,
    start_sn: u64,
    count: u64,
    first_start: f64,
    duration: f64,
    live: bool,
) -> LevelDetails {
    let fragments = (0..count)
        .map(|i| {
            Fragment::new(
                FragKey::new(level, start_sn + i),
                first_start + i as f64 * duration,
                duration,
                0,
                seg_url(level, start_sn + i),
            )
        })
        .collect();
    LevelDetails::new(fragments, duration, live)
}

pub fn vod_details(level: usize, count: u64, duration: f64) -> LevelDetails {
    make_details(level, 0, count, 0.0, duration, false)
}

pub fn with_init(mut details: LevelDetails, level: usize) -> LevelDetails {
    details.init_segment = Some(InitSegment::new(
        Url::parse(&format!("https://cdn.example.com/l{level}/init.mp4")).unwrap(),
    ));
    details
}

// Scripted media element

#[derive(Debug)]
pub struct MediaState {
    pub time: f64,
    pub ready: u8,
    pub seeking: bool,
    pub paused: bool,
    pub duration: f64,
    pub buffered: Vec<(f64, f64)>,
    pub seeks: Vec<f64>,
    pub play_calls: u32,
    pub pause_calls: u32,
}

impl MediaState {
    /// Append a buffered range, merging with an adjacent one.
    pub fn append_range(&mut self, start: f64, end: f64) {
        for range in &mut self.buffered {
            if start <= range.1 + 1e-9 && end >= range.0 - 1e-9 {
                range.0 = range.0.min(start);
                range.1 = range.1.max(end);
                return;
            }
        }
        self.buffered.push((start, end));
        self.buffered.sort_by(|a, b| a.0.total_cmp(&b.0));
    }
}

/// Media element backed by shared state the test can inspect and mutate.
#[derive(Clone)]
pub struct FakeMedia(pub Arc<Mutex<MediaState>>);

impl FakeMedia {
    pub fn new(time: f64, ready: u8) -> Self {
        Self(Arc::new(Mutex::new(MediaState {
            time,
            ready,
            seeking: false,
            paused: false,
            duration: f64::INFINITY,
            buffered: Vec::new(),
            seeks: Vec::new(),
            play_calls: 0,
            pause_calls: 0,
        })))
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MediaState> {
        self.0.lock().unwrap()
    }
}

impl Media for FakeMedia {
    fn current_time(&self) -> f64 {
        self.state().time
    }
    fn set_current_time(&mut self, pos: f64) {
        let mut state = self.state();
        state.seeks.push(pos);
        state.time = pos;
    }
    fn ready_state(&self) -> u8 {
        self.state().ready
    }
    fn seeking(&self) -> bool {
        self.state().seeking
    }
    fn paused(&self) -> bool {
        self.state().paused
    }
    fn duration(&self) -> f64 {
        self.state().duration
    }
    fn buffered(&self) -> TimeRanges {
        TimeRanges::from(self.state().buffered.clone())
    }
    fn play(&mut self) {
        let mut state = self.state();
        state.play_calls += 1;
        state.paused = false;
    }
    fn pause(&mut self) {
        let mut state = self.state();
        state.pause_calls += 1;
        state.paused = true;
    }
}

// Recording collaborators

#[derive(Clone, Default)]
pub struct RecordingLoader {
    pub requests: Arc<Mutex<Vec<LoadRequest>>>,
    pub aborts: Arc<Mutex<u32>>,
}

impl RecordingLoader {
    pub fn last(&self) -> Option<LoadRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn abort_count(&self) -> u32 {
        *self.aborts.lock().unwrap()
    }
}

impl FragmentLoader for RecordingLoader {
    fn load(&mut self, request: LoadRequest) {
        self.requests.lock().unwrap().push(request);
    }
    fn abort(&mut self) {
        *self.aborts.lock().unwrap() += 1;
    }
}

#[derive(Clone, Default)]
pub struct RecordingTransmuxer {
    pub jobs: Arc<Mutex<Vec<TransmuxJob>>>,
    pub destroys: Arc<Mutex<u32>>,
}

impl RecordingTransmuxer {
    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

impl Transmuxer for RecordingTransmuxer {
    fn push(&mut self, job: TransmuxJob) {
        self.jobs.lock().unwrap().push(job);
    }
    fn destroy(&mut self) {
        *self.destroys.lock().unwrap() += 1;
    }
}

// Harness

/// Scheduler plus recording collaborators, driven with explicit time.
pub struct Harness {
    pub scheduler: Scheduler,
    pub bus: EventBus,
    pub rx: broadcast::Receiver<StreamEvent>,
    pub loader: RecordingLoader,
    pub transmuxer: RecordingTransmuxer,
    pub media: Option<FakeMedia>,
    pub now: Instant,
}

impl Harness {
    pub fn new(config: StreamConfig) -> Self {
        let bus = EventBus::new(256);
        let rx = bus.subscribe();
        let loader = RecordingLoader::default();
        let transmuxer = RecordingTransmuxer::default();
        let scheduler = Scheduler::new(
            config,
            bus.clone(),
            Box::new(loader.clone()),
            Box::new(transmuxer.clone()),
        );
        Self {
            scheduler,
            bus,
            rx,
            loader,
            transmuxer,
            media: None,
            now: Instant::now(),
        }
    }

    pub fn attach_media(&mut self, media: FakeMedia) {
        self.media = Some(media.clone());
        self.scheduler.attach_media(Box::new(media), self.now);
        self.scheduler
            .handle_event(&StreamEvent::MediaAttached, self.now);
    }

    pub fn media(&self) -> &FakeMedia {
        self.media.as_ref().expect("media attached")
    }

    pub fn event(&mut self, event: StreamEvent) {
        self.scheduler.handle_event(&event, self.now);
    }

    pub fn manifest(&mut self, bitrates: &[u64]) {
        self.event(StreamEvent::ManifestParsed {
            levels: level_summaries(bitrates),
        });
    }

    pub fn level_loaded(&mut self, level: usize, details: LevelDetails) {
        self.event(StreamEvent::LevelLoaded { level, details });
    }

    pub fn advance(&mut self, duration: Duration) {
        self.now += duration;
    }

    pub fn tick(&mut self) {
        self.scheduler.tick(self.now);
    }

    /// Drain every event published so far.
    pub fn drain_events(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Deliver the in-flight fragment's payload.
    pub fn complete_load(&mut self) -> FragKey {
        let frag = self
            .scheduler
            .frag_current()
            .expect("a fragment is in flight")
            .key;
        self.scheduler
            .on_frag_loaded(frag, Bytes::from_static(&[0u8; 1024]), self.now);
        frag
    }

    /// Deliver a transmux result mirroring the fragment's playlist timing.
    pub fn complete_transmux(&mut self, dropped: u32) {
        let frag = self
            .scheduler
            .frag_current()
            .expect("a fragment is being parsed")
            .clone();
        self.scheduler
            .on_transmux_complete(transmux_result(&frag, dropped), self.now);
    }

    /// Report the sink's append completion, first mirroring the
    /// fragment's range into the media buffer.
    pub fn complete_append(&mut self) {
        if let Some(frag) = self.scheduler.frag_current() {
            let (start, end) = (frag.start, frag.end());
            if let Some(media) = &self.media {
                media.state().append_range(start, end);
            }
        }
        self.event(StreamEvent::BufferAppended {
            parent: StreamTarget::Main,
            pending: 0,
        });
    }

    /// Drive one fragment through load, parse, and append.
    pub fn run_frag_cycle(&mut self) -> FragKey {
        let key = self.complete_load();
        self.advance(Duration::from_millis(50));
        self.complete_transmux(0);
        self.advance(Duration::from_millis(20));
        self.complete_append();
        key
    }
}

pub fn transmux_result(frag: &Fragment, dropped: u32) -> TransmuxResult {
    let (start, end) = (frag.start, frag.end());
    TransmuxResult {
        frag: frag.key,
        init: None,
        audio: Some(TrackPayload {
            kind: TrackKind::Audio,
            data: Bytes::from_static(b"audio"),
            start_pts: start,
            end_pts: end,
            start_dts: start,
            end_dts: end,
            dropped: 0,
        }),
        video: Some(TrackPayload {
            kind: TrackKind::Video,
            data: Bytes::from_static(b"video"),
            start_pts: start,
            end_pts: end,
            start_dts: start,
            end_dts: end,
            dropped,
        }),
        id3: None,
        text: None,
    }
}

pub fn frag_error(kind: ErrorKind, frag: FragKey) -> StreamEvent {
    StreamEvent::Error(ErrorEvent {
        kind,
        fatal: false,
        frag: Some(frag),
        parent: Some(StreamTarget::Main),
        level_retry: false,
    })
}
