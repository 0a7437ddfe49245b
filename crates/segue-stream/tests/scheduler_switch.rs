#![forbid(unsafe_code)]

//! Immediate and smooth level switching.

use std::time::Duration;

use rstest::{fixture, rstest};
use segue_events::StreamEvent;
use segue_stream::{SchedulerState, StreamConfig};

mod fixture;
use fixture::{FakeMedia, Harness, vod_details};

#[fixture]
fn tracing_setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::default().add_directive("warn".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

#[rstest]
fn immediate_switch_pauses_flushes_and_resumes(tracing_setup: ()) {
    let _ = tracing_setup;
    let config = StreamConfig::default().with_test_bandwidth(false);
    let mut h = Harness::new(config);
    h.manifest(&[500_000, 2_000_000]);
    h.attach_media(FakeMedia::new(0.0, 4));
    h.scheduler.start_load(Some(0.0), h.now);
    h.level_loaded(0, vod_details(0, 10, 6.0));

    // Buffer a couple of fragments, leave a third in flight.
    h.run_frag_cycle();
    h.run_frag_cycle();
    assert!(h.scheduler.frag_current().is_some());
    h.media().state().time = 12.0;
    h.drain_events();

    h.scheduler.immediate_level_switch(h.now);

    // Playback pauses, the in-flight load is aborted, everything flushes.
    assert_eq!(h.media().state().pause_calls, 1);
    assert_eq!(h.loader.abort_count(), 1);
    assert!(h.scheduler.frag_current().is_none());
    assert_eq!(h.scheduler.state(), SchedulerState::BufferFlushing);
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::BufferFlushing { start_offset, end_offset, .. }
            if *start_offset == 0.0 && end_offset.is_infinite()
    )));

    // Sink reports the flush; scheduler resumes loading on the new level.
    h.media().state().buffered.clear();
    h.scheduler.set_level(1, h.now);
    h.event(StreamEvent::BufferFlushed);
    h.level_loaded(1, vod_details(1, 10, 6.0));

    let req = h.loader.last().unwrap();
    assert_eq!(req.frag.level, 1);
    assert_eq!(req.frag.sn, 2);

    // Once the new-level fragment covers the playhead, the decoder is
    // nudged and playback resumes.
    h.run_frag_cycle();
    let state = h.media().state();
    assert!(state.seeks.iter().any(|s| (s - (12.0 - 0.0001)).abs() < 1e-9));
    assert_eq!(state.play_calls, 1);
    assert!(!state.paused);
}

#[rstest]
fn smooth_switch_flushes_past_the_fetch_window(tracing_setup: ()) {
    let _ = tracing_setup;
    let config = StreamConfig::default().with_test_bandwidth(false);
    let mut h = Harness::new(config);
    h.manifest(&[500_000, 2_000_000]);
    h.attach_media(FakeMedia::new(0.0, 4));
    h.scheduler.start_load(Some(0.0), h.now);
    h.level_loaded(0, vod_details(0, 10, 6.0));

    h.run_frag_cycle();
    h.run_frag_cycle();
    h.media().state().time = 2.0;
    // Paused media: no fetch-delay headroom is needed.
    h.media().state().paused = true;
    h.drain_events();

    h.scheduler.set_level(1, h.now);
    h.scheduler.next_level_switch(h.now);

    // The fragment after the one at the playhead survives; everything
    // past its start is flushed.
    assert_eq!(h.loader.abort_count(), 1);
    assert_eq!(h.scheduler.state(), SchedulerState::BufferFlushing);
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::BufferFlushing { start_offset, end_offset, .. }
            if (*start_offset - 6.0).abs() < 1e-9 && end_offset.is_infinite()
    )));
}

#[rstest]
fn slow_throughput_defers_smooth_switch(tracing_setup: ()) {
    let _ = tracing_setup;
    let config = StreamConfig::default().with_test_bandwidth(false);
    let mut h = Harness::new(config);
    h.manifest(&[500_000, 2_000_000]);
    h.attach_media(FakeMedia::new(0.0, 4));
    h.scheduler.start_load(Some(0.0), h.now);
    h.level_loaded(0, vod_details(0, 10, 6.0));

    // Slow loads: measured throughput makes the fetch delay enormous.
    h.complete_load();
    h.advance(Duration::from_secs(5));
    h.complete_transmux(0);
    h.complete_append();
    h.media().state().time = 2.0;
    h.drain_events();

    h.scheduler.set_level(1, h.now);
    h.scheduler.next_level_switch(h.now);

    // Nothing buffered that far ahead: no flush, playback continues.
    assert_ne!(h.scheduler.state(), SchedulerState::BufferFlushing);
    let events = h.drain_events();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, StreamEvent::BufferFlushing { .. }))
    );
}
