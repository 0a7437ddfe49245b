#![forbid(unsafe_code)]

//! Key sequencing, seeks, audio-track switches, and restart behavior.

use rstest::{fixture, rstest};
use segue_events::StreamEvent;
use segue_stream::{SchedulerState, StreamConfig};

mod fixture;
use fixture::{FakeMedia, Harness, make_details, vod_details};

#[fixture]
fn tracing_setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::default().add_directive("warn".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

fn harness() -> Harness {
    let config = StreamConfig::default().with_test_bandwidth(false);
    let mut h = Harness::new(config);
    h.manifest(&[1_000_000]);
    h.attach_media(FakeMedia::new(0.0, 4));
    h.scheduler.start_load(Some(0.0), h.now);
    h
}

#[rstest]
fn encrypted_fragment_waits_for_its_key(tracing_setup: ()) {
    let _ = tracing_setup;
    let mut h = harness();
    let mut details = vod_details(0, 5, 6.0);
    for frag in &mut details.fragments {
        frag.encrypted = true;
    }
    h.level_loaded(0, details);

    // No fragment load yet: the key comes first.
    assert_eq!(h.loader.count(), 0);
    assert_eq!(h.scheduler.state(), SchedulerState::KeyLoading);
    let events = h.drain_events();
    assert!(events.iter().any(
        |e| matches!(e, StreamEvent::KeyLoading { frag } if frag.sn == 0)
    ));

    // Key arrives: the fragment load follows on the same tick.
    h.event(StreamEvent::KeyLoaded {
        frag: segue_core::FragKey::new(0, 0),
    });
    assert_eq!(h.loader.count(), 1);
    assert_eq!(h.scheduler.state(), SchedulerState::FragLoading);
}

#[rstest]
fn stale_key_loaded_is_ignored(tracing_setup: ()) {
    let _ = tracing_setup;
    let mut h = harness();
    let mut details = vod_details(0, 5, 6.0);
    details.fragments[0].encrypted = true;
    h.level_loaded(0, details);
    assert_eq!(h.scheduler.state(), SchedulerState::KeyLoading);

    h.event(StreamEvent::KeyLoaded {
        frag: segue_core::FragKey::new(0, 3),
    });
    assert_eq!(h.scheduler.state(), SchedulerState::KeyLoading);
    assert_eq!(h.loader.count(), 0);
}

#[rstest]
fn seek_outside_inflight_fragment_aborts_the_load(tracing_setup: ()) {
    let _ = tracing_setup;
    let mut h = harness();
    h.level_loaded(0, vod_details(0, 10, 6.0));
    assert_eq!(h.loader.last().unwrap().frag.sn, 0);

    {
        let mut state = h.media().state();
        state.time = 50.0;
        state.seeking = true;
    }
    h.scheduler.on_media_seeking(h.now);

    assert_eq!(h.loader.abort_count(), 1);
    // The next load targets the seek position.
    assert_eq!(h.loader.last().unwrap().frag.sn, 8);
}

#[rstest]
fn seek_command_moves_the_playhead_and_retargets_loading(tracing_setup: ()) {
    let _ = tracing_setup;
    let mut h = harness();
    h.level_loaded(0, vod_details(0, 10, 6.0));
    assert_eq!(h.loader.last().unwrap().frag.sn, 0);

    h.scheduler.seek(50.0, h.now);

    assert_eq!(h.media().state().seeks, vec![50.0]);
    assert_eq!(h.loader.abort_count(), 1);
    assert_eq!(h.loader.last().unwrap().frag.sn, 8);
}

#[rstest]
fn seek_inside_inflight_fragment_keeps_the_load(tracing_setup: ()) {
    let _ = tracing_setup;
    let mut h = harness();
    h.level_loaded(0, vod_details(0, 10, 6.0));

    {
        let mut state = h.media().state();
        state.time = 3.0;
        state.seeking = true;
    }
    h.scheduler.on_media_seeking(h.now);

    assert_eq!(h.loader.abort_count(), 0);
    assert_eq!(h.scheduler.state(), SchedulerState::FragLoading);
}

#[rstest]
fn switching_back_to_main_audio_restarts_the_pipeline(tracing_setup: ()) {
    let _ = tracing_setup;
    let mut h = harness();
    h.level_loaded(0, vod_details(0, 10, 6.0));
    let loads = h.loader.count();

    h.event(StreamEvent::AudioTrackSwitching { id: 0, url: None });

    // In-flight load aborted, transmuxer torn down, then a fresh load.
    assert_eq!(h.loader.abort_count(), 1);
    assert_eq!(*h.transmuxer.destroys.lock().unwrap(), 1);
    assert_eq!(h.loader.count(), loads + 1);
}

#[rstest]
fn emergency_abort_reissues_the_fragment(tracing_setup: ()) {
    let _ = tracing_setup;
    let mut h = harness();
    h.level_loaded(0, vod_details(0, 10, 6.0));
    assert_eq!(h.loader.count(), 1);

    h.event(StreamEvent::FragLoadEmergencyAborted);
    assert_eq!(h.loader.count(), 2);
    assert_eq!(h.loader.last().unwrap().frag.sn, 0);
}

#[rstest]
fn stop_and_restart_resumes_loading(tracing_setup: ()) {
    let _ = tracing_setup;
    let mut h = harness();
    h.level_loaded(0, vod_details(0, 10, 6.0));
    h.run_frag_cycle();

    h.scheduler.stop_load();
    assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    let loads = h.loader.count();
    h.tick();
    assert_eq!(h.loader.count(), loads);

    h.scheduler.start_load(Some(0.0), h.now);
    assert!(h.loader.count() > loads);
}

#[rstest]
fn manifest_reload_resets_the_scheduler(tracing_setup: ()) {
    let _ = tracing_setup;
    let mut h = harness();
    h.level_loaded(0, vod_details(0, 10, 6.0));
    h.run_frag_cycle();
    h.drain_events();

    h.event(StreamEvent::ManifestLoading);
    assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    let events = h.drain_events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, StreamEvent::BufferReset))
    );
}

#[rstest]
fn live_start_without_media_uses_prefetch_rules(tracing_setup: ()) {
    let _ = tracing_setup;
    // Without media and without prefetch, nothing loads.
    let config = StreamConfig::default().with_test_bandwidth(false);
    let mut h = Harness::new(config);
    h.manifest(&[1_000_000]);
    h.scheduler.start_load(None, h.now);
    h.level_loaded(0, make_details(0, 0, 5, 0.0, 6.0, true));
    assert_eq!(h.loader.count(), 0);
}
