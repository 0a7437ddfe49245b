#![forbid(unsafe_code)]

use std::time::Duration;

/// Configuration for the scheduling core.
///
/// Buffer targets are in seconds unless noted otherwise. Defaults suit a
/// general-purpose player; latency-sensitive live deployments usually
/// lower `live_sync_duration_count`.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Target ahead-buffer, seconds.
    pub max_buffer_length: f64,
    /// Hard cap on the ahead-buffer; halved at runtime on buffer-full
    /// pressure, never below `max_buffer_length`.
    pub max_max_buffer_length: f64,
    /// Ahead-buffer cap in bytes, converted through the level bitrate.
    pub max_buffer_size: u64,
    /// Max gap treated as contiguous when probing buffered ranges.
    pub max_buffer_hole: f64,
    /// Slack around fragment boundaries in PTS search.
    pub max_frag_lookup_tolerance: f64,
    /// Target latency behind the live edge, seconds. Overrides the
    /// count-based setting when set.
    pub live_sync_duration: Option<f64>,
    /// Target latency behind the live edge, in target-duration units.
    pub live_sync_duration_count: u32,
    /// Catch-up threshold, seconds. Overrides the count-based setting
    /// when set.
    pub live_max_latency_duration: Option<f64>,
    /// Catch-up threshold in target-duration units. `None` disables
    /// latency-based catch-up.
    pub live_max_latency_duration_count: Option<u32>,
    /// Minimum fragments required before the first live load.
    pub initial_live_manifest_size: usize,
    /// Allow fragment fetch before media attaches.
    pub start_frag_prefetch: bool,
    /// Forced start level; `None` means auto.
    pub start_level: Option<usize>,
    /// When the start level is auto, fetch the lowest level's first
    /// fragment as a bandwidth probe before committing to a level.
    pub test_bandwidth: bool,
    /// Fragment load retry envelope.
    pub frag_loading_max_retry: u32,
    pub frag_loading_retry_delay: Duration,
    pub frag_loading_max_retry_timeout: Duration,
    /// Overrides the level's declared audio codec.
    pub default_audio_codec: Option<String>,
    /// Initial seek target, seconds. `None` starts at the playlist start
    /// (or the live sync position).
    pub start_position: Option<f64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_length: 30.0,
            max_max_buffer_length: 600.0,
            max_buffer_size: 60_000_000,
            max_buffer_hole: 0.5,
            max_frag_lookup_tolerance: 0.25,
            live_sync_duration: None,
            live_sync_duration_count: 3,
            live_max_latency_duration: None,
            live_max_latency_duration_count: None,
            initial_live_manifest_size: 1,
            start_frag_prefetch: false,
            start_level: None,
            test_bandwidth: true,
            frag_loading_max_retry: 6,
            frag_loading_retry_delay: Duration::from_millis(1000),
            frag_loading_max_retry_timeout: Duration::from_millis(64_000),
            default_audio_codec: None,
            start_position: None,
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target ahead-buffer, seconds.
    pub fn with_max_buffer_length(mut self, secs: f64) -> Self {
        self.max_buffer_length = secs;
        self
    }

    /// Set the hard cap on the ahead-buffer, seconds.
    pub fn with_max_max_buffer_length(mut self, secs: f64) -> Self {
        self.max_max_buffer_length = secs;
        self
    }

    /// Set the ahead-buffer cap in bytes.
    pub fn with_max_buffer_size(mut self, bytes: u64) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    /// Set the max gap treated as contiguous, seconds.
    pub fn with_max_buffer_hole(mut self, secs: f64) -> Self {
        self.max_buffer_hole = secs;
        self
    }

    /// Set the live sync latency in target-duration units.
    pub fn with_live_sync_duration_count(mut self, count: u32) -> Self {
        self.live_sync_duration_count = count;
        self
    }

    /// Set the live catch-up threshold in target-duration units.
    pub fn with_live_max_latency_duration_count(mut self, count: u32) -> Self {
        self.live_max_latency_duration_count = Some(count);
        self
    }

    /// Force a start level instead of auto selection.
    pub fn with_start_level(mut self, level: usize) -> Self {
        self.start_level = Some(level);
        self
    }

    /// Enable or disable the start-up bandwidth probe.
    pub fn with_test_bandwidth(mut self, enabled: bool) -> Self {
        self.test_bandwidth = enabled;
        self
    }

    /// Set the fragment retry envelope.
    pub fn with_frag_retry(mut self, max_retry: u32, delay: Duration, timeout: Duration) -> Self {
        self.frag_loading_max_retry = max_retry;
        self.frag_loading_retry_delay = delay;
        self.frag_loading_max_retry_timeout = timeout;
        self
    }

    /// Set the initial seek target, seconds.
    pub fn with_start_position(mut self, secs: f64) -> Self {
        self.start_position = Some(secs);
        self
    }

    /// Allow fragment fetch before media attaches.
    pub fn with_start_frag_prefetch(mut self, enabled: bool) -> Self {
        self.start_frag_prefetch = enabled;
        self
    }

    /// Target latency behind the live edge for the given target duration.
    pub fn live_sync_latency(&self, target_duration: f64) -> f64 {
        self.live_sync_duration
            .unwrap_or(f64::from(self.live_sync_duration_count) * target_duration)
    }

    /// Catch-up threshold for the given target duration, if enabled.
    pub fn live_max_latency(&self, target_duration: f64) -> Option<f64> {
        self.live_max_latency_duration
            .or_else(|| {
                self.live_max_latency_duration_count
                    .map(|c| f64::from(c) * target_duration)
            })
    }
}
