#![forbid(unsafe_code)]

//! Stall detection and hole jumping.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::{buffer::buffer_info, media::Media};

/// How long the playhead must sit still before intervening.
const STALL_HANDLING_DELAY: Duration = Duration::from_secs(1);
/// Seek increment applied when the playhead is stuck inside buffered data.
const NUDGE_OFFSET: f64 = 0.1;
/// Give up nudging after this many attempts per stall.
const MAX_NUDGES: u32 = 3;
/// Margin added when jumping to the far side of a hole.
const HOLE_SKIP_MARGIN: f64 = 0.005;

/// Watches playback progress on each tick and moves `current_time`
/// forward when the playhead is wedged against an unrecoverable hole.
#[derive(Debug, Default)]
pub struct GapController {
    last_time: f64,
    stalled_since: Option<Instant>,
    nudge_count: u32,
}

impl GapController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.stalled_since = None;
        self.nudge_count = 0;
    }

    /// Inspect playback progress; called once per tick while media is
    /// attached and no switch recovery is in progress.
    pub fn poll(&mut self, media: &mut dyn Media, max_buffer_hole: f64, now: Instant) {
        if media.ready_state() < 2 || media.seeking() || media.paused() {
            self.reset();
            return;
        }

        let pos = media.current_time();
        if pos != self.last_time {
            self.last_time = pos;
            self.reset();
            return;
        }

        let since = *self.stalled_since.get_or_insert(now);
        if now.saturating_duration_since(since) < STALL_HANDLING_DELAY {
            return;
        }

        let buffered = media.buffered();
        let info = buffer_info(&buffered, pos, max_buffer_hole);
        if info.len > 0.5 {
            // Data is buffered ahead but the decoder will not advance;
            // nudge the playhead to kick it loose.
            if self.nudge_count < MAX_NUDGES {
                self.nudge_count += 1;
                let target = pos + NUDGE_OFFSET * f64::from(self.nudge_count);
                warn!(pos, target, "playback stalled inside buffer, nudging");
                media.set_current_time(target);
            }
        } else if let Some(next_start) = info.next_start {
            // Stuck against a hole wider than the merge tolerance; jump it.
            let target = next_start + HOLE_SKIP_MARGIN;
            warn!(pos, target, "playback stalled at buffer hole, jumping");
            media.set_current_time(target);
            self.reset();
        }
    }
}
