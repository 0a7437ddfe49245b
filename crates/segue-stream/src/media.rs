#![forbid(unsafe_code)]

//! The media element as seen by the scheduling core.

use crate::buffer::TimeRanges;

/// Readiness of the attached media element, mirroring the
/// HTMLMediaElement `readyState` ladder.
pub mod ready_state {
    pub const HAVE_NOTHING: u8 = 0;
    pub const HAVE_METADATA: u8 = 1;
    pub const HAVE_CURRENT_DATA: u8 = 2;
    pub const HAVE_FUTURE_DATA: u8 = 3;
    pub const HAVE_ENOUGH_DATA: u8 = 4;
}

/// Capabilities the scheduler requires from the attached media element.
///
/// The scheduler treats the element as read-only apart from
/// `set_current_time` (start-up seek, live catch-up, switch nudge, hole
/// jump) and `play`/`pause` around immediate level switches. `seeking`,
/// `seeked`, and `ended` notifications are delivered to the scheduler by
/// whoever owns the element.
pub trait Media: Send {
    fn current_time(&self) -> f64;
    fn set_current_time(&mut self, pos: f64);
    fn ready_state(&self) -> u8;
    fn seeking(&self) -> bool;
    fn paused(&self) -> bool;
    fn duration(&self) -> f64;
    /// Ordered, disjoint buffered ranges.
    fn buffered(&self) -> TimeRanges;
    fn play(&mut self);
    fn pause(&mut self);
}
