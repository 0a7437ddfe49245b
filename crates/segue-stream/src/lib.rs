#![forbid(unsafe_code)]

//! Adaptive segment scheduling core for HLS playback.
//!
//! The [`Scheduler`] is a tick-driven state machine that couples three
//! inputs — the playback position, the buffered time ranges, and the
//! selected level's playlist — into fragment-load / parse / append
//! decisions. Playlist loading, HTTP transport, transmuxing, and buffer
//! I/O are collaborators reached through the event bus and the
//! [`FragmentLoader`] / [`Transmuxer`] traits.
//!
//! The scheduler itself is synchronous and single-owner: every entry
//! point takes an explicit `now: Instant`, which keeps the state machine
//! deterministic under test. [`StreamDriver`] wires it to real time on a
//! tokio task with a 100 ms tick.

pub mod buffer;
pub mod config;
pub mod driver;
pub mod error;
pub mod gap;
pub mod index;
pub mod level;
pub mod loader;
pub mod media;
pub mod scheduler;
pub mod tracker;

pub use buffer::{BufferInfo, TimeRange, TimeRanges, buffer_info};
pub use config::StreamConfig;
pub use driver::{DriverHandle, StreamCommand, StreamDriver, TICK_INTERVAL};
pub use error::{StreamError, StreamResult};
pub use gap::GapController;
pub use level::{Level, LevelUpdate, Levels};
pub use loader::{
    FragmentLoader, InitTrack, LoadKind, LoadRequest, ParsedInit, TrackPayload, TransmuxJob,
    TransmuxResult, Transmuxer,
};
pub use media::Media;
pub use scheduler::{Scheduler, SchedulerState};
pub use tracker::{BufferedFrag, FragState, FragmentTracker};
