#![forbid(unsafe_code)]

//! Shared data model for the segue streaming stack.
//!
//! Fragment identity is always `(level, sn)`; components reference
//! fragments through [`FragKey`] and resolve them against the owning
//! [`LevelDetails`] at call time.

mod frag;
mod level;
mod track;

pub use frag::{ElementaryStream, ElementaryStreams, FragKey, FragStats, Fragment};
pub use level::{InitSegment, LevelDetails, LevelSummary};
pub use track::{StreamTarget, TrackInfo, TrackKind};
