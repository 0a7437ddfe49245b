#![forbid(unsafe_code)]

//! Per-level playlist snapshots.

use bytes::Bytes;
use url::Url;

use crate::frag::Fragment;

/// Codec-init bytes required before media fragments of a level can be
/// decoded (fMP4 streams). `data` is filled in once loaded; a level whose
/// init segment already has data is never re-fetched.
#[derive(Debug, Clone)]
pub struct InitSegment {
    pub url: Url,
    pub data: Option<Bytes>,
}

impl InitSegment {
    pub fn new(url: Url) -> Self {
        Self { url, data: None }
    }
}

/// Static attributes of one quality level from the multivariant playlist.
#[derive(Debug, Clone)]
pub struct LevelSummary {
    pub url: Url,
    /// Advertised bandwidth in bits per second.
    pub bitrate: Option<u64>,
    /// Audio codec declared by the playlist, if any.
    pub audio_codec: Option<String>,
}

/// Snapshot of one quality level's media playlist.
///
/// Fragment sequence numbers are contiguous from `start_sn` to `end_sn`,
/// and `fragments[i + 1].start == fragments[i].end()`.
#[derive(Debug, Clone)]
pub struct LevelDetails {
    pub fragments: Vec<Fragment>,
    pub start_sn: u64,
    pub end_sn: u64,
    pub start_cc: u32,
    pub end_cc: u32,
    pub target_duration: f64,
    pub live: bool,
    /// True once at least one fragment of this snapshot carries parsed PTS
    /// (inherited across live reloads).
    pub pts_known: bool,
    pub has_program_date_time: bool,
    pub init_segment: Option<InitSegment>,
    pub start_time_offset: Option<f64>,
}

impl LevelDetails {
    /// Build details from a fragment list, deriving the SN/CC bounds.
    pub fn new(fragments: Vec<Fragment>, target_duration: f64, live: bool) -> Self {
        let start_sn = fragments.first().map_or(0, Fragment::sn);
        let end_sn = fragments.last().map_or(0, Fragment::sn);
        let start_cc = fragments.first().map_or(0, |f| f.cc);
        let end_cc = fragments.last().map_or(0, |f| f.cc);
        let has_program_date_time = fragments.iter().any(|f| f.program_date_time.is_some());
        Self {
            fragments,
            start_sn,
            end_sn,
            start_cc,
            end_cc,
            target_duration,
            live,
            pts_known: false,
            has_program_date_time,
            init_segment: None,
            start_time_offset: None,
        }
    }

    pub fn total_duration(&self) -> f64 {
        self.fragments.iter().map(|f| f.duration).sum()
    }

    /// Start of the sliding window (first fragment's start).
    pub fn start(&self) -> f64 {
        self.fragments.first().map_or(0.0, |f| f.start)
    }

    /// Far end of the playlist (last fragment's end).
    pub fn edge(&self) -> f64 {
        self.fragments.last().map_or(0.0, Fragment::end)
    }

    pub fn index_of(&self, sn: u64) -> Option<usize> {
        if sn < self.start_sn || sn > self.end_sn {
            return None;
        }
        let idx = (sn - self.start_sn) as usize;
        (idx < self.fragments.len()).then_some(idx)
    }

    pub fn frag(&self, sn: u64) -> Option<&Fragment> {
        self.index_of(sn).map(|i| &self.fragments[i])
    }

    pub fn frag_mut(&mut self, sn: u64) -> Option<&mut Fragment> {
        self.index_of(sn).map(|i| &mut self.fragments[i])
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::frag::FragKey;

    fn details(start_sn: u64, count: u64) -> LevelDetails {
        let url = Url::parse("https://cdn.example.com/seg.ts").unwrap();
        let fragments = (0..count)
            .map(|i| {
                Fragment::new(
                    FragKey::new(0, start_sn + i),
                    i as f64 * 4.0,
                    4.0,
                    0,
                    url.clone(),
                )
            })
            .collect();
        LevelDetails::new(fragments, 4.0, false)
    }

    #[test]
    fn sn_bounds_derived_from_fragments() {
        let d = details(10, 5);
        assert_eq!(d.start_sn, 10);
        assert_eq!(d.end_sn, 14);
        assert_eq!(d.total_duration(), 20.0);
        assert_eq!(d.edge(), 20.0);
    }

    #[test]
    fn frag_lookup_by_sn() {
        let mut d = details(10, 5);
        assert!(d.frag(9).is_none());
        assert!(d.frag(15).is_none());
        assert_eq!(d.frag(12).unwrap().sn(), 12);
        d.frag_mut(14).unwrap().backtracked = true;
        assert!(d.fragments[4].backtracked);
    }

    #[test]
    fn empty_details_have_zero_edge() {
        let d = LevelDetails::new(Vec::new(), 4.0, true);
        assert_eq!(d.start(), 0.0);
        assert_eq!(d.edge(), 0.0);
    }
}
