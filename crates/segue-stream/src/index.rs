#![forbid(unsafe_code)]

//! Pure fragment lookup over a level's fragment list.

use std::cmp::Ordering;

use segue_core::Fragment;

/// Where a fragment sits relative to a probe time, with boundary slack.
///
/// The slack is clamped to half the fragment duration so that very short
/// fragments cannot be skipped entirely by a generous tolerance.
fn tolerance_test(frag: &Fragment, buffer_end: f64, tolerance: f64) -> Ordering {
    let tol = tolerance.min(frag.duration / 2.0);
    if buffer_end >= frag.start + frag.duration - tol {
        Ordering::Less
    } else if buffer_end < frag.start - tol {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Find the fragment whose interval covers `buffer_end`.
///
/// `prev` is the previously loaded fragment; when its successor covers
/// the probe this avoids the binary search entirely (the common case of
/// sequential playback).
///
/// Returns `None` when the list is empty or `buffer_end` is at or past
/// the last fragment's end — the caller decides whether that means
/// end-of-stream or a slid live window.
pub fn find_fragment_by_pts<'a>(
    prev: Option<&Fragment>,
    fragments: &'a [Fragment],
    buffer_end: f64,
    tolerance: f64,
) -> Option<&'a Fragment> {
    let (first, last) = (fragments.first()?, fragments.last()?);
    if buffer_end >= last.end() {
        return None;
    }
    if buffer_end < first.start {
        return Some(first);
    }

    if let Some(prev) = prev
        && prev.level() == first.level()
        && let Some(idx) = sn_index(fragments, prev.sn() + 1)
    {
        let next = &fragments[idx];
        if tolerance_test(next, buffer_end, tolerance) == Ordering::Equal {
            return Some(next);
        }
    }

    binary_search(fragments, |f| tolerance_test(f, buffer_end, tolerance))
}

/// Find the first fragment whose `[program_date_time, end_program_date_time)`
/// contains `pdt`, or the nearest fragment within `tolerance` seconds.
pub fn find_fragment_by_pdt(fragments: &[Fragment], pdt: f64, tolerance: f64) -> Option<&Fragment> {
    let mut nearest: Option<(&Fragment, f64)> = None;
    for frag in fragments {
        let (Some(start), Some(end)) = (frag.program_date_time, frag.end_program_date_time) else {
            continue;
        };
        if pdt >= start && pdt < end {
            return Some(frag);
        }
        let distance = if pdt < start { start - pdt } else { pdt - end };
        if distance <= tolerance && nearest.is_none_or(|(_, d)| distance < d) {
            nearest = Some((frag, distance));
        }
    }
    nearest.map(|(frag, _)| frag)
}

/// Binary search for a fragment with the given discontinuity counter.
///
/// `cc` is non-decreasing within a level, so any match is acceptable.
pub fn find_fragment_by_cc(fragments: &[Fragment], cc: u32) -> Option<&Fragment> {
    binary_search(fragments, |f| f.cc.cmp(&cc))
}

/// Index of the fragment with sequence number `sn`, if in range.
pub fn sn_index(fragments: &[Fragment], sn: u64) -> Option<usize> {
    let start_sn = fragments.first()?.sn();
    if sn < start_sn {
        return None;
    }
    let idx = (sn - start_sn) as usize;
    (idx < fragments.len()).then_some(idx)
}

/// Generic binary search: `probe` says whether a candidate lies before
/// (`Less`), after (`Greater`), or at (`Equal`) the sought position.
fn binary_search<F>(fragments: &[Fragment], probe: F) -> Option<&Fragment>
where
    F: Fn(&Fragment) -> Ordering,
{
    let mut lo = 0usize;
    let mut hi = fragments.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        match probe(&fragments[mid]) {
            Ordering::Equal => return Some(&fragments[mid]),
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
        }
    }
    None
}
