#![forbid(unsafe_code)]

//! Buffer view: what is buffered ahead of a given position.

/// One contiguous buffered interval, `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, pos: f64) -> bool {
        pos >= self.start && pos < self.end
    }
}

/// Ordered, disjoint set of buffered intervals, mirroring the media
/// element's `buffered` attribute.
#[derive(Debug, Clone, Default)]
pub struct TimeRanges(Vec<TimeRange>);

impl TimeRanges {
    pub fn new(ranges: Vec<TimeRange>) -> Self {
        Self(ranges)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeRange> {
        self.0.iter()
    }

    /// Whether `pos` lies inside any buffered interval.
    pub fn contains(&self, pos: f64) -> bool {
        self.0.iter().any(|r| r.contains(pos))
    }

    /// Whether `[start, end)` intersects any buffered interval.
    pub fn intersects(&self, start: f64, end: f64) -> bool {
        self.0.iter().any(|r| start < r.end && end > r.start)
    }

    /// Whether `[start, end)` is fully covered, tolerating boundary slack.
    pub fn covers(&self, start: f64, end: f64, tolerance: f64) -> bool {
        self.0
            .iter()
            .any(|r| r.start <= start + tolerance && r.end >= end - tolerance)
    }
}

impl From<Vec<(f64, f64)>> for TimeRanges {
    fn from(ranges: Vec<(f64, f64)>) -> Self {
        Self(
            ranges
                .into_iter()
                .map(|(start, end)| TimeRange { start, end })
                .collect(),
        )
    }
}

/// Buffered region ahead of a probe position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferInfo {
    pub start: f64,
    pub end: f64,
    /// Seconds buffered ahead of the probe position.
    pub len: f64,
    /// Start of the next buffered range past any unbridgeable hole.
    pub next_start: Option<f64>,
}

impl BufferInfo {
    fn empty(pos: f64) -> Self {
        Self {
            start: pos,
            end: pos,
            len: 0.0,
            next_start: None,
        }
    }
}

/// Compute the buffered region ahead of `pos`.
///
/// Finds the range containing `pos` — or beginning within `max_hole`
/// seconds after it — then merges forward across successive ranges
/// separated by gaps of at most `max_hole`. `len` is the distance from
/// `pos` (or the merged range start, whichever is later) to the merged
/// end.
pub fn buffer_info(buffered: &TimeRanges, pos: f64, max_hole: f64) -> BufferInfo {
    let ranges = &buffered.0;
    let Some(first) = ranges
        .iter()
        .position(|r| r.contains(pos) || (r.start > pos && r.start - pos <= max_hole))
    else {
        let next_start = ranges.iter().map(|r| r.start).find(|s| *s > pos);
        let mut info = BufferInfo::empty(pos);
        info.next_start = next_start;
        return info;
    };

    let start = ranges[first].start.max(pos);
    let mut end = ranges[first].end;
    let mut next = first + 1;
    while next < ranges.len() && ranges[next].start - end <= max_hole {
        end = ranges[next].end;
        next += 1;
    }

    BufferInfo {
        start,
        end,
        len: (end - start.max(pos)).max(0.0),
        next_start: ranges.get(next).map(|r| r.start),
    }
}
