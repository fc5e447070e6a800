//! Byte-range interpretation for `Range: bytes=...` headers.
//!
//! Supported range-spec forms:
//! - `start-end` a closed range, `end` clamped to the last byte
//! - `start-` from `start` to the end of the file
//! - `-suffix` the last `suffix` bytes
//!
//! Several comma-separated specs may be given. Specs that fall outside the
//! file are dropped; if nothing survives the request is unsatisfiable.
//! Surviving ranges are sorted and overlapping or adjacent ones merged, so a
//! `Partial` decision always holds an ordered, non-overlapping set.

use std::fmt;

/// Upper bound on range-specs considered from a single header.
const MAX_RANGE_SPECS: usize = 64;

/// An inclusive byte range `[start, end]` inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the `Content-Range` header of this range.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeDecision {
    Full,
    Partial(Vec<ByteRange>),
    Unsatisfiable,
}

/// Decides how much of a file of `file_length` bytes a request asked for.
///
/// A missing header, a unit other than `bytes`, or a header that is not
/// valid byte-range syntax all mean `Full`: such headers are ignored rather
/// than rejected.
pub fn compute(range_header: Option<&str>, file_length: u64) -> RangeDecision {
    let Some(header) = range_header else {
        return RangeDecision::Full;
    };

    let Some((unit, set)) = header.trim().split_once('=') else {
        return RangeDecision::Full;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return RangeDecision::Full;
    }

    let mut specs = Vec::new();
    for raw in set.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match parse_spec(raw) {
            Some(spec) => specs.push(spec),
            None => return RangeDecision::Full,
        }
        if specs.len() > MAX_RANGE_SPECS {
            return RangeDecision::Full;
        }
    }
    if specs.is_empty() {
        return RangeDecision::Full;
    }

    let mut ranges: Vec<ByteRange> = specs
        .into_iter()
        .filter_map(|spec| spec.clamp(file_length))
        .collect();
    if ranges.is_empty() {
        return RangeDecision::Unsatisfiable;
    }

    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }

    RangeDecision::Partial(merged)
}

/// One syntactically valid range-spec, before it is checked against a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    FromTo(u64, u64),
    From(u64),
    Suffix(u64),
}

impl RangeSpec {
    fn clamp(self, file_length: u64) -> Option<ByteRange> {
        if file_length == 0 {
            return None;
        }
        let last = file_length - 1;
        match self {
            RangeSpec::FromTo(start, end) => {
                let end = end.min(last);
                (start <= end).then_some(ByteRange { start, end })
            }
            RangeSpec::From(start) => (start <= last).then_some(ByteRange { start, end: last }),
            RangeSpec::Suffix(0) => None,
            RangeSpec::Suffix(n) => Some(ByteRange {
                start: file_length.saturating_sub(n),
                end: last,
            }),
        }
    }
}

fn parse_spec(raw: &str) -> Option<RangeSpec> {
    let (start, end) = raw.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        (true, true) => None,
        (true, false) => parse_number(end).map(RangeSpec::Suffix),
        (false, true) => parse_number(start).map(RangeSpec::From),
        (false, false) => {
            let start = parse_number(start)?;
            let end = parse_number(end)?;
            Some(RangeSpec::FromTo(start, end))
        }
    }
}

fn parse_number(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
