//! Range header parsing and multipart/byteranges framing.

use std::fmt::Write;

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid range")]
    Invalid,

    #[error("overlapping ranges")]
    Overlap,
}

/// One byte range to send: an offset into the entity and a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    pub start: u64,
    pub length: u64,
}

impl HttpRange {
    /// The `Content-Range` value for this slice of a `size`-byte entity.
    pub fn content_range(&self, size: u64) -> String {
        format!(
            "bytes {}-{}/{}",
            self.start,
            (self.start + self.length).saturating_sub(1),
            size
        )
    }
}

/// Parses a `Range` header against the known entity size.
///
/// An absent or empty header yields no ranges and is not an error. An
/// explicit start at or past the end of the entity is unsatisfiable; an end
/// past it is clamped. The suffix form `-N` addresses the final `N` bytes.
///
/// With `sorted` the ranges are reordered ascending by start. Without
/// `overlap_allowed` they are additionally required to be disjoint (this
/// implies sorting), which is what a forward-only source needs.
pub fn parse_range(
    header: Option<&str>,
    size: u64,
    overlap_allowed: bool,
    sorted: bool,
) -> Result<Vec<HttpRange>, RangeError> {
    let Some(header) = header.filter(|h| !h.is_empty()) else {
        return Ok(Vec::new());
    };
    let Some(list) = header.strip_prefix("bytes=") else {
        return Err(RangeError::Invalid);
    };

    let mut ranges = Vec::new();
    for spec in list.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let Some((start, end)) = spec.split_once('-') else {
            return Err(RangeError::Invalid);
        };
        let (start, end) = (start.trim(), end.trim());

        let range = if start.is_empty() {
            let suffix: u64 = end.parse().map_err(|_| RangeError::Invalid)?;
            let suffix = suffix.min(size);
            HttpRange {
                start: size - suffix,
                length: suffix,
            }
        } else {
            let start: u64 = start.parse().map_err(|_| RangeError::Invalid)?;
            if start >= size {
                return Err(RangeError::Invalid);
            }
            if end.is_empty() {
                HttpRange {
                    start,
                    length: size - start,
                }
            } else {
                let end: u64 = end.parse().map_err(|_| RangeError::Invalid)?;
                if start > end {
                    return Err(RangeError::Invalid);
                }
                let end = end.min(size - 1);
                HttpRange {
                    start,
                    length: end - start + 1,
                }
            }
        };
        ranges.push(range);
    }

    if sorted || !overlap_allowed {
        ranges.sort_by_key(|r| r.start);
    }
    if !overlap_allowed {
        for pair in ranges.windows(2) {
            if pair[1].start < pair[0].start + pair[0].length {
                return Err(RangeError::Overlap);
            }
        }
    }
    Ok(ranges)
}

pub fn sum_ranges_size(ranges: &[HttpRange]) -> u64 {
    ranges.iter().map(|r| r.length).sum()
}

/// A fresh multipart boundary: 30 random bytes, hex-encoded.
pub fn random_boundary() -> String {
    let bytes: [u8; 30] = rand::rng().random();
    let mut out = String::with_capacity(60);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// The header block introducing one part of a multipart/byteranges body.
/// Only the first part omits the leading CRLF.
pub fn part_header(
    boundary: &str,
    first: bool,
    range: &HttpRange,
    content_type: &str,
    size: u64,
) -> String {
    format!(
        "{lead}--{boundary}\r\nContent-Range: {cr}\r\nContent-Type: {content_type}\r\n\r\n",
        lead = if first { "" } else { "\r\n" },
        cr = range.content_range(size),
    )
}

/// The closing delimiter of a multipart/byteranges body.
pub fn trailer(boundary: &str) -> String {
    format!("\r\n--{boundary}--\r\n")
}

/// The exact encoded size of the whole multipart/byteranges body, so
/// Content-Length can be set before any part is produced.
pub fn byteranges_size(ranges: &[HttpRange], boundary: &str, content_type: &str, size: u64) -> u64 {
    let mut total = 0u64;
    for (i, range) in ranges.iter().enumerate() {
        total += part_header(boundary, i == 0, range, content_type, size).len() as u64;
        total += range.length;
    }
    total + trailer(boundary).len() as u64
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn one(header: &str, size: u64) -> HttpRange {
        let ranges = parse_range(Some(header), size, true, false).expect("parse");
        assert_eq!(ranges.len(), 1, "{header}");
        ranges[0]
    }

    #[rstest]
    #[case("bytes=0-99", 1000, 0, 100)]
    #[case("bytes=-500", 1000, 500, 500)]
    #[case("bytes=100-", 1000, 100, 900)]
    #[case("bytes=0-1999", 1000, 0, 1000)] // end clamped to the entity
    #[case("bytes=-5000", 1000, 0, 1000)] // suffix longer than the entity
    #[case("bytes=999-999", 1000, 999, 1)]
    fn single_range(#[case] header: &str, #[case] size: u64, #[case] start: u64, #[case] length: u64) {
        assert_eq!(one(header, size), HttpRange { start, length });
    }

    #[rstest]
    #[case("bytes=1000-")] // start at the end
    #[case("bytes=1200-1300")]
    #[case("bytes=5-2")] // inverted
    #[case("bytes=abc-10")]
    #[case("bytes=10")]
    #[case("chars=0-10")]
    fn invalid(#[case] header: &str) {
        assert_eq!(
            parse_range(Some(header), 1000, true, false),
            Err(RangeError::Invalid)
        );
    }

    #[test]
    fn absent_or_empty_header_is_no_ranges() {
        assert_eq!(parse_range(None, 1000, true, false).unwrap(), vec![]);
        assert_eq!(parse_range(Some(""), 1000, true, false).unwrap(), vec![]);
    }

    #[test]
    fn overlap_rejected_when_not_allowed() {
        assert_eq!(
            parse_range(Some("bytes=0-99,50-149"), 1000, false, true),
            Err(RangeError::Overlap)
        );
        // Disjoint ranges are fine, whatever order they arrive in.
        let ranges = parse_range(Some("bytes=0-99,200-299"), 1000, false, true).unwrap();
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[1].start, 200);
        let ranges = parse_range(Some("bytes=200-299,0-99"), 1000, false, true).unwrap();
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[1].start, 200);
    }

    #[test]
    fn overlap_kept_when_allowed() {
        let ranges = parse_range(Some("bytes=0-99,50-149"), 1000, true, false).unwrap();
        assert_eq!(ranges.len(), 2);
        // Order is preserved when sorting is not requested.
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[1].start, 50);
    }

    #[test]
    fn content_range_header() {
        let r = HttpRange { start: 100, length: 50 };
        assert_eq!(r.content_range(1000), "bytes 100-149/1000");
    }

    #[test]
    fn byteranges_size_matches_assembled_body() {
        let ranges = vec![
            HttpRange { start: 0, length: 10 },
            HttpRange { start: 20, length: 5 },
        ];
        let boundary = random_boundary();
        assert_eq!(boundary.len(), 60);

        let mut body = Vec::new();
        for (i, r) in ranges.iter().enumerate() {
            body.extend_from_slice(part_header(&boundary, i == 0, r, "text/plain", 100).as_bytes());
            body.extend_from_slice(&vec![b'x'; r.length as usize]);
        }
        body.extend_from_slice(trailer(&boundary).as_bytes());

        assert_eq!(
            byteranges_size(&ranges, &boundary, "text/plain", 100),
            body.len() as u64
        );
    }
}
