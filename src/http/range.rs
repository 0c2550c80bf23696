//! Byte-range and precondition handling for article responses
//!
//! Served articles are immutable once they exist on Usenet, so every
//! conditional request that asks "has this resource changed?" is answered
//! "no change": `If-Match` and `If-Unmodified-Since` always pass,
//! `If-None-Match` and `If-Modified-Since` always short-circuit to 304 (412
//! for writes), and `If-Range` always honors the requested range. The
//! precondition check runs before any NNTP command is issued.
//!
//! Range parsing and `multipart/byteranges` composition follow RFC 7233,
//! with MIME framing byte-compatible with the common Go/`net/http` layout:
//! the multipart `Content-Length` is pre-computed by a counting dry run and
//! must equal the emitted payload exactly.

use axum::http::{HeaderMap, Method, header};
use rand::Rng;
use thiserror::Error;

/// Result of one RFC 7232 check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondResult {
    None,
    True,
    False,
}

/// Outcome of evaluating all request preconditions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Respond 304 with no entity headers
    NotModified,
    /// Respond 412
    PreconditionFailed,
    /// Carry on; `range` holds the `Range` header to honor, if any
    Proceed { range: Option<String> },
}

/// Evaluate request preconditions per RFC 7232 §6 under the immutable
/// content policy.
pub fn check_preconditions(method: &Method, headers: &HeaderMap) -> Precondition {
    let mut ch = check_if_match(headers);
    if ch == CondResult::None {
        ch = check_if_unmodified_since(headers);
    }
    if ch == CondResult::False {
        return Precondition::PreconditionFailed;
    }

    match check_if_none_match(headers) {
        CondResult::False => {
            return if *method == Method::GET || *method == Method::HEAD {
                Precondition::NotModified
            } else {
                Precondition::PreconditionFailed
            };
        }
        CondResult::None => {
            if check_if_modified_since(method, headers) == CondResult::False {
                return Precondition::NotModified;
            }
        }
        CondResult::True => {}
    }

    let mut range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if range.is_some() && check_if_range(method, headers) == CondResult::False {
        range = None;
    }
    Precondition::Proceed { range }
}

fn check_if_match(headers: &HeaderMap) -> CondResult {
    if headers.get(header::IF_MATCH).is_none() {
        return CondResult::None;
    }
    // Immutable content: whatever the client has cached still matches
    CondResult::True
}

fn check_if_unmodified_since(headers: &HeaderMap) -> CondResult {
    if headers.get(header::IF_UNMODIFIED_SINCE).is_none() {
        return CondResult::None;
    }
    CondResult::True
}

fn check_if_none_match(headers: &HeaderMap) -> CondResult {
    if headers.get(header::IF_NONE_MATCH).is_none() {
        return CondResult::None;
    }
    // The client's cached entity is still current, so "none match" fails
    CondResult::False
}

fn check_if_modified_since(method: &Method, headers: &HeaderMap) -> CondResult {
    if *method != Method::GET && *method != Method::HEAD {
        return CondResult::None;
    }
    if headers.get(header::IF_MODIFIED_SINCE).is_none() {
        return CondResult::None;
    }
    CondResult::False
}

fn check_if_range(method: &Method, headers: &HeaderMap) -> CondResult {
    if *method != Method::GET && *method != Method::HEAD {
        return CondResult::None;
    }
    if headers.get(header::IF_RANGE).is_none() {
        return CondResult::None;
    }
    CondResult::True
}

/// One byte range to send, RFC 7233 style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    pub start: u64,
    pub length: u64,
}

impl HttpRange {
    /// `Content-Range` value: `bytes start-end/size`
    #[must_use]
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.start + self.length - 1, size)
    }

    #[inline]
    fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Range parsing failures and their HTTP projection (both 416)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    /// Syntactically invalid `Range` header
    #[error("invalid range")]
    Malformed,

    /// Every requested range starts past the end of the content; the 416
    /// response carries `Content-Range: bytes */<size>`
    #[error("no overlapping range")]
    NoOverlap,
}

/// Parse a `Range` header per RFC 7233.
///
/// Returns an empty list when `s` is empty (header not present).
pub fn parse_range(s: &str, size: u64) -> Result<Vec<HttpRange>, RangeError> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    const PREFIX: &str = "bytes=";
    if !s.starts_with(PREFIX) {
        return Err(RangeError::Malformed);
    }

    let mut ranges = Vec::new();
    let mut no_overlap = false;
    for ra in s[PREFIX.len()..].split(',') {
        let ra = ra.trim_matches([' ', '\t']);
        if ra.is_empty() {
            continue;
        }
        let (start, end) = ra.split_once('-').ok_or(RangeError::Malformed)?;
        let (start, end) = (start.trim_matches([' ', '\t']), end.trim_matches([' ', '\t']));

        let range = if start.is_empty() {
            // Suffix form `-N`: the last min(N, size) bytes
            let n: u64 = end.parse().map_err(|_| RangeError::Malformed)?;
            let n = n.min(size);
            HttpRange {
                start: size - n,
                length: n,
            }
        } else {
            let start: u64 = start.parse().map_err(|_| RangeError::Malformed)?;
            if start >= size {
                // Begins past the content: no overlap, but not a failure yet
                no_overlap = true;
                continue;
            }
            let end = if end.is_empty() {
                size - 1
            } else {
                let e: u64 = end.parse().map_err(|_| RangeError::Malformed)?;
                if start > e {
                    return Err(RangeError::Malformed);
                }
                e.min(size - 1)
            };
            HttpRange {
                start,
                length: end - start + 1,
            }
        };
        ranges.push(range);
    }

    if no_overlap && ranges.is_empty() {
        return Err(RangeError::NoOverlap);
    }
    Ok(ranges)
}

/// Total bytes covered by `ranges`
#[must_use]
pub fn sum_ranges_size(ranges: &[HttpRange]) -> u64 {
    ranges.iter().map(|r| r.length).sum()
}

/// Random multipart boundary: 60 hex characters, matching the length the
/// Go multipart writer would have used so framing sizes line up everywhere
#[must_use]
pub fn generate_boundary() -> String {
    let mut rng = rand::thread_rng();
    (0..60)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(u32::from(n), 16).expect("hex digit")
        })
        .collect()
}

fn part_header(boundary: &str, first: bool, range: &HttpRange, content_type: &str, size: u64) -> String {
    let lead = if first { "" } else { "\r\n" };
    format!(
        "{lead}--{boundary}\r\nContent-Range: {}\r\nContent-Type: {content_type}\r\n\r\n",
        range.content_range(size)
    )
}

/// Counting dry run: the exact byte size of the multipart payload that
/// [`write_multipart`] will produce for these inputs
#[must_use]
pub fn ranges_mime_size(
    ranges: &[HttpRange],
    content_type: &str,
    size: u64,
    boundary: &str,
) -> u64 {
    let mut enc_size = 0u64;
    for (i, ra) in ranges.iter().enumerate() {
        enc_size += part_header(boundary, i == 0, ra, content_type, size).len() as u64;
        enc_size += ra.length;
    }
    enc_size += format!("\r\n--{boundary}--\r\n").len() as u64;
    enc_size
}

/// Emit the `multipart/byteranges` payload for `ranges` over `body`
#[must_use]
pub fn write_multipart(
    ranges: &[HttpRange],
    content_type: &str,
    size: u64,
    boundary: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(ranges_mime_size(ranges, content_type, size, boundary) as usize);
    for (i, ra) in ranges.iter().enumerate() {
        out.extend_from_slice(part_header(boundary, i == 0, ra, content_type, size).as_bytes());
        out.extend_from_slice(&body[ra.start as usize..ra.end() as usize]);
    }
    out.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_no_conditionals_proceeds() {
        let h = headers(&[("range", "bytes=0-3")]);
        assert_eq!(
            check_preconditions(&Method::GET, &h),
            Precondition::Proceed {
                range: Some("bytes=0-3".to_string())
            }
        );
    }

    #[test]
    fn test_if_none_match_yields_304_for_get_and_head() {
        let h = headers(&[("if-none-match", "\"abc@x\"")]);
        assert_eq!(
            check_preconditions(&Method::GET, &h),
            Precondition::NotModified
        );
        assert_eq!(
            check_preconditions(&Method::HEAD, &h),
            Precondition::NotModified
        );
        assert_eq!(
            check_preconditions(&Method::POST, &h),
            Precondition::PreconditionFailed
        );
    }

    #[test]
    fn test_if_modified_since_yields_304_unless_if_none_match_present() {
        let h = headers(&[("if-modified-since", "Sat, 01 Jan 2022 00:00:00 GMT")]);
        assert_eq!(
            check_preconditions(&Method::GET, &h),
            Precondition::NotModified
        );

        // If-None-Match takes precedence and is evaluated first
        let h = headers(&[
            ("if-none-match", "\"x\""),
            ("if-modified-since", "Sat, 01 Jan 2022 00:00:00 GMT"),
        ]);
        assert_eq!(
            check_preconditions(&Method::GET, &h),
            Precondition::NotModified
        );
    }

    #[test]
    fn test_if_match_and_if_unmodified_since_always_pass() {
        let h = headers(&[
            ("if-match", "\"whatever\""),
            ("if-unmodified-since", "Sat, 01 Jan 2022 00:00:00 GMT"),
        ]);
        assert_eq!(
            check_preconditions(&Method::GET, &h),
            Precondition::Proceed { range: None }
        );
    }

    #[test]
    fn test_if_range_honors_range() {
        let h = headers(&[
            ("range", "bytes=0-1"),
            ("if-range", "\"abc@x\""),
        ]);
        assert_eq!(
            check_preconditions(&Method::GET, &h),
            Precondition::Proceed {
                range: Some("bytes=0-1".to_string())
            }
        );
    }

    #[test]
    fn test_parse_range_forms() {
        // start-end
        assert_eq!(
            parse_range("bytes=0-3", 10).unwrap(),
            vec![HttpRange { start: 0, length: 4 }]
        );
        // open-ended
        assert_eq!(
            parse_range("bytes=4-", 10).unwrap(),
            vec![HttpRange { start: 4, length: 6 }]
        );
        // suffix
        assert_eq!(
            parse_range("bytes=-3", 10).unwrap(),
            vec![HttpRange { start: 7, length: 3 }]
        );
        // suffix longer than content
        assert_eq!(
            parse_range("bytes=-100", 10).unwrap(),
            vec![HttpRange { start: 0, length: 10 }]
        );
        // end clamped to size-1
        assert_eq!(
            parse_range("bytes=8-99", 10).unwrap(),
            vec![HttpRange { start: 8, length: 2 }]
        );
        // whitespace around ranges
        assert_eq!(
            parse_range("bytes= 0-1 , 4-5", 10).unwrap(),
            vec![
                HttpRange { start: 0, length: 2 },
                HttpRange { start: 4, length: 2 }
            ]
        );
        // absent header
        assert_eq!(parse_range("", 10).unwrap(), vec![]);
    }

    #[test]
    fn test_parse_range_malformed() {
        assert_eq!(parse_range("chunks=0-1", 10), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=abc", 10), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=5-2", 10), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=--5", 10), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=", 10).unwrap(), vec![]);
    }

    #[test]
    fn test_parse_range_no_overlap() {
        assert_eq!(parse_range("bytes=100-", 10), Err(RangeError::NoOverlap));
        assert_eq!(parse_range("bytes=10-20", 10), Err(RangeError::NoOverlap));

        // A single overlapping range saves the request
        assert_eq!(
            parse_range("bytes=100-,0-1", 10).unwrap(),
            vec![HttpRange { start: 0, length: 2 }]
        );
    }

    #[test]
    fn test_parse_format_roundtrip() {
        // parse(format(ranges)) == ranges for valid non-overlapping lists
        let ranges = vec![
            HttpRange { start: 0, length: 2 },
            HttpRange { start: 4, length: 2 },
            HttpRange { start: 8, length: 1 },
        ];
        let header = format!(
            "bytes={}",
            ranges
                .iter()
                .map(|r| format!("{}-{}", r.start, r.start + r.length - 1))
                .collect::<Vec<_>>()
                .join(",")
        );
        assert_eq!(parse_range(&header, 10).unwrap(), ranges);
    }

    #[test]
    fn test_content_range_format() {
        let r = HttpRange { start: 0, length: 4 };
        assert_eq!(r.content_range(10), "bytes 0-3/10");
    }

    #[test]
    fn test_mime_size_matches_emitted_payload() {
        let body = b"0123456789";
        let ranges = vec![
            HttpRange { start: 0, length: 2 },
            HttpRange { start: 4, length: 2 },
        ];
        let boundary = generate_boundary();
        let ctype = "text/plain; charset=utf-8";

        let payload = write_multipart(&ranges, ctype, 10, &boundary, body);
        assert_eq!(
            ranges_mime_size(&ranges, ctype, 10, &boundary),
            payload.len() as u64
        );

        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("Content-Range: bytes 0-1/10"));
        assert!(text.contains("Content-Range: bytes 4-5/10"));
        assert!(text.contains("01"));
        assert!(text.contains("45"));
        assert!(text.ends_with(&format!("\r\n--{boundary}--\r\n")));
    }

    #[test]
    fn test_boundary_is_60_hex_chars() {
        let b = generate_boundary();
        assert_eq!(b.len(), 60);
        assert!(b.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(b, generate_boundary());
    }

    #[test]
    fn test_sum_ranges_size() {
        let ranges = vec![
            HttpRange { start: 0, length: 2 },
            HttpRange { start: 4, length: 6 },
        ];
        assert_eq!(sum_ranges_size(&ranges), 8);
    }
}
