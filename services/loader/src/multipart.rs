//! Multipart/related envelope parsing.
//!
//! Pixel data responses either carry the frame directly or wrap a single part
//! in a `multipart/related` envelope:
//!
//! ```text
//! --BOUNDARY\r\n
//! Content-Type: image/jls\r\n
//! \r\n
//! <payload bytes>\r\n
//! --BOUNDARY--
//! ```
//!
//! The payload is returned as a slice of the response buffer, no bytes are
//! copied.

use bytes::Bytes;
use thiserror::Error;

/// Content type assumed when neither the response nor the part names one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";
const CONTENT_TYPE_PREFIX: &str = "Content-Type:";

/// Malformed envelope errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no multipart mime header")]
    NoMimeHeader,

    #[error("no boundary marker")]
    NoBoundary,

    #[error("terminating boundary not found")]
    NoTerminatingBoundary,
}

/// A parsed response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Content type of the payload
    pub content_type: String,
    /// Payload bytes, sharing storage with the response buffer
    pub payload: Bytes,
}

/// Whether a response content type announces a multipart envelope.
pub fn is_multipart(content_type: &str) -> bool {
    content_type.contains("multipart")
}

/// Parse a response body given its `Content-Type` header value.
pub fn parse_envelope(content_type: &str, body: Bytes) -> Result<Envelope, ParseError> {
    if !is_multipart(content_type) {
        return Ok(Envelope {
            content_type: content_type.to_string(),
            payload: body,
        });
    }

    let token_index = find_subslice(&body, HEADER_SEPARATOR, 0).ok_or(ParseError::NoMimeHeader)?;

    // Header bytes are decoded one byte per char so the boundary maps back exactly.
    let header: String = body[..token_index].iter().map(|&b| b as char).collect();
    let lines: Vec<&str> = header.split("\r\n").collect();

    let boundary = find_boundary(&lines).ok_or(ParseError::NoBoundary)?;
    let boundary_bytes: Vec<u8> = boundary.chars().map(|c| c as u8).collect();

    let offset = token_index + HEADER_SEPARATOR.len();
    let end_index =
        find_subslice(&body, &boundary_bytes, offset).ok_or(ParseError::NoTerminatingBoundary)?;

    // Strip the CR LF that precedes the boundary
    let end = end_index.saturating_sub(2).max(offset);

    Ok(Envelope {
        content_type: find_content_type(&lines)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string(),
        payload: body.slice(offset..end),
    })
}

fn find_boundary<'a>(lines: &[&'a str]) -> Option<&'a str> {
    lines.iter().copied().find(|line| line.starts_with("--"))
}

fn find_content_type<'a>(lines: &[&'a str]) -> Option<&'a str> {
    lines
        .iter()
        .find_map(|line| line.strip_prefix(CONTENT_TYPE_PREFIX))
        .map(str::trim)
}

/// Index of the first occurrence of `needle` in `haystack` at or after `from`.
pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIPART: &str = "multipart/related; type=\"image/x\"; boundary=B";

    fn envelope(payload: &[u8]) -> Bytes {
        let mut body = b"--B\r\nContent-Type: image/x\r\n\r\n".to_vec();
        body.extend_from_slice(payload);
        body.extend_from_slice(b"\r\n--B--");
        Bytes::from(body)
    }

    #[test]
    fn test_single_part_envelope() {
        let payload: Vec<u8> = (0u8..16).map(|b| b.wrapping_mul(17)).collect();
        let parsed = parse_envelope(MULTIPART, envelope(&payload)).unwrap();

        assert_eq!(parsed.content_type, "image/x");
        assert_eq!(parsed.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_payload_shares_response_buffer() {
        let body = envelope(&[7u8; 16]);
        let base = body.as_ptr() as usize;
        let parsed = parse_envelope(MULTIPART, body.clone()).unwrap();

        let offset = parsed.payload.as_ptr() as usize - base;
        assert_eq!(offset, b"--B\r\nContent-Type: image/x\r\n\r\n".len());
    }

    #[test]
    fn test_payload_containing_crlf() {
        let payload = b"\r\n\r\nabc\r\n-";
        let parsed = parse_envelope(MULTIPART, envelope(payload)).unwrap();
        assert_eq!(parsed.payload.as_ref(), payload);
    }

    #[test]
    fn test_non_multipart_passthrough() {
        let body = Bytes::from_static(b"\x00\x01\x02");
        let parsed = parse_envelope("image/jls", body.clone()).unwrap();
        assert_eq!(parsed.content_type, "image/jls");
        assert_eq!(parsed.payload, body);
    }

    #[test]
    fn test_missing_header_separator() {
        let body = Bytes::from_static(b"--B\r\nContent-Type: image/x\r\n");
        assert_eq!(
            parse_envelope(MULTIPART, body),
            Err(ParseError::NoMimeHeader)
        );
    }

    #[test]
    fn test_missing_boundary() {
        let body = Bytes::from_static(b"Content-Type: image/x\r\n\r\ndata\r\n--B--");
        assert_eq!(parse_envelope(MULTIPART, body), Err(ParseError::NoBoundary));
    }

    #[test]
    fn test_missing_terminating_boundary() {
        let body = Bytes::from_static(b"--B\r\nContent-Type: image/x\r\n\r\ntruncated");
        assert_eq!(
            parse_envelope(MULTIPART, body),
            Err(ParseError::NoTerminatingBoundary)
        );
    }

    #[test]
    fn test_content_type_prefix_is_case_sensitive() {
        let body = Bytes::from_static(b"--B\r\ncontent-type: image/x\r\n\r\nab\r\n--B--");
        let parsed = parse_envelope(MULTIPART, body).unwrap();
        assert_eq!(parsed.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(parsed.payload.as_ref(), b"ab");
    }

    #[test]
    fn test_find_subslice_from_offset() {
        assert_eq!(find_subslice(b"abcabc", b"abc", 1), Some(3));
        assert_eq!(find_subslice(b"abc", b"abcd", 0), None);
        assert_eq!(find_subslice(b"abc", b"c", 4), None);
    }
}
