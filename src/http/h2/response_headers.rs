//! Response header and trailer validation
//!
//! Turns decoded HPACK field lists into response heads and trailers,
//! enforcing the RFC 9113 Section 8.3 rules for pseudo-headers. Every
//! violation here is scoped to the stream.

use super::error::{Error, Result};
use crate::http::Headers;

const REQUEST_PSEUDO_HEADERS: &[&[u8]] = &[b":method", b":scheme", b":authority", b":path"];

/// A validated response header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseHead {
    /// 1xx; the final response is still to come
    Informational { status: u16, headers: Headers },
    Final {
        status: u16,
        headers: Headers,
        content_length: Option<u64>,
    },
}

fn stream_error(stream_id: u32, reason: impl Into<String>) -> Error {
    Error::StreamProtocol {
        stream_id,
        reason: reason.into(),
    }
}

fn field_str(stream_id: u32, bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| stream_error(stream_id, "field is not valid UTF-8"))
}

/// Validate a response header block
///
/// `:status` must appear exactly once, before any regular field, and be a
/// three-digit number. Request pseudo-headers and unknown pseudo-headers are
/// rejected, as are conflicting or non-numeric content-length values. A 1xx
/// block must not end the stream.
pub fn process_response_headers(
    fields: &[(Vec<u8>, Vec<u8>)],
    stream_id: u32,
    end_stream: bool,
) -> Result<ResponseHead> {
    let mut headers = Headers::new();
    let mut status: Option<u16> = None;
    let mut seen_regular = false;
    let mut content_length: Option<u64> = None;

    for (name, value) in fields {
        if name.starts_with(b":") {
            let pseudo = String::from_utf8_lossy(name);
            if seen_regular {
                return Err(stream_error(
                    stream_id,
                    format!("pseudo-header {} after regular header", pseudo),
                ));
            }
            if name.as_slice() == b":status" {
                if status.is_some() {
                    return Err(stream_error(stream_id, "expected a single :status header"));
                }
                status = Some(parse_status(stream_id, value)?);
            } else if REQUEST_PSEUDO_HEADERS.contains(&name.as_slice()) {
                return Err(stream_error(
                    stream_id,
                    format!("request pseudo-header {} in response", pseudo),
                ));
            } else {
                return Err(stream_error(
                    stream_id,
                    format!("unknown pseudo-header {} in response", pseudo),
                ));
            }
            continue;
        }

        seen_regular = true;
        let name = field_str(stream_id, name)?;
        let value = field_str(stream_id, value)?;
        if name.eq_ignore_ascii_case("content-length") {
            let parsed: u64 = value
                .trim()
                .parse()
                .map_err(|_| stream_error(stream_id, format!("invalid content-length: {}", value)))?;
            if content_length.is_some_and(|existing| existing != parsed) {
                return Err(stream_error(stream_id, "multiple content-length values"));
            }
            content_length = Some(parsed);
        }
        headers.insert_lowercase(name, value);
    }

    let status = status.ok_or_else(|| stream_error(stream_id, "response missing :status"))?;
    if (100..200).contains(&status) {
        if end_stream {
            return Err(stream_error(stream_id, "1xx response must not end the stream"));
        }
        return Ok(ResponseHead::Informational { status, headers });
    }
    Ok(ResponseHead::Final {
        status,
        headers,
        content_length,
    })
}

fn parse_status(stream_id: u32, value: &[u8]) -> Result<u16> {
    let valid = value.len() == 3 && value.iter().all(u8::is_ascii_digit) && value[0] != b'0';
    if !valid {
        return Err(stream_error(
            stream_id,
            format!("invalid :status {}", String::from_utf8_lossy(value)),
        ));
    }
    Ok(value
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')))
}

/// Validate a trailer block; pseudo-headers are not allowed
pub fn process_trailers(fields: &[(Vec<u8>, Vec<u8>)], stream_id: u32) -> Result<Headers> {
    let mut trailers = Headers::new();
    for (name, value) in fields {
        if name.starts_with(b":") {
            return Err(stream_error(
                stream_id,
                format!("trailer contains pseudo-header {}", String::from_utf8_lossy(name)),
            ));
        }
        trailers.insert_lowercase(field_str(stream_id, name)?, field_str(stream_id, value)?);
    }
    Ok(trailers)
}

/// Compare the declared content-length with the bytes actually received
pub fn validate_content_length(expected: Option<u64>, received: u64, stream_id: u32) -> Result<()> {
    match expected {
        Some(expected) if expected != received => Err(Error::ContentLengthMismatch {
            stream_id,
            expected,
            received,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
        pairs
            .iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_final_response() {
        let head = process_response_headers(
            &fields(&[(":status", "200"), ("content-length", "42"), ("x-a", "1")]),
            1,
            false,
        )
        .unwrap();
        match head {
            ResponseHead::Final {
                status,
                headers,
                content_length,
            } => {
                assert_eq!(status, 200);
                assert_eq!(content_length, Some(42));
                assert_eq!(headers.get("x-a"), Some("1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_status() {
        let err = process_response_headers(&fields(&[(":status", "200"), (":status", "204")]), 3, true)
            .unwrap_err();
        assert!(matches!(err, Error::StreamProtocol { stream_id: 3, .. }));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_pseudo_after_regular() {
        let err = process_response_headers(&fields(&[("x", "1"), (":status", "200")]), 1, false)
            .unwrap_err();
        assert!(matches!(err, Error::StreamProtocol { .. }));
    }

    #[test]
    fn test_request_and_unknown_pseudo_headers() {
        for name in [":path", ":method", ":bogus"] {
            let result =
                process_response_headers(&fields(&[(":status", "200"), (name, "x")]), 1, false);
            assert!(result.is_err(), "{} accepted", name);
        }
    }

    #[test]
    fn test_missing_and_invalid_status() {
        assert!(process_response_headers(&fields(&[("x", "1")]), 1, false).is_err());
        assert!(process_response_headers(&fields(&[(":status", "abc")]), 1, false).is_err());
        assert!(process_response_headers(&fields(&[(":status", "20")]), 1, false).is_err());
    }

    #[test]
    fn test_content_length_rules() {
        let same = fields(&[(":status", "200"), ("content-length", "5"), ("content-length", "5")]);
        assert!(process_response_headers(&same, 1, false).is_ok());

        let differing = fields(&[(":status", "200"), ("content-length", "5"), ("content-length", "6")]);
        assert!(process_response_headers(&differing, 1, false).is_err());

        let garbage = fields(&[(":status", "200"), ("content-length", "five")]);
        assert!(process_response_headers(&garbage, 1, false).is_err());
    }

    #[test]
    fn test_informational() {
        let head = process_response_headers(&fields(&[(":status", "103"), ("link", "</a>")]), 1, false)
            .unwrap();
        assert!(matches!(head, ResponseHead::Informational { status: 103, .. }));

        let err = process_response_headers(&fields(&[(":status", "100")]), 1, true).unwrap_err();
        assert!(matches!(err, Error::StreamProtocol { .. }));
    }

    #[test]
    fn test_trailers() {
        let trailers = process_trailers(&fields(&[("grpc-status", "0")]), 1).unwrap();
        assert_eq!(trailers.get("grpc-status"), Some("0"));
        assert!(process_trailers(&fields(&[(":status", "200")]), 1).is_err());
    }

    #[test]
    fn test_validate_content_length() {
        assert!(validate_content_length(None, 10, 1).is_ok());
        assert!(validate_content_length(Some(10), 10, 1).is_ok());
        let err = validate_content_length(Some(100), 90, 5).unwrap_err();
        assert!(matches!(
            err,
            Error::ContentLengthMismatch {
                stream_id: 5,
                expected: 100,
                received: 90
            }
        ));
    }
}
