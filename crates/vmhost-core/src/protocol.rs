//! Wire format of the command channel.
//!
//! ```text
//! request:  <decimal byte length>\n<raw script bytes>
//! response: <status digit>\n
//! ```
//!
//! Submitters use [`write_request`] and [`read_response`]; engines use
//! [`read_request`] and [`write_response`].

use std::io::{self, BufRead, ErrorKind, Read, Write};

use vmhost_common::ProtocolError;

/// Result delivered to completions on any transport failure.
pub const STATUS_PROTOCOL_VIOLATION: i32 = 1;

/// Largest script body an engine accepts.
pub const MAX_SCRIPT_LEN: usize = 10_000_000;

/// Status digit engines answer for malformed requests.
pub const STATUS_BAD_REQUEST: u8 = 1;

const RESPONSE_LEN: usize = 2;

/// Write one request frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Io`] if the write fails.
pub fn write_request<W: Write + ?Sized>(
    writer: &mut W,
    script: &[u8],
) -> Result<(), ProtocolError> {
    let mut frame = Vec::with_capacity(script.len() + 12);
    frame.extend_from_slice(script.len().to_string().as_bytes());
    frame.push(b'\n');
    frame.extend_from_slice(script);

    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one response and decode its status digit.
///
/// Exactly two bytes are consumed.
///
/// # Errors
///
/// - [`ProtocolError::Closed`] if the peer closed before any byte arrived
/// - [`ProtocolError::MalformedResponse`] on a short read or a frame that
///   is not `<digit>\n`
/// - [`ProtocolError::Io`] if the read fails
pub fn read_response<R: Read + ?Sized>(reader: &mut R) -> Result<u8, ProtocolError> {
    let mut buf = [0u8; RESPONSE_LEN];
    let mut filled = 0;

    while filled < RESPONSE_LEN {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(ProtocolError::Closed),
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    match buf[..filled] {
        [digit @ b'0'..=b'9', b'\n'] => Ok(digit - b'0'),
        _ => Err(ProtocolError::MalformedResponse {
            got: buf[..filled].to_vec(),
        }),
    }
}

/// Read one request frame.
///
/// Blank length lines are skipped. Returns `Ok(None)` when the peer closes
/// the channel between frames.
///
/// # Errors
///
/// - [`ProtocolError::InvalidLength`] if the length line is not a positive
///   decimal
/// - [`ProtocolError::TooLarge`] if the length exceeds [`MAX_SCRIPT_LEN`];
///   the body is read and discarded so the next frame starts cleanly
/// - [`ProtocolError::Truncated`] if the channel closes mid-body
/// - [`ProtocolError::Io`] if the read fails
pub fn read_request<R: BufRead + ?Sized>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut line = String::new();
    let len = loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match trimmed.parse::<usize>() {
            Ok(len) if len > 0 => break len,
            _ => {
                return Err(ProtocolError::InvalidLength {
                    line: trimmed.to_string(),
                });
            }
        }
    };

    if len > MAX_SCRIPT_LEN {
        let discarded = io::copy(&mut Read::take(&mut *reader, len as u64), &mut io::sink())?;
        if discarded < len as u64 {
            return Err(ProtocolError::Truncated {
                expected: len,
                got: usize::try_from(discarded).unwrap_or(usize::MAX),
            });
        }
        return Err(ProtocolError::TooLarge {
            len,
            max: MAX_SCRIPT_LEN,
        });
    }

    let mut body = Vec::with_capacity(len);
    Read::take(&mut *reader, len as u64).read_to_end(&mut body)?;
    if body.len() < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            got: body.len(),
        });
    }

    Ok(Some(body))
}

/// Write one response frame. Statuses above 9 are reported as 9.
///
/// # Errors
///
/// Returns [`ProtocolError::Io`] if the write fails.
pub fn write_response<W: Write + ?Sized>(
    writer: &mut W,
    status: u8,
) -> Result<(), ProtocolError> {
    let digit = b'0' + status.min(9);
    writer.write_all(&[digit, b'\n'])?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use super::*;

    #[test]
    fn test_request_framing() {
        let mut out = Vec::new();
        write_request(&mut out, b"exit 3").unwrap();
        assert_eq!(out, b"6\nexit 3");

        let mut reader = Cursor::new(out);
        assert_eq!(read_request(&mut reader).unwrap().unwrap(), b"exit 3");
        assert!(read_request(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_consecutive_requests() {
        let mut out = Vec::new();
        write_request(&mut out, b"first").unwrap();
        write_request(&mut out, "sécond\nline".as_bytes()).unwrap();

        let mut reader = BufReader::new(Cursor::new(out));
        assert_eq!(read_request(&mut reader).unwrap().unwrap(), b"first");
        assert_eq!(
            read_request(&mut reader).unwrap().unwrap(),
            "sécond\nline".as_bytes()
        );
    }

    #[test]
    fn test_blank_length_lines_skipped() {
        let mut reader = Cursor::new(b"\n\n2\nok".to_vec());
        assert_eq!(read_request(&mut reader).unwrap().unwrap(), b"ok");
    }

    #[test]
    fn test_invalid_lengths() {
        for input in [&b"abc\n"[..], b"0\n", b"-4\n"] {
            let mut reader = Cursor::new(input.to_vec());
            assert!(
                matches!(
                    read_request(&mut reader),
                    Err(ProtocolError::InvalidLength { .. })
                ),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn test_oversized_body_is_discarded() {
        let len = MAX_SCRIPT_LEN + 1;
        let mut input = format!("{len}\n").into_bytes();
        input.extend(std::iter::repeat_n(b'\n', len));
        write_request(&mut input, b"next").unwrap();

        let mut reader = Cursor::new(input);
        assert!(matches!(
            read_request(&mut reader),
            Err(ProtocolError::TooLarge { len: l, max: MAX_SCRIPT_LEN }) if l == len
        ));
        assert_eq!(read_request(&mut reader).unwrap().unwrap(), b"next");
    }

    #[test]
    fn test_oversized_truncated_body() {
        let mut reader = Cursor::new(b"10000001\nabc".to_vec());
        assert!(matches!(
            read_request(&mut reader),
            Err(ProtocolError::Truncated {
                expected: 10_000_001,
                got: 3
            })
        ));
    }

    #[test]
    fn test_truncated_body() {
        let mut reader = Cursor::new(b"10\nshort".to_vec());
        match read_request(&mut reader) {
            Err(ProtocolError::Truncated { expected, got }) => {
                assert_eq!(expected, 10);
                assert_eq!(got, 5);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_response_decoding() {
        assert_eq!(read_response(&mut Cursor::new(b"0\n".to_vec())).unwrap(), 0);
        assert_eq!(read_response(&mut Cursor::new(b"7\n".to_vec())).unwrap(), 7);
    }

    #[test]
    fn test_response_violations() {
        assert!(matches!(
            read_response(&mut Cursor::new(Vec::new())),
            Err(ProtocolError::Closed)
        ));
        assert!(matches!(
            read_response(&mut Cursor::new(b"3".to_vec())),
            Err(ProtocolError::MalformedResponse { .. })
        ));
        assert!(matches!(
            read_response(&mut Cursor::new(b"x\n".to_vec())),
            Err(ProtocolError::MalformedResponse { .. })
        ));
        assert!(matches!(
            read_response(&mut Cursor::new(b"12".to_vec())),
            Err(ProtocolError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_response_consumes_two_bytes() {
        let mut reader = Cursor::new(b"1\n2\n".to_vec());
        assert_eq!(read_response(&mut reader).unwrap(), 1);
        assert_eq!(read_response(&mut reader).unwrap(), 2);
    }

    #[test]
    fn test_write_response_clamps() {
        let mut out = Vec::new();
        write_response(&mut out, 4).unwrap();
        write_response(&mut out, 200).unwrap();
        assert_eq!(out, b"4\n9\n");
    }
}
