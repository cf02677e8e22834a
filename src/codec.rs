use bytes::{BufMut, Bytes, BytesMut};

use crate::error::StompError;
use crate::frame::{CONTENT_LENGTH, Command, Frame};

/// Upper bound for a marshalled frame (120 MiB).
pub const MAX_FRAME_SIZE: usize = 125_829_120;

/// Escape a STOMP 1.2 header key or value for wire transmission.
///
/// The following characters are escaped:
/// - backslash (0x5c) → `\\`
/// - carriage return (0x0d) → `\r`
/// - line feed (0x0a) → `\n`
/// - colon (0x3a) → `\c`
pub fn encode_header(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

/// Encode a frame into its wire representation.
///
/// Layout: `COMMAND\r\n`, every header as `key:value\r\n` with keys sorted
/// lexicographically and a computed `content-length` among them, an empty
/// line, the body and a terminating NUL. Heartbeats encode to a single NUL.
///
/// Returns
/// - `Ok(Bytes)` with the encoded frame.
/// - `Err(StompError::Validation)` when the frame fails validation.
/// - `Err(StompError::Frame)` for the shutdown sentinel, which has no wire
///   form.
pub fn marshal(frame: &Frame) -> Result<Bytes, StompError> {
    match frame.command() {
        Command::Heartbeat => return Ok(Bytes::from_static(&[0])),
        Command::Shutdown => {
            return Err(StompError::frame(
                frame.command().as_str(),
                "the shutdown sentinel cannot be marshalled",
            ));
        }
        _ => {}
    }
    frame.validate()?;

    let content_length = frame.body().len().to_string();
    let mut lines: Vec<(&str, &str)> = frame
        .headers()
        .sorted()
        .into_iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case(CONTENT_LENGTH))
        .collect();
    lines.push((CONTENT_LENGTH, content_length.as_str()));
    // stable sort keeps the newest-first order of repeated keys
    lines.sort_by(|a, b| a.0.cmp(b.0));

    let mut buf = BytesMut::with_capacity(64 + frame.body().len());
    buf.put_slice(frame.command().as_str().as_bytes());
    buf.put_slice(b"\r\n");
    for (k, v) in lines {
        buf.put_slice(encode_header(k).as_bytes());
        buf.put_u8(b':');
        buf.put_slice(encode_header(v).as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(frame.body());
    buf.put_u8(0);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Direction;

    #[test]
    fn heartbeat_is_a_single_nul() {
        let bytes = marshal(&Frame::heartbeat(Direction::ServerBound)).unwrap();
        assert_eq!(&bytes[..], &[0u8]);
    }

    #[test]
    fn shutdown_cannot_be_marshalled() {
        assert!(matches!(
            marshal(&Frame::shutdown()),
            Err(StompError::Frame { .. })
        ));
    }

    #[test]
    fn repeated_keys_are_written_newest_first() {
        let mut frame = Frame::send("/q").header("x", "old").header("x", "new");
        frame.set_text_body("", "text/plain").unwrap();
        let bytes = marshal(&frame).unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let new_at = text.find("x:new").unwrap();
        let old_at = text.find("x:old").unwrap();
        assert!(new_at < old_at);
    }

    #[test]
    fn empty_body_still_carries_content_length() {
        let bytes = marshal(&Frame::ack("a-1")).unwrap();
        assert_eq!(&bytes[..], b"ACK\r\ncontent-length:0\r\nid:a-1\r\n\r\n\0");
    }
}
