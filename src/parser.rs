//! Recursive-descent unmarshaller.
//!
//! Frames are read one byte at a time from a [`ByteRead`] source through an
//! [`UnmarshalContext`], which keeps every byte of the current frame so the
//! parser can look ahead and push bytes back.

use tokio_util::sync::CancellationToken;

use crate::codec::MAX_FRAME_SIZE;
use crate::error::StompError;
use crate::frame::{CONTENT_LENGTH, Command, Direction, Frame};
use crate::headers::Headers;
use crate::transport::ByteRead;

const NUL: u8 = 0;
const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Reverse the STOMP 1.2 header escaping.
///
/// Returns `StompError::Protocol` for any backslash not followed by one of
/// `r`, `n`, `c` or `\`, including a trailing lone backslash.
pub fn decode_header(input: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                return Err(StompError::Protocol(format!(
                    "invalid escape sequence '\\{}' in header '{}'",
                    other, input
                )));
            }
            None => {
                return Err(StompError::Protocol(format!(
                    "dangling escape at end of header '{}'",
                    input
                )));
            }
        }
    }
    Ok(out)
}

/// Pushback cursor over a byte source.
pub struct UnmarshalContext<'a, R: ByteRead + ?Sized> {
    reader: &'a mut R,
    cancel: &'a CancellationToken,
    buffer: Vec<u8>,
    pos: usize,
}

impl<'a, R: ByteRead + ?Sized> UnmarshalContext<'a, R> {
    pub fn new(reader: &'a mut R, cancel: &'a CancellationToken) -> Self {
        Self {
            reader,
            cancel,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    /// Next byte, replaying pushed-back bytes first.
    pub fn read_byte(&mut self) -> Result<u8, StompError> {
        if self.pos < self.buffer.len() {
            let byte = self.buffer[self.pos];
            self.pos += 1;
            return Ok(byte);
        }
        if self.buffer.len() > MAX_FRAME_SIZE {
            return Err(StompError::Protocol(format!(
                "inbound frame exceeds {} bytes",
                MAX_FRAME_SIZE
            )));
        }
        let byte = self.reader.read_byte(self.cancel)?;
        self.buffer.push(byte);
        self.pos += 1;
        Ok(byte)
    }

    /// Push the last `n` bytes back so they are read again.
    pub fn return_bytes(&mut self, n: usize) -> Result<(), StompError> {
        if n > self.pos {
            return Err(StompError::Protocol(format!(
                "cannot return {} bytes, only {} were read",
                n, self.pos
            )));
        }
        self.pos -= n;
        Ok(())
    }

    /// Read through the next LF. The LF and a preceding CR are stripped.
    pub fn read_line(&mut self) -> Result<Vec<u8>, StompError> {
        let mut line = Vec::new();
        loop {
            match self.read_byte()? {
                LF => break,
                byte => line.push(byte),
            }
        }
        if line.last() == Some(&CR) {
            line.pop();
        }
        Ok(line)
    }

    /// Whether the cursor sits on an EOL (`\n` or `\r\n`). Consumes nothing.
    pub fn is_end_of_line(&mut self) -> Result<bool, StompError> {
        match self.read_byte()? {
            LF => {
                self.return_bytes(1)?;
                Ok(true)
            }
            CR => {
                let next = self.read_byte()?;
                self.return_bytes(2)?;
                Ok(next == LF)
            }
            _ => {
                self.return_bytes(1)?;
                Ok(false)
            }
        }
    }

    /// Consume a mandatory EOL.
    pub fn read_end_of_line(&mut self) -> Result<(), StompError> {
        match self.read_byte()? {
            LF => Ok(()),
            CR => match self.read_byte()? {
                LF => Ok(()),
                other => Err(StompError::Protocol(format!(
                    "expected LF after CR, found 0x{:02x}",
                    other
                ))),
            },
            other => Err(StompError::Protocol(format!(
                "expected end of line, found 0x{:02x}",
                other
            ))),
        }
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, StompError> {
        let mut out = Vec::with_capacity(n.min(64 * 1024));
        for _ in 0..n {
            out.push(self.read_byte()?);
        }
        Ok(out)
    }
}

/// Read the next frame from `reader`.
///
/// A lone NUL yields the shutdown sentinel and a lone EOL yields a
/// client-bound heartbeat. Anything else is parsed as a full frame, which is
/// validated before it is returned.
///
/// Returns
/// - `Err(StompError::Io)` when the reader fails or is cancelled.
/// - `Err(StompError::Protocol)` for malformed input.
/// - `Err(StompError::Validation)` when the frame misses mandatory headers.
pub fn unmarshal<R: ByteRead + ?Sized>(
    reader: &mut R,
    cancel: &CancellationToken,
) -> Result<Frame, StompError> {
    let mut ctx = UnmarshalContext::new(reader, cancel);
    match ctx.read_byte()? {
        NUL => return Ok(Frame::shutdown()),
        LF => return Ok(Frame::heartbeat(Direction::ClientBound)),
        CR => {
            if ctx.read_byte()? == LF {
                return Ok(Frame::heartbeat(Direction::ClientBound));
            }
            ctx.return_bytes(2)?;
        }
        _ => ctx.return_bytes(1)?,
    }
    read_frame(&mut ctx)
}

fn read_frame<R: ByteRead + ?Sized>(ctx: &mut UnmarshalContext<'_, R>) -> Result<Frame, StompError> {
    let command = read_command(ctx)?;
    let mut headers = read_headers(ctx)?;
    let length = content_length(&headers);
    headers.remove(CONTENT_LENGTH);
    let body = read_body(ctx, length)?;

    let frame = Frame::received(command, headers, body);
    frame.validate()?;
    Ok(frame)
}

fn read_command<R: ByteRead + ?Sized>(
    ctx: &mut UnmarshalContext<'_, R>,
) -> Result<Command, StompError> {
    let line = ctx.read_line()?;
    let text = String::from_utf8(line)
        .map_err(|e| StompError::Protocol(format!("invalid utf8 in command: {}", e)))?;
    Command::from_wire(text.trim())
        .ok_or_else(|| StompError::Protocol(format!("unknown frame '{}'", text)))
}

fn read_headers<R: ByteRead + ?Sized>(
    ctx: &mut UnmarshalContext<'_, R>,
) -> Result<Headers, StompError> {
    let mut headers = Headers::new();
    while !ctx.is_end_of_line()? {
        let line = ctx.read_line()?;
        let text = String::from_utf8(line)
            .map_err(|e| StompError::Protocol(format!("invalid utf8 in header: {}", e)))?;
        let (key, value) = text
            .split_once(':')
            .ok_or_else(|| StompError::Protocol(format!("malformed header line '{}'", text)))?;
        headers.append(decode_header(key)?, decode_header(value)?);
    }
    ctx.read_end_of_line()?;
    Ok(headers)
}

fn content_length(headers: &Headers) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.trim().parse::<usize>().ok())
}

fn read_body<R: ByteRead + ?Sized>(
    ctx: &mut UnmarshalContext<'_, R>,
    length: Option<usize>,
) -> Result<Vec<u8>, StompError> {
    match length {
        Some(n) if n > MAX_FRAME_SIZE => Err(StompError::Protocol(format!(
            "content-length {} exceeds {} bytes",
            n, MAX_FRAME_SIZE
        ))),
        Some(n) => {
            let body = ctx.read_bytes(n)?;
            match ctx.read_byte()? {
                NUL => Ok(body),
                other => Err(StompError::Protocol(format!(
                    "expected NUL after {} body bytes, found 0x{:02x}",
                    n, other
                ))),
            }
        }
        None => {
            let mut body = Vec::new();
            loop {
                match ctx.read_byte()? {
                    NUL => return Ok(body),
                    byte => body.push(byte),
                }
            }
        }
    }
}
