use stompd_util::{ByteString, soft_panic};

use crate::{
    LIMIT_FRAME_BODY_LEN, LIMIT_FRAME_CMD_LINE_LEN, LIMIT_FRAME_HEADER_COUNT,
    LIMIT_FRAME_HEADER_LINE_LEN,
    frame::{Command, Frame},
    iobuf::IoBuf,
};

const CR: u8 = 0x0d;
const LF: u8 = 0x0a;
const NUL: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Command,
    Header,
    Body,
    End,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLength {
    Unknown,
    Remaining(usize),
}

/// Result of one [`FrameParser::parse`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// More input is needed.
    Waiting,
    /// A finished frame is waiting to be taken with
    /// [`FrameParser::take_frame`].
    FrameReady,
    /// The stream is malformed; see [`FrameParser::error`]. Terminal.
    Error,
}

/// Streaming STOMP frame parser.
///
/// Consumes bytes from an [`IoBuf`] as progress is made, across any
/// partitioning of the input into reads. At most one finished frame is
/// buffered; until the caller takes it, parsing of the next frame's trailing
/// NUL stalls. The error state is sticky and keeps the first error message.
pub struct FrameParser {
    state: State,
    body_left: BodyLength,
    current: Option<Frame>,
    finished: Option<Frame>,
    error: Option<ByteString>,
}

impl FrameParser {
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            body_left: BodyLength::Unknown,
            current: None,
            finished: None,
            error: None,
        }
    }

    /// Parses as much of `buf` as possible, then compacts it.
    pub fn parse(&mut self, buf: &mut IoBuf) -> ParseOutcome {
        while !buf.is_empty() {
            if !self.step(buf) {
                break;
            }
        }
        buf.compact();

        if self.state == State::Error {
            ParseOutcome::Error
        } else if self.finished.is_some() {
            ParseOutcome::FrameReady
        } else {
            ParseOutcome::Waiting
        }
    }

    /// Hands the finished frame to the caller, unblocking the parser.
    pub fn take_frame(&mut self) -> Option<Frame> {
        self.finished.take()
    }

    /// The first error recorded, independent of the outcome code.
    pub fn error(&self) -> Option<&ByteString> {
        self.error.as_ref()
    }

    fn set_error(&mut self, msg: impl Into<ByteString>) {
        self.state = State::Error;
        // Only the first error is kept.
        if self.error.is_none() {
            self.error = Some(msg.into());
        }
    }

    /// One parse step. Returns true iff progress was made.
    fn step(&mut self, buf: &mut IoBuf) -> bool {
        match self.state {
            State::Error => false,
            State::Idle => self.step_idle(buf),
            State::Command => self.step_command(buf),
            State::Header => self.step_header(buf),
            State::Body => self.step_body(buf),
            State::End => self.step_end(buf),
        }
    }

    /// Between frames: eat keep-alive line feeds, or hand off to the command
    /// state on the first real byte.
    fn step_idle(&mut self, buf: &mut IoBuf) -> bool {
        match buf.byte_at(0) {
            Some(CR) => {
                if buf.len() < 2 {
                    return false;
                }
                let second = buf.byte_at(1).unwrap_or(0);
                if second != LF {
                    self.set_error(format!("Expected 0x0A after 0x0D, got 0x{second:02X}"));
                    return false;
                }
                buf.consume(2);
                true
            }
            Some(LF) => {
                buf.consume(1);
                true
            }
            Some(_) => {
                self.state = State::Command;
                true
            }
            None => false,
        }
    }

    fn step_command(&mut self, buf: &mut IoBuf) -> bool {
        let Some(lfpos) = buf.find_byte(LF) else {
            if buf.len() > LIMIT_FRAME_CMD_LINE_LEN {
                self.set_error("Line length limit exceeded waiting for command");
            }
            return false;
        };

        let mut len = lfpos;
        if len > 0 && buf.byte_at(len - 1) == Some(CR) {
            len -= 1;
        }

        let mut name = ByteString::with_capacity(len);
        buf.copy_range_into(0, len, &mut name);
        buf.consume(lfpos + 1);

        let Some(cmd) = Command::from_bytes(&name) else {
            self.set_error("Unknown command");
            return false;
        };

        self.current = Some(Frame::new(cmd));
        self.state = State::Header;
        true
    }

    fn step_header(&mut self, buf: &mut IoBuf) -> bool {
        let Some(lfpos) = buf.find_byte(LF) else {
            if buf.len() > LIMIT_FRAME_HEADER_LINE_LEN {
                self.set_error("Line length limit exceeded waiting for header");
            }
            return false;
        };

        // A blank line (LF or CRLF alone) ends the header block.
        if lfpos == 0 {
            buf.consume(1);
            return self.headers_complete();
        }
        if lfpos == 1 && buf.byte_at(0) == Some(CR) {
            buf.consume(2);
            return self.headers_complete();
        }

        let mut len = lfpos;
        if buf.byte_at(len - 1) == Some(CR) {
            len -= 1;
        }

        let Some(colon) = buf.find_byte_before(b':', len) else {
            self.set_error("Expected colon delimiter on header line");
            return false;
        };
        if colon == 0 {
            self.set_error("Header name has zero length");
            return false;
        }

        let mut key = ByteString::with_capacity(colon);
        buf.copy_range_into(0, colon, &mut key);
        let mut value = ByteString::with_capacity(len - colon - 1);
        buf.copy_range_into(colon + 1, len - colon - 1, &mut value);
        buf.consume(lfpos + 1);

        let Some(frame) = self.current.as_mut() else {
            soft_panic!("header parsed with no frame in progress");
            self.set_error("Internal parser state error");
            return false;
        };

        if frame.headers.len() >= LIMIT_FRAME_HEADER_COUNT {
            self.set_error("Header count limit exceeded");
            return false;
        }

        // STOMP 1.2 exempts the handshake frames from header unescaping.
        if frame.command().unescapes_headers_on_parse() {
            let (Ok(k), Ok(v)) = (unescape(key), unescape(value)) else {
                self.set_error("Invalid escape sequence in header");
                return false;
            };
            frame.headers.push(k, v);
        } else {
            frame.headers.push(key, value);
        }
        true
    }

    /// Decides between body and end states once the blank line is seen.
    fn headers_complete(&mut self) -> bool {
        let Some(frame) = self.current.as_ref() else {
            soft_panic!("headers completed with no frame in progress");
            self.set_error("Internal parser state error");
            return false;
        };

        if !frame.command().allows_body() {
            self.state = State::End;
            return true;
        }

        match frame.header(b"content-length") {
            None => {
                // No content-length: the body runs until the first NUL.
                self.body_left = BodyLength::Unknown;
                self.state = State::Body;
            }
            Some(value) => {
                let parsed = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok());
                match parsed {
                    None => {
                        self.set_error(
                            "Contents of 'content-length' header is not a valid number",
                        );
                    }
                    Some(n) if n > LIMIT_FRAME_BODY_LEN as u64 => {
                        self.set_error("Value of 'content-length' header is out of range");
                    }
                    Some(n) => {
                        self.body_left = BodyLength::Remaining(n as usize);
                        self.state = State::Body;
                    }
                }
            }
        }
        true
    }

    fn step_body(&mut self, buf: &mut IoBuf) -> bool {
        let Some(frame) = self.current.as_mut() else {
            soft_panic!("body parsed with no frame in progress");
            self.set_error("Internal parser state error");
            return false;
        };

        match self.body_left {
            BodyLength::Unknown => match buf.find_byte(NUL) {
                None => {
                    // No terminator yet; everything buffered is body.
                    let count = buf.len();
                    buf.copy_range_into(0, count, frame.body_mut());
                    buf.consume(count);
                    true
                }
                Some(0) => {
                    self.state = State::End;
                    true
                }
                Some(nulpos) => {
                    buf.copy_range_into(0, nulpos, frame.body_mut());
                    buf.consume(nulpos);
                    self.state = State::End;
                    true
                }
            },
            BodyLength::Remaining(left) => {
                let count = left.min(buf.len());
                if count > 0 {
                    buf.copy_range_into(0, count, frame.body_mut());
                    buf.consume(count);
                }
                let left = left - count;
                self.body_left = BodyLength::Remaining(left);
                if left == 0 {
                    self.state = State::End;
                }
                true
            }
        }
    }

    fn step_end(&mut self, buf: &mut IoBuf) -> bool {
        // Don't overwrite a finished frame the caller hasn't picked up yet.
        if self.finished.is_some() {
            return false;
        }

        match buf.byte_at(0) {
            Some(NUL) => {
                buf.consume(1);
                self.finished = self.current.take();
                self.body_left = BodyLength::Unknown;
                self.state = State::Idle;
                true
            }
            Some(_) => {
                self.set_error("Expected trailing NUL at end of frame");
                false
            }
            None => false,
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Reverses header octet escaping: `\n`, `\r`, `\c`, `\\` become LF, CR,
/// colon, backslash. Any other backslash sequence (including a trailing
/// backslash) is malformed.
fn unescape(input: ByteString) -> Result<ByteString, ()> {
    if input.find_byte(b'\\', 0).is_none() {
        return Ok(input);
    }

    let mut out = ByteString::with_capacity(input.len());
    let mut bytes = input.as_bytes().iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push_byte(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push_byte(LF),
            Some(b'r') => out.push_byte(CR),
            Some(b'c') => out.push_byte(b':'),
            Some(b'\\') => out.push_byte(b'\\'),
            _ => return Err(()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn buf_from(bytes: &[u8]) -> IoBuf {
        let mut buf = IoBuf::with_capacity(bytes.len().max(1));
        buf.extend_from_slice(bytes);
        buf
    }

    #[test]
    fn parses_minimal_frame() {
        let mut parser = FrameParser::new();
        let mut buf = buf_from(b"DISCONNECT\n\n\0");
        assert_eq!(parser.parse(&mut buf), ParseOutcome::FrameReady);
        let frame = parser.take_frame().unwrap();
        assert_eq!(frame.command(), Command::Disconnect);
        assert!(frame.headers.is_empty());
        assert!(frame.body_bytes().is_empty());
    }

    #[test]
    fn error_state_is_sticky_and_keeps_first_message() {
        let mut parser = FrameParser::new();
        let mut buf = buf_from(b"BOGUS\n\n\0");
        assert_eq!(parser.parse(&mut buf), ParseOutcome::Error);
        assert_eq!(parser.error().unwrap(), b"Unknown command".as_slice());

        let mut more = buf_from(b"SEND\ndestination:/queue/a\n\n\0");
        assert_eq!(parser.parse(&mut more), ParseOutcome::Error);
        assert_eq!(parser.error().unwrap(), b"Unknown command".as_slice());
        assert!(parser.take_frame().is_none());
    }

    #[test]
    fn lone_cr_between_frames_is_an_error() {
        let mut parser = FrameParser::new();
        let mut buf = buf_from(b"\rX");
        assert_eq!(parser.parse(&mut buf), ParseOutcome::Error);
        assert_eq!(
            parser.error().unwrap(),
            b"Expected 0x0A after 0x0D, got 0x58".as_slice()
        );
    }

    #[test]
    fn finished_frame_blocks_the_next_one() {
        let mut parser = FrameParser::new();
        let mut buf = buf_from(b"BEGIN\ntransaction:t1\n\n\0COMMIT\ntransaction:t1\n\n\0");
        assert_eq!(parser.parse(&mut buf), ParseOutcome::FrameReady);
        let first = parser.take_frame().unwrap();
        assert_eq!(first.command(), Command::Begin);

        // The second frame parses only after the first was taken.
        assert_eq!(parser.parse(&mut buf), ParseOutcome::FrameReady);
        let second = parser.take_frame().unwrap();
        assert_eq!(second.command(), Command::Commit);
        assert!(buf.is_empty());
    }

    #[test]
    fn unescape_rules() {
        assert_eq!(
            unescape(ByteString::from(r"a\nb\cc\\d\re")).unwrap(),
            b"a\nb:c\\d\re".as_slice()
        );
        assert!(unescape(ByteString::from(r"bad\x")).is_err());
        assert!(unescape(ByteString::from(r"trailing\")).is_err());
        assert_eq!(unescape(ByteString::from("plain")).unwrap(), b"plain".as_slice());
    }
}
