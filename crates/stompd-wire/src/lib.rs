//! STOMP 1.2 wire layer: windowed I/O buffers, frames, and the streaming
//! parser and serializer that connect them to non-blocking sockets.

mod frame;
mod iobuf;
mod parser;
mod serializer;

pub use frame::{Command, Frame, HeaderBundle};
pub use iobuf::IoBuf;
pub use parser::{FrameParser, ParseOutcome};
pub use serializer::{CompletedFrame, FrameSerializer, SERIALIZER_QUEUE_SIZE};

/// Longest accepted command line, in bytes, excluding the line terminator.
pub const LIMIT_FRAME_CMD_LINE_LEN: usize = 32;
/// Longest accepted header line, in bytes, excluding the line terminator.
pub const LIMIT_FRAME_HEADER_LINE_LEN: usize = 8192;
/// Most headers accepted on a single frame.
pub const LIMIT_FRAME_HEADER_COUNT: usize = 128;
/// Largest accepted frame body, in bytes.
pub const LIMIT_FRAME_BODY_LEN: usize = 10 * 1024 * 1024;
