//! hgs2hpc text protocol parser and reply encoder.
//!
//! One request per frame, one reply per write:
//!
//! ```text
//! Request:  <lat> <lon> <obstime>
//! Reply:    <x>, <y>
//!
//! Request:  quit
//! Reply:    ok
//! ```
//!
//! Frames end at `\n`, or at the end of a short read when no newline is
//! present. Replies carry no terminator. A request that cannot
//! be computed is answered with [`FALLBACK_REPLY`].

use crate::transformer::Point;
use bytes::{Bytes, BytesMut};
use std::str;

/// Termination command, matched exactly after trimming.
pub const QUIT: &str = "quit";

/// Acknowledgement sent before a session closes.
pub const ACK_REPLY: &[u8] = b"ok";

/// Sentinel pair sent whenever a request cannot be computed.
pub const FALLBACK_REPLY: &[u8] = b"0.123456789 0.987654321";

/// Coordinates to convert.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub lat: f64,
    pub lon: f64,
    /// Observation time, passed to the transformer untouched.
    pub obstime: String,
}

/// Parsed client request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Convert(Query),
    Quit,
}

/// Reply to a single request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    /// Converted coordinates
    Point(Point),
    /// The request could not be computed
    Fallback,
    /// Acknowledges `quit`
    Ack,
}

impl Reply {
    /// Encode the reply in its wire form.
    pub fn encode(&self) -> Bytes {
        match self {
            Reply::Point(point) => Bytes::from(format!("{:?}, {:?}", point.x, point.y)),
            Reply::Fallback => Bytes::from_static(FALLBACK_REPLY),
            Reply::Ack => Bytes::from_static(ACK_REPLY),
        }
    }
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Frame is not valid UTF-8
    InvalidUtf8,
    /// Wrong number of fields
    FieldCount { expected: usize, found: usize },
    /// Field is not a finite number
    InvalidNumber(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidUtf8 => write!(f, "Invalid UTF-8 in request"),
            ParseError::FieldCount { expected, found } => {
                write!(f, "Expected {expected} fields, found {found}")
            }
            ParseError::InvalidNumber(field) => write!(f, "Invalid number: {field}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Longest request line accepted, terminator included.
pub const MAX_LINE_LENGTH: usize = 4096;

/// A unit of input handed to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// One request
    Line(Bytes),
    /// A line exceeded [`MAX_LINE_LENGTH`]; it is answered once and discarded
    Overflow,
}

/// Splits buffered input into frames.
///
/// A frame ends at `\n`. Without a newline, the buffered bytes only form a
/// frame once a read came back short, meaning the client's write has ended.
/// Lines longer than [`MAX_LINE_LENGTH`] yield a single [`Frame::Overflow`]
/// and the rest of the line is dropped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    discarding: bool,
}

impl FrameDecoder {
    /// Take the next frame out of `buffer`.
    ///
    /// `short_read` tells whether the last read left spare room in the
    /// buffer.
    pub fn decode(&mut self, buffer: &mut BytesMut, short_read: bool) -> Option<Frame> {
        loop {
            if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line = buffer.split_to(pos + 1);
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                if line.len() > MAX_LINE_LENGTH {
                    return Some(Frame::Overflow);
                }
                return Some(Frame::Line(line.freeze()));
            }

            if buffer.len() > MAX_LINE_LENGTH {
                buffer.clear();
                if self.discarding {
                    return None;
                }
                self.discarding = true;
                return Some(Frame::Overflow);
            }

            if !short_read || buffer.is_empty() {
                return None;
            }

            if self.discarding {
                buffer.clear();
                self.discarding = false;
                return None;
            }
            return Some(Frame::Line(buffer.split().freeze()));
        }
    }
}

/// Parse a single frame into a request.
pub fn parse_request(frame: &[u8]) -> Result<Request, ParseError> {
    let line = str::from_utf8(frame)
        .map_err(|_| ParseError::InvalidUtf8)?
        .trim();

    if line == QUIT {
        return Ok(Request::Quit);
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    let [lat, lon, obstime] = parts[..] else {
        return Err(ParseError::FieldCount {
            expected: 3,
            found: parts.len(),
        });
    };

    Ok(Request::Convert(Query {
        lat: parse_number(lat)?,
        lon: parse_number(lon)?,
        obstime: obstime.to_string(),
    }))
}

/// Parse `"<x>, <y>"` text back into a point.
pub fn parse_point(text: &str) -> Result<Point, ParseError> {
    let parts: Vec<&str> = text.trim().split(',').map(str::trim).collect();
    let [x, y] = parts[..] else {
        return Err(ParseError::FieldCount {
            expected: 2,
            found: parts.len(),
        });
    };
    Ok(Point::new(parse_number(x)?, parse_number(y)?))
}

fn parse_number(field: &str) -> Result<f64, ParseError> {
    match field.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ParseError::InvalidNumber(field.to_string())),
    }
}
