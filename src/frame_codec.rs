//! Length-prefixed frames exchanged with the emulator workers.
//!
//! A frame on the wire is its payload length in ASCII decimal, one space, then exactly that
//! many payload bytes: `8 FINISHED`. Workers may coalesce several frames in one write, and a
//! single read may stop in the middle of a frame, so decoding is done by [`FrameDecoder`]
//! which keeps the incomplete tail until more bytes arrive.
//!
//! The kind of a frame is discriminated by a fixed prefix of its payload, see [`Tag`].

use crate::error::EvalError;

pub const READY: &[u8] = b"READY";
pub const FINISHED: &[u8] = b"FINISHED";
pub const FITNESS_MARKER: &[u8] = b"FITNESS:";
pub const LOG_MARKER: &[u8] = b"LOG:";
pub const STATE_MARKER: &[u8] = b"BF_STATE";
pub const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Frames larger than this are rejected.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// u32::MAX has 10 digits
const MAX_PREFIX_DIGITS: usize = 10;

/// Kind of a frame, decided by its payload prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Handshake sentinel, sent by the worker before each agent and echoed back.
    Ready,
    /// Sent to the worker when no agent is left.
    Finish,
    /// `FITNESS:<float>`, ends the evaluation of the current agent.
    Fitness,
    /// `LOG:<text>`, one-way.
    Log,
    /// `BF_STATE<json>`, answered with the rendered output vector.
    StatePayload,
    /// A PNG screenshot, answered with an action label.
    ImagePayload,
    /// Anything else. Ignored.
    Unknown,
}

impl Tag {
    /// Prefix-selected tags, in discrimination order.
    const PREFIXES: [(Tag, &'static [u8]); 4] = [
        (Tag::Fitness, FITNESS_MARKER),
        (Tag::Log, LOG_MARKER),
        (Tag::StatePayload, STATE_MARKER),
        (Tag::ImagePayload, PNG_SIGNATURE),
    ];

    pub fn classify(payload: &[u8]) -> Tag {
        if payload == READY {
            return Tag::Ready;
        }
        if payload == FINISHED {
            return Tag::Finish;
        }
        Self::PREFIXES
            .iter()
            .find(|(_, prefix)| payload.starts_with(prefix))
            .map_or(Tag::Unknown, |(tag, _)| *tag)
    }

    /// Bytes stripped from the payload to get the frame body.
    fn marker_len(&self) -> usize {
        match self {
            Tag::Fitness => FITNESS_MARKER.len(),
            Tag::Log => LOG_MARKER.len(),
            Tag::StatePayload => STATE_MARKER.len(),
            Tag::Ready | Tag::Finish | Tag::ImagePayload | Tag::Unknown => 0,
        }
    }
}

/// One self-delimited message.
///
/// Only built through [`Frame::new`], so the tag always agrees with the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    tag: Tag,
    /// The full payload, marker included.
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: impl Into<Vec<u8>>) -> Frame {
        let payload = payload.into();
        Frame {
            tag: Tag::classify(&payload),
            payload,
        }
    }

    pub fn ready() -> Frame {
        Frame::new(READY)
    }

    pub fn finish() -> Frame {
        Frame::new(FINISHED)
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The full payload, marker included.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Payload without its marker. Images keep their PNG signature.
    pub fn body(&self) -> &[u8] {
        &self.payload[self.tag.marker_len()..]
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(&self.payload)
    }
}

/// `payload` prefixed by its decimal length and a space.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{} ", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out
}

/// Decode a buffer holding only complete frames.
///
/// # Errors
/// Returns [`EvalError::Protocol`] on a malformed length prefix or a truncated last frame.
pub fn decode_frames(buf: &[u8]) -> Result<Vec<Frame>, EvalError> {
    let mut decoder = FrameDecoder::default();
    let frames = decoder.push_chunk(buf)?;
    if decoder.has_pending() {
        return Err(EvalError::protocol(format!(
            "truncated frame: {} trailing bytes",
            decoder.pending.len()
        )));
    }
    Ok(frames)
}

/// Incremental decoder for the byte stream of one connection.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
        }
    }

    /// Append `chunk` and return every frame completed by it, in stream order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, EvalError> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut cursor = 0;
        while let Some((frame, consumed)) = self.parse_one(&self.pending[cursor..])? {
            frames.push(frame);
            cursor += consumed;
        }
        self.pending.drain(..cursor);
        Ok(frames)
    }

    /// True while part of a frame is buffered.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Parse the frame at the start of `buf`, `None` if it is not complete yet.
    fn parse_one(&self, buf: &[u8]) -> Result<Option<(Frame, usize)>, EvalError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let Some(space) = buf.iter().take(MAX_PREFIX_DIGITS + 1).position(|b| *b == b' ')
        else {
            if buf.len() > MAX_PREFIX_DIGITS || !buf.iter().all(u8::is_ascii_digit) {
                return Err(bad_prefix(buf));
            }
            return Ok(None);
        };

        let digits = &buf[..space];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(bad_prefix(buf));
        }
        // only ASCII digits at this point
        let size: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad_prefix(buf))?;
        if size > self.max_frame_bytes {
            return Err(EvalError::protocol(format!(
                "frame of {size} bytes exceeds the {} bytes limit",
                self.max_frame_bytes
            )));
        }

        let start = space + 1;
        let end = start + size;
        if buf.len() < end {
            return Ok(None);
        }
        Ok(Some((Frame::new(&buf[start..end]), end)))
    }
}

fn bad_prefix(buf: &[u8]) -> EvalError {
    let shown = &buf[..buf.len().min(16)];
    EvalError::protocol(format!(
        "invalid length prefix in '{}'",
        String::from_utf8_lossy(shown)
    ))
}
