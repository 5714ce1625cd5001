//! Framing: 3-byte header + fixed-size body, null-padded on the final fragment.
//!
//! ```text
//! byte 0      message id
//! byte 1      total fragments (1..=127)
//! byte 2      bit 7 response flag | bits 6..0 fragment index (1-based)
//! byte 3..    body (N bytes)
//! ```

use crate::message_id;
use crate::protocol::{
    MessageId, DEFAULT_BODY_LEN, HEADER_SIZE, INDEX_MASK, MAX_BODY_LEN, MAX_FRAGMENTS,
    RESPONSE_FLAG,
};

/// One radio frame, exactly as advertised.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Frame(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Header fields and body of a single frame. Carries no state between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub message_id: MessageId,
    pub total_fragments: u8,
    /// 1-based, masked to 7 bits.
    pub fragment_index: u8,
    pub is_response: bool,
    /// Everything after the header, padding included.
    pub body: Vec<u8>,
}

impl DecodedFrame {
    /// Rebuild the exact bytes this frame was decoded from.
    pub fn to_frame(&self) -> Frame {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.push(self.message_id);
        out.push(self.total_fragments);
        out.push(index_byte(self.fragment_index, self.is_response));
        out.extend_from_slice(&self.body);
        Frame(out)
    }

    /// Body with trailing null padding removed.
    pub fn trimmed_body(&self) -> &[u8] {
        strip_padding(&self.body)
    }
}

/// Error encoding a message into frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("message needs {fragments} fragments, limit is {MAX_FRAGMENTS}")]
    MessageTooLarge { fragments: usize },
}

/// Fixed frame geometry. Every device in a network must agree on `body_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    body_len: usize,
}

impl Codec {
    /// `body_len` is clamped to `1..=MAX_BODY_LEN`.
    pub fn new(body_len: usize) -> Self {
        Self {
            body_len: body_len.clamp(1, MAX_BODY_LEN),
        }
    }

    pub fn body_len(&self) -> usize {
        self.body_len
    }

    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len
    }

    /// Largest UTF-8 byte length that still fits in `MAX_FRAGMENTS` frames.
    pub fn max_message_len(&self) -> usize {
        MAX_FRAGMENTS * self.body_len
    }

    /// Split `text` into frames. A random ID is drawn when `message_id` is `None`.
    pub fn encode(
        &self,
        text: &str,
        message_id: Option<MessageId>,
        is_response: bool,
    ) -> Result<Vec<Frame>, EncodeError> {
        let bytes = text.as_bytes();
        let total = bytes.len().div_ceil(self.body_len).max(1);
        if total > MAX_FRAGMENTS {
            return Err(EncodeError::MessageTooLarge { fragments: total });
        }
        let id = message_id.unwrap_or_else(message_id::generate);
        let mut frames = Vec::with_capacity(total);
        for i in 0..total {
            let mut out = vec![0u8; self.frame_len()];
            out[0] = id;
            out[1] = total as u8;
            out[2] = index_byte((i + 1) as u8, is_response);
            let start = (i * self.body_len).min(bytes.len());
            let end = (start + self.body_len).min(bytes.len());
            out[HEADER_SIZE..HEADER_SIZE + (end - start)].copy_from_slice(&bytes[start..end]);
            frames.push(Frame(out));
        }
        Ok(frames)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_BODY_LEN)
    }
}

/// Decode one frame. Returns `None` if it is shorter than the header.
pub fn decode_frame(bytes: &[u8]) -> Option<DecodedFrame> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    Some(DecodedFrame {
        message_id: bytes[0],
        total_fragments: bytes[1],
        fragment_index: bytes[2] & INDEX_MASK,
        is_response: bytes[2] & RESPONSE_FLAG != 0,
        body: bytes[HEADER_SIZE..].to_vec(),
    })
}

/// Join bodies in order, strip the null padding and decode. Invalid UTF-8 is replaced, not rejected.
pub fn assemble_text<'a>(bodies: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut joined = Vec::new();
    for body in bodies {
        joined.extend_from_slice(body);
    }
    String::from_utf8_lossy(strip_padding(&joined)).into_owned()
}

fn index_byte(index: u8, is_response: bool) -> u8 {
    let mut b = index & INDEX_MASK;
    if is_response {
        b |= RESPONSE_FLAG;
    }
    b
}

fn strip_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}
