//! hopcast wire protocol: frame layout constants and shared types.

/// Message identifier carried in byte 0 of every frame.
pub type MessageId = u8;

/// Header bytes: message ID, total fragments, flag + index.
pub const HEADER_SIZE: usize = 3;

/// Default body bytes per frame. Must be the same on every device in a network.
pub const DEFAULT_BODY_LEN: usize = 6;

/// Largest body size a deployment may configure.
pub const MAX_BODY_LEN: usize = 24;

/// Fragment index is 7 bits, so a message spans at most 127 frames.
pub const MAX_FRAGMENTS: usize = 127;

/// Bit 7 of header byte 2: frame belongs to a response.
pub const RESPONSE_FLAG: u8 = 0b1000_0000;

/// Bits 6..0 of header byte 2: 1-based fragment index.
pub const INDEX_MASK: u8 = 0b0111_1111;

/// Default number of full passes an outbound message gets before it fades out.
pub const DEFAULT_MAX_BROADCAST_CYCLES: u32 = 6;

/// Whether an entry was assembled from received frames or generated for broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Fragments done out of total. `percent` is rounded to the nearest integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
    pub percent: u8,
}

impl Progress {
    pub fn new(done: usize, total: usize) -> Self {
        let total = total.max(1);
        let done = done.min(total);
        let percent = ((done * 100 + total / 2) / total) as u8;
        Self {
            done,
            total,
            percent,
        }
    }
}

/// Notifications for whoever renders mesh state (CLI, UI, logs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A message finished reassembly.
    MessageComplete {
        message_id: MessageId,
        text: String,
        is_response: bool,
    },
    /// Reception or broadcast progress moved for a message.
    ProgressChanged {
        message_id: MessageId,
        progress: Progress,
    },
    /// An outbound message used up its broadcast cycles and left the queue.
    BroadcastFinished { message_id: MessageId, cycles: u32 },
}
