//! Reassembly table: per-message state, fragment tracking, role and direction.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::protocol::{Direction, MessageId, Progress, MAX_FRAGMENTS};
use crate::wire::{self, DecodedFrame, Frame};

/// One message entry. Created on first frame of an ID or on local broadcast.
#[derive(Debug, Clone)]
pub struct MessageState {
    pub id: MessageId,
    pub total_fragments: u8,
    pub is_response: bool,
    pub direction: Direction,
    pub complete: bool,
    /// Reassembled (inbound) or originating (outbound) text.
    pub text: String,
    /// Fragments handed to the radio in the current pass. Outbound only.
    pub broadcast_progress: usize,
    /// Full passes completed. Outbound only.
    pub broadcast_cycles: u32,
    /// Request handed to the response producer; nothing rebroadcast locally.
    pub awaiting_response: bool,
    /// Received fragments by 1-based index.
    fragments: BTreeMap<u8, DecodedFrame>,
}

impl MessageState {
    fn inbound(first: &DecodedFrame) -> Self {
        Self {
            id: first.message_id,
            total_fragments: first.total_fragments,
            is_response: first.is_response,
            direction: Direction::Inbound,
            complete: false,
            text: String::new(),
            broadcast_progress: 0,
            broadcast_cycles: 0,
            awaiting_response: false,
            fragments: BTreeMap::new(),
        }
    }

    /// Entry for a message this device broadcasts itself.
    pub fn outbound(id: MessageId, text: String, is_response: bool, total_fragments: u8) -> Self {
        Self {
            id,
            total_fragments,
            is_response,
            direction: Direction::Outbound,
            complete: false,
            text,
            broadcast_progress: 0,
            broadcast_cycles: 0,
            awaiting_response: false,
            fragments: BTreeMap::new(),
        }
    }

    pub fn received_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn has_fragment(&self, index: u8) -> bool {
        self.fragments.contains_key(&index)
    }

    /// Outbound: fragments broadcast this pass. Inbound: fragments received.
    pub fn progress(&self) -> Progress {
        let total = self.total_fragments as usize;
        match self.direction {
            Direction::Outbound => Progress::new(self.broadcast_progress, total),
            Direction::Inbound => Progress::new(self.fragments.len(), total),
        }
    }

    /// Received frames in index order, rebuilt byte for byte.
    pub fn frames(&self) -> Vec<Frame> {
        self.fragments.values().map(DecodedFrame::to_frame).collect()
    }

    fn flip_to_response(&mut self, total_fragments: u8) {
        self.is_response = true;
        self.direction = Direction::Inbound;
        self.complete = false;
        self.awaiting_response = false;
        self.text.clear();
        self.fragments.clear();
        self.total_fragments = total_fragments;
    }

    fn all_present(&self) -> bool {
        (1..=self.total_fragments).all(|i| self.fragments.contains_key(&i))
    }
}

/// Why a frame was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// `total_fragments` is 0 or above 127.
    InvalidTotal,
    /// Index 0 or beyond `total_fragments`.
    IndexOutOfRange,
    /// Declared total disagrees with the entry's current generation.
    TotalMismatch,
}

/// Result of feeding one frame to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    /// Frame stored; message still incomplete.
    FragmentAccepted { id: MessageId, progress: Progress },
    /// Frame completed the message.
    MessageComplete {
        id: MessageId,
        text: String,
        is_response: bool,
    },
    /// Already have it, or it is our own outbound message coming back.
    Duplicate { id: MessageId },
    /// Invalid header; ignored.
    Dropped { id: MessageId, reason: DropReason },
}

/// All known messages keyed by ID.
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    entries: HashMap<MessageId, MessageState>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one decoded frame and report what changed.
    pub fn on_frame_received(&mut self, decoded: DecodedFrame) -> ReassemblyEvent {
        let id = decoded.message_id;
        let total = decoded.total_fragments;
        if total == 0 || total as usize > MAX_FRAGMENTS {
            trace!(id, total, "dropping frame with invalid total");
            return ReassemblyEvent::Dropped {
                id,
                reason: DropReason::InvalidTotal,
            };
        }
        if decoded.fragment_index == 0 || decoded.fragment_index > total {
            trace!(id, index = decoded.fragment_index, total, "dropping frame with out-of-range index");
            return ReassemblyEvent::Dropped {
                id,
                reason: DropReason::IndexOutOfRange,
            };
        }

        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| MessageState::inbound(&decoded));

        if !entry.is_response && decoded.is_response {
            debug!(id, total, "response started arriving, entry switches to response reassembly");
            entry.flip_to_response(total);
        }

        if entry.is_response && !decoded.is_response {
            trace!(id, "ignoring late request frame for answered message");
            return ReassemblyEvent::Duplicate { id };
        }
        if entry.direction == Direction::Outbound && entry.is_response == decoded.is_response {
            trace!(id, "ignoring echo of outbound message");
            return ReassemblyEvent::Duplicate { id };
        }
        if entry.complete || entry.fragments.contains_key(&decoded.fragment_index) {
            return ReassemblyEvent::Duplicate { id };
        }
        if entry.total_fragments != total {
            trace!(id, expected = entry.total_fragments, got = total, "dropping frame from another generation");
            return ReassemblyEvent::Dropped {
                id,
                reason: DropReason::TotalMismatch,
            };
        }

        entry.fragments.insert(decoded.fragment_index, decoded);

        if entry.fragments.len() < entry.total_fragments as usize {
            return ReassemblyEvent::FragmentAccepted {
                id,
                progress: entry.progress(),
            };
        }
        if !entry.all_present() {
            debug!(id, "fragment count reached total with gaps, skipping reassembly");
            return ReassemblyEvent::FragmentAccepted {
                id,
                progress: entry.progress(),
            };
        }

        let text = wire::assemble_text(entry.fragments.values().map(|f| f.body.as_slice()));
        entry.complete = true;
        entry.text = text.clone();
        debug!(id, is_response = entry.is_response, len = text.len(), "message reassembled");
        ReassemblyEvent::MessageComplete {
            id,
            text,
            is_response: entry.is_response,
        }
    }

    /// Insert or replace the entry for a locally generated message.
    pub fn insert_outbound(&mut self, state: MessageState) {
        self.entries.insert(state.id, state);
    }

    /// Turn a completed inbound request into a relay. Returns its frames in index order.
    pub fn begin_relay(&mut self, id: MessageId) -> Option<Vec<Frame>> {
        let entry = self.entries.get_mut(&id)?;
        if !entry.complete {
            return None;
        }
        entry.direction = Direction::Outbound;
        entry.broadcast_progress = 0;
        Some(entry.frames())
    }

    pub fn mark_awaiting_response(&mut self, id: MessageId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.awaiting_response = true;
        }
    }

    /// Record that fragment `sent` (1-based) of an outbound message reached the radio.
    /// Returns the new progress if the entry is outbound.
    pub fn record_broadcast(&mut self, id: MessageId, sent: usize) -> Option<Progress> {
        let entry = self.outbound_mut(id)?;
        entry.broadcast_progress = entry.broadcast_progress.max(sent);
        Some(entry.progress())
    }

    /// Record a completed pass over all fragments.
    pub fn record_cycle(&mut self, id: MessageId, cycles: u32) -> Option<Progress> {
        let entry = self.outbound_mut(id)?;
        entry.broadcast_cycles = cycles;
        entry.broadcast_progress = entry.total_fragments as usize;
        Some(entry.progress())
    }

    /// Outbound message finished its cycles: complete, no longer outbound.
    pub fn finish_outbound(&mut self, id: MessageId) {
        if let Some(entry) = self.outbound_mut(id) {
            entry.complete = true;
            entry.direction = Direction::Inbound;
        }
    }

    pub fn get(&self, id: MessageId) -> Option<&MessageState> {
        self.entries.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageState> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn outbound_mut(&mut self, id: MessageId) -> Option<&mut MessageState> {
        self.entries
            .get_mut(&id)
            .filter(|e| e.direction == Direction::Outbound)
    }
}
