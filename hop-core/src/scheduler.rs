//! Broadcast scheduler state: outbound frame sets, round-robin cursor, cycle counting.
//! No timers here; the host loop paces calls to `next` and `advance`.

use crate::protocol::MessageId;
use crate::wire::Frame;

struct QueuedMessage {
    message_id: MessageId,
    frames: Vec<Frame>,
    cycles: u32,
}

/// A frame picked for the radio, with enough context to report back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledFrame {
    pub message_id: MessageId,
    /// 0-based position within the message's frames.
    pub fragment: usize,
    pub total: usize,
    pub frame: Frame,
}

/// What `advance` did with the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// More fragments left in this pass.
    Continue,
    /// Last fragment of a pass went out; cursor moved to the next message.
    PassCompleted { cycles: u32 },
    /// The message left the queue while its frame was on air.
    Gone,
}

/// Ordered outbound work. Entries keep their position when replaced.
#[derive(Default)]
pub struct BroadcastQueue {
    entries: Vec<QueuedMessage>,
    message_cursor: usize,
    fragment_cursor: usize,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert frames for `message_id`, or replace an existing entry's frames and reset its cycles.
    pub fn enqueue(&mut self, message_id: MessageId, frames: Vec<Frame>) {
        match self.entries.iter_mut().find(|e| e.message_id == message_id) {
            Some(entry) => {
                entry.frames = frames;
                entry.cycles = 0;
            }
            None => self.entries.push(QueuedMessage {
                message_id,
                frames,
                cycles: 0,
            }),
        }
    }

    /// Remove a message. Cursor restarts from the front.
    pub fn remove(&mut self, message_id: MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.message_id != message_id);
        let removed = self.entries.len() != before;
        if removed {
            self.reset_cursor();
        }
        removed
    }

    /// Frame at the cursor. Entries with no frames are discarded on the way.
    pub fn next(&mut self) -> Option<ScheduledFrame> {
        loop {
            if self.entries.is_empty() {
                return None;
            }
            if self.message_cursor >= self.entries.len() {
                self.message_cursor = 0;
            }
            let entry = &self.entries[self.message_cursor];
            if entry.frames.is_empty() {
                self.entries.remove(self.message_cursor);
                self.reset_cursor();
                continue;
            }
            if self.fragment_cursor >= entry.frames.len() {
                self.fragment_cursor = 0;
            }
            return Some(ScheduledFrame {
                message_id: entry.message_id,
                fragment: self.fragment_cursor,
                total: entry.frames.len(),
                frame: entry.frames[self.fragment_cursor].clone(),
            });
        }
    }

    /// Move past `sent`. On the last fragment, count a pass and move to the next message.
    pub fn advance(&mut self, sent: &ScheduledFrame) -> Advance {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.message_id == sent.message_id)
        else {
            return Advance::Gone;
        };
        self.message_cursor = pos;
        self.fragment_cursor = sent.fragment + 1;
        let entry = &mut self.entries[pos];
        if self.fragment_cursor < entry.frames.len() {
            return Advance::Continue;
        }
        entry.cycles += 1;
        let cycles = entry.cycles;
        self.fragment_cursor = 0;
        self.message_cursor = (pos + 1) % self.entries.len();
        Advance::PassCompleted { cycles }
    }

    /// ID of the message the cursor points at.
    pub fn current(&self) -> Option<MessageId> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = if self.message_cursor < self.entries.len() {
            self.message_cursor
        } else {
            0
        };
        Some(self.entries[idx].message_id)
    }

    /// First frame queued for `message_id`.
    pub fn first_frame(&self, message_id: MessageId) -> Option<&Frame> {
        self.entries
            .iter()
            .find(|e| e.message_id == message_id)
            .and_then(|e| e.frames.first())
    }

    pub fn cycles(&self, message_id: MessageId) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.message_id == message_id)
            .map(|e| e.cycles)
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.entries.iter().any(|e| e.message_id == message_id)
    }

    pub fn message_ids(&self) -> Vec<MessageId> {
        self.entries.iter().map(|e| e.message_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.reset_cursor();
    }

    fn reset_cursor(&mut self) {
        self.message_cursor = 0;
        self.fragment_cursor = 0;
    }
}
