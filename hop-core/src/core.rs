//! Host-driven API: MeshCore receives frames and scheduler callbacks from the host, returns actions.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coordinator::{self, Disposition};
use crate::message_id;
use crate::protocol::{Direction, MeshEvent, MessageId, Progress, DEFAULT_BODY_LEN, DEFAULT_MAX_BROADCAST_CYCLES};
use crate::reassembly::{MessageState, ReassemblyEvent, ReassemblyTable};
use crate::scheduler::{Advance, BroadcastQueue, ScheduledFrame};
use crate::wire::{self, Codec, EncodeError};

/// Characters of message text shown in a broadcast preview.
const PREVIEW_CHARS: usize = 60;

/// Protocol parameters that must match across a deployment (body size) or bound effort (cycles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    /// Body bytes per frame (default 6).
    #[serde(default = "default_body_len")]
    pub body_len: usize,
    /// Full passes per outbound message before it leaves the queue (default 6).
    #[serde(default = "default_max_broadcast_cycles")]
    pub max_broadcast_cycles: u32,
}

fn default_body_len() -> usize {
    DEFAULT_BODY_LEN
}
fn default_max_broadcast_cycles() -> u32 {
    DEFAULT_MAX_BROADCAST_CYCLES
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            body_len: default_body_len(),
            max_broadcast_cycles: default_max_broadcast_cycles(),
        }
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Ask the response producer to answer `request`; report back with `on_response_produced`.
    ProduceResponse {
        message_id: MessageId,
        request: String,
    },
    /// Frames were queued; make sure the broadcast loop is running.
    StartBroadcasting,
    /// Forward to observers.
    Notify(MeshEvent),
}

/// Message at the scheduler cursor, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastInfo {
    pub message_id: MessageId,
    pub preview: String,
}

/// Owns the reassembly table and the broadcast queue. All mutation goes through here.
pub struct MeshCore {
    config: MeshConfig,
    codec: Codec,
    table: ReassemblyTable,
    queue: BroadcastQueue,
}

impl MeshCore {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            codec: Codec::new(config.body_len),
            config,
            table: ReassemblyTable::new(),
            queue: BroadcastQueue::new(),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Start broadcasting a new request under a random ID.
    pub fn broadcast_message(&mut self, text: &str) -> Result<(MessageId, Vec<Action>), EncodeError> {
        let id = self.fresh_id();
        let frames = self.codec.encode(text, Some(id), false)?;
        self.table.insert_outbound(MessageState::outbound(
            id,
            text.to_string(),
            false,
            frames.len() as u8,
        ));
        self.queue.enqueue(id, frames);
        info!(id, len = text.len(), "broadcasting new message");
        Ok((id, vec![Action::StartBroadcasting]))
    }

    /// Random ID not used by anything this device is still broadcasting.
    fn fresh_id(&self) -> MessageId {
        let start = message_id::generate();
        let free = (0..=MessageId::MAX)
            .map(|k| start.wrapping_add(k))
            .find(|&id| !self.id_busy(id));
        match free {
            Some(id) => id,
            None => {
                warn!("every message ID is in local use, reusing one");
                start
            }
        }
    }

    fn id_busy(&self, id: MessageId) -> bool {
        self.queue.contains(id)
            || self
                .table
                .get(id)
                .is_some_and(|e| e.direction == Direction::Outbound)
    }

    /// Process one raw frame from the radio. `can_respond` is the response producer's current capability.
    pub fn on_frame_received(&mut self, bytes: &[u8], can_respond: bool) -> Vec<Action> {
        let Some(decoded) = wire::decode_frame(bytes) else {
            tracing::trace!(len = bytes.len(), "dropping short frame");
            return vec![];
        };
        match self.table.on_frame_received(decoded) {
            ReassemblyEvent::FragmentAccepted { id, progress } => {
                vec![Action::Notify(MeshEvent::ProgressChanged {
                    message_id: id,
                    progress,
                })]
            }
            ReassemblyEvent::MessageComplete {
                id,
                text,
                is_response,
            } => self.on_message_complete(id, text, is_response, can_respond),
            ReassemblyEvent::Duplicate { .. } | ReassemblyEvent::Dropped { .. } => vec![],
        }
    }

    fn on_message_complete(
        &mut self,
        id: MessageId,
        text: String,
        is_response: bool,
        can_respond: bool,
    ) -> Vec<Action> {
        let mut actions = vec![Action::Notify(MeshEvent::MessageComplete {
            message_id: id,
            text: text.clone(),
            is_response,
        })];
        match coordinator::dispose(is_response, can_respond) {
            Disposition::Deliver => {
                info!(id, "response received");
            }
            Disposition::Respond => {
                info!(id, "request complete, producing response");
                self.table.mark_awaiting_response(id);
                actions.push(Action::ProduceResponse {
                    message_id: id,
                    request: text,
                });
            }
            Disposition::Relay => match self.table.begin_relay(id) {
                Some(frames) => {
                    info!(id, frames = frames.len(), "request complete, relaying");
                    self.queue.enqueue(id, frames);
                    actions.push(Action::StartBroadcasting);
                }
                None => warn!(id, "completed message missing from table, cannot relay"),
            },
        }
        actions
    }

    /// Queue a produced response under the request's ID with the response flag set.
    pub fn on_response_produced(
        &mut self,
        message_id: MessageId,
        response: &str,
    ) -> Result<Vec<Action>, EncodeError> {
        let frames = self.codec.encode(response, Some(message_id), true)?;
        self.table.insert_outbound(MessageState::outbound(
            message_id,
            response.to_string(),
            true,
            frames.len() as u8,
        ));
        self.queue.enqueue(message_id, frames);
        info!(id = message_id, len = response.len(), "broadcasting response");
        Ok(vec![Action::StartBroadcasting])
    }

    /// Next frame for the radio, if any work is queued.
    pub fn next_frame(&mut self) -> Option<ScheduledFrame> {
        self.queue.next()
    }

    /// Report a hand-off to the radio. `ok` is false when advertising failed.
    pub fn on_frame_advertised(&mut self, sent: &ScheduledFrame, ok: bool) -> Vec<Action> {
        let id = sent.message_id;
        let mut actions = Vec::new();
        if ok {
            if let Some(progress) = self.table.record_broadcast(id, sent.fragment + 1) {
                actions.push(progress_event(id, progress));
            }
        }
        match self.queue.advance(sent) {
            Advance::Continue | Advance::Gone => {}
            Advance::PassCompleted { cycles } => {
                debug!(id, cycles, "broadcast cycle complete");
                if let Some(progress) = self.table.record_cycle(id, cycles) {
                    actions.push(progress_event(id, progress));
                }
                if cycles >= self.config.max_broadcast_cycles {
                    self.queue.remove(id);
                    self.table.finish_outbound(id);
                    info!(id, cycles, "stopped broadcasting message");
                    actions.push(Action::Notify(MeshEvent::BroadcastFinished {
                        message_id: id,
                        cycles,
                    }));
                }
            }
        }
        actions
    }

    /// Outbound messages use broadcast progress, inbound ones received fragments.
    pub fn progress(&self, message_id: MessageId) -> Option<Progress> {
        self.table.get(message_id).map(MessageState::progress)
    }

    /// What the scheduler is broadcasting right now.
    pub fn current_broadcast(&self) -> Option<BroadcastInfo> {
        let id = self.queue.current()?;
        let text = match self.table.get(id) {
            Some(state) => state.text.clone(),
            None => self
                .queue
                .first_frame(id)
                .and_then(|f| wire::decode_frame(f.as_bytes()))
                .map(|d| String::from_utf8_lossy(d.trimmed_body()).into_owned())
                .unwrap_or_default(),
        };
        Some(BroadcastInfo {
            message_id: id,
            preview: preview(&text),
        })
    }

    pub fn message(&self, message_id: MessageId) -> Option<&MessageState> {
        self.table.get(message_id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessageState> {
        self.table.iter()
    }

    /// IDs waiting in the broadcast queue, in scheduling order.
    pub fn queued(&self) -> Vec<MessageId> {
        self.queue.message_ids()
    }

    /// Entries in the reassembly table, complete or not.
    pub fn message_count(&self) -> usize {
        self.table.len()
    }

    pub fn has_queued_work(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Drop every message and all queued broadcasts.
    pub fn reset(&mut self) {
        self.table.clear();
        self.queue.clear();
        info!("mesh state cleared");
    }
}

impl Default for MeshCore {
    fn default() -> Self {
        Self::new(MeshConfig::default())
    }
}

fn progress_event(message_id: MessageId, progress: Progress) -> Action {
    Action::Notify(MeshEvent::ProgressChanged {
        message_id,
        progress,
    })
}

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_frame;

    /// Run the scheduler without delays until it has nothing left, collecting what went on air.
    fn drain(core: &mut MeshCore) -> Vec<ScheduledFrame> {
        let mut sent = Vec::new();
        while let Some(s) = core.next_frame() {
            core.on_frame_advertised(&s, true);
            sent.push(s);
        }
        sent
    }

    fn one_pass(core: &mut MeshCore) -> Vec<ScheduledFrame> {
        let mut sent = Vec::new();
        let first = core.next_frame().expect("queued work");
        let total = first.total;
        core.on_frame_advertised(&first, true);
        sent.push(first);
        for _ in 1..total {
            let s = core.next_frame().expect("rest of pass");
            core.on_frame_advertised(&s, true);
            sent.push(s);
        }
        sent
    }

    fn completes(actions: &[Action]) -> Vec<(MessageId, String, bool)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Notify(MeshEvent::MessageComplete {
                    message_id,
                    text,
                    is_response,
                }) => Some((*message_id, text.clone(), *is_response)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn broadcast_runs_exactly_max_cycles() {
        let mut core = MeshCore::new(MeshConfig {
            body_len: 6,
            max_broadcast_cycles: 3,
        });
        let (id, actions) = core.broadcast_message("twelve bytes").unwrap();
        assert_eq!(actions, vec![Action::StartBroadcasting]);
        let sent = drain(&mut core);
        assert_eq!(sent.len(), 2 * 3);
        assert!(!core.has_queued_work());
        let state = core.message(id).unwrap();
        assert!(state.complete);
        assert_eq!(state.direction, Direction::Inbound);
        assert_eq!(state.broadcast_cycles, 3);
    }

    #[test]
    fn finish_emits_broadcast_finished() {
        let mut core = MeshCore::new(MeshConfig {
            body_len: 6,
            max_broadcast_cycles: 1,
        });
        let (id, _) = core.broadcast_message("hi").unwrap();
        let s = core.next_frame().unwrap();
        let actions = core.on_frame_advertised(&s, true);
        assert!(actions.contains(&Action::Notify(MeshEvent::BroadcastFinished {
            message_id: id,
            cycles: 1
        })));
    }

    #[test]
    fn failed_advertise_does_not_move_progress() {
        let mut core = MeshCore::default();
        let (id, _) = core.broadcast_message("abcdefghijkl").unwrap();
        let s = core.next_frame().unwrap();
        core.on_frame_advertised(&s, false);
        assert_eq!(core.progress(id).unwrap().done, 0);
        let s = core.next_frame().unwrap();
        assert_eq!(s.fragment, 1);
        core.on_frame_advertised(&s, true);
        // Pass completed: progress pinned to 100%.
        assert_eq!(core.progress(id).unwrap().percent, 100);
    }

    #[test]
    fn offline_device_relays_request_verbatim() {
        let mut origin = MeshCore::default();
        let (id, _) = origin.broadcast_message("transfer 10 to carol").unwrap();
        let original = one_pass(&mut origin);

        let mut relay = MeshCore::default();
        let mut actions = Vec::new();
        for s in original.iter().rev() {
            actions.extend(relay.on_frame_received(s.frame.as_bytes(), false));
        }
        assert_eq!(completes(&actions), vec![(id, "transfer 10 to carol".into(), false)]);
        assert!(actions.contains(&Action::StartBroadcasting));
        assert_eq!(relay.queued(), vec![id]);
        assert_eq!(relay.progress(id).unwrap().done, 0);

        let relayed = one_pass(&mut relay);
        let relayed_bytes: Vec<&[u8]> = relayed.iter().map(|s| s.frame.as_bytes()).collect();
        let original_bytes: Vec<&[u8]> = original.iter().map(|s| s.frame.as_bytes()).collect();
        assert_eq!(relayed_bytes, original_bytes);
    }

    #[test]
    fn gateway_answers_under_same_id() {
        let mut origin = MeshCore::default();
        let (id, _) = origin.broadcast_message("{\"type\":\"transfer\"}").unwrap();
        let request = one_pass(&mut origin);

        let mut gateway = MeshCore::default();
        let mut actions = Vec::new();
        for s in &request {
            actions.extend(gateway.on_frame_received(s.frame.as_bytes(), true));
        }
        assert!(actions.contains(&Action::ProduceResponse {
            message_id: id,
            request: "{\"type\":\"transfer\"}".into(),
        }));
        assert!(gateway.message(id).unwrap().awaiting_response);
        assert!(gateway.queued().is_empty());

        let actions = gateway.on_response_produced(id, "{\"ok\":true}").unwrap();
        assert_eq!(actions, vec![Action::StartBroadcasting]);
        let response = one_pass(&mut gateway);
        for s in &response {
            let d = decode_frame(s.frame.as_bytes()).unwrap();
            assert_eq!(d.message_id, id);
            assert!(d.is_response);
        }

        // Originator sees the first response frame and drops its request entry.
        let mut actions = origin.on_frame_received(response[0].frame.as_bytes(), false);
        let entry = origin.message(id).unwrap();
        assert!(entry.is_response);
        assert!(entry.text.is_empty());
        for s in &response[1..] {
            actions.extend(origin.on_frame_received(s.frame.as_bytes(), false));
        }
        assert_eq!(completes(&actions), vec![(id, "{\"ok\":true}".into(), true)]);
        // Delivered, not rebroadcast: only the original request remains queued.
        assert_eq!(origin.queued(), vec![id]);
        assert!(!actions.contains(&Action::StartBroadcasting));
    }

    #[test]
    fn own_echo_does_not_complete() {
        let mut core = MeshCore::default();
        let (_, _) = core.broadcast_message("echo").unwrap();
        let s = core.next_frame().unwrap();
        let actions = core.on_frame_received(s.frame.as_bytes(), true);
        assert!(actions.is_empty());
    }

    #[test]
    fn garbage_is_ignored() {
        let mut core = MeshCore::default();
        assert!(core.on_frame_received(&[1, 2], true).is_empty());
        assert!(core.on_frame_received(&[1, 0, 1, 0, 0, 0, 0, 0, 0], true).is_empty());
        assert_eq!(core.messages().count(), 0);
    }

    #[test]
    fn progress_reported_while_assembling() {
        let frames = Codec::default().encode("abcdefghijklm", Some(8), false).unwrap();
        let mut core = MeshCore::default();
        let actions = core.on_frame_received(frames[1].as_bytes(), false);
        assert_eq!(
            actions,
            vec![Action::Notify(MeshEvent::ProgressChanged {
                message_id: 8,
                progress: Progress::new(1, 3),
            })]
        );
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut core = MeshCore::default();
        let err = core.broadcast_message(&"x".repeat(128 * 6)).unwrap_err();
        assert!(matches!(err, EncodeError::MessageTooLarge { .. }));
        assert!(!core.has_queued_work());
    }

    #[test]
    fn local_broadcasts_get_distinct_ids() {
        let mut core = MeshCore::default();
        let mut ids = Vec::new();
        for n in 0..200 {
            let (id, _) = core.broadcast_message(&format!("msg {n}")).unwrap();
            ids.push(id);
        }
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 200);
        assert_eq!(core.queued().len(), 200);
        assert_eq!(core.message_count(), 200);
        assert_eq!(core.message(ids[0]).unwrap().text, "msg 0");
    }

    #[test]
    fn current_broadcast_previews_text() {
        let mut core = MeshCore::default();
        assert!(core.current_broadcast().is_none());
        let long = "a".repeat(80);
        let (id, _) = core.broadcast_message(&long).unwrap();
        let info = core.current_broadcast().unwrap();
        assert_eq!(info.message_id, id);
        assert_eq!(info.preview, format!("{}...", "a".repeat(60)));
    }

    #[test]
    fn reset_clears_everything() {
        let mut core = MeshCore::default();
        core.broadcast_message("one").unwrap();
        core.on_frame_received(&[3, 2, 1, b'x', 0, 0, 0, 0, 0], false);
        core.reset();
        assert!(!core.has_queued_work());
        assert_eq!(core.messages().count(), 0);
        assert!(core.next_frame().is_none());
    }
}
