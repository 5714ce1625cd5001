//! Wires the core to the radio, the broadcast loop and the response producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hop_core::{Action, EncodeError, MeshConfig, MeshCore, MeshEvent, MessageId};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::Pacing;
use crate::gateway::Responder;
use crate::radio::{Radio, RadioError};

/// Frames buffered between the radio and the core.
const INBOUND_CAPACITY: usize = 256;

pub struct MeshNode {
    core: Arc<Mutex<MeshCore>>,
    radio: Arc<dyn Radio>,
    responder: Arc<dyn Responder>,
    broadcaster: Broadcaster<dyn Radio>,
    events: mpsc::UnboundedSender<MeshEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on reset so responses to cleared requests are dropped.
    generation: AtomicU64,
}

impl MeshNode {
    pub fn new(
        config: MeshConfig,
        pacing: Pacing,
        radio: Arc<dyn Radio>,
        responder: Arc<dyn Responder>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MeshEvent>) {
        let core = Arc::new(Mutex::new(MeshCore::new(config)));
        let (events, events_rx) = mpsc::unbounded_channel();
        let broadcaster = Broadcaster::new(core.clone(), radio.clone(), pacing, events.clone());
        let node = Arc::new(Self {
            core,
            radio,
            responder,
            broadcaster,
            events,
            listener: Mutex::new(None),
            generation: AtomicU64::new(0),
        });
        (node, events_rx)
    }

    /// Start scanning and feeding received frames to the core.
    pub async fn start(self: &Arc<Self>) -> Result<(), RadioError> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(INBOUND_CAPACITY);
        self.radio.start_scan(tx).await?;
        let node = self.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                node.on_frame(&frame).await;
            }
            debug!("inbound listener exited");
        });
        if let Some(old) = self.listener.lock().await.replace(task) {
            old.abort();
        }
        Ok(())
    }

    /// Broadcast a new request from this device.
    pub async fn broadcast(self: &Arc<Self>, text: &str) -> Result<MessageId, EncodeError> {
        let (id, actions) = self.core.lock().await.broadcast_message(text)?;
        self.execute(actions).await;
        Ok(id)
    }

    /// Stop broadcasting, reinitialize the radio, forget every message and listen again.
    /// State is cleared and listening restarted even when the radio fails to come back;
    /// that error is returned afterwards.
    pub async fn reset(self: &Arc<Self>) -> Result<(), RadioError> {
        info!("resetting node");
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.broadcaster.shutdown().await;
        self.stop_listener().await;
        let reinit = self.radio.reinitialize().await;
        if let Err(e) = &reinit {
            warn!(error = %e, "radio reinitialize failed");
        }
        self.core.lock().await.reset();
        let started = self.start().await;
        reinit.and(started)
    }

    pub async fn shutdown(&self) {
        self.broadcaster.shutdown().await;
        self.stop_listener().await;
    }

    pub async fn is_broadcasting(&self) -> bool {
        self.broadcaster.is_running().await
    }

    pub fn core(&self) -> &Arc<Mutex<MeshCore>> {
        &self.core
    }

    async fn stop_listener(&self) {
        self.radio.stop_scan().await;
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
        }
    }

    async fn on_frame(self: &Arc<Self>, frame: &[u8]) {
        let can_respond = self.responder.has_response_capability();
        let actions = self.core.lock().await.on_frame_received(frame, can_respond);
        self.execute(actions).await;
    }

    async fn execute(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Notify(event) => {
                    let _ = self.events.send(event);
                }
                Action::StartBroadcasting => self.broadcaster.ensure_running().await,
                Action::ProduceResponse {
                    message_id,
                    request,
                } => {
                    let node = self.clone();
                    let generation = self.generation.load(Ordering::SeqCst);
                    tokio::spawn(async move {
                        node.respond(generation, message_id, request).await;
                    });
                }
            }
        }
    }

    async fn respond(&self, generation: u64, message_id: MessageId, request: String) {
        let response = match self.responder.produce_response(&request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(id = message_id, error = %e, "response producer failed, dropping request");
                return;
            }
        };
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(id = message_id, "node reset while responding, dropping response");
            return;
        }
        let queued = self
            .core
            .lock()
            .await
            .on_response_produced(message_id, &response);
        match queued {
            Ok(_) => self.broadcaster.ensure_running().await,
            Err(e) => warn!(id = message_id, error = %e, "cannot broadcast response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use hop_core::{decode_frame, Codec, Direction};

    use super::*;
    use crate::gateway::fake::FakeResponder;
    use crate::radio::fake::FakeRadio;

    const SETTLE: Duration = Duration::from_secs(30);

    fn node_with(
        responder: FakeResponder,
    ) -> (
        Arc<MeshNode>,
        Arc<FakeRadio>,
        Arc<FakeResponder>,
        mpsc::UnboundedReceiver<MeshEvent>,
    ) {
        let radio = Arc::new(FakeRadio::new());
        let responder = Arc::new(responder);
        let (node, events) = MeshNode::new(
            MeshConfig {
                body_len: 6,
                max_broadcast_cycles: 2,
            },
            Pacing::default(),
            radio.clone(),
            responder.clone(),
        );
        (node, radio, responder, events)
    }

    fn request_frames(id: MessageId, text: &str) -> Vec<Vec<u8>> {
        Codec::default()
            .encode(text, Some(id), false)
            .unwrap()
            .into_iter()
            .map(|f| f.into_bytes())
            .collect()
    }

    fn completed(events: &mut mpsc::UnboundedReceiver<MeshEvent>) -> Vec<(MessageId, String, bool)> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let MeshEvent::MessageComplete {
                message_id,
                text,
                is_response,
            } = ev
            {
                out.push((message_id, text, is_response));
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_answers_with_response_frames() {
        let (node, radio, responder, mut events) = node_with(FakeResponder::answering("{\"ok\":1}"));
        node.start().await.unwrap();
        for f in request_frames(42, "{\"type\":\"pay\"}") {
            radio.inject(&f).await;
        }
        tokio::time::sleep(SETTLE).await;

        assert_eq!(responder.requests(), vec!["{\"type\":\"pay\"}".to_string()]);
        assert_eq!(completed(&mut events), vec![(42, "{\"type\":\"pay\"}".into(), false)]);
        let sent = radio.advertised();
        assert!(!sent.is_empty());
        let mut body = Vec::new();
        for f in &sent[..2] {
            let d = decode_frame(f).unwrap();
            assert_eq!(d.message_id, 42);
            assert!(d.is_response);
            body.extend_from_slice(d.trimmed_body());
        }
        assert_eq!(body, b"{\"ok\":1}");
        // Two fragments, two cycles.
        assert_eq!(sent.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_node_relays_verbatim() {
        let (node, radio, responder, _events) = node_with(FakeResponder::offline());
        node.start().await.unwrap();
        let frames = request_frames(7, "send 5 to bob");
        for f in frames.iter().rev() {
            radio.inject(f).await;
        }
        tokio::time::sleep(SETTLE).await;

        assert!(responder.requests().is_empty());
        let sent = radio.advertised();
        assert_eq!(sent.len(), frames.len() * 2);
        assert_eq!(&sent[..frames.len()], &frames[..]);
        let core = node.core().lock().await;
        assert!(!core.has_queued_work());
        assert!(core.message(7).unwrap().complete);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_response_is_dropped() {
        let (node, radio, responder, _events) = node_with(FakeResponder::broken());
        node.start().await.unwrap();
        for f in request_frames(9, "ping") {
            radio.inject(&f).await;
        }
        tokio::time::sleep(SETTLE).await;
        assert_eq!(responder.requests().len(), 1);
        assert!(radio.advertised().is_empty());
        assert!(node.core().lock().await.message(9).unwrap().awaiting_response);
    }

    #[tokio::test(start_paused = true)]
    async fn own_broadcast_gets_answered() {
        let (node, radio, _responder, mut events) = node_with(FakeResponder::offline());
        node.start().await.unwrap();
        let id = node.broadcast("balance?").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!radio.advertised().is_empty());

        let response = Codec::default().encode("42 coins", Some(id), true).unwrap();
        for f in &response {
            radio.inject(f.as_bytes()).await;
        }
        tokio::time::sleep(SETTLE).await;
        assert!(completed(&mut events).contains(&(id, "42 coins".into(), true)));
        let core = node.core().lock().await;
        let entry = core.message(id).unwrap();
        assert!(entry.is_response);
        assert_eq!(entry.direction, Direction::Inbound);
        assert!(!core.has_queued_work());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_state_and_keeps_listening() {
        let (node, radio, _responder, mut events) = node_with(FakeResponder::offline());
        node.start().await.unwrap();
        node.broadcast("one two three four").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        node.reset().await.unwrap();
        assert_eq!(radio.reinits.load(Ordering::SeqCst), 1);
        assert!(radio.stops.load(Ordering::SeqCst) >= 1);
        let sent = radio.advertised().len();
        {
            let core = node.core().lock().await;
            assert!(!core.has_queued_work());
            assert_eq!(core.messages().count(), 0);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(radio.advertised().len(), sent);

        assert!(radio.is_scanning());
        radio.inject(&request_frames(3, "x")[0]).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(completed(&mut events).contains(&(3, "x".into(), false)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reinitialize_still_clears_and_listens() {
        let (node, radio, _responder, mut events) = node_with(FakeResponder::offline());
        node.start().await.unwrap();
        node.broadcast("one two three four").await.unwrap();
        radio.inject(&request_frames(11, "partial message")[0]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        radio.set_reinit_failing(true);
        assert!(matches!(node.reset().await, Err(RadioError::NotReady)));
        {
            let core = node.core().lock().await;
            assert!(!core.has_queued_work());
            assert_eq!(core.messages().count(), 0);
        }
        assert!(radio.is_scanning());
        let _ = completed(&mut events);
        radio.inject(&request_frames(4, "y")[0]).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(completed(&mut events).contains(&(4, "y".into(), false)));
        assert!(node.is_broadcasting().await);
    }
}
