//! Paced broadcast loop: one frame at a time from the core's queue to the radio.

use std::sync::Arc;

use hop_core::{Action, MeshCore, MeshEvent};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Pacing;
use crate::radio::Advertiser;

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Running {
    fn is_live(&self) -> bool {
        !*self.stop_tx.borrow() && !self.handle.is_finished()
    }
}

/// Owns the single broadcast loop task. At most one loop runs at a time.
pub struct Broadcaster<A: Advertiser + ?Sized> {
    core: Arc<Mutex<MeshCore>>,
    advertiser: Arc<A>,
    pacing: Pacing,
    events: mpsc::UnboundedSender<MeshEvent>,
    running: Mutex<Option<Running>>,
}

impl<A: Advertiser + ?Sized> Broadcaster<A> {
    pub fn new(
        core: Arc<Mutex<MeshCore>>,
        advertiser: Arc<A>,
        pacing: Pacing,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        Self {
            core,
            advertiser,
            pacing,
            events,
            running: Mutex::new(None),
        }
    }

    /// Start the loop unless it is already running. A loop that was told to stop is awaited first.
    pub async fn ensure_running(&self) {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            if r.is_live() {
                return;
            }
        }
        if let Some(old) = running.take() {
            let _ = old.stop_tx.send(true);
            let _ = old.handle.await;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.core.clone(),
            self.advertiser.clone(),
            self.pacing,
            self.events.clone(),
            stop_rx,
        ));
        debug!("broadcast loop started");
        *running = Some(Running { stop_tx, handle });
    }

    /// Ask the loop to exit after its current hand-off and clear the advertisement.
    pub async fn stop(&self) {
        if let Some(r) = self.running.lock().await.as_ref() {
            let _ = r.stop_tx.send(true);
        }
        if let Err(e) = self.advertiser.stop().await {
            warn!(error = %e, "failed to clear advertisement");
        }
    }

    /// Stop and wait for the loop task to finish.
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Some(r) = self.running.lock().await.take() {
            let _ = r.handle.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(Running::is_live)
    }
}

async fn run_loop<A: Advertiser + ?Sized>(
    core: Arc<Mutex<MeshCore>>,
    advertiser: Arc<A>,
    pacing: Pacing,
    events: mpsc::UnboundedSender<MeshEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut idle = false;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let next = core.lock().await.next_frame();
        let Some(scheduled) = next else {
            if !idle {
                idle = true;
                debug!("broadcast queue empty");
                if let Err(e) = advertiser.stop().await {
                    warn!(error = %e, "failed to clear advertisement");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(pacing.empty_queue_backoff()) => {}
                changed = stop_rx.changed() => {
                    // Sender gone: the broadcaster was dropped.
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };
        idle = false;

        let ok = match advertiser.advertise(scheduled.frame.as_bytes()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    id = scheduled.message_id,
                    fragment = scheduled.fragment + 1,
                    total = scheduled.total,
                    error = %e,
                    "advertise failed"
                );
                false
            }
        };
        tokio::time::sleep(pacing.post_broadcast_delay()).await;

        let actions = core.lock().await.on_frame_advertised(&scheduled, ok);
        for action in actions {
            match action {
                Action::Notify(event) => {
                    if let MeshEvent::BroadcastFinished { message_id, cycles } = &event {
                        info!(id = message_id, cycles, "broadcast finished");
                    }
                    let _ = events.send(event);
                }
                other => debug!(?other, "unexpected action from scheduler"),
            }
        }

        if *stop_rx.borrow() {
            break;
        }
        tokio::time::sleep(pacing.inter_chunk_delay()).await;
    }
    debug!("broadcast loop exited");
}
