//! Radio stand-in: UDP multicast on the LAN. Advertising repeats the current frame until replaced or
//! stopped; scanning pushes every tagged datagram to the node.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);

/// Datagram prefix identifying hopcast traffic (the service UUID's leading bytes).
pub const SERVICE_TAG: [u8; 4] = [0xf1, 0xd0, 0xc0, 0x01];

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("radio not initialized")]
    NotReady,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sends one frame at a time. A new `advertise` replaces the previous frame.
#[async_trait]
pub trait Advertiser: Send + Sync + 'static {
    async fn advertise(&self, frame: &[u8]) -> Result<(), RadioError>;
    /// Clear the active advertisement.
    async fn stop(&self) -> Result<(), RadioError>;
}

/// Full radio: advertising plus scanning and reinitialization.
#[async_trait]
pub trait Radio: Advertiser {
    /// Start delivering received frames to `tx`. Replaces any earlier scan.
    async fn start_scan(&self, tx: mpsc::Sender<Vec<u8>>) -> Result<(), RadioError>;
    async fn stop_scan(&self);
    /// Release advertising and scanning state and bring the radio back up.
    async fn reinitialize(&self) -> Result<(), RadioError>;
}

/// Prefix a frame with the service tag.
pub fn wrap(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SERVICE_TAG.len() + frame.len());
    out.extend_from_slice(&SERVICE_TAG);
    out.extend_from_slice(frame);
    out
}

/// Strip the service tag; `None` for foreign datagrams.
pub fn unwrap_datagram(datagram: &[u8]) -> Option<&[u8]> {
    datagram.strip_prefix(&SERVICE_TAG[..])
}

struct Live {
    socket: Arc<UdpSocket>,
    repeater: JoinHandle<()>,
}

pub struct UdpRadio {
    port: u16,
    advertise_interval: Duration,
    current: watch::Sender<Option<Vec<u8>>>,
    live: Mutex<Option<Live>>,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl UdpRadio {
    pub fn new(port: u16, advertise_interval: Duration) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            port,
            advertise_interval,
            current,
            live: Mutex::new(None),
            scan: Mutex::new(None),
        }
    }

    /// Bind the multicast socket and start the advertisement repeater.
    pub async fn open(&self) -> Result<(), RadioError> {
        let mut live = self.live.lock().await;
        if live.is_some() {
            return Ok(());
        }
        let socket = Arc::new(make_multicast_socket(self.port)?);
        let repeater = tokio::spawn(repeat_loop(
            socket.clone(),
            self.destination(),
            self.current.subscribe(),
            self.advertise_interval,
        ));
        *live = Some(Live { socket, repeater });
        info!(port = self.port, group = %MULTICAST_GROUP, "radio up");
        Ok(())
    }

    /// Tear down both tasks and release the socket. The port is free when this returns.
    async fn close(&self) {
        self.stop_scan().await;
        self.current.send_replace(None);
        let live = self.live.lock().await.take();
        if let Some(Live { socket, repeater }) = live {
            cancel(repeater).await;
            drop(socket);
        }
    }

    async fn socket(&self) -> Result<Arc<UdpSocket>, RadioError> {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|l| l.socket.clone())
            .ok_or(RadioError::NotReady)
    }

    fn destination(&self) -> SocketAddr {
        SocketAddr::from((MULTICAST_GROUP, self.port))
    }
}

#[async_trait]
impl Advertiser for UdpRadio {
    async fn advertise(&self, frame: &[u8]) -> Result<(), RadioError> {
        let socket = self.socket().await?;
        let datagram = wrap(frame);
        socket.send_to(&datagram, self.destination()).await?;
        self.current.send_replace(Some(datagram));
        Ok(())
    }

    async fn stop(&self) -> Result<(), RadioError> {
        self.current.send_replace(None);
        Ok(())
    }
}

#[async_trait]
impl Radio for UdpRadio {
    async fn start_scan(&self, tx: mpsc::Sender<Vec<u8>>) -> Result<(), RadioError> {
        let socket = self.socket().await?;
        let mut scan = self.scan.lock().await;
        if let Some(old) = scan.take() {
            cancel(old).await;
        }
        *scan = Some(tokio::spawn(recv_loop(socket, tx)));
        Ok(())
    }

    async fn stop_scan(&self) {
        let task = self.scan.lock().await.take();
        if let Some(task) = task {
            cancel(task).await;
        }
    }

    async fn reinitialize(&self) -> Result<(), RadioError> {
        self.close().await;
        self.open().await
    }
}

/// Abort a task and wait until it has dropped everything it held.
async fn cancel(task: JoinHandle<()>) {
    task.abort();
    let _ = task.await;
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Resend the active advertisement every `interval` until it is cleared.
async fn repeat_loop(
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    mut current: watch::Receiver<Option<Vec<u8>>>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = current.changed() => {
                if changed.is_err() {
                    return;
                }
                // `advertise` already sent the new frame once.
                continue;
            }
        }
        let datagram = current.borrow().clone();
        if let Some(d) = datagram {
            if let Err(e) = socket.send_to(&d, dest).await {
                trace!(error = %e, "advertisement repeat failed");
            }
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 2048];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let Some(frame) = unwrap_datagram(&buf[..n]) else {
                    trace!(%from, len = n, "ignoring untagged datagram");
                    continue;
                };
                if tx.send(frame.to_vec()).await.is_err() {
                    debug!("scan receiver dropped, stopping scan");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "radio receive failed, stopping scan");
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory radio for node and broadcast loop tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    pub struct FakeRadio {
        advertised: std::sync::Mutex<Vec<Vec<u8>>>,
        scan_tx: std::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
        failing: AtomicBool,
        reinit_fails: AtomicBool,
        pub stops: AtomicUsize,
        pub reinits: AtomicUsize,
    }

    impl FakeRadio {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every frame handed to `advertise`, including failed ones.
        pub fn advertised(&self) -> Vec<Vec<u8>> {
            self.advertised.lock().unwrap().clone()
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn set_reinit_failing(&self, failing: bool) {
            self.reinit_fails.store(failing, Ordering::SeqCst);
        }

        pub fn is_scanning(&self) -> bool {
            self.scan_tx.lock().unwrap().is_some()
        }

        /// Deliver a frame as if heard over the air.
        pub async fn inject(&self, frame: &[u8]) {
            let tx = self.scan_tx.lock().unwrap().clone();
            if let Some(tx) = tx {
                tx.send(frame.to_vec()).await.unwrap();
            }
        }
    }

    #[async_trait]
    impl Advertiser for FakeRadio {
        async fn advertise(&self, frame: &[u8]) -> Result<(), RadioError> {
            self.advertised.lock().unwrap().push(frame.to_vec());
            if self.failing.load(Ordering::SeqCst) {
                return Err(RadioError::NotReady);
            }
            Ok(())
        }

        async fn stop(&self) -> Result<(), RadioError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Radio for FakeRadio {
        async fn start_scan(&self, tx: mpsc::Sender<Vec<u8>>) -> Result<(), RadioError> {
            *self.scan_tx.lock().unwrap() = Some(tx);
            Ok(())
        }

        async fn stop_scan(&self) {
            self.scan_tx.lock().unwrap().take();
        }

        async fn reinitialize(&self) -> Result<(), RadioError> {
            self.reinits.fetch_add(1, Ordering::SeqCst);
            if self.reinit_fails.load(Ordering::SeqCst) {
                return Err(RadioError::NotReady);
            }
            Ok(())
        }
    }
}
