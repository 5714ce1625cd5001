// hopcast Linux daemon: multicast radio, paced broadcast loop, optional HTTP gateway.

mod broadcast;
mod config;
mod gateway;
mod node;
mod radio;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hop_core::MeshEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::gateway::{HttpGateway, NoGateway, Responder};
use crate::node::MeshNode;
use crate::radio::UdpRadio;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LOG_FILTER: &str = "hop_linux=info,hop_core=info";

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("hop-linux {}", VERSION);
            return Ok(());
        }
    }

    init_tracing();
    let cfg = config::load();
    info!(
        port = cfg.radio_port,
        body_len = cfg.mesh.body_len,
        gateway = cfg.gateway_url.as_deref().unwrap_or("none"),
        "starting hop-linux {}",
        VERSION
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let radio = Arc::new(UdpRadio::new(
        cfg.radio_port,
        cfg.pacing.advertise_interval(),
    ));
    radio
        .open()
        .await
        .with_context(|| format!("open radio on port {}", cfg.radio_port))?;

    let responder: Arc<dyn Responder> = match &cfg.gateway_url {
        Some(url) => {
            let gw = Arc::new(HttpGateway::new(
                url.as_str(),
                Duration::from_secs(cfg.gateway_timeout_secs),
            )?);
            info!(url = gw.url(), "gateway responder enabled");
            tokio::spawn(
                gw.clone()
                    .run_probe_loop(Duration::from_secs(cfg.gateway_probe_interval_secs)),
            );
            gw
        }
        None => Arc::new(NoGateway),
    };

    let (node, mut events) = MeshNode::new(cfg.mesh, cfg.pacing, radio, responder);
    node.start().await.context("start scanning")?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let input_node = node.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end();
            match line {
                "" => {}
                "/reset" => {
                    if let Err(e) = input_node.reset().await {
                        warn!(error = %e, "reset failed");
                    }
                }
                "/status" => {
                    let looping = input_node.is_broadcasting().await;
                    let core = input_node.core().lock().await;
                    match core.current_broadcast() {
                        Some(b) => println!("on air: #{} {}", b.message_id, b.preview),
                        None => println!("on air: nothing"),
                    }
                    println!("queued: {:?} (loop running: {looping})", core.queued());
                    println!(
                        "known messages: {}, body {} bytes, max message {} bytes, {} cycles each",
                        core.message_count(),
                        core.codec().body_len(),
                        core.codec().max_message_len(),
                        core.config().max_broadcast_cycles
                    );
                }
                text => match input_node.broadcast(text).await {
                    Ok(id) => println!("queued #{id}"),
                    Err(e) => warn!(error = %e, "cannot broadcast"),
                },
            }
        }
    });

    shutdown_signal().await?;
    info!("shutting down");
    node.shutdown().await;
    Ok(())
}

fn print_event(event: &MeshEvent) {
    match event {
        MeshEvent::MessageComplete {
            message_id,
            text,
            is_response,
        } => {
            let kind = if *is_response { "response" } else { "request" };
            println!("{kind} #{message_id}: {text}");
        }
        MeshEvent::ProgressChanged {
            message_id,
            progress,
        } => {
            tracing::debug!(id = message_id, percent = progress.percent, "progress");
        }
        MeshEvent::BroadcastFinished { message_id, cycles } => {
            println!("done broadcasting #{message_id} after {cycles} cycles");
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
