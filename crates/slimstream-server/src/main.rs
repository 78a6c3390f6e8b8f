//! SlimStreamer Server - standalone headless server speaking SlimProto to
//! legacy Squeezebox-family playback clients.
//!
//! Wires together the capture-agnostic pieces in `slimstream-core` with a
//! concrete `slimstream-capture` device and plain TCP acceptors, following
//! the shutdown order and component layout of §4-5 of the design this crate
//! implements.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use slimstream_capture::CpalCaptureDevice;
use slimstream_core::{
    accept_streaming_connection, CaptureSource, ChunkQueue, ClientRegistry, ControlSession,
    ControlSessionConfig, Dispatcher, ErrorCode, SessionRegistry,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// SlimStreamer - headless SlimProto capture-and-distribute server.
#[derive(Parser, Debug)]
#[command(name = "slimstreamd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SLIMSTREAM_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Control-plane TCP port (overrides config file).
    #[arg(long, env = "SLIMSTREAM_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Streaming-plane TCP port (overrides config file).
    #[arg(long, env = "SLIMSTREAM_STREAM_PORT")]
    stream_port: Option<u16>,

    /// Capture device name (overrides config file).
    #[arg(long, env = "SLIMSTREAM_DEVICE")]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("SlimStreamer v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    if let Some(port) = args.stream_port {
        config.stream_port = port;
    }
    if let Some(device) = args.device {
        config.device = device;
    }

    let pcm = config.pcm_parameters().context("invalid capture configuration")?;
    let sample_rate_byte = config.sample_rate_byte();

    log::info!(
        "Configuration: device={:?}, sampling_rate={}, control_port={}, stream_port={}",
        config.device,
        config.sampling_rate,
        config.control_port,
        config.stream_port,
    );

    let queue = Arc::new(ChunkQueue::new(config.queue_capacity, pcm.chunk_capacity_bytes()));
    let client_registry = Arc::new(ClientRegistry::new());
    let session_registry = Arc::new(SessionRegistry::new());
    let shutdown = CancellationToken::new();

    let device = CpalCaptureDevice::new(pcm.clone());
    let capture_source = Arc::new(CaptureSource::new(device, pcm.clone(), Arc::clone(&queue)));
    capture_source.open().context("failed to open capture device")?;

    let dispatcher = Dispatcher::new(Arc::clone(&queue), Arc::clone(&session_registry));
    let dispatcher_stop = dispatcher.stop_handle();

    // Capture Source: real-time thread, never async (§4.1).
    let capture_thread = {
        let capture_source = Arc::clone(&capture_source);
        thread::Builder::new()
            .name("slimstream-capture".into())
            .spawn(move || {
                if let Err(err) = capture_source.start(|| {
                    log::warn!("chunk queue overflow: dropping frames");
                }) {
                    log::error!("capture source terminated [{}]: {err}", err.code());
                }
            })
            .context("failed to spawn capture thread")?
    };

    // Dispatcher: single consumer of the Chunk Queue, also never async (§4.6).
    let dispatcher_thread = thread::Builder::new()
        .name("slimstream-dispatcher".into())
        .spawn(move || dispatcher.run())
        .context("failed to spawn dispatcher thread")?;

    let control_listener = TcpListener::bind(("0.0.0.0", config.control_port))
        .await
        .with_context(|| format!("failed to bind control port {}", config.control_port))?;
    log::info!("control plane listening on {}", config.control_port);

    let stream_listener = TcpListener::bind(("0.0.0.0", config.stream_port))
        .await
        .with_context(|| format!("failed to bind stream port {}", config.stream_port))?;
    log::info!("streaming plane listening on {}", config.stream_port);

    let control_task = tokio::spawn(run_control_acceptor(
        control_listener,
        ControlSessionConfig {
            stream_port: config.stream_port,
            sampling_rate: config.sampling_rate,
            sample_rate_byte,
        },
        Arc::clone(&client_registry),
        shutdown.clone(),
    ));

    let streaming_task = tokio::spawn(run_streaming_acceptor(
        stream_listener,
        Arc::clone(&client_registry),
        Arc::clone(&session_registry),
        pcm,
        config.log_rate_mismatch,
        shutdown.clone(),
    ));

    shutdown_signal().await;
    log::info!("shutdown signal received, stopping");

    // §5 shutdown order.
    // 1. Stop the Capture Source.
    capture_source.stop_handle().stop(true).ok();
    if let Err(err) = capture_thread.join() {
        log::error!("capture thread panicked: {err:?}");
    }

    // 2. Drain the Dispatcher until empty, then stop it.
    dispatcher_stop.stop();
    if let Err(err) = dispatcher_thread.join() {
        log::error!("dispatcher thread panicked: {err:?}");
    }

    // 3 & 4. Cancel the shared token: every live Control Session emits
    // `STRM Stop` and closes; every Streaming Session's acceptor loop and
    // connections wind down.
    shutdown.cancel();
    let _ = control_task.await;
    let _ = streaming_task.await;

    log::info!("shutdown complete");
    Ok(())
}

async fn run_control_acceptor(
    listener: TcpListener,
    session_config: ControlSessionConfig,
    client_registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("control accept failed: {err}");
                        continue;
                    }
                };
                log::debug!("control connection from {addr}");

                let session = ControlSession::new(
                    stream,
                    session_config,
                    Arc::clone(&client_registry),
                    shutdown.child_token(),
                );
                tokio::spawn(async move {
                    if let Err(err) = session.run().await {
                        log::warn!("control session ended: {err}");
                    }
                });
            }
        }
    }
}

async fn run_streaming_acceptor(
    listener: TcpListener,
    client_registry: Arc<ClientRegistry>,
    session_registry: Arc<SessionRegistry>,
    pcm: slimstream_core::PcmParameters,
    log_rate_mismatch: bool,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("streaming accept failed: {err}");
                        continue;
                    }
                };
                log::debug!("streaming connection from {addr}");

                let client_registry = Arc::clone(&client_registry);
                let session_registry = Arc::clone(&session_registry);
                let pcm = pcm.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        accept_streaming_connection(stream, &client_registry, &session_registry, &pcm, log_rate_mismatch)
                            .await
                    {
                        log::warn!("streaming session ended: {err}");
                    }
                });
            }
        }
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
