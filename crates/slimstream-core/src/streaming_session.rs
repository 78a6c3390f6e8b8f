//! The per-client HTTP response that emits a WAVE header followed by PCM
//! chunks at the negotiated rate (§4.5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::dispatcher::{ChunkSink, SessionRegistry};
use crate::error::TransportError;
use crate::pcm::PcmParameters;
use crate::protocol_constants::SERVER_NAME;
use crate::registry::{parse_client_id, ClientRegistry};
use crate::stream::wav::create_wav_header;

/// Longest request line this acceptor will buffer before giving up. Generous
/// enough for any real `GET /stream.pcm?player=<clientID> HTTP/1.1` line.
const MAX_REQUEST_LINE_BYTES: usize = 2048;

/// Capacity of the bounded channel bridging the Dispatcher thread into this
/// session's async write task (§5's per-session decoupling option). A slow
/// client fills its own channel and starves itself without blocking the
/// Dispatcher or any other session.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// A live `GET /stream.pcm?player=<clientID>` connection bound to one
/// sampling rate, registered with the [`SessionRegistry`] for as long as its
/// write task is running.
pub struct StreamingSession {
    client_id: String,
    sampling_rate: u32,
    tx: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
    log_rate_mismatch: bool,
}

impl ChunkSink for StreamingSession {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn on_chunk(&self, data: &[u8], sampling_rate: u32) {
        if sampling_rate != self.sampling_rate {
            if self.log_rate_mismatch {
                log::warn!(
                    "dropping chunk for client {}: capture rate {} != negotiated rate {}",
                    self.client_id,
                    sampling_rate,
                    self.sampling_rate
                );
            }
            return;
        }

        match self.tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The session's own socket/channel is the backpressure point
                // (§4.5): a slow client starves itself, it never stalls the
                // Capture Source or the Dispatcher.
                log::debug!("streaming session {} is backed up, dropping chunk", self.client_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Accepts one HTTP streaming connection: reads the request line, resolves
/// `clientID` against `client_registry`, and - if a matching `Ready` Control
/// Session exists - writes the response head and WAVE header, registers
/// itself with `session_registry`, then drives the write loop until the
/// connection closes or errors.
///
/// If no `Ready` client matches (E2E-3: HTTP arrives before `HELO`), replies
/// `404` and returns without creating a session.
pub async fn accept_streaming_connection(
    mut stream: TcpStream,
    client_registry: &ClientRegistry,
    session_registry: &Arc<SessionRegistry>,
    pcm: &PcmParameters,
    log_rate_mismatch: bool,
) -> Result<(), TransportError> {
    let request_line = read_request_line(&mut stream).await?;
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();
    let client_id = parse_client_id(&path);

    let Some(sampling_rate) = client_registry.sampling_rate_for(&client_id) else {
        log::warn!("streaming request for unknown/not-ready client {client_id:?}");
        stream.write_all(not_found_response().as_bytes()).await?;
        let _ = stream.shutdown().await;
        return Ok(());
    };

    stream.write_all(response_head().as_bytes()).await?;
    let wav_header = create_wav_header(pcm.sampling_rate(), pcm.payload_channels(), pcm.bit_depth());
    stream.write_all(&wav_header).await?;

    let (tx, mut rx) = mpsc::channel::<Bytes>(DEFAULT_CHANNEL_CAPACITY);
    let closed = Arc::new(AtomicBool::new(false));
    let session = Arc::new(StreamingSession {
        client_id: client_id.clone(),
        sampling_rate,
        tx,
        closed: Arc::clone(&closed),
        log_rate_mismatch,
    });

    session_registry.register(session);
    log::info!("streaming session started for client {client_id} at {sampling_rate} Hz");

    let result = loop {
        match rx.recv().await {
            Some(bytes) => {
                if let Err(err) = stream.write_all(&bytes).await {
                    break Err(TransportError::Io(err));
                }
            }
            None => break Ok(()),
        }
    };

    closed.store(true, Ordering::Release);
    session_registry.unregister(&client_id);
    let _ = stream.shutdown().await;
    log::info!("streaming session ended for client {client_id}");
    result
}

/// Reads bytes off `stream` until a full request line (`...\r\n`) is
/// buffered. Any header lines that follow are left unread: this acceptor
/// only needs the request line, and the connection becomes write-only for
/// the caller once the response head is sent.
async fn read_request_line(stream: &mut TcpStream) -> Result<String, TransportError> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n") {
            buf.truncate(buf.len() - 2);
            break;
        }
        if buf.len() > MAX_REQUEST_LINE_BYTES {
            return Err(TransportError::Closed);
        }
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn response_head() -> String {
    format!(
        "HTTP/1.1 200 OK\r\nServer: {SERVER_NAME} ({})\r\nConnection: close\r\nContent-Type: audio/x-wave\r\n\r\n",
        env!("CARGO_PKG_VERSION")
    )
}

fn not_found_response() -> String {
    "HTTP/1.1 404 Not Found\r\nConnection: close\r\nContent-Length: 0\r\n\r\n".to_string()
}
