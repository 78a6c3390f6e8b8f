//! Per-client state machine over one control-plane TCP connection.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, CommandSelection, Frame};
use crate::error::{ErrorCode, TransportError};
use crate::registry::ClientRegistry;

/// Control Session state, per §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHelo,
    Ready,
    Closed,
}

/// Parameters a Control Session needs to emit `STRM Start`, fixed for the
/// lifetime of the server.
#[derive(Debug, Clone, Copy)]
pub struct ControlSessionConfig {
    pub stream_port: u16,
    /// The single capture sampling rate every client is negotiated against
    /// (§1: resampling across client rates is a non-goal), in Hz.
    pub sampling_rate: u32,
    /// The wire-encoded ASCII byte for `sampling_rate` (§4.3's mapping table).
    pub sample_rate_byte: u8,
}

/// Drives one accepted control-plane connection through the `AwaitingHelo` →
/// `Ready` → `Closed` state machine.
///
/// Invariants upheld: exactly one `STRM Start` is emitted (on the `HELO`
/// transition), and `STRM Stop` is emitted at most once, only if `Start` was
/// already emitted (enforced by `started`/`stopped` below, not by `state`
/// alone, so a caller invoking `shutdown` twice is harmless).
pub struct ControlSession {
    stream: TcpStream,
    state: State,
    client_id: Option<String>,
    config: ControlSessionConfig,
    registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
    started: bool,
    stopped: bool,
    read_buf: BytesMut,
}

impl ControlSession {
    /// `shutdown` is a token shared across every live Control Session; the
    /// server cancels it once, during the shutdown sequence (§5 step 3), to
    /// make every session emit `STRM Stop` and close.
    pub fn new(
        stream: TcpStream,
        config: ControlSessionConfig,
        registry: Arc<ClientRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stream,
            state: State::AwaitingHelo,
            client_id: None,
            config,
            registry,
            shutdown,
            started: false,
            stopped: false,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Runs the session until the client disconnects, the connection errors,
    /// or `shutdown` is cancelled. Always attempts `shutdown()` before
    /// returning.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let result = self.drive().await;
        let _ = self.shutdown().await;
        result
    }

    async fn drive(&mut self) -> Result<(), TransportError> {
        loop {
            while let Some(frame) = self.try_decode_next()? {
                self.handle_frame(frame).await?;
            }

            let mut chunk = [0u8; 1024];
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                read = self.stream.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(()); // TCP EOF
                    }
                    self.read_buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }

    fn try_decode_next(&mut self) -> Result<Option<Frame>, TransportError> {
        match codec::decode(&mut self.read_buf) {
            Ok(frame) => Ok(Some(frame)),
            Err(crate::error::ProtocolDecodeError::Incomplete { .. }) => Ok(None),
            Err(err) => {
                log::warn!("discarding control frame [{}]: {err}", err.code());
                // Drop the buffered bytes; a single malformed frame closes
                // only this session, not others, per the propagation policy.
                self.read_buf.clear();
                Err(TransportError::Closed)
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        match (self.state, frame) {
            (State::AwaitingHelo, Frame::Helo { client_id }) => {
                self.client_id = Some(client_id.clone());
                self.registry
                    .mark_ready(client_id.clone(), self.config.sampling_rate);
                self.state = State::Ready;
                self.emit_start(&client_id).await?;
            }
            (State::AwaitingHelo, other) => {
                log::debug!("ignoring {other:?} before HELO");
            }
            (State::Ready, Frame::Stat { .. }) => {
                log::debug!("STAT from {:?}", self.client_id);
            }
            (State::Ready, Frame::Resp { .. }) => {
                log::debug!("RESP from {:?}", self.client_id);
            }
            (State::Ready, Frame::Helo { .. }) => {
                log::debug!("ignoring duplicate HELO in Ready state");
            }
            (State::Closed, _) => {}
        }
        Ok(())
    }

    async fn emit_start(&mut self, client_id: &str) -> Result<(), TransportError> {
        debug_assert!(!self.started, "STRM Start must be emitted at most once");
        let frame = codec::encode_strm(
            CommandSelection::Start,
            self.config.stream_port,
            self.config.sample_rate_byte,
            Some(client_id),
        );
        self.stream.write_all(&frame).await?;
        self.started = true;
        Ok(())
    }

    /// Emits `STRM Stop` (if and only if `Start` was already emitted) and
    /// half-closes the connection. Safe to call more than once.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        if self.state == State::Closed {
            return Ok(());
        }

        if self.started && !self.stopped {
            let frame = codec::encode_strm(CommandSelection::Stop, 0, self.config.sample_rate_byte, None);
            if let Err(err) = self.stream.write_all(&frame).await {
                log::warn!("failed to send STRM Stop: {err}");
            }
            self.stopped = true;
        }

        if let Some(client_id) = &self.client_id {
            self.registry.unmark_ready(client_id);
        }

        self.state = State::Closed;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControlSessionConfig {
        ControlSessionConfig {
            stream_port: 9000,
            sampling_rate: 48000,
            sample_rate_byte: b'4',
        }
    }

    fn helo_frame(mac: [u8; 6]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 8]); // declared length: device(1)+rev(1)+mac(6)
        buf.extend_from_slice(b"HELO");
        buf.extend_from_slice(&[0, 1]); // device id, firmware revision
        buf.extend_from_slice(&mac);
        buf
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (server, (client, _)) = tokio::join!(connect, listener.accept());
        (server.unwrap(), client)
    }

    #[tokio::test]
    async fn helo_transitions_to_ready_marks_registry_and_emits_single_strm_start() {
        let (server_side, mut client_side) = connected_pair().await;
        let registry = Arc::new(ClientRegistry::new());
        let session = ControlSession::new(
            server_side,
            config(),
            Arc::clone(&registry),
            CancellationToken::new(),
        );

        client_side
            .write_all(&helo_frame([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]))
            .await
            .unwrap();
        client_side.shutdown().await.unwrap();

        session.run().await.unwrap();

        assert_eq!(registry.sampling_rate_for("AA:BB:CC:DD:EE:FF"), None); // unregistered on session close

        let mut response = Vec::new();
        client_side.read_to_end(&mut response).await.unwrap();
        let declared_len = u16::from_be_bytes([response[0], response[1]]) as usize;
        assert_eq!(&response[2..6], b"strm");
        assert_eq!(response[6], b's'); // Start
        assert_eq!(response.len(), 2 + declared_len);
    }

    #[tokio::test]
    async fn unknown_frame_before_helo_is_ignored_and_session_stays_awaiting() {
        let (server_side, mut client_side) = connected_pair().await;
        let registry = Arc::new(ClientRegistry::new());
        let mut session = ControlSession::new(
            server_side,
            config(),
            Arc::clone(&registry),
            CancellationToken::new(),
        );

        let mut stat = BytesMut::new();
        stat.extend_from_slice(&[0, 3]);
        stat.extend_from_slice(b"STAT");
        stat.extend_from_slice(b"abc");
        client_side.write_all(&stat).await.unwrap();

        // Drive one decode cycle manually: read what's buffered, then decode.
        let mut tmp = [0u8; 64];
        let n = session.stream.read(&mut tmp).await.unwrap();
        session.read_buf.extend_from_slice(&tmp[..n]);
        let frame = session.try_decode_next().unwrap();
        assert!(matches!(frame, Some(Frame::Stat { .. })));
        session.handle_frame(frame.unwrap()).await.unwrap();

        assert_eq!(session.state, State::AwaitingHelo);
        assert!(session.client_id().is_none());
    }

    #[tokio::test]
    async fn shutdown_token_emits_strm_stop_only_after_start_was_sent() {
        let (server_side, mut client_side) = connected_pair().await;
        let registry = Arc::new(ClientRegistry::new());
        let shutdown = CancellationToken::new();
        let session = ControlSession::new(server_side, config(), registry, shutdown.clone());

        client_side
            .write_all(&helo_frame([1, 2, 3, 4, 5, 6]))
            .await
            .unwrap();

        let handle = tokio::spawn(session.run());
        // Give the session a moment to process HELO and emit Start.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let mut response = Vec::new();
        client_side.read_to_end(&mut response).await.unwrap();

        // Two frames on the wire: STRM Start, then STRM Stop.
        let first_len = u16::from_be_bytes([response[0], response[1]]) as usize;
        let second_start = 2 + first_len;
        assert_eq!(&response[2..6], b"strm");
        assert_eq!(response[6], b's');

        let second_declared_len = u16::from_be_bytes([response[second_start], response[second_start + 1]]) as usize;
        assert_eq!(second_declared_len, crate::protocol_constants::STRM_FIXED_PAYLOAD_SIZE); // STRM Stop has no http header
        assert_eq!(&response[second_start + 2..second_start + 6], b"strm");
        assert_eq!(response[second_start + 6], b'q'); // Stop
    }
}
