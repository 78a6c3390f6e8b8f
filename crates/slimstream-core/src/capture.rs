//! The Capture Source: a blocking producer that reads interleaved PCM frames
//! from a hardware device, detects inline stream markers, strips the marker
//! channel, and enqueues chunks into the [`ChunkQueue`] without allocation on
//! the hot path.
//!
//! The hardware device itself is abstracted behind [`CaptureDevice`], whose
//! methods all take `&self`: real device APIs (ALSA, WASAPI, CoreAudio...)
//! support calling a stop/drain function from a thread other than the one
//! blocked in a read, which is exactly how `stop()` below unblocks
//! `start()`'s capture loop from another thread. Implementers own whatever
//! interior mutability their hardware binding needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chunk::ChunkQueue;
use crate::error::DeviceError;
use crate::markers::{StreamMarker, StreamingState};
use crate::pcm::PcmParameters;

/// The hardware capture device contract consumed by [`CaptureSource`].
///
/// Only `open`/`start` are called once, before the real-time loop begins.
/// `read_interleaved` is called in a tight loop by the capture thread and
/// must block until data is available or the stream is stopped/errors.
/// `recover`, `drain`, `drop_stream`, and `close` may be called from a
/// different thread than the one running the capture loop.
pub trait CaptureDevice: Send + Sync {
    /// Opens the device at the configured name/rate/format. Failing here is
    /// always fatal to startup.
    fn open(&self) -> Result<(), DeviceError>;

    /// Starts the underlying hardware stream so reads begin returning data.
    fn start(&self) -> Result<(), DeviceError>;

    /// Blocks until up to `max_frames` interleaved frames are available (or
    /// an error/stop occurs), writing them into `buf`. Returns the number of
    /// frames actually read.
    fn read_interleaved(&self, buf: &mut [u8], max_frames: usize) -> Result<usize, DeviceError>;

    /// Attempts to recover the stream after a read error. Returns `true` if
    /// the caller should retry the read, `false` if the error is terminal.
    fn recover(&self, err: &DeviceError) -> bool;

    /// Requests a graceful stop: let buffered frames drain, then unblock the
    /// next `read_interleaved` with [`DeviceError::Stopped`].
    fn drain(&self) -> Result<(), DeviceError>;

    /// Requests an immediate stop, discarding any buffered frames.
    fn drop_stream(&self) -> Result<(), DeviceError>;

    fn close(&self) -> Result<(), DeviceError>;
}

/// Drives one [`CaptureDevice`] through the real-time capture loop described
/// in §4.1: blocking reads, marker-based framing, marker-channel stripping,
/// and handoff into a [`ChunkQueue`].
pub struct CaptureSource<D: CaptureDevice> {
    device: Arc<D>,
    params: PcmParameters,
    queue: Arc<ChunkQueue>,
    producing: Arc<AtomicBool>,
}

impl<D: CaptureDevice> CaptureSource<D> {
    pub fn new(device: D, params: PcmParameters, queue: Arc<ChunkQueue>) -> Self {
        Self {
            device: Arc::new(device),
            params,
            queue,
            producing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn open(&self) -> Result<(), DeviceError> {
        self.device.open()
    }

    /// A cloneable handle that can signal `stop()` from another thread while
    /// `start()` blocks the capture thread.
    pub fn stop_handle(&self) -> CaptureStopHandle<D> {
        CaptureStopHandle {
            device: Arc::clone(&self.device),
            producing: Arc::clone(&self.producing),
        }
    }

    /// Runs the capture loop until `stop()` is called or an unrecoverable
    /// device error occurs. Blocks the calling thread; callers run this on a
    /// dedicated `std::thread`, never as an async task, since the only
    /// blocking call here is the device read itself.
    ///
    /// Everything inside the loop body (besides `on_overflow`) must stay
    /// real-time safe: no heap allocation, no locking, no logging.
    pub fn start(&self, mut on_overflow: impl FnMut()) -> Result<(), DeviceError> {
        self.device.start()?;

        let bytes_per_frame = self.params.bytes_per_frame();
        let payload_bytes_per_frame = self.params.payload_bytes_per_frame();
        let max_frames = self.params.frames_per_chunk();
        let sampling_rate = self.params.sampling_rate();

        // Allocated once, before the real-time loop starts; reused for every read.
        let mut src_buffer = vec![0u8; max_frames * bytes_per_frame];
        let mut state = StreamingState::Stopped;

        self.producing.store(true, Ordering::Release);

        while self.producing.load(Ordering::Acquire) {
            match self.device.read_interleaved(&mut src_buffer, max_frames) {
                Ok(frames) if frames > 0 => {
                    if let Some(offset) =
                        contains_data(&src_buffer[..frames * bytes_per_frame], bytes_per_frame, &mut state)
                    {
                        let from_offset = &src_buffer[offset * bytes_per_frame..frames * bytes_per_frame];
                        self.queue.enqueue(
                            |chunk| {
                                let written = copy_data(
                                    from_offset,
                                    chunk.buffer_mut(),
                                    bytes_per_frame,
                                    payload_bytes_per_frame,
                                    &mut state,
                                );
                                chunk.set_data_size(written * payload_bytes_per_frame);
                                chunk.set_sampling_rate(sampling_rate);
                                true
                            },
                            &mut on_overflow,
                        );
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if self.device.recover(&err) {
                        continue;
                    }
                    self.producing.store(false, Ordering::Release);
                    if matches!(err, DeviceError::Stopped) {
                        return Ok(());
                    }
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}

/// Cloneable stop signal for a [`CaptureSource`], usable from any thread.
#[derive(Clone)]
pub struct CaptureStopHandle<D> {
    device: Arc<D>,
    producing: Arc<AtomicBool>,
}

impl<D: CaptureDevice> CaptureStopHandle<D> {
    /// Signals the capture loop to exit and unblocks its current/next read.
    /// `graceful` drains buffered frames first; otherwise the stream drops
    /// immediately.
    pub fn stop(&self, graceful: bool) -> Result<(), DeviceError> {
        self.producing.store(false, Ordering::Release);
        if graceful {
            self.device.drain()
        } else {
            self.device.drop_stream()
        }
    }
}

/// Marker scan (§4.1 step 3): walks frames looking for the first one carrying
/// `Data` while in `Streaming` state, updating `state` along the way on any
/// `BoS`/`EoS` markers encountered before that point. Returns `None` if no
/// such frame exists in this buffer.
#[inline]
fn contains_data(buf: &[u8], bytes_per_frame: usize, state: &mut StreamingState) -> Option<usize> {
    let frames = buf.len() / bytes_per_frame;
    for i in 0..frames {
        let marker_byte = buf[(i + 1) * bytes_per_frame - 1];
        let marker = StreamMarker::from_byte(marker_byte);
        *state = state.apply(marker);
        if marker == StreamMarker::Data && *state == StreamingState::Streaming {
            return Some(i);
        }
    }
    None
}

/// Producer callback (§4.1 step 4): copies the first `channels - 1` channels
/// of every `Data` frame (while `Streaming`) from `src` into `dst`, continuing
/// the marker walk from `state` so a later `EoS` within the same buffer stops
/// the copy at the right frame. Returns the number of frames written.
#[inline]
fn copy_data(
    src: &[u8],
    dst: &mut [u8],
    bytes_per_frame: usize,
    payload_bytes_per_frame: usize,
    state: &mut StreamingState,
) -> usize {
    let frames = src.len() / bytes_per_frame;
    let mut written = 0usize;

    for i in 0..frames {
        let frame = &src[i * bytes_per_frame..(i + 1) * bytes_per_frame];
        let marker = StreamMarker::from_byte(frame[bytes_per_frame - 1]);
        *state = state.apply(marker);

        if marker == StreamMarker::Data && *state == StreamingState::Streaming {
            let dst_start = written * payload_bytes_per_frame;
            dst[dst_start..dst_start + payload_bytes_per_frame]
                .copy_from_slice(&frame[..payload_bytes_per_frame]);
            written += 1;
        }
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Mutex;

    /// Builds one interleaved frame: `channels - 1` audio channels (byte
    /// value = channel index) plus a trailing marker byte.
    fn frame(channels: usize, marker: u8) -> Vec<u8> {
        let mut f = vec![0u8; channels];
        for (ch, byte) in f.iter_mut().enumerate().take(channels - 1) {
            *byte = ch as u8 + 1;
        }
        f[channels - 1] = marker;
        f
    }

    #[test]
    fn contains_data_finds_first_data_frame_after_beginning_of_stream() {
        let channels = 3; // stereo + marker
        let mut buf = Vec::new();
        buf.extend(frame(channels, StreamMarker::BEGINNING_OF_STREAM));
        buf.extend(frame(channels, StreamMarker::DATA));
        buf.extend(frame(channels, StreamMarker::DATA));

        let mut state = StreamingState::Stopped;
        let offset = contains_data(&buf, channels, &mut state);
        assert_eq!(offset, Some(1));
        assert_eq!(state, StreamingState::Streaming);
    }

    #[test]
    fn contains_data_ignores_data_frames_before_beginning_of_stream() {
        let channels = 3;
        let mut buf = Vec::new();
        buf.extend(frame(channels, StreamMarker::DATA));
        buf.extend(frame(channels, StreamMarker::DATA));

        let mut state = StreamingState::Stopped;
        assert_eq!(contains_data(&buf, channels, &mut state), None);
        assert_eq!(state, StreamingState::Stopped);
    }

    #[test]
    fn copy_data_strips_marker_channel_and_stops_at_end_of_stream() {
        // E2E-1 shape, shrunk: BoS, Data, Data, EoS over 3 channels.
        let channels = 3;
        let mut buf = Vec::new();
        buf.extend(frame(channels, StreamMarker::BEGINNING_OF_STREAM));
        buf.extend(frame(channels, StreamMarker::DATA));
        buf.extend(frame(channels, StreamMarker::DATA));
        buf.extend(frame(channels, StreamMarker::END_OF_STREAM));

        let bytes_per_frame = channels;
        let payload_bytes_per_frame = channels - 1;

        let mut state = StreamingState::Stopped;
        let offset = contains_data(&buf, bytes_per_frame, &mut state).expect("data frame present");
        assert_eq!(offset, 1);

        let mut dst = vec![0u8; payload_bytes_per_frame * 4];
        let from_offset = &buf[offset * bytes_per_frame..];
        let written = copy_data(
            from_offset,
            &mut dst,
            bytes_per_frame,
            payload_bytes_per_frame,
            &mut state,
        );

        assert_eq!(written, 2); // the two Data frames, not the trailing EoS frame
        assert_eq!(&dst[..payload_bytes_per_frame * 2], &[1, 2, 1, 2]);
        assert_eq!(state, StreamingState::Stopped);
    }

    #[test]
    fn data_frames_while_stopped_are_never_copied() {
        let channels = 3;
        let mut buf = Vec::new();
        buf.extend(frame(channels, StreamMarker::DATA));
        buf.extend(frame(channels, StreamMarker::DATA));

        let mut state = StreamingState::Stopped;
        // No BoS ever seen: contains_data must return None.
        assert_eq!(contains_data(&buf, channels, &mut state), None);
    }

    struct FakeDevice {
        reads: Mutex<Vec<Result<Vec<u8>, DeviceError>>>,
        recover_result: bool,
    }

    impl CaptureDevice for FakeDevice {
        fn open(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn start(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn read_interleaved(&self, buf: &mut [u8], max_frames: usize) -> Result<usize, DeviceError> {
            let mut reads = self.reads.lock().unwrap();
            if reads.is_empty() {
                return Err(DeviceError::Stopped);
            }
            match reads.remove(0) {
                Ok(data) => {
                    let frames = (data.len() / (buf.len() / max_frames)).min(max_frames);
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(frames)
                }
                Err(err) => Err(err),
            }
        }
        fn recover(&self, _err: &DeviceError) -> bool {
            self.recover_result
        }
        fn drain(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn drop_stream(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn close(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[test]
    fn capture_source_enqueues_one_chunk_for_a_complete_stream_span() {
        let channels = 3u16;
        let params = PcmParameters::new("fake", 48000, channels, 8, 4, 2).unwrap();
        let queue = Arc::new(ChunkQueue::new(2, params.chunk_capacity_bytes()));

        let mut read_buf = Vec::new();
        read_buf.extend(frame(3, StreamMarker::BEGINNING_OF_STREAM));
        read_buf.extend(frame(3, StreamMarker::DATA));
        read_buf.extend(frame(3, StreamMarker::DATA));
        read_buf.extend(frame(3, StreamMarker::END_OF_STREAM));

        let device = FakeDevice {
            reads: Mutex::new(vec![Ok(read_buf)]),
            recover_result: false,
        };

        let source = CaptureSource::new(device, params, Arc::clone(&queue));
        let overflowed = Cell::new(false);
        // The fake device returns Stopped on the second read, ending the loop cleanly.
        source.start(|| overflowed.set(true)).unwrap();

        assert!(!overflowed.get());
        let chunk = queue.try_dequeue().expect("one chunk enqueued");
        assert_eq!(chunk.data_size(), 2 * 2); // 2 data frames * 2 payload channels
        assert_eq!(chunk.data(), &[1, 2, 1, 2]);
    }
}
