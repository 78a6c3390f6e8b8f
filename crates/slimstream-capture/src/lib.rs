//! cpal-backed implementation of the `CaptureDevice` contract consumed by
//! `slimstream_core::capture::CaptureSource`.
//!
//! The real-time discipline `CaptureSource::start` requires (§4.1: no
//! allocation, no locking, no logging on its hot path) belongs to *that*
//! loop, which only ever calls [`CpalCaptureDevice::read_interleaved`]. cpal
//! drives its own audio thread on a tighter, host-owned schedule we don't
//! control; this crate bridges the two by having the cpal callback push
//! converted bytes into a lock-free ring buffer
//! ([`ringbuf::HeapRb`]) that `read_interleaved` blocks on, parking via a
//! condvar the callback notifies after every push. The callback performs a
//! fixed-size scratch-buffer conversion and a ring-buffer push only - no
//! allocation once the stream is running.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use dasp_sample::ToSample;
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use slimstream_core::{CaptureDevice, DeviceError, PcmParameters};

/// How long `read_interleaved` parks between wake-ups while waiting for more
/// bytes. A timeout (rather than waiting forever on the condvar) means a
/// missed notification - e.g. the callback notifying before the waiter
/// starts waiting - only costs a bounded delay, never a hang.
const WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// Scratch buffer the audio callback reuses across invocations; sized for a
/// few hundred frames of 4-byte samples, well above typical cpal callback
/// buffer sizes.
const SCRATCH_BYTES: usize = 4096;

#[derive(Default)]
struct CallbackState {
    stopped: AtomicBool,
    discard: AtomicBool,
    overruns: AtomicUsize,
    error: Mutex<Option<String>>,
}

impl CallbackState {
    fn request_stop(&self, discard: bool) {
        self.stopped.store(true, Ordering::Release);
        if discard {
            self.discard.store(true, Ordering::Release);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn should_discard(&self) -> bool {
        self.discard.load(Ordering::Acquire)
    }

    fn note_error(&self, message: String) {
        *self.error.lock() = Some(message);
        self.stopped.store(true, Ordering::Release);
    }

    fn take_error(&self) -> Option<String> {
        self.error.lock().take()
    }
}

struct OpenedDevice {
    device: cpal::Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

struct RunningDevice {
    // Held only to keep the stream alive; dropping it stops capture.
    _stream: cpal::Stream,
    consumer: HeapCons<u8>,
    callback_state: Arc<CallbackState>,
}

enum State {
    Unopened,
    Opened(OpenedDevice),
    Running(RunningDevice),
    Closed,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

/// A [`CaptureDevice`] backed by a cpal input stream.
///
/// `params.device_name()` selects the host input device by exact name match;
/// an empty name or the literal `"default"` uses the host's default input
/// device. `params.channels()`/`params.sampling_rate()` must match a config
/// the device actually supports - this implementation does not resample or
/// remix, matching the core crate's stated non-goal.
pub struct CpalCaptureDevice {
    params: PcmParameters,
    shared: Arc<Shared>,
}

impl CpalCaptureDevice {
    pub fn new(params: PcmParameters) -> Self {
        Self {
            params,
            shared: Arc::new(Shared {
                state: Mutex::new(State::Unopened),
                wake: Condvar::new(),
            }),
        }
    }
}

impl CaptureDevice for CpalCaptureDevice {
    fn open(&self) -> Result<(), DeviceError> {
        let mut guard = self.shared.state.lock();
        if !matches!(&*guard, State::Unopened) {
            return Err(DeviceError::Open("open() called more than once".into()));
        }

        let host = cpal::default_host();
        let device = find_input_device(&host, self.params.device_name())?;
        let (config, sample_format) = negotiate_config(&device, &self.params)?;

        *guard = State::Opened(OpenedDevice {
            device,
            config,
            sample_format,
        });
        Ok(())
    }

    fn start(&self) -> Result<(), DeviceError> {
        let mut guard = self.shared.state.lock();
        let opened = match std::mem::replace(&mut *guard, State::Closed) {
            State::Opened(opened) => opened,
            State::Running(running) => {
                *guard = State::Running(running);
                return Ok(()); // already started; idempotent
            }
            other => {
                *guard = other;
                return Err(DeviceError::Open("start() called before open()".into()));
            }
        };

        let bytes_per_frame = self.params.bytes_per_frame();
        let capacity_frames = self.params.frames_per_chunk() * self.params.periods().max(1) as usize;
        let ring = HeapRb::<u8>::new((capacity_frames * bytes_per_frame).max(bytes_per_frame));
        let (producer, consumer) = ring.split();

        let callback_state = Arc::new(CallbackState::default());
        let stream = build_input_stream(
            &opened,
            self.params.bit_depth(),
            producer,
            Arc::clone(&self.shared),
            Arc::clone(&callback_state),
        )?;
        stream.play().map_err(|err| DeviceError::Open(err.to_string()))?;

        *guard = State::Running(RunningDevice {
            _stream: stream,
            consumer,
            callback_state,
        });
        Ok(())
    }

    fn read_interleaved(&self, buf: &mut [u8], max_frames: usize) -> Result<usize, DeviceError> {
        let bytes_per_frame = self.params.bytes_per_frame();
        let needed = max_frames * bytes_per_frame;
        debug_assert!(buf.len() >= needed);

        let mut guard = self.shared.state.lock();
        let mut filled = 0usize;

        loop {
            let running = match &mut *guard {
                State::Running(running) => running,
                _ => return Err(DeviceError::Read("device is not running".into())),
            };

            if let Some(message) = running.callback_state.take_error() {
                return Err(DeviceError::Read(message));
            }

            filled += running.consumer.pop_slice(&mut buf[filled..needed]);
            if filled >= needed {
                return Ok(filled / bytes_per_frame);
            }

            if running.callback_state.is_stopped() {
                if filled > 0 && !running.callback_state.should_discard() {
                    return Ok(filled / bytes_per_frame);
                }
                return Err(DeviceError::Stopped);
            }

            self.shared.wake.wait_for(&mut guard, WAIT_TIMEOUT);
        }
    }

    fn recover(&self, _err: &DeviceError) -> bool {
        // cpal surfaces device errors (disconnects, config changes) rather
        // than ALSA-style recoverable xruns; there is nothing meaningful to
        // retry here, so every error is terminal for this backend.
        false
    }

    fn drain(&self) -> Result<(), DeviceError> {
        let guard = self.shared.state.lock();
        if let State::Running(running) = &*guard {
            running.callback_state.request_stop(false);
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn drop_stream(&self) -> Result<(), DeviceError> {
        let guard = self.shared.state.lock();
        if let State::Running(running) = &*guard {
            running.callback_state.request_stop(true);
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        let mut guard = self.shared.state.lock();
        *guard = State::Closed;
        self.shared.wake.notify_all();
        Ok(())
    }
}

fn find_input_device(host: &cpal::Host, name: &str) -> Result<cpal::Device, DeviceError> {
    if name.is_empty() || name.eq_ignore_ascii_case("default") {
        return host
            .default_input_device()
            .ok_or_else(|| DeviceError::Open("no default input device".into()));
    }

    host.input_devices()
        .map_err(|err| DeviceError::Open(err.to_string()))?
        .find(|device| device.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| DeviceError::Open(format!("input device {name:?} not found")))
}

fn negotiate_config(
    device: &cpal::Device,
    params: &PcmParameters,
) -> Result<(StreamConfig, SampleFormat), DeviceError> {
    let desired_rate = cpal::SampleRate(params.sampling_rate());
    let desired_channels = params.channels();

    let range = device
        .supported_input_configs()
        .map_err(|err| DeviceError::Open(err.to_string()))?
        .find(|candidate| {
            candidate.channels() == desired_channels
                && candidate.min_sample_rate() <= desired_rate
                && desired_rate <= candidate.max_sample_rate()
        })
        .ok_or_else(|| {
            DeviceError::Open(format!(
                "device {:?} does not support {desired_channels} channel(s) at {} Hz",
                params.device_name(),
                params.sampling_rate()
            ))
        })?;

    let sample_format = range.sample_format();
    let config = range.with_sample_rate(desired_rate).config();
    Ok((config, sample_format))
}

fn build_input_stream(
    opened: &OpenedDevice,
    bit_depth: u16,
    producer: HeapProd<u8>,
    shared: Arc<Shared>,
    callback_state: Arc<CallbackState>,
) -> Result<cpal::Stream, DeviceError> {
    let err_fn = {
        let callback_state = Arc::clone(&callback_state);
        let shared = Arc::clone(&shared);
        move |err: cpal::StreamError| {
            callback_state.note_error(err.to_string());
            shared.wake.notify_all();
        }
    };

    match opened.sample_format {
        SampleFormat::I16 => {
            build_typed_stream::<i16>(opened, bit_depth, producer, shared, callback_state, err_fn)
        }
        SampleFormat::I32 => {
            build_typed_stream::<i32>(opened, bit_depth, producer, shared, callback_state, err_fn)
        }
        SampleFormat::U16 => {
            build_typed_stream::<u16>(opened, bit_depth, producer, shared, callback_state, err_fn)
        }
        SampleFormat::F32 => {
            build_typed_stream::<f32>(opened, bit_depth, producer, shared, callback_state, err_fn)
        }
        other => Err(DeviceError::Open(format!("unsupported sample format {other:?}"))),
    }
}

fn build_typed_stream<T>(
    opened: &OpenedDevice,
    bit_depth: u16,
    mut producer: HeapProd<u8>,
    shared: Arc<Shared>,
    callback_state: Arc<CallbackState>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, DeviceError>
where
    T: cpal::SizedSample + ToSample<i32>,
{
    let mut scratch = [0u8; SCRATCH_BYTES];
    let bytes_per_sample = (bit_depth / 8) as usize;

    let data_fn = move |data: &[T], _: &cpal::InputCallbackInfo| {
        let mut pos = 0usize;
        for sample in data {
            if pos + bytes_per_sample > scratch.len() {
                flush(&mut producer, &scratch[..pos], &callback_state);
                pos = 0;
            }
            let value = (*sample).to_sample::<i32>();
            pos += encode_sample(value, bit_depth, &mut scratch[pos..]);
        }
        if pos > 0 {
            flush(&mut producer, &scratch[..pos], &callback_state);
        }
        shared.wake.notify_all();
    };

    opened
        .device
        .build_input_stream(&opened.config, data_fn, err_fn, None)
        .map_err(|err| DeviceError::Open(err.to_string()))
}

fn flush(producer: &mut HeapProd<u8>, bytes: &[u8], callback_state: &CallbackState) {
    let pushed = producer.push_slice(bytes);
    if pushed < bytes.len() {
        callback_state.overruns.fetch_add(1, Ordering::Relaxed);
    }
}

/// Encodes one canonical `i32` sample into `bit_depth` bits of little-endian
/// PCM, writing into `out` and returning the number of bytes written.
#[inline]
fn encode_sample(value: i32, bit_depth: u16, out: &mut [u8]) -> usize {
    match bit_depth {
        8 => {
            // Unsigned 8-bit PCM: top byte of the signed value, offset to unsigned.
            out[0] = ((value >> 24) as i8 as u8).wrapping_add(0x80);
            1
        }
        16 => {
            let narrowed = (value >> 16) as i16;
            out[..2].copy_from_slice(&narrowed.to_le_bytes());
            2
        }
        32 => {
            out[..4].copy_from_slice(&value.to_le_bytes());
            4
        }
        other => unreachable!("PcmParameters only constructs with multiple-of-8 depths, got {other}"),
    }
}
