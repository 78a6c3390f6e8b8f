//! Stream markers embedded in the last channel of each captured frame.

/// A single-byte marker carried in the marker channel of a captured frame.
///
/// Markers are side-band signaling, never audio: at most one is interpreted
/// per frame, and it delimits the coherent playback spans the capture source
/// forwards downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMarker {
    Data,
    BeginningOfStream,
    EndOfStream,
    Empty,
}

impl StreamMarker {
    pub const DATA: u8 = 0;
    pub const BEGINNING_OF_STREAM: u8 = 1;
    pub const END_OF_STREAM: u8 = 2;

    /// Decodes the marker byte carried in the last sample of a frame's
    /// marker channel. Any value other than `Data`/`BeginningOfStream`/
    /// `EndOfStream` is `Empty` and the frame is ignored.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            Self::DATA => StreamMarker::Data,
            Self::BEGINNING_OF_STREAM => StreamMarker::BeginningOfStream,
            Self::END_OF_STREAM => StreamMarker::EndOfStream,
            _ => StreamMarker::Empty,
        }
    }
}

/// Capture-side streaming state, driven by `StreamMarker`s observed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    Stopped,
    Streaming,
}

impl StreamingState {
    /// Applies a marker, returning the resulting state. `Data`/`Empty`
    /// markers never change state.
    #[inline]
    pub fn apply(self, marker: StreamMarker) -> Self {
        match marker {
            StreamMarker::BeginningOfStream => StreamingState::Streaming,
            StreamMarker::EndOfStream => StreamingState::Stopped,
            StreamMarker::Data | StreamMarker::Empty => self,
        }
    }
}

impl Default for StreamingState {
    fn default() -> Self {
        StreamingState::Stopped
    }
}
