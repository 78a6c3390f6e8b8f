//! Binding between Control Sessions and Streaming Sessions.
//!
//! A client is identified by its `clientID` (§3). The Control Session is the
//! authority on whether a client is `Ready` to stream; the streaming-plane
//! acceptor consults this registry to decide whether an incoming
//! `GET /stream.pcm?player=<clientID>` should become a Streaming Session.

use dashmap::DashMap;

/// Tracks clients whose Control Session has completed the `HELO` handshake
/// and is in the `Ready` state.
///
/// Relationship is weak by design (§3): removing an entry here unbinds a
/// future streaming request without touching any already-created Streaming
/// Session, and vice versa.
#[derive(Default)]
pub struct ClientRegistry {
    ready: DashMap<String, u32>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `client_id` ready to stream at `sampling_rate`, called by a
    /// Control Session once it has processed `HELO`.
    pub fn mark_ready(&self, client_id: String, sampling_rate: u32) {
        self.ready.insert(client_id, sampling_rate);
    }

    /// Removes a client from the ready set, called when its Control Session closes.
    pub fn unmark_ready(&self, client_id: &str) {
        self.ready.remove(client_id);
    }

    /// Looks up the negotiated sampling rate for a ready client.
    pub fn sampling_rate_for(&self, client_id: &str) -> Option<u32> {
        self.ready.get(client_id).map(|entry| *entry.value())
    }

    pub fn is_ready(&self, client_id: &str) -> bool {
        self.ready.contains_key(client_id)
    }
}

/// Extracts the `clientID` from the query string of a streaming request's
/// `GET /stream.pcm?player=<clientID>` request line or header.
///
/// Per §4.5, URL-decoding is not required for the known client-ID vocabulary:
/// this simply returns the substring following the first `=`.
pub fn parse_client_id(header: &str) -> String {
    match header.find('=') {
        Some(index) => header[index + 1..].to_string(),
        None => String::new(),
    }
}
