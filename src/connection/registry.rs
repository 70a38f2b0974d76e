//! Registry of live streams on a connection.

use std::collections::BTreeMap;

use crate::frame::StreamId;

use super::flow_control::WindowError;
use super::stream::{Stream, StreamState};

/// Why a new peer-initiated stream was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// Stream id reuses or regresses a previously seen id.
    NotMonotonic,
    /// Stream id above the GOAWAY cutoff; safe for the peer to retry
    /// elsewhere.
    Refused,
    /// SETTINGS_MAX_CONCURRENT_STREAMS would be exceeded; safe retry.
    Exhausted,
}

/// Id-ordered map of live streams plus the connection's id bookkeeping:
/// monotonic admission per initiator, the concurrency cap, push-id
/// allocation, and the GOAWAY cutoff.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    /// Live streams, keyed and iterated in id order.
    streams: BTreeMap<u32, Stream>,
    /// Highest client-initiated id ever seen, admitted or refused.
    max_client_id: u32,
    /// Next even id for a PUSH_PROMISE.
    next_push_id: u32,
    /// After GOAWAY, ids above this are refused.
    cutoff: Option<u32>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: BTreeMap::new(),
            max_client_id: 0,
            next_push_id: 2,
            cutoff: None,
        }
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id.value())
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id.value())
    }

    /// Highest client-initiated id seen so far; the last_stream_id we put in
    /// a GOAWAY.
    pub fn max_client_id(&self) -> u32 {
        self.max_client_id
    }

    /// Whether a client id refers to a stream still in idle state, i.e. one
    /// we have never seen.
    pub fn is_idle_client_id(&self, id: StreamId) -> bool {
        id.value() > self.max_client_id
    }

    /// Whether a server id refers to a push stream we never reserved.
    pub fn is_idle_server_id(&self, id: StreamId) -> bool {
        id.value() >= self.next_push_id
    }

    /// Admit a new client-initiated stream, enforcing monotonic ids, the
    /// GOAWAY cutoff, and the concurrency cap. The id is recorded as seen
    /// even when admission fails, so later frames on it map to a closed
    /// stream rather than an idle one.
    pub fn admit_client(
        &mut self,
        id: StreamId,
        max_concurrent: u32,
        send_window: u32,
        recv_window: u32,
    ) -> Result<&mut Stream, AdmitError> {
        if id.value() <= self.max_client_id {
            return Err(AdmitError::NotMonotonic);
        }
        self.max_client_id = id.value();

        if let Some(cutoff) = self.cutoff
            && id.value() > cutoff
        {
            return Err(AdmitError::Refused);
        }

        if self.active_client_count() >= max_concurrent as usize {
            return Err(AdmitError::Exhausted);
        }

        let mut stream = Stream::new(id, send_window, recv_window);
        stream.open();
        Ok(self.streams.entry(id.value()).or_insert(stream))
    }

    /// Reserve the next server-initiated stream for a push.
    pub fn reserve_push(&mut self, send_window: u32, recv_window: u32) -> StreamId {
        let id = StreamId::new(self.next_push_id);
        self.next_push_id += 2;

        let mut stream = Stream::new(id, send_window, recv_window);
        stream.reserve_local();
        self.streams.insert(id.value(), stream);
        id
    }

    /// Count client-initiated streams counted against
    /// SETTINGS_MAX_CONCURRENT_STREAMS: open or half-closed.
    pub fn active_client_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| s.id().is_client_initiated() && is_active(s.state()))
            .count()
    }

    /// Count server-initiated (push) streams against the peer's cap.
    pub fn active_server_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| s.id().is_server_initiated() && is_active(s.state()))
            .count()
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE delta to every live stream's
    /// send window. Any overflow is a connection-level flow control error.
    pub fn apply_send_window_delta(&mut self, delta: i64) -> Result<(), WindowError> {
        for stream in self.streams.values_mut() {
            stream.send_window().adjust(delta)?;
        }
        Ok(())
    }

    /// Apply our own initial-window change (after the peer ACKed it) to
    /// every live stream's receive window.
    pub fn apply_recv_window_delta(&mut self, delta: i64) -> Result<(), WindowError> {
        for stream in self.streams.values_mut() {
            stream.recv_window().adjust(delta)?;
        }
        Ok(())
    }

    /// Record the GOAWAY cutoff: client streams above `last_stream_id` are
    /// refused from now on.
    pub fn set_cutoff(&mut self, last_stream_id: StreamId) {
        self.cutoff = Some(last_stream_id.value());
    }

    /// Ids of streams with parked sends, in id order.
    pub fn ids_with_pending(&self) -> Vec<StreamId> {
        self.streams
            .values()
            .filter(|s| s.has_pending())
            .map(Stream::id)
            .collect()
    }

    /// All live stream ids, in id order.
    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.keys().map(|&id| StreamId::new(id)).collect()
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        self.streams.remove(&id.value())
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }
}

fn is_active(state: StreamState) -> bool {
    matches!(
        state,
        StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u32 = 65_535;

    fn admit(registry: &mut StreamRegistry, id: u32) -> Result<StreamId, AdmitError> {
        registry
            .admit_client(StreamId::new(id), 100, WINDOW, WINDOW)
            .map(|s| s.id())
    }

    #[test]
    fn admits_increasing_ids() {
        let mut registry = StreamRegistry::new();
        assert!(admit(&mut registry, 1).is_ok());
        assert!(admit(&mut registry, 3).is_ok());
        assert!(admit(&mut registry, 7).is_ok());
        assert_eq!(registry.max_client_id(), 7);
    }

    #[test]
    fn rejects_reused_and_regressing_ids() {
        let mut registry = StreamRegistry::new();
        assert!(admit(&mut registry, 5).is_ok());
        assert_eq!(admit(&mut registry, 5), Err(AdmitError::NotMonotonic));
        assert_eq!(admit(&mut registry, 3), Err(AdmitError::NotMonotonic));
    }

    #[test]
    fn idle_detection() {
        let mut registry = StreamRegistry::new();
        assert!(registry.is_idle_client_id(StreamId::new(1)));
        admit(&mut registry, 5).unwrap();
        assert!(!registry.is_idle_client_id(StreamId::new(3)));
        assert!(registry.is_idle_client_id(StreamId::new(7)));
    }

    #[test]
    fn concurrency_cap() {
        let mut registry = StreamRegistry::new();
        registry
            .admit_client(StreamId::new(1), 2, WINDOW, WINDOW)
            .unwrap();
        registry
            .admit_client(StreamId::new(3), 2, WINDOW, WINDOW)
            .unwrap();

        let err = registry
            .admit_client(StreamId::new(5), 2, WINDOW, WINDOW)
            .unwrap_err();
        assert_eq!(err, AdmitError::Exhausted);

        // The refused id still counts as seen.
        assert!(!registry.is_idle_client_id(StreamId::new(5)));

        // Closing one readmits.
        registry.get_mut(StreamId::new(1)).unwrap().reset();
        assert!(
            registry
                .admit_client(StreamId::new(7), 2, WINDOW, WINDOW)
                .is_ok()
        );
    }

    #[test]
    fn cutoff_refuses_new_streams() {
        let mut registry = StreamRegistry::new();
        admit(&mut registry, 1).unwrap();
        registry.set_cutoff(StreamId::new(1));

        assert_eq!(admit(&mut registry, 3), Err(AdmitError::Refused));
    }

    #[test]
    fn push_id_allocation_is_even_and_increasing() {
        let mut registry = StreamRegistry::new();
        let a = registry.reserve_push(WINDOW, WINDOW);
        let b = registry.reserve_push(WINDOW, WINDOW);
        assert_eq!(a.value(), 2);
        assert_eq!(b.value(), 4);
        assert_eq!(
            registry.get(a).unwrap().state(),
            StreamState::ReservedLocal
        );
        // Reserved streams do not count against the cap.
        assert_eq!(registry.active_server_count(), 0);
    }

    #[test]
    fn initial_window_delta_applies_to_all() {
        let mut registry = StreamRegistry::new();
        admit(&mut registry, 1).unwrap();
        admit(&mut registry, 3).unwrap();

        registry.apply_send_window_delta(1000).unwrap();
        assert_eq!(
            registry.get(StreamId::new(1)).unwrap().send_window_available(),
            WINDOW + 1000
        );
        assert_eq!(
            registry.get(StreamId::new(3)).unwrap().send_window_available(),
            WINDOW + 1000
        );
    }

    #[test]
    fn initial_window_delta_overflow() {
        let mut registry = StreamRegistry::new();
        admit(&mut registry, 1).unwrap();

        assert!(
            registry
                .apply_send_window_delta(i64::from(u32::MAX))
                .is_err()
        );
    }
}
