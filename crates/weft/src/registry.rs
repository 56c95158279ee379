use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::mpsc;
use tracing::debug;
use weft_wire::CollectorRequest;

use crate::ids::ParticipantId;

pub struct ParticipantEntry {
    pub name: String,
    tx: mpsc::UnboundedSender<CollectorRequest>,
}

/// Live participants, keyed by their coordinator-assigned id.
///
/// The registry owns the outbound request channels; a send failure means
/// the transport already died and the authoritative cleanup is the
/// `remove` that follows it, so failures are only logged.
#[derive(Default)]
pub struct ParticipantRegistry {
    next_id: u64,
    entries: BTreeMap<ParticipantId, ParticipantEntry>,
}

impl ParticipantRegistry {
    pub fn add(
        &mut self,
        name: String,
        tx: mpsc::UnboundedSender<CollectorRequest>,
    ) -> ParticipantId {
        self.next_id += 1;
        let id = ParticipantId::new(self.next_id);
        self.entries.insert(id, ParticipantEntry { name, tx });
        id
    }

    pub fn remove(&mut self, id: ParticipantId) -> Option<ParticipantEntry> {
        self.entries.remove(&id)
    }

    pub fn name(&self, id: ParticipantId) -> Option<&str> {
        self.entries.get(&id).map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn ids(&self) -> BTreeSet<ParticipantId> {
        self.entries.keys().copied().collect()
    }

    pub fn send(&self, id: ParticipantId, request: CollectorRequest) {
        let Some(entry) = self.entries.get(&id) else {
            debug!(participant = %id, "request for unknown participant dropped");
            return;
        };
        if let Err(e) = entry.tx.send(request) {
            debug!(participant = %id, name = %entry.name, %e, "failed to send request to participant");
        }
    }

    pub fn broadcast(&self, request: &CollectorRequest) {
        for (id, entry) in &self.entries {
            if let Err(e) = entry.tx.send(request.clone()) {
                debug!(participant = %id, name = %entry.name, %e, "failed to send request to participant");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_assigned_in_join_order() {
        let mut registry = ParticipantRegistry::default();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        let a = registry.add("renderer".into(), tx_a);
        let b = registry.add("gpu-process".into(), tx_b);
        assert!(a < b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.name(a), Some("renderer"));
    }

    #[test]
    fn broadcast_reaches_every_live_channel() {
        let mut registry = ParticipantRegistry::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.add("renderer".into(), tx_a);
        let b = registry.add("gpu-process".into(), tx_b);

        registry.broadcast(&CollectorRequest::CancelWatchEvent);
        assert_eq!(rx_a.try_recv().ok(), Some(CollectorRequest::CancelWatchEvent));
        assert_eq!(rx_b.try_recv().ok(), Some(CollectorRequest::CancelWatchEvent));

        registry.remove(b).expect("participant b should be present");
        registry.broadcast(&CollectorRequest::EndRecording);
        assert_eq!(rx_a.try_recv().ok(), Some(CollectorRequest::EndRecording));
        assert!(rx_b.try_recv().is_err());
    }
}
