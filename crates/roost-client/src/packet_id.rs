//! Packet identifier allocation.
//!
//! QoS 1/2 PUBLISH, SUBSCRIBE and UNSUBSCRIBE each reserve a 16 bit
//! non-zero identifier for the lifetime of their acknowledgment exchange.
//! The generator also keeps the originating packet per identifier so ack
//! handling can recover which topics and QoS an acknowledgment refers to.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use roost_core::Packet;

#[derive(Debug, Default)]
pub(crate) struct IdGenerator {
    pending: Mutex<HashMap<u16, Packet>>,
}

impl IdGenerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve the lowest free identifier and store the packet `build`
    /// produces for it as the pending context.
    ///
    /// Returns `None` when all 65535 identifiers are in flight; the caller
    /// surfaces that as a quota error rather than aliasing a live id.
    pub(crate) fn assign(&self, build: impl FnOnce(u16) -> Packet) -> Option<(u16, Packet)> {
        let mut pending = self.lock();
        let id = (1..=u16::MAX).find(|id| !pending.contains_key(id))?;
        let packet = build(id);
        pending.insert(id, packet.clone());
        Some((id, packet))
    }

    /// Release an identifier after the terminal acknowledgment. Idempotent.
    pub(crate) fn release(&self, id: u16) {
        self.lock().remove(&id);
    }

    /// Re-reserve an identifier for an exchange reloaded from
    /// persistence. Keeps the live context if the id is already held.
    pub(crate) fn restore(&self, id: u16, packet: Packet) {
        self.lock().entry(id).or_insert(packet);
    }

    /// The packet that reserved `id`, if the exchange is still open.
    pub(crate) fn peek(&self, id: u16) -> Option<Packet> {
        self.lock().get(&id).cloned()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u16, Packet>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::{Ack, Packet};
    use std::sync::Arc;

    fn marker(id: u16) -> Packet {
        Packet::Pubrel(Ack::new(id))
    }

    #[test]
    fn assigns_lowest_free_id() {
        let ids = IdGenerator::new();
        assert_eq!(ids.assign(marker).unwrap().0, 1);
        assert_eq!(ids.assign(marker).unwrap().0, 2);
        ids.release(1);
        assert_eq!(ids.assign(marker).unwrap().0, 1);
    }

    #[test]
    fn peek_returns_the_origin_packet() {
        let ids = IdGenerator::new();
        let (id, _) = ids.assign(marker).unwrap();
        assert_eq!(ids.peek(id), Some(marker(id)));
        ids.release(id);
        assert_eq!(ids.peek(id), None);
    }

    #[test]
    fn release_is_idempotent() {
        let ids = IdGenerator::new();
        let (id, _) = ids.assign(marker).unwrap();
        ids.release(id);
        ids.release(id);
        assert_eq!(ids.in_flight(), 0);
    }

    #[test]
    fn concurrent_assign_and_release_never_duplicate() {
        let ids = Arc::new(IdGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = Arc::clone(&ids);
            handles.push(std::thread::spawn(move || {
                let mut held = Vec::new();
                for _ in 0..200 {
                    let (id, _) = ids.assign(marker).expect("id space exhausted");
                    held.push(id);
                }
                held
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().expect("worker panicked"));
        }

        let distinct: std::collections::HashSet<_> = all.iter().copied().collect();
        assert_eq!(distinct.len(), all.len(), "duplicate identifiers handed out");
        assert!(all.iter().all(|id| *id >= 1));

        for id in all {
            ids.release(id);
        }
        assert_eq!(ids.in_flight(), 0);
    }
}
