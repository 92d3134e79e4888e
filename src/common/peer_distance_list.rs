use std::vec::IntoIter;

use crate::common::{Distance, KadId, PeerInfo};

#[derive(Debug, Clone)]
struct PeerDistance {
    peer: PeerInfo,
    distance: Distance,
}

#[derive(Debug, Clone)]
/// Peers sorted by their distance to an origin, keeping at most `capacity` of them.
///
/// Created fresh per lookup, never shared between queries.
pub struct PeerDistanceList {
    origin: KadId,
    capacity: usize,
    peers: Vec<PeerDistance>,
}

impl PeerDistanceList {
    pub fn new(origin: KadId, capacity: usize) -> Self {
        Self {
            origin,
            capacity,
            peers: Vec::with_capacity(capacity),
        }
    }

    // === Getters ===

    pub fn origin(&self) -> &KadId {
        &self.origin
    }

    /// Sorted snapshot, closest first.
    pub fn peers(&self) -> Vec<&PeerInfo> {
        self.peers.iter().map(|p| &p.peer).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.capacity
    }

    /// Returns `true` if a peer with `kad_id` would make it into this list.
    pub fn is_closer(&self, kad_id: &KadId) -> bool {
        if !self.is_full() {
            return true;
        }

        match self.peers.last() {
            Some(farthest) => kad_id.distance(&self.origin) < farthest.distance,
            None => false,
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, peer: PeerInfo) {
        let kad_id = peer.id.kad_id();

        self.add_with_kad_id(peer, kad_id)
    }

    /// Insert keeping the list sorted; equal distances keep insertion order.
    pub fn add_with_kad_id(&mut self, peer: PeerInfo, kad_id: KadId) {
        if self.peers.iter().any(|p| p.peer.id == peer.id) {
            return;
        }

        let distance = kad_id.distance(&self.origin);
        let position = self.peers.partition_point(|p| p.distance <= distance);

        if position >= self.capacity {
            return;
        }

        self.peers.insert(position, PeerDistance { peer, distance });
        self.peers.truncate(self.capacity);
    }
}

impl IntoIterator for PeerDistanceList {
    type Item = PeerInfo;
    type IntoIter = IntoIter<PeerInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers
            .into_iter()
            .map(|p| p.peer)
            .collect::<Vec<_>>()
            .into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PeerId;

    fn random_peer() -> PeerInfo {
        PeerInfo::without_addrs(PeerId::random())
    }

    #[test]
    fn add() {
        let origin = KadId::random();

        let mut list = PeerDistanceList::new(origin, 20);

        for _ in 0..10 {
            let peer = random_peer();
            list.add(peer.clone());
            list.add(peer);
        }

        assert_eq!(list.len(), 10);

        let distances = list
            .peers()
            .iter()
            .map(|p| p.id.kad_id().distance(&origin))
            .collect::<Vec<_>>();

        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(sorted, distances);
    }

    #[test]
    fn never_exceeds_capacity() {
        let origin = KadId::random();
        let mut list = PeerDistanceList::new(origin, 5);

        let mut all = Vec::new();
        for _ in 0..50 {
            let peer = random_peer();
            all.push(peer.clone());
            list.add(peer);
            assert!(list.len() <= 5);
        }

        all.sort_by_key(|p| p.id.kad_id().distance(&origin));
        let expected: Vec<_> = all.iter().take(5).map(|p| p.id.clone()).collect();
        let kept: Vec<_> = list.peers().iter().map(|p| p.id.clone()).collect();

        assert_eq!(kept, expected);
        assert!(list.is_full());
    }

    #[test]
    fn farther_peer_is_dropped_when_full() {
        let origin = KadId([0; 32]);
        let mut list = PeerDistanceList::new(origin, 1);

        let mut near = [0; 32];
        near[31] = 1;
        let mut far = [0; 32];
        far[0] = 1;

        let near_peer = random_peer();
        let far_peer = random_peer();

        list.add_with_kad_id(far_peer.clone(), KadId(far));
        assert!(list.is_closer(&KadId(near)));

        list.add_with_kad_id(near_peer.clone(), KadId(near));
        assert_eq!(list.peers(), vec![&near_peer]);

        list.add_with_kad_id(far_peer, KadId(far));
        assert_eq!(list.peers(), vec![&near_peer]);
        assert!(!list.is_closer(&KadId(far)));
    }

    #[test]
    fn equal_distance_keeps_insertion_order() {
        let origin = KadId([0; 32]);
        let mut list = PeerDistanceList::new(origin, 2);
        let kad_id = KadId([7; 32]);

        let first = random_peer();
        let second = random_peer();
        let third = random_peer();

        list.add_with_kad_id(first.clone(), kad_id);
        list.add_with_kad_id(second.clone(), kad_id);
        list.add_with_kad_id(third, kad_id);

        assert_eq!(list.peers(), vec![&first, &second]);
    }
}
