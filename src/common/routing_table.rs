//! Kademlia routing table: a binary trie of k-buckets over the bits of [KadId]s.

use crate::common::{KadId, Peer, PeerDistanceList, PeerId, PeerInfo, ID_BITS};

/// K = the default maximum size of a k-bucket.
pub const K_BUCKET_SIZE: usize = 20;
/// Default maximum depth of the trie, in bits.
pub const PREFIX_LENGTH: usize = 32;
/// Default number of old contacts to ping when a bucket is full.
pub const PING_COUNT: usize = 3;

#[derive(Debug, Clone)]
/// Routing table settings.
pub struct RoutingTableConfig {
    /// Maximum number of peers in a bucket that can no longer split.
    ///
    /// Defaults to [K_BUCKET_SIZE]
    pub k_bucket_size: usize,
    /// Maximum depth of the trie.
    ///
    /// Defaults to [PREFIX_LENGTH]
    pub prefix_length: usize,
    /// Number of peers at which a leaf splits, if it is not at the maximum depth.
    ///
    /// Defaults to [K_BUCKET_SIZE]
    pub split_threshold: usize,
    /// How many of the least recently added peers to name in a [RoutingTableEvent::Ping].
    ///
    /// Defaults to [PING_COUNT]
    pub ping_count: usize,
}

impl Default for RoutingTableConfig {
    fn default() -> Self {
        Self {
            k_bucket_size: K_BUCKET_SIZE,
            prefix_length: PREFIX_LENGTH,
            split_threshold: K_BUCKET_SIZE,
            ping_count: PING_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Notifications for routing table observers.
pub enum RoutingTableEvent {
    Added(Peer),
    Removed(Peer),
    /// A full bucket refused `new_contact`.
    ///
    /// The observer may ping `old_contacts`, remove the unresponsive ones, and
    /// add `new_contact` again. Nothing is evicted automatically, so a flood of
    /// new ids can not push out long-lived peers.
    Ping {
        old_contacts: Vec<Peer>,
        new_contact: Peer,
    },
}

#[derive(Debug, Clone)]
pub struct LeafBucket {
    pub prefix: String,
    pub depth: usize,
    /// Sorted by the least recently added.
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone)]
pub struct InternalBucket {
    pub depth: usize,
    /// Arena index of the child for bit `0`.
    pub left: usize,
    /// Arena index of the child for bit `1`.
    pub right: usize,
}

#[derive(Debug, Clone)]
/// A node of the trie.
pub enum Bucket {
    Leaf(LeafBucket),
    Internal(InternalBucket),
}

#[derive(Debug, Clone)]
/// Binary trie routing table.
///
/// Nodes live in an arena; index `0` is the root.
pub struct RoutingTable {
    local_id: KadId,
    config: RoutingTableConfig,
    buckets: Vec<Bucket>,
    observers: Vec<flume::Sender<RoutingTableEvent>>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] for the local node id.
    ///
    /// `prefix_length` is capped at [ID_BITS].
    pub fn new(local_id: KadId, mut config: RoutingTableConfig) -> Self {
        config.prefix_length = config.prefix_length.min(ID_BITS);

        let root = Bucket::Leaf(LeafBucket {
            prefix: String::new(),
            depth: 0,
            peers: Vec::new(),
        });

        RoutingTable {
            local_id,
            config,
            buckets: vec![root],
            observers: Vec::new(),
        }
    }

    // === Getters ===

    /// Returns the [KadId] of this node, which is never added to the table.
    pub fn local_id(&self) -> &KadId {
        &self.local_id
    }

    pub fn config(&self) -> &RoutingTableConfig {
        &self.config
    }

    pub fn k_bucket_size(&self) -> usize {
        self.config.k_bucket_size
    }

    /// All leaf buckets of the trie.
    pub fn leaves(&self) -> impl Iterator<Item = &LeafBucket> {
        self.buckets.iter().filter_map(|bucket| match bucket {
            Bucket::Leaf(leaf) => Some(leaf),
            Bucket::Internal(_) => None,
        })
    }

    /// Iterate over every peer in this routing table.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.leaves().flat_map(|leaf| leaf.peers.iter())
    }

    // === Public Methods ===

    /// Subscribe to [RoutingTableEvent]s.
    pub fn subscribe(&mut self) -> flume::Receiver<RoutingTableEvent> {
        let (sender, receiver) = flume::unbounded();
        self.observers.push(sender);

        receiver
    }

    /// Attempts to add a peer to this routing table, and return `true` if it did.
    pub fn add(&mut self, peer: Peer) -> bool {
        if peer.kad_id == self.local_id {
            return false;
        }

        loop {
            let index = self.leaf_index(&peer.kad_id);

            let (len, depth) = match &self.buckets[index] {
                Bucket::Leaf(leaf) => {
                    if leaf.peers.iter().any(|p| p.kad_id == peer.kad_id) {
                        return false;
                    }
                    (leaf.peers.len(), leaf.depth)
                }
                Bucket::Internal(_) => return false,
            };

            if len < self.config.split_threshold
                || (depth >= self.config.prefix_length && len < self.config.k_bucket_size)
            {
                if let Bucket::Leaf(leaf) = &mut self.buckets[index] {
                    leaf.peers.push(peer.clone());
                }
                self.emit(RoutingTableEvent::Added(peer));

                return true;
            }

            if depth < self.config.prefix_length {
                self.split(index);
                continue;
            }

            let old_contacts = match &self.buckets[index] {
                Bucket::Leaf(leaf) => leaf
                    .peers
                    .iter()
                    .take(self.config.ping_count)
                    .cloned()
                    .collect(),
                Bucket::Internal(_) => Vec::new(),
            };

            self.emit(RoutingTableEvent::Ping {
                old_contacts,
                new_contact: peer,
            });

            return false;
        }
    }

    /// Convenience for [Self::add] from a [PeerId].
    pub fn add_peer_id(&mut self, peer_id: PeerId) -> bool {
        self.add(Peer::new(peer_id))
    }

    /// Remove a peer from this routing table.
    pub fn remove(&mut self, kad_id: &KadId) -> Option<Peer> {
        let index = self.leaf_index(kad_id);

        let removed = match &mut self.buckets[index] {
            Bucket::Leaf(leaf) => leaf
                .peers
                .iter()
                .position(|p| &p.kad_id == kad_id)
                .map(|position| leaf.peers.remove(position)),
            Bucket::Internal(_) => None,
        };

        if let Some(peer) = &removed {
            self.emit(RoutingTableEvent::Removed(peer.clone()));
        }

        removed
    }

    /// Exact lookup along the trie path.
    pub fn get(&self, kad_id: &KadId) -> Option<&Peer> {
        match &self.buckets[self.leaf_index(kad_id)] {
            Bucket::Leaf(leaf) => leaf.peers.iter().find(|p| &p.kad_id == kad_id),
            Bucket::Internal(_) => None,
        }
    }

    pub fn contains(&self, kad_id: &KadId) -> bool {
        self.get(kad_id).is_some()
    }

    /// Return up to `n` peers closest to `id`.
    ///
    /// The trie is ordered by prefix, not by distance, so every leaf is scanned.
    pub fn closest(&self, id: &KadId, n: usize) -> Vec<PeerId> {
        let mut closest = PeerDistanceList::new(*id, n);

        for peer in self.peers() {
            closest.add_with_kad_id(PeerInfo::without_addrs(peer.peer_id.clone()), peer.kad_id);
        }

        closest.into_iter().map(|info| info.id).collect()
    }

    pub fn closest_peer(&self, id: &KadId) -> Option<PeerId> {
        self.closest(id, 1).into_iter().next()
    }

    /// Return the number of peers in this routing table.
    pub fn count(&self) -> usize {
        self.count_from(0)
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    // === Private Methods ===

    fn count_from(&self, index: usize) -> usize {
        match &self.buckets[index] {
            Bucket::Leaf(leaf) => leaf.peers.len(),
            Bucket::Internal(internal) => {
                self.count_from(internal.left) + self.count_from(internal.right)
            }
        }
    }

    /// Index of the leaf whose prefix matches `kad_id`.
    fn leaf_index(&self, kad_id: &KadId) -> usize {
        let mut index = 0;

        while let Bucket::Internal(internal) = &self.buckets[index] {
            index = if kad_id.bit(internal.depth) {
                internal.right
            } else {
                internal.left
            };
        }

        index
    }

    /// Turn the leaf at `index` into an internal node with two leaf children.
    fn split(&mut self, index: usize) {
        let (prefix, depth, peers) = match &mut self.buckets[index] {
            Bucket::Leaf(leaf) => (
                leaf.prefix.clone(),
                leaf.depth,
                std::mem::take(&mut leaf.peers),
            ),
            Bucket::Internal(_) => return,
        };

        let (right_peers, left_peers): (Vec<Peer>, Vec<Peer>) =
            peers.into_iter().partition(|peer| peer.kad_id.bit(depth));

        let left = self.buckets.len();
        self.buckets.push(Bucket::Leaf(LeafBucket {
            prefix: format!("{prefix}0"),
            depth: depth + 1,
            peers: left_peers,
        }));

        let right = self.buckets.len();
        self.buckets.push(Bucket::Leaf(LeafBucket {
            prefix: format!("{prefix}1"),
            depth: depth + 1,
            peers: right_peers,
        }));

        self.buckets[index] = Bucket::Internal(InternalBucket {
            depth,
            left,
            right,
        });
    }

    fn emit(&mut self, event: RoutingTableEvent) {
        self.observers
            .retain(|observer| observer.send(event.clone()).is_ok());
    }
}
