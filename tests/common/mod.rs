#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kad_dht::network::{request_stream, Network, RequestOptions};
use kad_dht::store::{MemoryDatastore, MemoryPeerStore};
use kad_dht::{
    Error, EventStream, KadDht, KadDhtBuilder, Message, MessageType, Multiaddr, PeerId, PeerInfo,
    QueryEvent,
};
use parking_lot::{Mutex, RwLock};
use tracing::Level;

#[derive(Debug, Clone)]
pub struct Request {
    pub from: PeerId,
    pub to: PeerId,
    pub message_type: MessageType,
    pub protocol: &'static str,
}

/// In-memory network delivering requests straight to the nodes' `handle_request`.
#[derive(Default)]
pub struct Testnet {
    nodes: RwLock<HashMap<PeerId, KadDht>>,
    requests: Mutex<Vec<Request>>,
    latency: Mutex<Duration>,
    counter: AtomicUsize,
}

impl Testnet {
    pub fn new() -> Arc<Self> {
        init_tracing();

        Arc::new(Self::default())
    }

    /// Build, start and register a node in server mode.
    pub fn node(self: &Arc<Self>) -> KadDht {
        self.node_with(|builder| builder)
    }

    pub fn node_with(
        self: &Arc<Self>,
        configure: impl FnOnce(KadDhtBuilder) -> KadDhtBuilder,
    ) -> KadDht {
        let dht = self.build(|builder| configure(builder.client_mode(false)));
        dht.start();

        dht
    }

    /// Build and register a node without starting it or choosing its mode.
    pub fn build(
        self: &Arc<Self>,
        configure: impl FnOnce(KadDhtBuilder) -> KadDhtBuilder,
    ) -> KadDht {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let peer_id = PeerId::random();
        let addrs = vec![Multiaddr::new(format!(
            "/ip4/8.8.{}.{}/tcp/4001",
            n / 250,
            n % 250 + 1
        ))];

        let link = Link {
            local: PeerInfo::new(peer_id.clone(), addrs.clone()),
            testnet: self.clone(),
        };

        let dht = configure(KadDht::builder().peer_id(peer_id.clone()).addresses(addrs)).build(
            Arc::new(link),
            Arc::new(MemoryDatastore::new()),
            Arc::new(MemoryPeerStore::new()),
        );

        self.nodes.write().insert(peer_id, dht.clone());

        dht
    }

    pub fn info(&self, dht: &KadDht) -> PeerInfo {
        self.nodes
            .read()
            .get(dht.peer_id())
            .and_then(|node| node.peer_routing().find_peer_local(node.peer_id()))
            .unwrap_or_else(|| PeerInfo::without_addrs(dht.peer_id().clone()))
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }
}

struct Link {
    local: PeerInfo,
    testnet: Arc<Testnet>,
}

impl Network for Link {
    fn send_request(&self, to: PeerId, message: Message, options: RequestOptions) -> EventStream {
        let testnet = self.testnet.clone();
        let from = self.local.clone();
        let message_type = message.message_type;

        testnet.requests.lock().push(Request {
            from: from.id.clone(),
            to: to.clone(),
            message_type,
            protocol: options.protocol,
        });

        let target = to.clone();

        request_stream(to, message_type, options, async move {
            let latency = *testnet.latency.lock();
            if latency.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(latency).await;
            }

            let node = testnet
                .nodes
                .read()
                .get(&target)
                .cloned()
                .ok_or_else(|| Error::Network(format!("unknown peer {target}")))?;

            node.handle_request(&from, message)
        })
    }
}

/// Log to the test output; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub async fn collect(events: EventStream) -> Vec<QueryEvent> {
    events.collect().await
}

/// Peers of the [QueryEvent::FinalPeer]s in `events`.
pub fn final_peers(events: &[QueryEvent]) -> Vec<PeerId> {
    events
        .iter()
        .filter_map(|event| event.final_peer())
        .map(|peer| peer.id.clone())
        .collect()
}

pub fn values(events: &[QueryEvent]) -> Vec<(PeerId, Vec<u8>)> {
    events
        .iter()
        .filter_map(|event| match event {
            QueryEvent::Value { from, value } => Some((from.clone(), value.to_vec())),
            _ => None,
        })
        .collect()
}
