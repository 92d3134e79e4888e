//! A single Kademlia DHT instance.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::common::{
    Message, Multiaddr, Peer, PeerId, PeerInfo, RoutingTable, RoutingTableConfig,
    RoutingTableEvent,
};
use crate::config::{Config, Scope};
use crate::events::{EventStream, QueryEvent};
use crate::network::Network;
use crate::query::{QueryManager, QueryOptions};
use crate::record::{Selector, Validator};
use crate::routing::{ContentFetching, ContentRouting, PeerRouting};
use crate::rpc::Rpc;
use crate::server::{Providers, Server, MAX_PROVIDERS_PER_KEY, MAX_PROVIDER_KEYS};
use crate::store::{Datastore, PeerStore};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Only sends requests, never answers them.
    Client,
    /// Answers requests, and can be added to other peers' routing tables.
    Server,
}

#[derive(Clone)]
pub struct KadDht {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    local: PeerId,
    routing_table: Arc<RwLock<RoutingTable>>,
    peer_store: Arc<dyn PeerStore>,
    client_mode: Arc<AtomicBool>,
    rpc: Rpc,
    query_manager: QueryManager,
    peer_routing: PeerRouting,
    content_fetching: ContentFetching,
    content_routing: ContentRouting,
    server: Server,
    /// Cancels the background tasks spawned by [KadDht::start].
    tasks: Mutex<Option<CancellationToken>>,
}

impl KadDht {
    /// Returns a builder to edit settings before creating a KadDht node.
    pub fn builder() -> KadDhtBuilder {
        KadDhtBuilder::default()
    }

    fn new(
        config: Config,
        local: PeerInfo,
        network: Arc<dyn Network>,
        datastore: Arc<dyn Datastore>,
        peer_store: Arc<dyn PeerStore>,
    ) -> Self {
        let routing_table = Arc::new(RwLock::new(RoutingTable::new(
            local.id.kad_id(),
            RoutingTableConfig {
                k_bucket_size: config.k_bucket_size,
                prefix_length: config.prefix_length,
                split_threshold: config.k_bucket_size,
                ping_count: config.ping_count,
            },
        )));

        peer_store.merge(&local);

        let client_mode = Arc::new(AtomicBool::new(config.client_mode.unwrap_or(true)));

        let rpc = Rpc::new(
            local.id.clone(),
            network,
            routing_table.clone(),
            peer_store.clone(),
            config.scope,
            client_mode.clone(),
        );

        let query_manager = QueryManager::new(
            local.id.clone(),
            routing_table.clone(),
            config.alpha,
            config.k_bucket_size,
        );

        let peer_routing = PeerRouting::new(
            rpc.clone(),
            routing_table.clone(),
            peer_store.clone(),
            query_manager.clone(),
            config.validators.clone(),
            config.k_bucket_size,
        );

        let content_fetching = ContentFetching::new(
            rpc.clone(),
            datastore.clone(),
            config.datastore_prefix.clone(),
            config.validators.clone(),
            config.selectors.clone(),
            peer_routing.clone(),
            query_manager.clone(),
            config.alpha,
        );

        let providers = Arc::new(Mutex::new(Providers::new(
            NonZeroUsize::new(MAX_PROVIDER_KEYS).unwrap_or(NonZeroUsize::MIN),
            NonZeroUsize::new(MAX_PROVIDERS_PER_KEY).unwrap_or(NonZeroUsize::MIN),
            config.provider_validity,
        )));

        let content_routing = ContentRouting::new(
            rpc.clone(),
            providers.clone(),
            peer_store.clone(),
            peer_routing.clone(),
            query_manager.clone(),
            config.alpha,
            config.k_bucket_size,
        );

        let server = Server::new(
            local.id.clone(),
            routing_table.clone(),
            peer_store.clone(),
            datastore,
            config.datastore_prefix.clone(),
            config.validators.clone(),
            providers,
            config.scope,
            config.max_record_age,
            config.k_bucket_size,
        );

        KadDht {
            inner: Arc::new(Inner {
                config,
                local: local.id,
                routing_table,
                peer_store,
                client_mode,
                rpc,
                query_manager,
                peer_routing,
                content_fetching,
                content_routing,
                server,
                tasks: Mutex::new(None),
            }),
        }
    }

    // === Getters ===

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn scope(&self) -> Scope {
        self.inner.config.scope
    }

    pub fn mode(&self) -> Mode {
        if self.inner.client_mode.load(Ordering::Relaxed) {
            Mode::Client
        } else {
            Mode::Server
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.tasks.lock().is_some()
    }

    /// Number of peers in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.inner.routing_table.read().count()
    }

    /// A snapshot of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.inner.routing_table.read().clone()
    }

    pub fn peer_routing(&self) -> &PeerRouting {
        &self.inner.peer_routing
    }

    pub fn content_fetching(&self) -> &ContentFetching {
        &self.inner.content_fetching
    }

    pub fn content_routing(&self) -> &ContentRouting {
        &self.inner.content_routing
    }

    // === Lifecycle ===

    /// Start accepting lookups and spawn the background tasks.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();

        if tasks.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *tasks = Some(token.clone());
        drop(tasks);

        self.inner.query_manager.start();
        self.inner.content_fetching.start();

        let events = self.inner.routing_table.write().subscribe();
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv_async() => match event {
                        Ok(RoutingTableEvent::Ping { old_contacts, new_contact }) => {
                            this.verify_old_contacts(old_contacts, new_contact, &token).await
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    },
                }
            }
        });

        info!(peer_id = ?self.inner.local, scope = ?self.scope(), mode = ?self.mode(), "KadDht started");
    }

    /// Abort running lookups and stop the background tasks.
    pub fn stop(&self) {
        if let Some(token) = self.inner.tasks.lock().take() {
            token.cancel();
        }

        self.inner.query_manager.stop();
        self.inner.content_fetching.stop();

        debug!(peer_id = ?self.inner.local, "KadDht stopped");
    }

    pub fn set_mode(&self, mode: Mode) {
        let client = mode == Mode::Client;
        let previous = self.inner.client_mode.swap(client, Ordering::Relaxed);

        if previous != client {
            info!(peer_id = ?self.inner.local, scope = ?self.scope(), ?mode, "Switched mode");
        }
    }

    /// Ping the oldest contacts of a full bucket, evicting the unresponsive
    /// ones to make room for `new_contact`.
    async fn verify_old_contacts(
        &self,
        old_contacts: Vec<Peer>,
        new_contact: Peer,
        signal: &CancellationToken,
    ) {
        let timeout = self.inner.config.ping_timeout;

        let pings = old_contacts.into_iter().map(|contact| async move {
            let responded = self.ping(&contact.peer_id, timeout, signal).await;
            (contact, responded)
        });

        let results = futures::future::join_all(pings).await;
        let mut evicted = false;

        for (contact, responded) in results {
            if responded {
                continue;
            }

            debug!(peer = ?contact.peer_id, "Evicting unresponsive contact");
            self.inner.routing_table.write().remove(&contact.kad_id);
            evicted = true;
        }

        if evicted {
            self.inner.routing_table.write().add(new_contact);
        }
    }

    async fn ping(&self, peer: &PeerId, timeout: Duration, signal: &CancellationToken) -> bool {
        let mut events = self
            .inner
            .rpc
            .send_request(peer, Message::ping(), signal, Some(timeout));

        while let Some(event) = events.next().await {
            if matches!(event, QueryEvent::PeerResponse { .. }) {
                return true;
            }
        }

        false
    }

    // === Public Methods ===

    /// Remember a peer and add it to the routing table, e.g. a bootstrap peer.
    pub fn add_peer(&self, info: PeerInfo) -> bool {
        if let Some(info) = self.inner.config.scope.filter(info.clone()) {
            self.inner.peer_store.merge(&info);
        }

        self.inner.routing_table.write().add_peer_id(info.id)
    }

    /// Replace the addresses this node announces for itself.
    pub fn set_addresses(&self, addrs: Vec<Multiaddr>) {
        self.inner
            .peer_store
            .merge(&PeerInfo::new(self.inner.local.clone(), addrs));
    }

    /// Look ourselves up to fill the routing table with our neighbours.
    ///
    /// Returns the routing table size afterwards.
    pub async fn bootstrap(&self) -> Result<usize> {
        if self.inner.routing_table.read().is_empty() {
            return Err(Error::NoPeersInRoutingTable);
        }

        let key = Bytes::copy_from_slice(self.inner.local.as_bytes());
        let mut events = self
            .inner
            .peer_routing
            .get_closest_peers(key, &QueryOptions::default())?;

        while let Some(event) = events.next().await {
            trace!(event = event.name(), "Bootstrap");
        }

        Ok(self.routing_table_size())
    }

    pub fn put(&self, key: Bytes, value: Bytes, options: &QueryOptions) -> Result<EventStream> {
        self.inner.content_fetching.put(key, value, options)
    }

    pub fn get(&self, key: Bytes, options: &QueryOptions) -> Result<EventStream> {
        self.inner.content_fetching.get(key, options)
    }

    pub fn find_peer(&self, id: PeerId, options: &QueryOptions) -> Result<EventStream> {
        self.inner.peer_routing.find_peer(id, options)
    }

    pub fn get_closest_peers(&self, key: Bytes, options: &QueryOptions) -> Result<EventStream> {
        self.inner.peer_routing.get_closest_peers(key, options)
    }

    pub fn find_providers(&self, key: Bytes, options: &QueryOptions) -> Result<EventStream> {
        self.inner.content_routing.find_providers(key, options)
    }

    pub fn provide(&self, key: Bytes, options: &QueryOptions) -> Result<EventStream> {
        self.inner.content_routing.provide(key, options)
    }

    /// Answer a request from `from`.
    ///
    /// Fails with [Error::ClientMode] while in client mode.
    pub fn handle_request(&self, from: &PeerInfo, message: Message) -> Result<Message> {
        if self.mode() == Mode::Client {
            return Err(Error::ClientMode);
        }

        self.inner.server.handle_request(from, message)
    }
}

#[derive(Default)]
/// Configure a [KadDht] before building it.
pub struct KadDhtBuilder {
    config: Config,
    peer_id: Option<PeerId>,
    addrs: Vec<Multiaddr>,
}

impl KadDhtBuilder {
    /// Our identity. Defaults to a random one.
    pub fn peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    /// Addresses we can be reached at.
    pub fn addresses(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.addrs = addrs;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.config.scope = scope;
        self
    }

    pub fn k_bucket_size(mut self, k_bucket_size: usize) -> Self {
        self.config.k_bucket_size = k_bucket_size;
        self
    }

    pub fn prefix_length(mut self, prefix_length: usize) -> Self {
        self.config.prefix_length = prefix_length;
        self
    }

    pub fn ping_count(mut self, ping_count: usize) -> Self {
        self.config.ping_count = ping_count;
        self
    }

    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.config.ping_timeout = ping_timeout;
        self
    }

    pub fn alpha(mut self, alpha: usize) -> Self {
        self.config.alpha = alpha;
        self
    }

    /// Force client (`true`) or server (`false`) mode.
    pub fn client_mode(mut self, client_mode: bool) -> Self {
        self.config.client_mode = Some(client_mode);
        self
    }

    pub fn datastore_prefix(mut self, prefix: &str) -> Self {
        self.config.datastore_prefix = prefix.to_string();
        self
    }

    pub fn max_record_age(mut self, max_record_age: Duration) -> Self {
        self.config.max_record_age = max_record_age;
        self
    }

    /// Validate records under `/<namespace>/` keys with `validator`.
    pub fn validator(mut self, namespace: &str, validator: impl Validator) -> Self {
        self.config.validators.insert(namespace, validator);
        self
    }

    /// Select the best record under `/<namespace>/` keys with `selector`.
    pub fn selector(mut self, namespace: &str, selector: impl Selector) -> Self {
        self.config.selectors.insert(namespace, selector);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn build(
        self,
        network: Arc<dyn Network>,
        datastore: Arc<dyn Datastore>,
        peer_store: Arc<dyn PeerStore>,
    ) -> KadDht {
        let local = PeerInfo::new(self.peer_id.unwrap_or_else(PeerId::random), self.addrs);

        KadDht::new(self.config, local, network, datastore, peer_store)
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::network::RequestOptions;
    use crate::store::{MemoryDatastore, MemoryPeerStore};

    /// Answers pings only from the peers it was told are alive.
    struct Pinger {
        alive: Vec<PeerId>,
    }

    impl Network for Pinger {
        fn send_request(&self, to: PeerId, message: Message, _: RequestOptions) -> EventStream {
            let event = if self.alive.contains(&to) {
                QueryEvent::PeerResponse {
                    from: to,
                    message_type: message.message_type,
                    closer: vec![],
                    providers: vec![],
                    record: None,
                }
            } else {
                QueryEvent::QueryError {
                    from: to,
                    error: Error::Timeout,
                }
            };

            stream::iter([event]).boxed()
        }
    }

    fn dht(network: impl Network) -> KadDht {
        KadDht::builder()
            .client_mode(false)
            .build(
                Arc::new(network),
                Arc::new(MemoryDatastore::new()),
                Arc::new(MemoryPeerStore::new()),
            )
    }

    #[tokio::test]
    async fn client_mode_refuses_requests() {
        let dht = KadDht::builder().build(
            Arc::new(Pinger { alive: vec![] }),
            Arc::new(MemoryDatastore::new()),
            Arc::new(MemoryPeerStore::new()),
        );

        assert_eq!(dht.mode(), Mode::Client);
        assert_eq!(
            dht.handle_request(&PeerInfo::without_addrs(PeerId::random()), Message::ping()),
            Err(Error::ClientMode)
        );

        dht.set_mode(Mode::Server);
        assert!(dht
            .handle_request(&PeerInfo::without_addrs(PeerId::random()), Message::ping())
            .is_ok());
    }

    #[tokio::test]
    async fn lookups_need_start() {
        let dht = dht(Pinger { alive: vec![] });
        dht.add_peer(PeerInfo::without_addrs(PeerId::random()));

        assert!(matches!(
            dht.get_closest_peers(Bytes::from_static(b"key"), &QueryOptions::default()),
            Err(Error::NotStarted)
        ));

        dht.start();
        assert!(dht
            .get_closest_peers(Bytes::from_static(b"key"), &QueryOptions::default())
            .is_ok());

        dht.stop();
        assert!(!dht.is_started());
    }

    #[tokio::test]
    async fn bootstrap_without_peers() {
        let dht = dht(Pinger { alive: vec![] });
        dht.start();

        assert_eq!(dht.bootstrap().await, Err(Error::NoPeersInRoutingTable));
    }

    #[tokio::test]
    async fn unresponsive_contacts_are_evicted() {
        let peers: Vec<PeerId> = (0..200).map(|_| PeerId::random()).collect();
        let alive = peers.clone();

        let dht = KadDht::builder()
            .client_mode(false)
            .k_bucket_size(2)
            .prefix_length(1)
            .ping_count(2)
            .build(
                Arc::new(Pinger { alive }),
                Arc::new(MemoryDatastore::new()),
                Arc::new(MemoryPeerStore::new()),
            );
        dht.start();

        for peer in &peers {
            dht.add_peer(PeerInfo::without_addrs(peer.clone()));
        }
        let before: Vec<PeerId> = dht.routing_table().peers().map(|p| p.peer_id.clone()).collect();
        assert_eq!(before.len(), 4);

        // Everyone in the table answers pings, so nobody is replaced.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after: Vec<PeerId> = dht.routing_table().peers().map(|p| p.peer_id.clone()).collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn dead_contacts_make_room() {
        let dht = KadDht::builder()
            .client_mode(false)
            .k_bucket_size(1)
            .prefix_length(0)
            .ping_count(1)
            .build(
                Arc::new(Pinger { alive: vec![] }),
                Arc::new(MemoryDatastore::new()),
                Arc::new(MemoryPeerStore::new()),
            );
        dht.start();

        let first = PeerId::random();
        let second = PeerId::random();

        assert!(dht.add_peer(PeerInfo::without_addrs(first.clone())));
        assert!(!dht.add_peer(PeerInfo::without_addrs(second.clone())));

        tokio::time::sleep(Duration::from_millis(50)).await;

        let table = dht.routing_table();
        assert!(!table.contains(&first.kad_id()));
        assert!(table.contains(&second.kad_id()));
    }
}
