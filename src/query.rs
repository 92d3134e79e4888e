//! Iterative lookups: repeatedly query the closest known peers to a key,
//! learning closer peers from their responses, until no unvisited candidate
//! is left.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::common::{Distance, KadId, PeerDistanceList, PeerId, PeerInfo, RoutingTable};
use crate::events::{spawn_stream, EventStream, QueryEvent, StreamSender};
use crate::{Error, Result};

#[derive(Debug, Clone)]
/// Options shared by every lookup.
pub struct QueryOptions {
    /// Aborts the lookup when cancelled.
    pub signal: CancellationToken,
    /// Answer from local state when possible.
    pub use_cache: bool,
    /// Go to the network when local state has no answer.
    pub use_network: bool,
    /// Timeout of every request; when `None`, each lookup picks its own.
    pub timeout: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            signal: CancellationToken::new(),
            use_cache: true,
            use_network: true,
            timeout: None,
        }
    }
}

impl QueryOptions {
    pub fn with_signal(signal: CancellationToken) -> Self {
        Self {
            signal,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
/// What a query function is asked to do: query `peer` about `key`.
pub struct QueryContext {
    pub key: Bytes,
    pub peer: PeerId,
    /// Cancelled when the lookup ends or is aborted.
    pub signal: CancellationToken,
    /// [QueryOptions::timeout] of the lookup.
    pub timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct QueryManager {
    inner: Arc<Inner>,
}

struct Inner {
    local: PeerId,
    routing_table: Arc<RwLock<RoutingTable>>,
    alpha: usize,
    k: usize,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl QueryManager {
    pub fn new(
        local: PeerId,
        routing_table: Arc<RwLock<RoutingTable>>,
        alpha: usize,
        k: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                routing_table,
                alpha: alpha.max(1),
                k,
                shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self) {
        let mut shutdown = self.inner.shutdown.lock();

        if shutdown.is_none() {
            *shutdown = Some(CancellationToken::new());
        }
    }

    /// Stop accepting lookups and abort every running one.
    pub fn stop(&self) {
        if let Some(shutdown) = self.inner.shutdown.lock().take() {
            shutdown.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.shutdown.lock().is_some()
    }

    /// Run an iterative lookup for `key`, calling `query_func` for every peer visited.
    ///
    /// Events of all query functions are forwarded as they arrive. The `closer`
    /// peers of every [QueryEvent::PeerResponse] become candidates for the
    /// next round.
    pub fn run<F>(&self, key: &[u8], query_func: F, options: &QueryOptions) -> Result<EventStream>
    where
        F: Fn(QueryContext) -> EventStream + Send + Sync + 'static,
    {
        let shutdown = self
            .inner
            .shutdown
            .lock()
            .clone()
            .ok_or(Error::NotStarted)?;

        if options.signal.is_cancelled() {
            return Err(Error::Aborted);
        }

        let query = IterativeQuery::new(
            Bytes::copy_from_slice(key),
            self.inner.local.clone(),
            self.inner.alpha,
            self.inner.k,
            options.timeout,
            query_func,
        )
        .seed(&self.inner.routing_table.read());

        Ok(spawn_stream(&options.signal, move |sender, signal| {
            query.drive(sender, signal, shutdown)
        }))
    }
}

/// Per peer event stream, ending with `(peer, None)` once the peer is done.
type PeerEvents = BoxStream<'static, (PeerId, Option<QueryEvent>)>;


struct IterativeQuery<F> {
    key: Bytes,
    target: KadId,
    local: PeerId,
    alpha: usize,
    k: usize,
    timeout: Option<Duration>,
    query_func: F,
    /// Closest peers seen so far, deciding who is worth a visit.
    closest: PeerDistanceList,
    /// Unvisited candidates, closest first.
    candidates: BTreeMap<Distance, PeerId>,
    seen: HashSet<PeerId>,
    visited: usize,
}

impl<F> IterativeQuery<F>
where
    F: Fn(QueryContext) -> EventStream + Send + Sync + 'static,
{
    fn new(
        key: Bytes,
        local: PeerId,
        alpha: usize,
        k: usize,
        timeout: Option<Duration>,
        query_func: F,
    ) -> Self {
        let target = KadId::digest(&key);

        trace!(?target, "New Query");

        Self {
            key,
            target,
            local,
            alpha,
            k,
            timeout,
            query_func,
            closest: PeerDistanceList::new(target, k),
            candidates: BTreeMap::new(),
            seen: HashSet::new(),
            visited: 0,
        }
    }

    fn seed(mut self, routing_table: &RoutingTable) -> Self {
        for peer in routing_table.closest(&self.target, self.k) {
            self.add_candidate(PeerInfo::without_addrs(peer));
        }

        self
    }

    /// Add a candidate to visit if it is among the closest peers seen so far.
    fn add_candidate(&mut self, peer: PeerInfo) {
        if peer.id == self.local || self.seen.contains(&peer.id) {
            return;
        }

        let kad_id = peer.id.kad_id();

        if !self.closest.is_closer(&kad_id) {
            return;
        }

        self.seen.insert(peer.id.clone());
        self.candidates
            .insert(kad_id.distance(&self.target), peer.id.clone());
        self.closest.add_with_kad_id(peer, kad_id);
    }

    /// Start querying the closest unvisited candidate.
    fn visit_closest(&mut self, signal: &CancellationToken) -> Option<PeerEvents> {
        let (_, peer) = self.candidates.pop_first()?;
        self.visited += 1;

        let context = QueryContext {
            key: self.key.clone(),
            peer: peer.clone(),
            signal: signal.child_token(),
            timeout: self.timeout,
        };

        let done = peer.clone();
        let events = (self.query_func)(context)
            .map(move |event| (peer.clone(), Some(event)))
            .chain(stream::once(async move { (done, None) }));

        Some(events.boxed())
    }

    async fn drive(
        mut self,
        sender: StreamSender<QueryEvent>,
        signal: CancellationToken,
        shutdown: CancellationToken,
    ) {
        if self.candidates.is_empty() {
            warn!(target = ?self.target, "Running query with no peers in the routing table");
            return;
        }

        let mut inflight: SelectAll<PeerEvents> = SelectAll::new();
        let mut running = 0;

        loop {
            while running < self.alpha {
                match self.visit_closest(&signal) {
                    Some(events) => {
                        inflight.push(events);
                        running += 1;
                    }
                    None => break,
                }
            }

            if running == 0 {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                _ = shutdown.cancelled() => break,
                next = inflight.next() => next,
            };

            match next {
                Some((_, None)) => running -= 1,
                Some((peer, Some(event))) => {
                    if let QueryEvent::PeerResponse { closer, .. } = &event {
                        trace!(?peer, closer = closer.len(), "Got response");

                        for candidate in closer {
                            self.add_candidate(candidate.clone());
                        }
                    }

                    if !sender.send(event).await {
                        break;
                    }
                }
                None => break,
            }
        }

        debug!(
            target = ?self.target,
            visited = self.visited,
            closest = self.closest.len(),
            "Query done"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::common::{MessageType, RoutingTableConfig};

    /// A fake network where every peer knows a fixed set of other peers.
    struct Topology {
        neighbours: HashMap<PeerId, Vec<PeerInfo>>,
        asked: Arc<Mutex<Vec<PeerId>>>,
    }

    impl Topology {
        fn query(self: &Arc<Self>, context: QueryContext) -> EventStream {
            self.asked.lock().push(context.peer.clone());

            let closer = self
                .neighbours
                .get(&context.peer)
                .cloned()
                .unwrap_or_default();

            stream::iter([
                QueryEvent::SendQuery {
                    to: context.peer.clone(),
                    message_type: MessageType::FindNode,
                },
                QueryEvent::PeerResponse {
                    from: context.peer,
                    message_type: MessageType::FindNode,
                    closer,
                    providers: vec![],
                    record: None,
                },
            ])
            .boxed()
        }
    }

    fn manager(local: &PeerId, seeds: &[PeerId]) -> QueryManager {
        let mut table = RoutingTable::new(local.kad_id(), RoutingTableConfig::default());
        for seed in seeds {
            table.add_peer_id(seed.clone());
        }

        let manager = QueryManager::new(local.clone(), Arc::new(RwLock::new(table)), 3, 20);
        manager.start();
        manager
    }

    fn chain(length: usize) -> (Vec<PeerId>, Arc<Topology>) {
        let peers: Vec<PeerId> = (0..length).map(|_| PeerId::random()).collect();
        let mut neighbours = HashMap::new();

        for window in peers.windows(2) {
            neighbours.insert(
                window[0].clone(),
                vec![PeerInfo::without_addrs(window[1].clone())],
            );
        }

        let topology = Arc::new(Topology {
            neighbours,
            asked: Arc::new(Mutex::new(Vec::new())),
        });

        (peers, topology)
    }

    #[tokio::test]
    async fn not_started() {
        let local = PeerId::random();
        let manager = manager(&local, &[]);
        manager.stop();

        let result = manager.run(b"key", |_| stream::empty().boxed(), &QueryOptions::default());

        assert!(matches!(result, Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn already_aborted() {
        let local = PeerId::random();
        let manager = manager(&local, &[PeerId::random()]);
        let options = QueryOptions::default();
        options.signal.cancel();

        let result = manager.run(b"key", |_| stream::empty().boxed(), &options);

        assert!(matches!(result, Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn empty_routing_table_yields_nothing() {
        let local = PeerId::random();
        let manager = manager(&local, &[]);

        let events: Vec<_> = manager
            .run(b"key", |_| stream::empty().boxed(), &QueryOptions::default())
            .unwrap()
            .collect()
            .await;

        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn follows_closer_peers_and_visits_each_once() {
        let local = PeerId::random();
        let (peers, topology) = chain(6);
        let manager = manager(&local, &peers[..1]);

        let query = topology.clone();
        let events: Vec<_> = manager
            .run(b"key", move |context| query.query(context), &QueryOptions::default())
            .unwrap()
            .collect()
            .await;

        let responses = events
            .iter()
            .filter(|event| matches!(event, QueryEvent::PeerResponse { .. }))
            .count();
        assert_eq!(responses, 6);

        let asked = topology.asked.lock().clone();
        let unique: HashSet<_> = asked.iter().cloned().collect();
        assert_eq!(asked.len(), unique.len());
        assert_eq!(unique, peers.into_iter().collect());
    }

    #[tokio::test]
    async fn context_carries_the_request_timeout() {
        let local = PeerId::random();
        let manager = manager(&local, &[PeerId::random()]);
        let timeouts = Arc::new(Mutex::new(Vec::new()));

        let options = QueryOptions {
            timeout: Some(Duration::from_secs(3)),
            ..Default::default()
        };

        let seen = timeouts.clone();
        let _: Vec<_> = manager
            .run(
                b"key",
                move |context| {
                    seen.lock().push(context.timeout);
                    stream::empty().boxed()
                },
                &options,
            )
            .unwrap()
            .collect()
            .await;

        assert_eq!(timeouts.lock().clone(), vec![Some(Duration::from_secs(3))]);
    }

    #[tokio::test]
    async fn never_queries_self() {
        let local = PeerId::random();
        let other = PeerId::random();

        let topology = Arc::new(Topology {
            neighbours: HashMap::from([(
                other.clone(),
                vec![PeerInfo::without_addrs(local.clone())],
            )]),
            asked: Arc::new(Mutex::new(Vec::new())),
        });

        let manager = manager(&local, &[other.clone()]);
        let query = topology.clone();
        let _: Vec<_> = manager
            .run(b"key", move |context| query.query(context), &QueryOptions::default())
            .unwrap()
            .collect()
            .await;

        assert_eq!(topology.asked.lock().clone(), vec![other]);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_alpha() {
        let local = PeerId::random();
        let seeds: Vec<PeerId> = (0..10).map(|_| PeerId::random()).collect();
        let manager = manager(&local, &seeds);

        let inflight = Arc::new(Mutex::new((0_usize, 0_usize)));
        let counter = inflight.clone();

        let events: Vec<_> = manager
            .run(
                b"key",
                move |context| {
                    let counter = counter.clone();
                    stream::once(async move {
                        {
                            let mut guard = counter.lock();
                            guard.0 += 1;
                            guard.1 = guard.1.max(guard.0);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        counter.lock().0 -= 1;

                        QueryEvent::QueryError {
                            from: context.peer,
                            error: Error::Timeout,
                        }
                    })
                    .boxed()
                },
                &QueryOptions::default(),
            )
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 10);
        assert!(inflight.lock().1 <= 3);
    }

    #[tokio::test]
    async fn abort_ends_the_stream() {
        let local = PeerId::random();
        let seeds: Vec<PeerId> = (0..5).map(|_| PeerId::random()).collect();
        let manager = manager(&local, &seeds);
        let options = QueryOptions::default();

        let mut events = manager
            .run(
                b"key",
                |context| {
                    stream::once(async move {
                        QueryEvent::SendQuery {
                            to: context.peer,
                            message_type: MessageType::FindNode,
                        }
                    })
                    .chain(stream::pending())
                    .boxed()
                },
                &options,
            )
            .unwrap();

        assert!(events.next().await.is_some());
        options.signal.cancel();

        let rest = tokio::time::timeout(Duration::from_secs(1), events.collect::<Vec<_>>())
            .await
            .unwrap();
        assert!(rest.iter().all(|event| event.name() != "PEER_RESPONSE"));
    }

    #[tokio::test]
    async fn stop_aborts_running_queries() {
        let local = PeerId::random();
        let manager = manager(&local, &[PeerId::random()]);

        let events = manager
            .run(b"key", |_| stream::pending().boxed(), &QueryOptions::default())
            .unwrap();

        manager.stop();

        let events = tokio::time::timeout(Duration::from_secs(1), events.collect::<Vec<_>>())
            .await
            .unwrap();
        assert!(events.is_empty());
    }
}
