//! Finding peers, and asking single peers for values.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::common::{
    DhtRecord, KadId, Message, MessageType, PeerDistanceList, PeerId, PeerInfo, RoutingTable,
};
use crate::events::{spawn_stream, EventStream, QueryEvent};
use crate::query::{QueryContext, QueryManager, QueryOptions};
use crate::record::Validators;
use crate::rpc::Rpc;
use crate::store::PeerStore;
use crate::{Error, Result};

#[derive(Clone)]
pub struct PeerRouting {
    local: PeerId,
    routing_table: Arc<RwLock<RoutingTable>>,
    peer_store: Arc<dyn PeerStore>,
    rpc: Rpc,
    query_manager: QueryManager,
    validators: Validators,
    k: usize,
}

impl PeerRouting {
    pub(crate) fn new(
        rpc: Rpc,
        routing_table: Arc<RwLock<RoutingTable>>,
        peer_store: Arc<dyn PeerStore>,
        query_manager: QueryManager,
        validators: Validators,
        k: usize,
    ) -> Self {
        Self {
            local: rpc.local().clone(),
            routing_table,
            peer_store,
            rpc,
            query_manager,
            validators,
            k,
        }
    }

    /// Addresses of `peer` if it is in the routing table or the peer store.
    pub fn find_peer_local(&self, peer: &PeerId) -> Option<PeerInfo> {
        let in_table = self.routing_table.read().contains(&peer.kad_id());

        match self.peer_store.get(peer) {
            Some(info) => Some(info),
            None if in_table => Some(PeerInfo::without_addrs(peer.clone())),
            None => None,
        }
    }

    /// Search for a peer, yielding a [QueryEvent::FinalPeer] as soon as it is found.
    ///
    /// The lookup ends with a [QueryEvent::QueryError] if the peer could not be found.
    pub fn find_peer(&self, id: PeerId, options: &QueryOptions) -> Result<EventStream> {
        if options.signal.is_cancelled() {
            return Err(Error::Aborted);
        }

        if options.use_cache {
            if let Some(peer) = self.find_peer_local(&id) {
                debug!(?id, "Found peer locally");

                return Ok(stream::iter([QueryEvent::FinalPeer {
                    from: self.local.clone(),
                    peer,
                }])
                .boxed());
            }
        }

        if !options.use_network {
            return Ok(stream::iter([QueryEvent::QueryError {
                from: self.local.clone(),
                error: Error::NotFound(format!("peer {id} not found locally")),
            }])
            .boxed());
        }

        let rpc = self.rpc.clone();
        let target = id.clone();

        let query_func = move |context: QueryContext| {
            let target = target.clone();

            rpc.send_request(
                &context.peer,
                Message::new(MessageType::FindNode, context.key.clone()),
                &context.signal,
                context.timeout,
            )
            .flat_map(move |event| {
                let found = match &event {
                    QueryEvent::PeerResponse { from, closer, .. } => closer
                        .iter()
                        .find(|peer| peer.id == target)
                        .map(|peer| QueryEvent::FinalPeer {
                            from: from.clone(),
                            peer: peer.clone(),
                        }),
                    _ => None,
                };

                stream::iter(std::iter::once(event).chain(found))
            })
            .boxed()
        };

        let mut events = self
            .query_manager
            .run(id.as_bytes(), query_func, options)?;
        let local = self.local.clone();

        Ok(spawn_stream(&options.signal, move |sender, _| async move {
            while let Some(event) = events.next().await {
                let found = matches!(event, QueryEvent::FinalPeer { .. });

                if !sender.send(event).await || found {
                    return;
                }
            }

            sender
                .send(QueryEvent::QueryError {
                    from: local,
                    error: Error::NotFound(format!("peer {id} not found")),
                })
                .await;
        }))
    }

    /// Lookup the closest peers to `key`, yielding them as [QueryEvent::FinalPeer]s
    /// (closest first) once the lookup is done.
    pub fn get_closest_peers(&self, key: Bytes, options: &QueryOptions) -> Result<EventStream> {
        let target = KadId::digest(&key);
        let mut closest = PeerDistanceList::new(target, self.k);

        for peer in self.routing_table.read().closest(&target, self.k) {
            closest.add(self.peer_info(peer));
        }

        let rpc = self.rpc.clone();

        let query_func = move |context: QueryContext| {
            trace!(peer = ?context.peer, "Asking for closer peers");

            rpc.send_request(
                &context.peer,
                Message::new(MessageType::FindNode, context.key),
                &context.signal,
                context.timeout,
            )
        };

        let mut events = self.query_manager.run(&key, query_func, options)?;
        let local = self.local.clone();

        Ok(spawn_stream(&options.signal, move |sender, _| async move {
            while let Some(event) = events.next().await {
                if let QueryEvent::PeerResponse { closer, .. } = &event {
                    for peer in closer {
                        closest.add(peer.clone());
                    }
                }

                if !sender.send(event).await {
                    return;
                }
            }

            for peer in closest {
                let event = QueryEvent::FinalPeer {
                    from: local.clone(),
                    peer,
                };

                if !sender.send(event).await {
                    return;
                }
            }
        }))
    }

    /// Ask `peer` for the record under `key`, and for peers closer to it.
    ///
    /// A record that fails validation turns the response into a [QueryEvent::QueryError].
    pub fn get_value_or_peers(
        &self,
        peer: &PeerId,
        key: Bytes,
        signal: &CancellationToken,
        timeout: Option<Duration>,
    ) -> EventStream {
        let validators = self.validators.clone();

        self.rpc
            .send_request(peer, Message::new(MessageType::GetValue, key), signal, timeout)
            .map(move |event| {
                if let QueryEvent::PeerResponse {
                    from,
                    record: Some(record),
                    ..
                } = &event
                {
                    if let Err(error) = verify_record_online(&validators, record) {
                        debug!(?from, ?error, "Received invalid record");

                        return QueryEvent::QueryError {
                            from: from.clone(),
                            error,
                        };
                    }
                }

                event
            })
            .boxed()
    }

    /// Peers in the routing table that are closer to `key` than `closer_than`.
    pub fn get_closer_peers_offline(&self, key: &[u8], closer_than: &PeerId) -> Vec<PeerInfo> {
        let target = KadId::digest(key);
        let threshold = closer_than.kad_id().distance(&target);

        let peers = self.routing_table.read().closest(&target, self.k);

        let closer: Vec<PeerInfo> = peers
            .into_iter()
            .filter(|peer| peer != closer_than && peer.kad_id().distance(&target) < threshold)
            .map(|peer| self.peer_info(peer))
            .collect();

        trace!(
            closer_than = ?closer_than,
            found = closer.len(),
            "Closer peers offline"
        );

        closer
    }

    /// Known addresses of a routing table peer.
    pub(crate) fn peer_info(&self, peer: PeerId) -> PeerInfo {
        self.peer_store
            .get(&peer)
            .unwrap_or_else(|| PeerInfo::without_addrs(peer))
    }
}

/// Records received from the network must carry the time they were received.
fn verify_record_online(validators: &Validators, record: &DhtRecord) -> Result<()> {
    if record.time_received().is_none() {
        return Err(Error::InvalidRecord(
            "record is missing time_received".to_string(),
        ));
    }

    validators.verify_record(record)
}
