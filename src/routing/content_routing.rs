//! Announcing and finding the providers of content.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{Message, MessageType, PeerId, PeerInfo};
use crate::events::{abortable, spawn_stream, EventStream, QueryEvent};
use crate::query::{QueryContext, QueryManager, QueryOptions};
use crate::routing::PeerRouting;
use crate::rpc::Rpc;
use crate::server::Providers;
use crate::store::PeerStore;
use crate::{Error, Result};

#[derive(Clone)]
pub struct ContentRouting {
    local: PeerId,
    providers: Arc<Mutex<Providers>>,
    peer_store: Arc<dyn PeerStore>,
    peer_routing: PeerRouting,
    query_manager: QueryManager,
    rpc: Rpc,
    alpha: usize,
    k: usize,
}

impl ContentRouting {
    pub(crate) fn new(
        rpc: Rpc,
        providers: Arc<Mutex<Providers>>,
        peer_store: Arc<dyn PeerStore>,
        peer_routing: PeerRouting,
        query_manager: QueryManager,
        alpha: usize,
        k: usize,
    ) -> Self {
        Self {
            local: rpc.local().clone(),
            providers,
            peer_store,
            peer_routing,
            query_manager,
            rpc,
            alpha: alpha.max(1),
            k,
        }
    }

    fn local_info(&self) -> PeerInfo {
        self.peer_store
            .get(&self.local)
            .unwrap_or_else(|| PeerInfo::without_addrs(self.local.clone()))
    }

    /// Announce this node as a provider of `key` to the closest peers to it.
    pub fn provide(&self, key: Bytes, options: &QueryOptions) -> Result<EventStream> {
        if options.signal.is_cancelled() {
            return Err(Error::Aborted);
        }

        self.providers
            .lock()
            .add_provider(key.clone(), self.local.clone());

        let message = Message::new(MessageType::AddProvider, key.clone())
            .with_provider_peers(vec![self.local_info()]);

        let closest = self.peer_routing.get_closest_peers(key, options)?;
        let rpc = self.rpc.clone();
        let signal = options.signal.clone();

        let events = closest
            .map(move |event| {
                let rpc = rpc.clone();
                let message = message.clone();
                let signal = signal.clone();

                async move {
                    match event {
                        QueryEvent::FinalPeer { peer, .. } => {
                            trace!(peer = ?peer.id, "Sending provider record");

                            rpc.send_request(&peer.id, message, &signal, None)
                                .collect::<Vec<_>>()
                                .await
                        }
                        event => vec![event],
                    }
                }
            })
            .buffer_unordered(self.alpha)
            .flat_map(stream::iter)
            .boxed();

        Ok(abortable(events, &options.signal))
    }

    /// Search for up to `k_bucket_size` providers of `key`, local ones first.
    pub fn find_providers(&self, key: Bytes, options: &QueryOptions) -> Result<EventStream> {
        if options.signal.is_cancelled() {
            return Err(Error::Aborted);
        }

        let k = self.k;
        let local_providers: Vec<PeerInfo> = self
            .providers
            .lock()
            .get_providers(&key, k)
            .into_iter()
            .map(|id| {
                if id == self.local {
                    self.local_info()
                } else {
                    self.peer_routing.peer_info(id)
                }
            })
            .collect();

        let mut found: HashSet<PeerId> = local_providers.iter().map(|p| p.id.clone()).collect();
        let mut local_events = Vec::new();

        if !local_providers.is_empty() {
            debug!(?key, count = local_providers.len(), "Found local providers");

            local_events.push(QueryEvent::PeerResponse {
                from: self.local.clone(),
                message_type: MessageType::GetProviders,
                closer: Vec::new(),
                providers: local_providers.clone(),
                record: None,
            });
            local_events.push(QueryEvent::Provider {
                from: self.local.clone(),
                providers: local_providers,
            });
        }

        if found.len() >= k {
            return Ok(stream::iter(local_events).boxed());
        }

        let rpc = self.rpc.clone();

        let query_func = move |context: QueryContext| {
            rpc.send_request(
                &context.peer,
                Message::new(MessageType::GetProviders, context.key),
                &context.signal,
                context.timeout,
            )
        };

        let mut events = self.query_manager.run(&key, query_func, options)?;

        Ok(spawn_stream(&options.signal, move |sender, _| async move {
            for event in local_events {
                if !sender.send(event).await {
                    return;
                }
            }

            while let Some(event) = events.next().await {
                let new_providers = match &event {
                    QueryEvent::PeerResponse {
                        from, providers, ..
                    } if !providers.is_empty() => {
                        let new: Vec<PeerInfo> = providers
                            .iter()
                            .filter(|p| found.insert(p.id.clone()))
                            .cloned()
                            .collect();

                        (!new.is_empty()).then(|| QueryEvent::Provider {
                            from: from.clone(),
                            providers: new,
                        })
                    }
                    _ => None,
                };

                if !sender.send(event).await {
                    return;
                }

                if let Some(provider) = new_providers {
                    if !sender.send(provider).await {
                        return;
                    }
                }

                if found.len() >= k {
                    return;
                }
            }
        }))
    }
}
