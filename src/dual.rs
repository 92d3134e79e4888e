//! A LAN and a WAN [KadDht] acting as one.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{MessageType, Multiaddr, PeerId, PeerInfo};
use crate::dht::{KadDht, Mode};
use crate::events::{spawn_stream, EventStream, QueryEvent};
use crate::query::QueryOptions;
use crate::{Error, Result};

/// Events of a [DualKadDht] lookup; a failure of the lookup as a whole is
/// the last item.
pub type DualEventStream = BoxStream<'static, Result<QueryEvent>>;

#[derive(Clone)]
pub struct DualKadDht {
    lan: KadDht,
    wan: KadDht,
    tasks: Arc<Mutex<Option<CancellationToken>>>,
}

impl DualKadDht {
    /// Combine two instances; the LAN one always runs in server mode.
    pub fn new(lan: KadDht, wan: KadDht) -> Self {
        lan.set_mode(Mode::Server);

        Self {
            lan,
            wan,
            tasks: Arc::new(Mutex::new(None)),
        }
    }

    // === Getters ===

    pub fn lan(&self) -> &KadDht {
        &self.lan
    }

    pub fn wan(&self) -> &KadDht {
        &self.wan
    }

    /// Mode of the WAN instance.
    pub fn mode(&self) -> Mode {
        self.wan.mode()
    }

    // === Lifecycle ===

    /// Start both instances, and follow our own address changes from `address_updates`.
    pub fn start(&self, address_updates: flume::Receiver<Vec<Multiaddr>>) {
        let mut tasks = self.tasks.lock();

        if tasks.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *tasks = Some(token.clone());
        drop(tasks);

        self.lan.start();
        self.wan.start();

        let this = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    update = address_updates.recv_async() => match update {
                        Ok(addrs) => this.on_self_addresses(addrs),
                        Err(_) => break,
                    },
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.tasks.lock().take() {
            token.cancel();
        }

        self.lan.stop();
        self.wan.stop();
    }

    /// Switch the WAN instance to server mode while we have a public address,
    /// unless its mode was configured explicitly.
    pub fn on_self_addresses(&self, addrs: Vec<Multiaddr>) {
        self.lan.set_addresses(addrs.clone());
        self.wan.set_addresses(addrs.clone());

        if self.wan.config().client_mode.is_some() {
            return;
        }

        let public = addrs
            .iter()
            .filter(|addr| !addr.is_circuit())
            .any(|addr| addr.is_public());

        match (public, self.wan.mode()) {
            (true, Mode::Client) => {
                info!("Found public address, switching WAN to server mode");
                self.wan.set_mode(Mode::Server);
            }
            (false, Mode::Server) => {
                info!("No public address, switching WAN to client mode");
                self.wan.set_mode(Mode::Client);
            }
            _ => {}
        }
    }

    // === Public Methods ===

    /// Store a value in both DHTs.
    pub fn put(&self, key: Bytes, value: Bytes, options: &QueryOptions) -> Result<DualEventStream> {
        let events = merge(
            self.lan.put(key.clone(), value.clone(), options),
            self.wan.put(key, value, options),
        )?;

        Ok(events.map(Ok).boxed())
    }

    /// Get a value from both DHTs.
    ///
    /// Fails with [Error::NoPeersInRoutingTable] if nobody could be asked.
    pub fn get(&self, key: Bytes, options: &QueryOptions) -> Result<DualEventStream> {
        let mut events = merge(
            self.lan.get(key.clone(), options),
            self.wan.get(key.clone(), options),
        )?;
        let local = self.lan.peer_id().clone();

        Ok(spawn_stream(&options.signal, move |sender, _| async move {
            let mut queried_peers = false;
            let mut found_value = false;

            while let Some(event) = events.next().await {
                match &event {
                    QueryEvent::SendQuery { .. } => queried_peers = true,
                    QueryEvent::Value { .. } => found_value = true,
                    _ => {}
                }

                if !sender.send(Ok(event)).await {
                    return;
                }
            }

            if found_value {
                return;
            }

            if !queried_peers {
                sender.send(Err(Error::NoPeersInRoutingTable)).await;
                return;
            }

            debug!(?key, "Value not found");

            sender
                .send(Ok(QueryEvent::QueryError {
                    from: local,
                    error: Error::NotFound("value not found".to_string()),
                }))
                .await;
        }))
    }

    /// Find a peer in either DHT, ending at the first match.
    pub fn find_peer(&self, id: PeerId, options: &QueryOptions) -> Result<DualEventStream> {
        let mut events = merge(
            self.lan.find_peer(id.clone(), options),
            self.wan.find_peer(id, options),
        )?;

        Ok(spawn_stream(&options.signal, move |sender, _| async move {
            let mut queried_peers = false;

            while let Some(event) = events.next().await {
                let found = match &event {
                    QueryEvent::SendQuery { .. } | QueryEvent::DialPeer { .. } => {
                        queried_peers = true;
                        false
                    }
                    QueryEvent::FinalPeer { .. } => true,
                    _ => false,
                };

                if !sender.send(Ok(event)).await || found {
                    return;
                }
            }

            if !queried_peers {
                sender.send(Err(Error::NoPeersInRoutingTable)).await;
            }
        }))
    }

    /// Closest peers from both DHTs, each yielded once.
    pub fn get_closest_peers(
        &self,
        key: Bytes,
        options: &QueryOptions,
    ) -> Result<DualEventStream> {
        let events = merge(
            self.lan.get_closest_peers(key.clone(), options),
            self.wan.get_closest_peers(key, options),
        )?;

        let mut seen: HashSet<PeerId> = HashSet::new();

        Ok(events
            .filter(move |event| {
                let keep = match event {
                    QueryEvent::FinalPeer { peer, .. } => seen.insert(peer.id.clone()),
                    _ => true,
                };

                std::future::ready(keep)
            })
            .map(Ok)
            .boxed())
    }

    /// Providers from both DHTs, each yielded once.
    pub fn find_providers(&self, key: Bytes, options: &QueryOptions) -> Result<DualEventStream> {
        let events = merge(
            self.lan.find_providers(key.clone(), options),
            self.wan.find_providers(key, options),
        )?;

        let mut seen: HashSet<PeerId> = HashSet::new();

        Ok(events
            .filter_map(move |event| {
                let event = match event {
                    QueryEvent::Provider { from, providers } => {
                        let providers: Vec<PeerInfo> = providers
                            .into_iter()
                            .filter(|p| seen.insert(p.id.clone()))
                            .collect();

                        (!providers.is_empty()).then_some(QueryEvent::Provider { from, providers })
                    }
                    event => Some(event),
                };

                std::future::ready(event.map(Ok))
            })
            .boxed())
    }

    /// Announce ourselves as a provider of `key`; to the WAN only in server mode.
    ///
    /// Fails with [Error::ProvidesFailed] if no peer acknowledged.
    pub fn provide(&self, key: Bytes, options: &QueryOptions) -> Result<DualEventStream> {
        let lan = self.lan.provide(key.clone(), options);

        let mut events = if self.wan.mode() == Mode::Server {
            merge(lan, self.wan.provide(key, options))?
        } else {
            lan?
        };

        Ok(spawn_stream(&options.signal, move |sender, _| async move {
            let mut success = 0;
            let mut errors = Vec::new();

            while let Some(event) = events.next().await {
                match &event {
                    QueryEvent::PeerResponse {
                        message_type: MessageType::AddProvider,
                        ..
                    } => success += 1,
                    QueryEvent::QueryError { error, .. } => errors.push(error.clone()),
                    _ => {}
                }

                if !sender.send(Ok(event)).await {
                    return;
                }
            }

            if success == 0 {
                warn!(errors = errors.len(), "Failed to provide to any peer");
                sender.send(Err(Error::ProvidesFailed { errors })).await;
            }
        }))
    }
}

/// Interleave the events of both instances, tolerating one of them failing to start.
///
/// Fails with [Error::LookupFailed] if neither started, or [Error::Aborted]
/// if that was because of the signal.
fn merge(lan: Result<EventStream>, wan: Result<EventStream>) -> Result<EventStream> {
    match (lan, wan) {
        (Ok(lan), Ok(wan)) => Ok(stream::select(lan, wan).boxed()),
        (Ok(events), Err(error)) | (Err(error), Ok(events)) => {
            debug!(?error, "One DHT failed to start the lookup");
            Ok(events)
        }
        (Err(Error::Aborted), Err(_)) | (Err(_), Err(Error::Aborted)) => Err(Error::Aborted),
        (Err(lan), Err(wan)) => {
            warn!(?lan, ?wan, "Both DHTs failed to start the lookup");
            Err(Error::LookupFailed)
        }
    }
}
