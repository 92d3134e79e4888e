//! Answering requests from other peers.

mod providers;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::common::{DhtRecord, KadId, Message, MessageType, PeerId, PeerInfo, RoutingTable};
use crate::config::Scope;
use crate::record::Validators;
use crate::store::{record_key, Datastore, PeerStore};
use crate::{Error, Result};

pub use providers::{Providers, MAX_PROVIDERS_PER_KEY, MAX_PROVIDER_KEYS};

/// Handles incoming requests on behalf of a [crate::KadDht] in server mode.
#[derive(Clone)]
pub(crate) struct Server {
    local: PeerId,
    routing_table: Arc<RwLock<RoutingTable>>,
    peer_store: Arc<dyn PeerStore>,
    datastore: Arc<dyn Datastore>,
    datastore_prefix: String,
    validators: Validators,
    providers: Arc<Mutex<Providers>>,
    scope: Scope,
    max_record_age: Duration,
    k: usize,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: PeerId,
        routing_table: Arc<RwLock<RoutingTable>>,
        peer_store: Arc<dyn PeerStore>,
        datastore: Arc<dyn Datastore>,
        datastore_prefix: String,
        validators: Validators,
        providers: Arc<Mutex<Providers>>,
        scope: Scope,
        max_record_age: Duration,
        k: usize,
    ) -> Self {
        Self {
            local,
            routing_table,
            peer_store,
            datastore,
            datastore_prefix,
            validators,
            providers,
            scope,
            max_record_age,
            k,
        }
    }

    pub fn handle_request(&self, from: &PeerInfo, message: Message) -> Result<Message> {
        trace!(from = ?from.id, message_type = %message.message_type, "Incoming request");

        if !message.client_mode && from.id != self.local {
            if let Some(info) = self.scope.filter(from.clone()) {
                self.peer_store.merge(&info);
            }
            self.routing_table.write().add_peer_id(from.id.clone());
        }

        match message.message_type {
            MessageType::Ping => Ok(message),
            MessageType::FindNode => self.find_node(from, message),
            MessageType::GetValue => self.get_value(from, message),
            MessageType::PutValue => self.put_value(message),
            MessageType::AddProvider => self.add_provider(from, message),
            MessageType::GetProviders => self.get_providers(from, message),
        }
    }

    /// Closest peers to `key` we know of, excluding the requester.
    fn closer_peers(&self, key: &[u8], requester: &PeerId) -> Vec<PeerInfo> {
        let target = KadId::digest(key);

        self.routing_table
            .read()
            .closest(&target, self.k)
            .into_iter()
            .filter(|peer| peer != requester)
            .map(|peer| {
                self.peer_store
                    .get(&peer)
                    .unwrap_or_else(|| PeerInfo::without_addrs(peer))
            })
            .filter_map(|peer| self.scope.filter(peer))
            .collect()
    }

    fn local_info(&self) -> PeerInfo {
        self.peer_store
            .get(&self.local)
            .unwrap_or_else(|| PeerInfo::without_addrs(self.local.clone()))
    }

    fn find_node(&self, from: &PeerInfo, message: Message) -> Result<Message> {
        let closer = if message.key.as_ref() == self.local.as_bytes() {
            vec![self.local_info()]
        } else {
            self.closer_peers(&message.key, &from.id)
        };

        Ok(Message::new(MessageType::FindNode, message.key).with_closer_peers(closer))
    }

    fn get_value(&self, from: &PeerInfo, message: Message) -> Result<Message> {
        if message.key.is_empty() {
            return Err(Error::InvalidRecord("invalid key".to_string()));
        }

        let closer = self.closer_peers(&message.key, &from.id);
        let mut response =
            Message::new(MessageType::GetValue, message.key.clone()).with_closer_peers(closer);

        if let Some(record) = self.check_local_datastore(&message.key)? {
            response = response.with_record(record);
        }

        Ok(response)
    }

    /// The stored record under `key`, deleting it if it is too old to serve.
    fn check_local_datastore(&self, key: &[u8]) -> Result<Option<DhtRecord>> {
        let datastore_key = record_key(&self.datastore_prefix, key);

        let Some(stored) = self.datastore.get(&datastore_key)? else {
            return Ok(None);
        };

        let record = DhtRecord::deserialize(&stored)?;

        match record.age() {
            Some(age) if age <= self.max_record_age => Ok(Some(record)),
            _ => {
                debug!(?key, "Deleting expired record");
                self.datastore.delete(&datastore_key)?;

                Ok(None)
            }
        }
    }

    fn put_value(&self, message: Message) -> Result<Message> {
        let Some(record) = &message.record else {
            return Err(Error::InvalidRecord("empty record".to_string()));
        };

        self.validators.verify_record(record)?;

        let record = record.received_at(SystemTime::now());
        self.datastore.put(
            &record_key(&self.datastore_prefix, record.key()),
            record.serialize()?.into(),
        )?;

        debug!(key = ?record.key(), "Stored record");

        Ok(message)
    }

    fn add_provider(&self, from: &PeerInfo, message: Message) -> Result<Message> {
        if message.key.is_empty() {
            return Err(Error::InvalidRecord("missing key".to_string()));
        }

        for provider in &message.provider_peers {
            if provider.id != from.id {
                debug!(provider = ?provider.id, from = ?from.id, "Ignoring provider record for another peer");
                continue;
            }

            self.peer_store.merge(provider);
            self.providers
                .lock()
                .add_provider(message.key.clone(), provider.id.clone());
        }

        Ok(message)
    }

    fn get_providers(&self, from: &PeerInfo, message: Message) -> Result<Message> {
        if message.key.is_empty() {
            return Err(Error::InvalidRecord("missing key".to_string()));
        }

        let providers: Vec<PeerInfo> = self
            .providers
            .lock()
            .get_providers(&message.key, self.k)
            .into_iter()
            .map(|id| {
                if id == self.local {
                    self.local_info()
                } else {
                    self.peer_store
                        .get(&id)
                        .unwrap_or_else(|| PeerInfo::without_addrs(id))
                }
            })
            .collect();

        let closer = self.closer_peers(&message.key, &from.id);

        Ok(Message::new(MessageType::GetProviders, message.key)
            .with_closer_peers(closer)
            .with_provider_peers(providers))
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use bytes::Bytes;

    use super::*;
    use crate::common::RoutingTableConfig;
    use crate::config::{MAX_RECORD_AGE, PROVIDERS_VALIDITY};
    use crate::store::{MemoryDatastore, MemoryPeerStore};

    fn server() -> (Server, Arc<MemoryDatastore>) {
        let local = PeerId::random();
        let datastore = Arc::new(MemoryDatastore::new());

        let server = Server::new(
            local.clone(),
            Arc::new(RwLock::new(RoutingTable::new(
                local.kad_id(),
                RoutingTableConfig::default(),
            ))),
            Arc::new(MemoryPeerStore::new()),
            datastore.clone(),
            "/dht".to_string(),
            Validators::empty(),
            Arc::new(Mutex::new(Providers::new(
                NonZeroUsize::new(10).unwrap(),
                NonZeroUsize::new(10).unwrap(),
                PROVIDERS_VALIDITY,
            ))),
            Scope::Any,
            MAX_RECORD_AGE,
            20,
        );

        (server, datastore)
    }

    fn peer() -> PeerInfo {
        PeerInfo::new(PeerId::random(), vec!["/ip4/1.2.3.4/tcp/4001".into()])
    }

    #[test]
    fn ping_is_echoed_and_sender_added() {
        let (server, _) = server();
        let from = peer();

        let response = server.handle_request(&from, Message::ping()).unwrap();

        assert_eq!(response, Message::ping());
        assert!(server.routing_table.read().contains(&from.id.kad_id()));
        assert_eq!(server.peer_store.get(&from.id), Some(from));
    }

    #[test]
    fn client_mode_senders_are_not_added() {
        let (server, _) = server();
        let mut message = Message::ping();
        message.client_mode = true;

        server.handle_request(&peer(), message).unwrap();

        assert!(server.routing_table.read().is_empty());
    }

    #[test]
    fn find_node_excludes_requester() {
        let (server, _) = server();
        let a = peer();
        let b = peer();

        server.handle_request(&a, Message::ping()).unwrap();
        server.handle_request(&b, Message::ping()).unwrap();

        let response = server
            .handle_request(&a, Message::new(MessageType::FindNode, a.id.as_bytes().to_vec()))
            .unwrap();

        assert_eq!(response.closer_peers, vec![b]);
    }

    #[test]
    fn find_node_for_own_id() {
        let (server, _) = server();
        let key = server.local.as_bytes().to_vec();

        let response = server
            .handle_request(&peer(), Message::new(MessageType::FindNode, key))
            .unwrap();

        assert_eq!(
            response.closer_peers,
            vec![PeerInfo::without_addrs(server.local.clone())]
        );
    }

    #[test]
    fn put_then_get_value() {
        let (server, _) = server();
        let record = DhtRecord::unstamped(&b"hello"[..], &b"world"[..]);

        let response = server
            .handle_request(
                &peer(),
                Message::new(MessageType::PutValue, record.key().clone()).with_record(record),
            )
            .unwrap();
        assert!(response.record.is_some());

        let response = server
            .handle_request(&peer(), Message::new(MessageType::GetValue, &b"hello"[..]))
            .unwrap();
        let stored = response.record.unwrap();

        assert_eq!(stored.value().as_ref(), b"world");
        assert!(stored.time_received().is_some());
    }

    #[test]
    fn expired_records_are_deleted() {
        let (server, datastore) = server();
        let received = SystemTime::now() - MAX_RECORD_AGE - Duration::from_secs(1);
        let record = DhtRecord::new(&b"old"[..], &b"value"[..]).received_at(received);

        datastore
            .put(
                &record_key("/dht", b"old"),
                record.serialize().unwrap().into(),
            )
            .unwrap();

        let response = server
            .handle_request(&peer(), Message::new(MessageType::GetValue, &b"old"[..]))
            .unwrap();

        assert!(response.record.is_none());
        assert!(datastore.is_empty());
    }

    #[test]
    fn invalid_records_are_refused() {
        let (server, datastore) = server();
        let record = DhtRecord::new(&b"/unknown/key"[..], &b"value"[..]);

        let result = server.handle_request(
            &peer(),
            Message::new(MessageType::PutValue, record.key().clone()).with_record(record),
        );

        assert!(matches!(result, Err(Error::InvalidRecord(_))));
        assert!(datastore.is_empty());

        let result =
            server.handle_request(&peer(), Message::new(MessageType::PutValue, &b"key"[..]));
        assert!(result.is_err());
    }

    #[test]
    fn providers_only_for_themselves() {
        let (server, _) = server();
        let provider = peer();
        let impostor = peer();
        let key = Bytes::from_static(b"content");

        server
            .handle_request(
                &provider,
                Message::new(MessageType::AddProvider, key.clone())
                    .with_provider_peers(vec![provider.clone(), impostor.clone()]),
            )
            .unwrap();

        let response = server
            .handle_request(&peer(), Message::new(MessageType::GetProviders, key))
            .unwrap();

        assert_eq!(response.provider_peers, vec![provider]);
    }
}
