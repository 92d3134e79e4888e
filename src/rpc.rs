//! Outgoing requests of a DHT instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::common::{Message, PeerId, PeerInfo, RoutingTable};
use crate::config::Scope;
use crate::events::{EventStream, QueryEvent};
use crate::network::{Network, RequestOptions};
use crate::store::PeerStore;

/// Wraps the [Network] to stamp our mode on requests, and to learn about
/// peers from their responses.
#[derive(Clone)]
pub(crate) struct Rpc {
    local: PeerId,
    network: Arc<dyn Network>,
    routing_table: Arc<RwLock<RoutingTable>>,
    peer_store: Arc<dyn PeerStore>,
    scope: Scope,
    client_mode: Arc<AtomicBool>,
}

impl Rpc {
    pub fn new(
        local: PeerId,
        network: Arc<dyn Network>,
        routing_table: Arc<RwLock<RoutingTable>>,
        peer_store: Arc<dyn PeerStore>,
        scope: Scope,
        client_mode: Arc<AtomicBool>,
    ) -> Self {
        Self {
            local,
            network,
            routing_table,
            peer_store,
            scope,
            client_mode,
        }
    }

    // === Getters ===

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn client_mode(&self) -> bool {
        self.client_mode.load(Ordering::Relaxed)
    }

    // === Public Methods ===

    pub fn send_request(
        &self,
        to: &PeerId,
        mut message: Message,
        signal: &CancellationToken,
        timeout: Option<Duration>,
    ) -> EventStream {
        message.client_mode = self.client_mode();

        trace!(to = ?to, message_type = %message.message_type, ?timeout, "Sending request");

        let options = RequestOptions {
            signal: signal.child_token(),
            timeout,
            protocol: self.scope.protocol(),
        };

        let this = self.clone();

        self.network
            .send_request(to.clone(), message, options)
            .map(move |event| this.observe(event))
            .boxed()
    }

    /// Keep only in-scope peers of a response, remembering their addresses,
    /// and add the responder to the routing table.
    fn observe(&self, event: QueryEvent) -> QueryEvent {
        match event {
            QueryEvent::PeerResponse {
                from,
                message_type,
                closer,
                providers,
                record,
            } => {
                let closer = self.learn(closer);
                let providers = self.learn(providers);

                if from != self.local {
                    self.routing_table.write().add_peer_id(from.clone());
                }

                QueryEvent::PeerResponse {
                    from,
                    message_type,
                    closer,
                    providers,
                    record,
                }
            }
            event => event,
        }
    }

    fn learn(&self, peers: Vec<PeerInfo>) -> Vec<PeerInfo> {
        peers
            .into_iter()
            .filter(|peer| peer.id != self.local)
            .filter_map(|peer| self.scope.filter(peer))
            .inspect(|peer| self.peer_store.merge(peer))
            .collect()
    }
}
