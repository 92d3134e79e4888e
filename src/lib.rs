#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Modules
mod common;

mod config;
mod dht;
mod dual;
mod error;
mod events;
pub mod network;
mod query;
pub mod record;
pub mod routing;
mod rpc;
mod server;
pub mod store;

pub use crate::common::{
    DhtRecord, Distance, KadId, Message, MessageType, Multiaddr, Peer, PeerDistanceList, PeerId,
    PeerInfo, RoutingTable, RoutingTableConfig, RoutingTableEvent,
};
pub use bytes::Bytes;
pub use config::{Config, Scope, ALPHA, MAX_RECORD_AGE, PROVIDERS_VALIDITY};
pub use dht::{KadDht, KadDhtBuilder, Mode};
pub use dual::{DualEventStream, DualKadDht};
pub use error::{Error, Result};
pub use events::{EventStream, QueryEvent};
pub use query::{QueryContext, QueryManager, QueryOptions};
pub use server::Providers;
