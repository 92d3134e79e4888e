use std::time::Duration;

use crate::common::{PeerInfo, K_BUCKET_SIZE, PING_COUNT, PREFIX_LENGTH};
use crate::network::{LAN_PROTOCOL, WAN_PROTOCOL};
use crate::record::{Selectors, Validators};

/// Requests in flight per lookup.
pub const ALPHA: usize = 3;
/// Records older than this are dropped instead of served.
pub const MAX_RECORD_AGE: Duration = Duration::from_secs(36 * 60 * 60);
/// Provider records older than this are ignored.
pub const PROVIDERS_VALIDITY: Duration = Duration::from_secs(48 * 60 * 60);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DATASTORE_PREFIX: &str = "/dht";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which part of the network a DHT instance talks to.
pub enum Scope {
    /// Peers reachable on the local network only.
    Lan,
    /// Peers reachable on the public internet only.
    Wan,
    /// No address filtering.
    Any,
}

impl Scope {
    pub fn protocol(&self) -> &'static str {
        match self {
            Scope::Lan => LAN_PROTOCOL,
            Scope::Wan | Scope::Any => WAN_PROTOCOL,
        }
    }

    /// Keep only the addresses of `info` that belong to this scope.
    ///
    /// Returns `None` if the peer had addresses and none of them survived.
    pub fn filter(&self, mut info: PeerInfo) -> Option<PeerInfo> {
        if info.multiaddrs.is_empty() {
            return Some(info);
        }

        match self {
            Scope::Lan => info.multiaddrs.retain(|addr| addr.is_private()),
            Scope::Wan => info.multiaddrs.retain(|addr| !addr.is_private()),
            Scope::Any => {}
        }

        (!info.multiaddrs.is_empty()).then_some(info)
    }
}

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Defaults to [Scope::Any]
    pub scope: Scope,
    /// Peers per k-bucket, and the size of every "closest peers" set.
    ///
    /// Defaults to [K_BUCKET_SIZE]
    pub k_bucket_size: usize,
    /// Maximum depth of the routing table trie.
    ///
    /// Defaults to [PREFIX_LENGTH]
    pub prefix_length: usize,
    /// How many old contacts to ping when a full bucket refuses a new peer.
    ///
    /// Defaults to [PING_COUNT]
    pub ping_count: usize,
    /// Defaults to [DEFAULT_PING_TIMEOUT]
    pub ping_timeout: Duration,
    /// Lookup concurrency.
    ///
    /// Defaults to [ALPHA]
    pub alpha: usize,
    /// Explicit client mode.
    ///
    /// Defaults to None, where a node starts in client mode, and a
    /// [crate::DualKadDht] switches its WAN instance to server mode once it
    /// has a public address.
    pub client_mode: Option<bool>,
    /// Defaults to [DEFAULT_DATASTORE_PREFIX]
    pub datastore_prefix: String,
    /// Defaults to [MAX_RECORD_AGE]
    pub max_record_age: Duration,
    /// Defaults to [PROVIDERS_VALIDITY]
    pub provider_validity: Duration,
    /// Defaults to the built-in validators, see [Validators::default].
    pub validators: Validators,
    /// Defaults to the built-in selectors, see [Selectors::default].
    pub selectors: Selectors,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: Scope::Any,
            k_bucket_size: K_BUCKET_SIZE,
            prefix_length: PREFIX_LENGTH,
            ping_count: PING_COUNT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            alpha: ALPHA,
            client_mode: None,
            datastore_prefix: DEFAULT_DATASTORE_PREFIX.to_string(),
            max_record_age: MAX_RECORD_AGE,
            provider_validity: PROVIDERS_VALIDITY,
            validators: Validators::default(),
            selectors: Selectors::default(),
        }
    }
}
