//! RPC messages exchanged between DHT peers.
//!
//! The bit-level framing is left to the [crate::Network] implementation.

use std::fmt::{self, Display, Formatter};

use bytes::Bytes;

use crate::common::{DhtRecord, PeerInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    FindNode,
    GetValue,
    PutValue,
    AddProvider,
    GetProviders,
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::Ping => "PING",
            MessageType::FindNode => "FIND_NODE",
            MessageType::GetValue => "GET_VALUE",
            MessageType::PutValue => "PUT_VALUE",
            MessageType::AddProvider => "ADD_PROVIDER",
            MessageType::GetProviders => "GET_PROVIDERS",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A request or its response; responses echo the request's `message_type`.
pub struct Message {
    pub message_type: MessageType,
    pub key: Bytes,
    pub record: Option<DhtRecord>,
    pub closer_peers: Vec<PeerInfo>,
    pub provider_peers: Vec<PeerInfo>,
    /// Set on requests by nodes in client mode, so that responders do not add
    /// them to their routing tables.
    pub client_mode: bool,
}

impl Message {
    pub fn new(message_type: MessageType, key: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            key: key.into(),
            record: None,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
            client_mode: false,
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Bytes::new())
    }

    pub fn with_record(mut self, record: DhtRecord) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_closer_peers(mut self, peers: Vec<PeerInfo>) -> Self {
        self.closer_peers = peers;
        self
    }

    pub fn with_provider_peers(mut self, peers: Vec<PeerInfo>) -> Self {
        self.provider_peers = peers;
        self
    }
}
