//! Main Crate Error

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Kad-dht crate error enum.
pub enum Error {
    /// A Kademlia id was built from a slice of the wrong length.
    #[error("Invalid Kademlia id size, expected 32 bytes, got {0}")]
    InvalidIdSize(usize),

    /// A lookup was exhausted without a result.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A specific peer interaction failed.
    #[error("Query error: {0}")]
    Query(String),

    /// A record failed validation.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A `/pk/` record carried bytes that are not a valid public key.
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// No peer could be contacted because both routing tables are empty.
    #[error("No peers found in routing table")]
    NoPeersInRoutingTable,

    /// Provide reached zero peers.
    ///
    /// Empty `errors` means nobody answered at all.
    #[error("Failed to provide to any peers ({} errors)", .errors.len())]
    ProvidesFailed { errors: Vec<Error> },

    /// Every sub-lookup failed.
    #[error("Lookup failed")]
    LookupFailed,

    /// The operation was aborted before any peer was contacted.
    #[error("Operation aborted")]
    Aborted,

    /// The component was used before `start()` or after `stop()`.
    #[error("Not started")]
    NotStarted,

    /// This node is in client mode and does not answer requests.
    #[error("Node is in client mode")]
    ClientMode,

    #[error("Datastore error: {0}")]
    Datastore(String),

    #[error("Failed to decode record: {0}")]
    Decode(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,
}

impl From<serde_bencode::Error> for Error {
    fn from(error: serde_bencode::Error) -> Self {
        Error::Decode(error.to_string())
    }
}

/// Alias for results with [Error] as the default error.
pub type Result<T, E = Error> = std::result::Result<T, E>;
