//! Lookups built on top of the [crate::QueryManager].

mod content_fetching;
mod content_routing;
mod peer_routing;

pub use content_fetching::*;
pub use content_routing::ContentRouting;
pub use peer_routing::PeerRouting;
