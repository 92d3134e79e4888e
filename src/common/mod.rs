//! Miscellaneous common structs used throughout the library.

mod id;
mod messages;
mod peer;
mod peer_distance_list;
mod record;
mod routing_table;

pub use id::*;
pub use messages::*;
pub use peer::*;
pub use peer_distance_list::*;
pub use record::*;
pub use routing_table::*;
