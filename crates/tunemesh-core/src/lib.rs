pub mod config;
pub mod contact;
pub mod ids;
pub mod keywords;
pub mod node;
pub mod pending;
pub mod records;
pub mod repository;
pub mod routing;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::NodeConfig;
pub use contact::Contact;
pub use ids::Id;
pub use keywords::{generate_keywords, StopWords, KEYWORD_PREFIX, MAX_KEYWORD_LEN};
pub use node::{
    now_unix_secs, Node, NodeHandle, ALPHA, MAINTENANCE_INTERVAL, MAX_CLOCK_SKEW_SECS,
    REFRESH_TIME, REPLICATE_TIME_SECS,
};
pub use pending::{ResponseWaiters, StoreOffers, MAX_CACHE_TIME, MAX_SYNC_WAIT};
pub use records::{KeywordEntry, ResourceRecord, SourceEntry, TrackTag};
pub use repository::{Repository, EXPIRE_TIME_SECS};
pub use routing::{RoutingTable, K};
pub use store::{MemoryStore, PersistedRepository, SqliteStore, Store};
pub use transport::MessageTransport;
pub use wire::{Envelope, MsgKind, WirePayload, MAX_ENVELOPE_BYTES};
