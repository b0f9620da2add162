// The core of a BitTorrent peer engine: per-peer protocol state
// machines, rarest-first piece scheduling, a verifying piece store,
// tit-for-tat choking and PEX gossip, driven through a per-torrent
// lifecycle chain.
//
// External collaborators (magnet parsing, trackers, DHT, .torrent
// parsing) plug in through the seams in `metainfo` (MetadataSource,
// the parsed Torrent) and `storage` (per-file StorageUnit).

pub mod assembler;
pub mod assignments;
pub mod availability;
pub mod choker;
pub mod config;
pub mod connection_state;
pub mod engine;
pub mod error;
pub mod events;
pub mod metainfo;
pub mod peer_connection;
mod peers;
pub mod pex_source;
pub mod piece_store;
pub mod pipeline;
pub mod registry;
pub mod selector;
pub mod storage;
pub mod torrent_state;
pub mod type_aliases;

pub use config::{Config, EncryptionPolicy};
pub use engine::{AddTorrentOptions, Engine};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind};
pub use metainfo::{MetadataSource, Torrent, TorrentFile};
pub use selector::Selector;
pub use storage::{FileStorage, InMemoryStorage, Storage, StorageUnit};
pub use torrent_state::TorrentSession;

pub use swarm_core::hash_id::Id20;
pub use swarm_core::lengths::Lengths;
