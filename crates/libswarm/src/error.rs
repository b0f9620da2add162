use peer_wire::MessageDeserializeError;
use swarm_core::hash_id::Id20;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("wrong info hash")]
    WrongInfoHash,

    #[error("error writing handshake: {0:#}")]
    WriteHandshake(#[source] std::io::Error),
    #[error("error reading handshake: {0:#}")]
    ReadHandshake(#[source] std::io::Error),
    #[error("peer disconnected while reading handshake")]
    PeerDisconnectedReadingHandshake,

    #[error("error writing: {0:#}")]
    Write(#[source] std::io::Error),
    #[error("error reading: {0:#}")]
    Read(#[source] std::io::Error),
    #[error("error connecting: {0:#}")]
    Connect(#[source] std::io::Error),

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("error deserializing message: {0:#}")]
    Deserialize(
        #[from]
        #[source]
        MessageDeserializeError,
    ),

    #[error("disconnect requested")]
    Disconnect,

    #[error("torrent {0:?} is not registered")]
    TorrentNotRegistered(Id20),

    #[error("torrent already registered and data descriptor attached: {0:?}")]
    DescriptorAlreadyAttached(Id20),

    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("descriptor stalled: {0} consecutive I/O failures on piece {1}")]
    DescriptorStalled(u32, u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("peer task is dead")]
    PeerTaskDead,

    #[error("torrent is not live")]
    TorrentIsNotLive,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
