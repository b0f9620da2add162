use std::net::SocketAddr;

use swarm_core::hash_id::Id20;

/// Domain events, fanned out on a broadcast channel. One flat tagged
/// union with the torrent id as the shared header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub torrent_id: Id20,
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    PeerDiscovered(SocketAddr),
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    PeerBitfieldUpdated(SocketAddr),
    PieceVerified(u32),
    MetadataFetched,
    FilesChosen,
    DownloadComplete,
    TorrentStarted,
    TorrentStopped,
    TorrentError(String),
}

#[derive(Clone, Debug)]
pub struct EventBus {
    event_tx: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(128);
        Self { event_tx }
    }

    pub fn emit(&self, torrent_id: Id20, kind: EventKind) {
        // nobody listening is fine
        let _ = self.event_tx.send(Event { torrent_id, kind });
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
