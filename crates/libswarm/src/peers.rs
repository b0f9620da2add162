// The per-torrent peer table. Peer lifecycle:
// queued (initial) -> connecting -> live
// ANY STATE -> dead (on error), rescheduled with exponential backoff
// ANY STATE -> not_needed (nothing more to say to the peer)

use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use swarm_core::hash_id::Id20;
use tokio::sync::mpsc::unbounded_channel;

use crate::{
    connection_state::{AtomicPeerStats, ConnectionState},
    peer_connection::{PeerRx, PeerTx},
    type_aliases::PeerHandle,
};

#[derive(Debug)]
pub(crate) struct LivePeer {
    #[allow(dead_code)]
    pub peer_id: Id20,
    pub conn: ConnectionState,
    pub tx: PeerTx,
}

impl LivePeer {
    pub fn new(peer_id: Id20, tx: PeerTx) -> Self {
        Self {
            peer_id,
            conn: ConnectionState::new(),
            tx,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) enum PeerState {
    // Will be connected to as soon as possible.
    #[default]
    Queued,
    Connecting(PeerTx),
    Live(LivePeer),
    // Errored, waiting out the backoff.
    Dead,
    // Nothing more to exchange with this peer.
    NotNeeded,
}

pub(crate) struct Peer {
    pub state: PeerState,
    pub stats: Arc<AtomicPeerStats>,
    pub backoff: ExponentialBackoff,
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: std::time::Duration::from_secs(5),
        max_interval: std::time::Duration::from_secs(60),
        max_elapsed_time: Some(std::time::Duration::from_secs(600)),
        ..Default::default()
    }
}

impl Default for Peer {
    fn default() -> Self {
        Self {
            state: PeerState::Queued,
            stats: Arc::new(AtomicPeerStats::default()),
            backoff: reconnect_backoff(),
        }
    }
}

#[derive(Default)]
pub(crate) struct PeerStates {
    pub states: DashMap<PeerHandle, Peer>,
}

impl PeerStates {
    /// Queues a previously unseen address. Returns false if we already
    /// know the peer.
    pub fn add_if_not_seen(&self, addr: PeerHandle) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.states.entry(addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vac) => {
                vac.insert(Peer::default());
                true
            }
        }
    }

    pub fn with_peer<R>(&self, addr: PeerHandle, f: impl FnOnce(&Peer) -> R) -> Option<R> {
        self.states.get(&addr).map(|e| f(e.value()))
    }

    pub fn with_peer_mut<R>(&self, addr: PeerHandle, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        self.states.get_mut(&addr).map(|mut e| f(e.value_mut()))
    }

    pub fn with_live<R>(&self, addr: PeerHandle, f: impl FnOnce(&LivePeer) -> R) -> Option<R> {
        self.with_peer(addr, |p| match &p.state {
            PeerState::Live(live) => Some(f(live)),
            _ => None,
        })
        .flatten()
    }

    pub fn with_live_mut<R>(
        &self,
        addr: PeerHandle,
        f: impl FnOnce(&mut LivePeer) -> R,
    ) -> Option<R> {
        self.with_peer_mut(addr, |p| match &mut p.state {
            PeerState::Live(live) => Some(f(live)),
            _ => None,
        })
        .flatten()
    }

    /// Queued/NotNeeded -> Connecting, handing back the channel pair
    /// for the connection task.
    pub fn mark_peer_connecting(&self, addr: PeerHandle) -> Option<(PeerRx, PeerTx)> {
        self.with_peer_mut(addr, |p| match p.state {
            PeerState::Queued | PeerState::NotNeeded => {
                let (tx, rx) = unbounded_channel();
                p.state = PeerState::Connecting(tx.clone());
                Some((rx, tx))
            }
            _ => None,
        })
        .flatten()
    }

    /// Connecting -> Live once the handshake completed.
    pub fn connecting_to_live(&self, addr: PeerHandle, peer_id: Id20) -> bool {
        self.with_peer_mut(addr, |p| {
            if let PeerState::Connecting(tx) = std::mem::take(&mut p.state) {
                p.state = PeerState::Live(LivePeer::new(peer_id, tx));
                p.backoff = reconnect_backoff();
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Registers an accepted connection for a peer we may not have
    /// seen before.
    pub fn incoming_to_live(&self, addr: PeerHandle, peer_id: Id20, tx: PeerTx) -> bool {
        self.add_if_not_seen(addr);
        self.with_peer_mut(addr, |p| match p.state {
            PeerState::Connecting(_) | PeerState::Live(_) => false,
            _ => {
                p.state = PeerState::Live(LivePeer::new(peer_id, tx));
                true
            }
        })
        .unwrap_or(false)
    }

    /// Takes the live/connecting state out, leaving the peer Dead.
    /// Returns the previous state for the caller to clean up after.
    pub fn take_for_death(&self, addr: PeerHandle) -> Option<PeerState> {
        self.with_peer_mut(addr, |p| std::mem::replace(&mut p.state, PeerState::Dead))
    }

    pub fn mark_queued(&self, addr: PeerHandle) -> bool {
        self.with_peer_mut(addr, |p| match p.state {
            PeerState::Dead => {
                p.state = PeerState::Queued;
                true
            }
            _ => false,
        })
        .unwrap_or(false)
    }

    pub fn mark_not_needed(&self, addr: PeerHandle) {
        self.with_peer_mut(addr, |p| p.state = PeerState::NotNeeded);
    }

    pub fn next_backoff(&self, addr: PeerHandle) -> Option<std::time::Duration> {
        self.with_peer_mut(addr, |p| p.backoff.next_backoff()).flatten()
    }

    pub fn drop_peer(&self, addr: PeerHandle) -> bool {
        self.states.remove(&addr).is_some()
    }

    pub fn live_addrs(&self) -> Vec<PeerHandle> {
        self.states
            .iter()
            .filter(|e| matches!(e.value().state, PeerState::Live(_)))
            .map(|e| *e.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> PeerHandle {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_lifecycle_queued_connecting_live() {
        let peers = PeerStates::default();
        assert!(peers.add_if_not_seen(addr(1)));
        assert!(!peers.add_if_not_seen(addr(1)));

        let (_rx, _tx) = peers.mark_peer_connecting(addr(1)).unwrap();
        // can't connect twice
        assert!(peers.mark_peer_connecting(addr(1)).is_none());

        assert!(peers.connecting_to_live(addr(1), Id20::default()));
        assert_eq!(peers.live_addrs(), vec![addr(1)]);
    }

    #[test]
    fn test_death_and_requeue() {
        let peers = PeerStates::default();
        peers.add_if_not_seen(addr(1));
        peers.mark_peer_connecting(addr(1)).unwrap();
        peers.connecting_to_live(addr(1), Id20::default());

        let prev = peers.take_for_death(addr(1)).unwrap();
        assert!(matches!(prev, PeerState::Live(_)));
        assert!(peers.next_backoff(addr(1)).is_some());
        assert!(peers.mark_queued(addr(1)));
        assert!(peers.mark_peer_connecting(addr(1)).is_some());
    }
}
