// The global map of which peer is downloading which piece. Outside of
// endgame a piece is reserved by at most one peer; each peer holds a
// small working set with a deadline, and an expired reservation goes
// back to the pool with the slacking peer blamed.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use swarm_core::lengths::ValidPieceIndex;
use tracing::debug;

use crate::type_aliases::PeerHandle;

#[derive(Debug, Clone, Copy)]
struct AssignmentEntry {
    peer: PeerHandle,
    started: Instant,
}

pub struct Assignments {
    max_pieces_per_peer: usize,
    deadline: Duration,
    pieces: HashMap<ValidPieceIndex, Vec<AssignmentEntry>>,
    per_peer: HashMap<PeerHandle, HashSet<ValidPieceIndex>>,
    endgame: bool,
}

impl Assignments {
    pub fn new(max_pieces_per_peer: usize, deadline: Duration) -> Self {
        Self {
            max_pieces_per_peer,
            deadline,
            pieces: HashMap::new(),
            per_peer: HashMap::new(),
            endgame: false,
        }
    }

    pub fn endgame(&self) -> bool {
        self.endgame
    }

    pub fn set_endgame(&mut self, endgame: bool) {
        if endgame && !self.endgame {
            debug!("entering endgame mode");
        }
        self.endgame = endgame;
    }

    pub fn is_assigned(&self, piece: ValidPieceIndex) -> bool {
        self.pieces.contains_key(&piece)
    }

    pub fn assigned_to(&self, piece: ValidPieceIndex) -> Vec<PeerHandle> {
        self.pieces
            .get(&piece)
            .map(|entries| entries.iter().map(|e| e.peer).collect())
            .unwrap_or_default()
    }

    pub fn pieces_for(&self, peer: PeerHandle) -> Vec<ValidPieceIndex> {
        self.per_peer
            .get(&peer)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn peer_has_capacity(&self, peer: PeerHandle) -> bool {
        self.per_peer
            .get(&peer)
            .map(|set| set.len() < self.max_pieces_per_peer)
            .unwrap_or(true)
    }

    /// Reserves a piece for a peer. Refused when the peer is at
    /// capacity, already holds the piece, or (outside endgame) the
    /// piece is reserved by someone else.
    pub fn try_assign(&mut self, peer: PeerHandle, piece: ValidPieceIndex) -> bool {
        if !self.peer_has_capacity(peer) {
            return false;
        }
        let entries = self.pieces.entry(piece).or_default();
        if !entries.is_empty() && !self.endgame {
            return false;
        }
        if entries.iter().any(|e| e.peer == peer) {
            return false;
        }
        entries.push(AssignmentEntry {
            peer,
            started: Instant::now(),
        });
        self.per_peer.entry(peer).or_default().insert(piece);
        true
    }

    fn remove_piece(&mut self, piece: ValidPieceIndex) -> Vec<PeerHandle> {
        let entries = self.pieces.remove(&piece).unwrap_or_default();
        let peers: Vec<PeerHandle> = entries.iter().map(|e| e.peer).collect();
        for peer in &peers {
            if let Some(set) = self.per_peer.get_mut(peer) {
                set.remove(&piece);
                if set.is_empty() {
                    self.per_peer.remove(peer);
                }
            }
        }
        peers
    }

    /// The piece verified; returns every peer that held a reservation
    /// so the caller can CANCEL the endgame losers.
    pub fn complete(&mut self, piece: ValidPieceIndex) -> Vec<PeerHandle> {
        self.remove_piece(piece)
    }

    /// The piece failed (hash mismatch or storage error); the
    /// reservation is dropped so the selector can hand it out again.
    pub fn fail(&mut self, piece: ValidPieceIndex) -> Vec<PeerHandle> {
        self.remove_piece(piece)
    }

    /// Drops all of a disconnected peer's reservations. Returned
    /// pieces went back to the pool (no other peer still holds them).
    pub fn remove_peer(&mut self, peer: PeerHandle) -> Vec<ValidPieceIndex> {
        let pieces = match self.per_peer.remove(&peer) {
            Some(set) => set,
            None => return Vec::new(),
        };
        let mut requeued = Vec::new();
        for piece in pieces {
            if let Some(entries) = self.pieces.get_mut(&piece) {
                entries.retain(|e| e.peer != peer);
                if entries.is_empty() {
                    self.pieces.remove(&piece);
                    requeued.push(piece);
                }
            }
        }
        requeued
    }

    /// Reservations past their deadline. Each is removed and returned
    /// with the peer to blame; the piece is selectable again.
    pub fn expire(&mut self, now: Instant) -> Vec<(ValidPieceIndex, PeerHandle)> {
        let deadline = self.deadline;
        let mut expired = Vec::new();
        for (piece, entries) in self.pieces.iter_mut() {
            entries.retain(|e| {
                if now.duration_since(e.started) >= deadline {
                    expired.push((*piece, e.peer));
                    false
                } else {
                    true
                }
            });
        }
        for (piece, peer) in &expired {
            if let Some(set) = self.per_peer.get_mut(peer) {
                set.remove(piece);
                if set.is_empty() {
                    self.per_peer.remove(peer);
                }
            }
        }
        self.pieces.retain(|_, entries| !entries.is_empty());
        expired
    }

    pub fn assigned_piece_count(&self) -> usize {
        self.pieces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(idx: u32) -> ValidPieceIndex {
        swarm_core::lengths::Lengths::new(1 << 24, 1 << 18)
            .unwrap()
            .validate_piece_index(idx)
            .unwrap()
    }

    fn addr(port: u16) -> PeerHandle {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_exclusive_outside_endgame() {
        let mut a = Assignments::new(3, Duration::from_secs(20));
        assert!(a.try_assign(addr(1), piece(0)));
        assert!(!a.try_assign(addr(2), piece(0)));
        assert!(a.try_assign(addr(2), piece(1)));
    }

    #[test]
    fn test_peer_capacity_limit() {
        let mut a = Assignments::new(2, Duration::from_secs(20));
        assert!(a.try_assign(addr(1), piece(0)));
        assert!(a.try_assign(addr(1), piece(1)));
        assert!(!a.try_assign(addr(1), piece(2)));
        a.complete(piece(0));
        assert!(a.try_assign(addr(1), piece(2)));
    }

    #[test]
    fn test_endgame_duplicates_and_cancels_losers() {
        let mut a = Assignments::new(3, Duration::from_secs(20));
        a.set_endgame(true);
        assert!(a.try_assign(addr(1), piece(0)));
        assert!(a.try_assign(addr(2), piece(0)));
        assert!(!a.try_assign(addr(1), piece(0)));

        let mut holders = a.complete(piece(0));
        holders.sort();
        assert_eq!(holders, vec![addr(1), addr(2)]);
        assert!(!a.is_assigned(piece(0)));
    }

    #[test]
    fn test_remove_peer_requeues_exclusive_pieces() {
        let mut a = Assignments::new(3, Duration::from_secs(20));
        a.set_endgame(true);
        a.try_assign(addr(1), piece(0));
        a.try_assign(addr(2), piece(0));
        a.try_assign(addr(1), piece(1));

        let requeued = a.remove_peer(addr(1));
        // piece 0 still held by peer 2, only piece 1 goes back
        assert_eq!(requeued, vec![piece(1)]);
        assert!(a.is_assigned(piece(0)));
    }

    #[test]
    fn test_expiry_blames_and_requeues() {
        let mut a = Assignments::new(3, Duration::from_millis(0));
        a.try_assign(addr(1), piece(0));
        let expired = a.expire(Instant::now() + Duration::from_millis(1));
        assert_eq!(expired, vec![(piece(0), addr(1))]);
        assert!(!a.is_assigned(piece(0)));
        assert!(a.peer_has_capacity(addr(1)));
        assert!(a.try_assign(addr(2), piece(0)));
    }
}
