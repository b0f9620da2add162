// Per-connection protocol state. The record is owned by the peer's
// task; only the atomic counters are read from other threads (choker,
// stats snapshots).

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bencode::ByteBufOwned;
use bytes::Bytes;
use peer_wire::extended::handshake::ExtendedHandshake;
use peer_wire::extended::PeerExtendedMessageIds;
use peer_wire::Request;
use swarm_core::hash_id::Id20;
use swarm_core::lengths::BlockInfo;

use crate::type_aliases::{PeerHandle, BF};

/// Identifies a peer connection within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub torrent_id: Id20,
    pub peer: PeerHandle,
}

/// A block read from storage on behalf of a peer's REQUEST, waiting in
/// the outbound queue to be emitted as PIECE.
#[derive(Debug, Clone)]
pub struct BlockRead {
    pub block: BlockInfo,
    pub data: Bytes,
}

/// Counters readable from other threads. `last_active` is milliseconds
/// since the connection's epoch and only ever moves forward.
#[derive(Debug, Default)]
pub struct AtomicPeerStats {
    pub downloaded: AtomicU64,
    pub uploaded: AtomicU64,
    /// Pieces attributed to this peer that failed verification, or
    /// assignments it let expire.
    pub failures: AtomicU64,
    last_active_ms: AtomicU64,
}

impl AtomicPeerStats {
    pub fn touch(&self, epoch: Instant) {
        let now_ms = epoch.elapsed().as_millis() as u64;
        self.last_active_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    pub fn last_active_ms(&self) -> u64 {
        self.last_active_ms.load(Ordering::Acquire)
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct ConnectionState {
    // The four protocol flags. Initially both sides choke and neither
    // is interested.
    pub choking: bool,
    pub peer_choking: bool,
    pub interested: bool,
    pub peer_interested: bool,

    /// Set by the choker; materialized into CHOKE/UNCHOKE by the
    /// outgoing producer, which then clears it.
    pub should_choke: Option<bool>,
    pub last_choked: Option<Instant>,

    /// What the peer advertised via BITFIELD/HAVE. Empty until the
    /// first advertisement.
    pub bitfield: BF,

    /// Outgoing requests currently in flight to this peer.
    pub pending_requests: HashSet<BlockInfo>,
    /// Blocks remaining for the pieces assigned to this peer, not yet
    /// requested.
    pub request_queue: VecDeque<BlockInfo>,

    /// Peer's REQUESTs forwarded to the I/O worker, not yet answered.
    pub enqueued_peer_requests: HashSet<Request>,
    /// Peer's CANCELs; the producer drops queued blocks matching these.
    pub cancelled_peer_requests: HashSet<Request>,

    /// The peer's extended handshake, if it sent one. Additive: never
    /// replaced by a later handshake dropping extensions.
    pub extended_handshake: Option<ExtendedHandshake<ByteBufOwned>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            choking: true,
            peer_choking: true,
            interested: false,
            peer_interested: false,
            should_choke: None,
            last_choked: None,
            bitfield: BF::default(),
            pending_requests: HashSet::new(),
            request_queue: VecDeque::new(),
            enqueued_peer_requests: HashSet::new(),
            cancelled_peer_requests: HashSet::new(),
            extended_handshake: None,
        }
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn peer_extended_msg_ids(&self) -> PeerExtendedMessageIds {
        PeerExtendedMessageIds {
            ut_pex: self
                .extended_handshake
                .as_ref()
                .and_then(|eh| eh.ut_pex()),
        }
    }

    /// Merges a (possibly repeated) extended handshake. The `m` map is
    /// additive, so extensions seen once stay known.
    pub fn merge_extended_handshake(&mut self, new: ExtendedHandshake<ByteBufOwned>) {
        match &mut self.extended_handshake {
            None => self.extended_handshake = Some(new),
            Some(existing) => {
                for (name, id) in new.m {
                    if !existing.m.iter().any(|(n, _)| n == &name) {
                        existing.m.push((name, id));
                    }
                }
                if new.p.is_some() {
                    existing.p = new.p;
                }
                if new.v.is_some() {
                    existing.v = new.v;
                }
                if new.metadata_size.is_some() {
                    existing.metadata_size = new.metadata_size;
                }
                if new.e.is_some() {
                    existing.e = new.e;
                }
                existing.other = new.other;
            }
        }
    }

    pub fn on_peer_cancel(&mut self, request: Request) {
        if self.enqueued_peer_requests.contains(&request) {
            self.cancelled_peer_requests.insert(request);
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }
}
