// Peer Exchange. Connect/disconnect events are queued per torrent,
// ordered by instant, and gossiped to ut_pex-capable peers under rate
// and size limits. The periodic cleaner trims every queue up to the
// least-recently-sent instant, which bounds memory without dropping
// events a current subscriber still needs.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use peer_wire::extended::pex::{PexPeerInfo, UtPex};
use bencode::ByteBufOwned;
use swarm_core::hash_id::Id20;
use tracing::trace;

use crate::{config::Config, connection_state::ConnectionKey};

/// Events older than this are dropped even if some subscriber never
/// caught up; matches the last-sent cache expiry.
pub const MAX_PEER_EVENT_STORAGE_MS: u64 = 10 * 60 * 1000;
/// How often the cleaner runs.
pub const CLEANER_INTERVAL_MS: u64 = 37 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEventKind {
    Added,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEvent {
    pub kind: PeerEventKind,
    pub addr: SocketAddr,
    pub flags: u8,
    /// Monotonic milliseconds.
    pub instant: u64,
}

impl PeerEvent {
    pub fn added(addr: SocketAddr, instant: u64) -> Self {
        Self {
            kind: PeerEventKind::Added,
            addr,
            flags: 0,
            instant,
        }
    }

    pub fn dropped(addr: SocketAddr, instant: u64) -> Self {
        Self {
            kind: PeerEventKind::Dropped,
            addr,
            flags: 0,
            instant,
        }
    }
}

pub struct PexSource {
    min_message_interval_ms: u64,
    max_message_interval_ms: u64,
    min_events_per_message: usize,
    max_events_per_message: usize,

    // Many producers append, per-connection readers scan, the cleaner
    // takes the write lock to trim from the front.
    events: RwLock<HashMap<Id20, VecDeque<PeerEvent>>>,

    capable: DashMap<ConnectionKey, ()>,
    last_sent: DashMap<ConnectionKey, u64>,

    // Peers learned from PEX messages we received, waiting for the
    // discovery side to pick them up.
    discovered: Mutex<HashMap<Id20, Vec<SocketAddr>>>,
}

impl PexSource {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_message_interval_ms: config.min_pex_message_interval.as_millis() as u64,
            max_message_interval_ms: config.max_pex_message_interval.as_millis() as u64,
            min_events_per_message: config.min_pex_events_per_message,
            max_events_per_message: config.max_pex_events_per_message,
            events: RwLock::new(HashMap::new()),
            capable: DashMap::new(),
            last_sent: DashMap::new(),
            discovered: Mutex::new(HashMap::new()),
        }
    }

    /// Appends an event keeping the queue ordered by non-decreasing
    /// instant.
    pub fn add_event(&self, torrent_id: Id20, event: PeerEvent) {
        let mut g = self.events.write();
        let queue = g.entry(torrent_id).or_default();
        let pos = queue
            .iter()
            .rposition(|e| e.instant <= event.instant)
            .map(|p| p + 1)
            .unwrap_or(0);
        queue.insert(pos, event);
    }

    pub fn on_peer_connected(&self, torrent_id: Id20, addr: SocketAddr, now_ms: u64) {
        self.add_event(torrent_id, PeerEvent::added(addr, now_ms));
    }

    pub fn on_peer_disconnected(&self, key: &ConnectionKey, addr: SocketAddr, now_ms: u64) {
        self.add_event(key.torrent_id, PeerEvent::dropped(addr, now_ms));
        self.capable.remove(key);
        self.last_sent.remove(key);
    }

    /// Called when a peer's extended handshake advertises ut_pex.
    /// The handshake map is additive, so capability is never revoked
    /// here; only disconnect removes it.
    pub fn mark_capable(&self, key: ConnectionKey) {
        self.capable.insert(key, ());
    }

    pub fn is_capable(&self, key: &ConnectionKey) -> bool {
        self.capable.contains_key(key)
    }

    /// Records peers gossiped to us; the discovery side drains them.
    pub fn on_pex_message<B: AsRef<[u8]>>(&self, torrent_id: Id20, msg: &UtPex<B>) {
        let mut g = self.discovered.lock();
        let list = g.entry(torrent_id).or_default();
        list.extend(msg.added_peers().map(|p| p.addr));
    }

    pub fn take_discovered(&self, torrent_id: Id20) -> Vec<SocketAddr> {
        self.discovered
            .lock()
            .get_mut(&torrent_id)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// The producer half: decides whether connection `key` is due a
    /// PEX message at `now_ms`, and builds it if so.
    pub fn produce(&self, key: &ConnectionKey, now_ms: u64) -> Option<UtPex<ByteBufOwned>> {
        if !self.is_capable(key) {
            return None;
        }
        let last_sent = self.last_sent.get(key).map(|e| *e.value()).unwrap_or(0);
        if now_ms.saturating_sub(last_sent) < self.min_message_interval_ms {
            return None;
        }

        let mut events = Vec::new();
        {
            let g = self.events.read();
            if let Some(queue) = g.get(&key.torrent_id) {
                for event in queue.iter() {
                    if event.instant < last_sent {
                        continue;
                    }
                    // never gossip the connection's own peer back at it
                    if event.addr.ip() == key.peer.ip() || event.addr.port() == key.peer.port() {
                        continue;
                    }
                    events.push(*event);
                    if events.len() >= self.max_events_per_message {
                        break;
                    }
                }
            }
        }

        let overdue = now_ms.saturating_sub(last_sent) >= self.max_message_interval_ms;
        if events.len() >= self.min_events_per_message || (!events.is_empty() && overdue) {
            self.last_sent.insert(*key, now_ms);
            let added = events
                .iter()
                .filter(|e| e.kind == PeerEventKind::Added)
                .map(|e| PexPeerInfo {
                    addr: e.addr,
                    flags: e.flags,
                });
            let dropped = events
                .iter()
                .filter(|e| e.kind == PeerEventKind::Dropped)
                .map(|e| PexPeerInfo {
                    addr: e.addr,
                    flags: 0,
                });
            trace!("PEX message to {:?}: {} events", key.peer, events.len());
            return Some(UtPex::from_addrs(added, dropped));
        }
        None
    }

    /// Periodic cleanup. Expires stale last-sent entries, then trims
    /// every torrent's queue up to the least-recently-sent instant.
    /// The trim uses `<=`, so an event stamped exactly at the LRU
    /// instant can be dropped right after being sent to exactly that
    /// subscriber; kept as-is.
    pub fn cleanup(&self, now_ms: u64) {
        self.last_sent
            .retain(|_, sent| now_ms.saturating_sub(*sent) < MAX_PEER_EVENT_STORAGE_MS);

        // with no live subscribers left after eviction, this is MAX
        // and the queues drain entirely
        let lru_instant = self
            .last_sent
            .iter()
            .map(|e| *e.value())
            .min()
            .unwrap_or(u64::MAX);

        let mut g = self.events.write();
        for queue in g.values_mut() {
            while queue.front().map_or(false, |e| e.instant <= lru_instant) {
                queue.pop_front();
            }
        }
    }

    /// Torrent stopped: its queues and discovered peers are gone.
    pub fn drop_torrent(&self, torrent_id: Id20) {
        self.events.write().remove(&torrent_id);
        self.discovered.lock().remove(&torrent_id);
        self.capable.retain(|key, _| key.torrent_id != torrent_id);
        self.last_sent.retain(|key, _| key.torrent_id != torrent_id);
    }

    #[cfg(test)]
    fn queued_events(&self, torrent_id: Id20) -> usize {
        self.events
            .read()
            .get(&torrent_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            min_pex_message_interval: Duration::from_secs(60),
            max_pex_message_interval: Duration::from_secs(120),
            min_pex_events_per_message: 1,
            max_pex_events_per_message: 50,
            ..Default::default()
        }
    }

    fn tid() -> Id20 {
        Id20::new([3u8; 20])
    }

    fn key(addr: &str) -> ConnectionKey {
        ConnectionKey {
            torrent_id: tid(),
            peer: addr.parse().unwrap(),
        }
    }

    #[test]
    fn test_rate_limit() {
        let pex = PexSource::from_config(&config());
        let a = key("10.0.0.1:1000");
        pex.mark_capable(a);

        // t=1s: peer B appears
        pex.add_event(tid(), PeerEvent::added("10.0.0.2:2000".parse().unwrap(), 1_000));

        // t=30s: min interval not elapsed since lastSent=0
        assert!(pex.produce(&a, 30_000).is_none());

        // t=61s: one message with one added peer
        let msg = pex.produce(&a, 61_000).expect("message due");
        let added: Vec<_> = msg.added_peers().collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].addr, "10.0.0.2:2000".parse::<SocketAddr>().unwrap());

        // immediately after, nothing new to say and interval not elapsed
        assert!(pex.produce(&a, 62_000).is_none());
    }

    #[test]
    fn test_self_exclusion() {
        let pex = PexSource::from_config(&config());
        let x = key("10.0.0.9:9000");
        pex.mark_capable(x);
        pex.add_event(tid(), PeerEvent::added(x.peer, 1_000));
        // the only queued event is X itself
        assert!(pex.produce(&x, 120_000).is_none());

        // same port on a different address is excluded too
        pex.add_event(
            tid(),
            PeerEvent::added("10.0.0.10:9000".parse().unwrap(), 2_000),
        );
        assert!(pex.produce(&x, 130_000).is_none());
    }

    #[test]
    fn test_not_capable_never_produces() {
        let pex = PexSource::from_config(&config());
        let a = key("10.0.0.1:1000");
        pex.add_event(tid(), PeerEvent::added("10.0.0.2:2000".parse().unwrap(), 0));
        assert!(pex.produce(&a, 600_000).is_none());
    }

    #[test]
    fn test_min_events_respected_until_max_interval() {
        let mut cfg = config();
        cfg.min_pex_events_per_message = 5;
        let pex = PexSource::from_config(&cfg);
        let a = key("10.0.0.1:1000");
        pex.mark_capable(a);
        pex.add_event(tid(), PeerEvent::added("10.0.0.2:2000".parse().unwrap(), 1_000));

        // one event < minEvents, max interval not reached yet
        assert!(pex.produce(&a, 61_000).is_none());
        // past maxMessageInterval a non-empty batch goes out anyway
        assert!(pex.produce(&a, 121_000).is_some());
    }

    #[test]
    fn test_cleanup_trims_up_to_lru() {
        let pex = PexSource::from_config(&config());
        let a = key("10.0.0.1:1000");
        let b = key("10.0.0.2:2000");
        pex.mark_capable(a);
        pex.mark_capable(b);

        pex.add_event(tid(), PeerEvent::added("10.0.0.5:5000".parse().unwrap(), 1_000));
        pex.add_event(tid(), PeerEvent::added("10.0.0.6:6000".parse().unwrap(), 70_000));

        // A was sent everything up to t=70s, B only up to t=65s
        assert!(pex.produce(&a, 70_000).is_some());
        assert!(pex.produce(&b, 65_000).is_some());

        pex.cleanup(80_000);
        // lru=65s: the t=1s event is dropped, the t=70s event stays
        // for B to pick up later
        assert_eq!(pex.queued_events(tid()), 1);
    }

    #[test]
    fn test_events_stay_ordered() {
        let pex = PexSource::from_config(&config());
        pex.add_event(tid(), PeerEvent::added("10.0.0.5:5000".parse().unwrap(), 500));
        pex.add_event(tid(), PeerEvent::added("10.0.0.6:6000".parse().unwrap(), 100));
        pex.add_event(tid(), PeerEvent::added("10.0.0.7:7000".parse().unwrap(), 300));
        let g = pex.events.read();
        let instants: Vec<u64> = g.get(&tid()).unwrap().iter().map(|e| e.instant).collect();
        assert_eq!(instants, vec![100, 300, 500]);
    }

    #[test]
    fn test_drop_torrent_clears_state() {
        let pex = PexSource::from_config(&config());
        let a = key("10.0.0.1:1000");
        pex.mark_capable(a);
        pex.add_event(tid(), PeerEvent::added("10.0.0.2:2000".parse().unwrap(), 0));
        pex.drop_torrent(tid());
        assert_eq!(pex.queued_events(tid()), 0);
        assert!(!pex.is_capable(&a));
    }
}
