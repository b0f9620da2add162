// Tit-for-tat choking. Every tick the top uploaders-to-us (or
// downloaders-from-us once seeding) among interested peers get the
// regular unchoke slots; every Nth tick one random interested choked
// peer gets the optimistic slot.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use tracing::trace;

use crate::type_aliases::PeerHandle;

/// One peer's view for a choker tick. `transferred` is a running total
/// (downloaded from the peer while leeching, uploaded to it while
/// seeding); the choker keeps the per-tick deltas itself.
#[derive(Debug, Clone, Copy)]
pub struct ChokerPeer {
    pub peer: PeerHandle,
    pub interested: bool,
    pub choked: bool,
    pub transferred: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeDecision {
    pub peer: PeerHandle,
    pub should_choke: bool,
}

pub struct Choker {
    regular_slots: usize,
    optimistic_every: u32,
    tick_no: u32,
    prev_transferred: HashMap<PeerHandle, u64>,
}

impl Choker {
    pub fn new(regular_slots: usize, optimistic_every: u32) -> Self {
        Self {
            regular_slots,
            optimistic_every,
            tick_no: 0,
            prev_transferred: HashMap::new(),
        }
    }

    pub fn tick(&mut self, peers: &[ChokerPeer]) -> Vec<ChokeDecision> {
        self.tick_no = self.tick_no.wrapping_add(1);
        let optimistic_tick = self.tick_no % self.optimistic_every == 0;

        let mut deltas: Vec<(PeerHandle, u64)> = peers
            .iter()
            .filter(|p| p.interested)
            .map(|p| {
                let prev = self.prev_transferred.get(&p.peer).copied().unwrap_or(0);
                (p.peer, p.transferred.saturating_sub(prev))
            })
            .collect();
        deltas.sort_by(|a, b| b.1.cmp(&a.1));

        let mut unchoke: Vec<PeerHandle> = deltas
            .iter()
            .take(self.regular_slots)
            .map(|(peer, _)| *peer)
            .collect();

        if optimistic_tick {
            let candidates: Vec<PeerHandle> = peers
                .iter()
                .filter(|p| p.interested && p.choked && !unchoke.contains(&p.peer))
                .map(|p| p.peer)
                .collect();
            if let Some(lucky) = candidates.choose(&mut rand::thread_rng()) {
                trace!("optimistic unchoke: {}", lucky);
                unchoke.push(*lucky);
            }
        }

        self.prev_transferred = peers.iter().map(|p| (p.peer, p.transferred)).collect();

        peers
            .iter()
            .filter(|p| p.interested)
            .map(|p| ChokeDecision {
                peer: p.peer,
                should_choke: !unchoke.contains(&p.peer),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> PeerHandle {
        format!("10.1.1.1:{port}").parse().unwrap()
    }

    fn peer(port: u16, interested: bool, choked: bool, transferred: u64) -> ChokerPeer {
        ChokerPeer {
            peer: addr(port),
            interested,
            choked,
            transferred,
        }
    }

    fn unchoked(decisions: &[ChokeDecision]) -> Vec<PeerHandle> {
        decisions
            .iter()
            .filter(|d| !d.should_choke)
            .map(|d| d.peer)
            .collect()
    }

    #[test]
    fn test_top_n_by_delta_unchoked() {
        let mut choker = Choker::new(2, 1000);
        // first tick establishes the baseline
        choker.tick(&[
            peer(1, true, true, 0),
            peer(2, true, true, 0),
            peer(3, true, true, 0),
        ]);
        let decisions = choker.tick(&[
            peer(1, true, true, 100),
            peer(2, true, true, 5000),
            peer(3, true, true, 900),
        ]);
        let mut got = unchoked(&decisions);
        got.sort();
        let mut want = vec![addr(2), addr(3)];
        want.sort();
        assert_eq!(got, want);
    }

    #[test]
    fn test_uninterested_peers_ignored() {
        let mut choker = Choker::new(4, 1000);
        let decisions = choker.tick(&[peer(1, false, true, 10_000), peer(2, true, true, 1)]);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].peer, addr(2));
        assert!(!decisions[0].should_choke);
    }

    #[test]
    fn test_optimistic_unchoke_every_third_tick() {
        let mut choker = Choker::new(1, 3);
        let peers = vec![
            peer(1, true, true, 0),
            peer(2, true, true, 0),
            peer(3, true, true, 0),
        ];
        // ticks 1 and 2: only the one regular slot gets unchoked
        assert_eq!(unchoked(&choker.tick(&peers)).len(), 1);
        assert_eq!(unchoked(&choker.tick(&peers)).len(), 1);
        // tick 3: regular slot + the optimistic one
        assert_eq!(unchoked(&choker.tick(&peers)).len(), 2);
    }

    #[test]
    fn test_delta_resets_each_tick() {
        let mut choker = Choker::new(1, 1000);
        choker.tick(&[peer(1, true, true, 10_000), peer(2, true, true, 0)]);
        // peer 1 transferred a lot historically but nothing this tick
        let decisions = choker.tick(&[peer(1, true, true, 10_000), peer(2, true, true, 500)]);
        assert_eq!(unchoked(&decisions), vec![addr(2)]);
    }
}
