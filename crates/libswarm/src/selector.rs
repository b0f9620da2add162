// Piece selection strategies. Rarest-first orders pieces by ascending
// availability; the randomized flavour shuffles runs of equal count so
// ties break fairly without ever swapping pieces across counts.

use rand::Rng;

use crate::{availability::PieceStatistics, type_aliases::BS};

/// Pieces are queued as `(piece_index << 32) | count` packed into 64
/// bits, ordered by count ascending, then piece index ascending.
fn zip(piece_index: u32, count: u32) -> u64 {
    ((piece_index as u64) << 32) | count as u64
}

fn piece_index(zipped: u64) -> u32 {
    (zipped >> 32) as u32
}

fn count(zipped: u64) -> u32 {
    zipped as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selector {
    #[default]
    RarestFirst,
    RandomizedRarest,
    Sequential,
}

impl Selector {
    /// A lazy sequence of selectable piece indices. Pieces the local
    /// side has and pieces no peer advertises are never emitted.
    pub fn iter_pieces(&self, stats: &PieceStatistics, have: &BS) -> SelectorIter {
        let selectable = (0..stats.total_pieces())
            .filter(|idx| !have.get(*idx as usize).map(|b| *b).unwrap_or(false))
            .filter(|idx| stats.count(*idx) > 0);

        match self {
            Selector::Sequential => SelectorIter::new_sequential(selectable.collect()),
            Selector::RarestFirst | Selector::RandomizedRarest => {
                let mut queue: Vec<u64> = selectable
                    .map(|idx| zip(idx, stats.count(idx)))
                    .collect();
                queue.sort_by_key(|z| (count(*z), piece_index(*z)));
                SelectorIter::new_ordered(queue, *self == Selector::RandomizedRarest)
            }
        }
    }
}

pub struct SelectorIter {
    list: Vec<u64>,
    position: usize,
    limit: usize,
    randomized: bool,
}

impl SelectorIter {
    fn new_sequential(indices: Vec<u32>) -> Self {
        Self {
            list: indices.into_iter().map(|idx| zip(idx, 0)).collect(),
            position: 0,
            limit: usize::MAX,
            randomized: false,
        }
    }

    fn new_ordered(list: Vec<u64>, randomized: bool) -> Self {
        let mut it = Self {
            list,
            position: 0,
            limit: 0,
            randomized,
        };
        it.limit = it.calculate_limit(0);
        it
    }

    /// End (exclusive) of the run of equal counts starting at
    /// `position`. Shuffling stays inside such a run, otherwise rarer
    /// pieces could get pushed behind more available ones.
    fn calculate_limit(&self, position: usize) -> usize {
        if position >= self.list.len() {
            return position;
        }
        let run_count = count(self.list[position]);
        let mut limit = position + 1;
        while limit < self.list.len() && count(self.list[limit]) == run_count {
            limit += 1;
        }
        limit
    }
}

impl Iterator for SelectorIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.position >= self.list.len() {
            return None;
        }
        if self.randomized {
            let bound = self.limit - self.position;
            if bound >= 2 {
                let random_position = self.position + rand::thread_rng().gen_range(0..bound);
                self.list.swap(self.position, random_position);
            }
        }
        let result = piece_index(self.list[self.position]);
        self.position += 1;
        if self.randomized && self.position == self.limit && self.position < self.list.len() {
            self.limit = self.calculate_limit(self.position);
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_aliases::BF;

    fn stats_from_counts(counts: &[u32]) -> PieceStatistics {
        let mut stats = PieceStatistics::new(counts.len() as u32);
        for (idx, c) in counts.iter().enumerate() {
            for _ in 0..*c {
                stats.on_have(idx as u32);
            }
        }
        stats
    }

    fn no_have(n: usize) -> BF {
        BF::repeat(false, n)
    }

    #[test]
    fn test_rarest_first_is_topological() {
        let counts = [5, 1, 3, 1, 2, 4];
        let stats = stats_from_counts(&counts);
        let order: Vec<u32> = Selector::RarestFirst
            .iter_pieces(&stats, &no_have(counts.len()))
            .collect();
        assert_eq!(order, vec![1, 3, 4, 2, 5, 0]);
        // every emitted prefix only contains counts <= the rest
        for (i, a) in order.iter().enumerate() {
            for b in &order[i..] {
                assert!(counts[*a as usize] <= counts[*b as usize]);
            }
        }
    }

    #[test]
    fn test_zero_count_never_emitted() {
        let stats = stats_from_counts(&[0, 2, 0, 1]);
        let order: Vec<u32> = Selector::RarestFirst
            .iter_pieces(&stats, &no_have(4))
            .collect();
        assert_eq!(order, vec![3, 1]);
    }

    #[test]
    fn test_have_pieces_omitted() {
        let stats = stats_from_counts(&[1, 1, 1]);
        let mut have = no_have(3);
        have.set(1, true);
        let order: Vec<u32> = Selector::RarestFirst.iter_pieces(&stats, &have).collect();
        assert_eq!(order, vec![0, 2]);
    }

    #[test]
    fn test_sequential_is_ascending() {
        let stats = stats_from_counts(&[1, 0, 2, 1, 9]);
        let order: Vec<u32> = Selector::Sequential
            .iter_pieces(&stats, &no_have(5))
            .collect();
        assert_eq!(order, vec![0, 2, 3, 4]);
    }

    #[test]
    fn test_randomized_runs_never_swap_across_counts() {
        let counts = [3, 1, 1, 1, 2];
        let stats = stats_from_counts(&counts);
        for _ in 0..100 {
            let order: Vec<u32> = Selector::RandomizedRarest
                .iter_pieces(&stats, &no_have(counts.len()))
                .collect();
            assert_eq!(order.len(), 5);
            // count-1 run first, in any order
            let mut first_run: Vec<u32> = order[..3].to_vec();
            first_run.sort_unstable();
            assert_eq!(first_run, vec![1, 2, 3]);
            assert_eq!(order[3], 4);
            assert_eq!(order[4], 0);
        }
    }

    #[test]
    fn test_randomized_tie_break_is_roughly_uniform() {
        // counts=[3,1,1,1,2]: position 0 of the emission is uniform
        // over {1,2,3}. With 1000 draws, expect ~333 each; chi-square
        // over 3 bins at 95% confidence is 5.99.
        let counts = [3, 1, 1, 1, 2];
        let stats = stats_from_counts(&counts);
        let mut occurrences = [0f64; 3];
        let draws = 1000;
        for _ in 0..draws {
            let first = Selector::RandomizedRarest
                .iter_pieces(&stats, &no_have(counts.len()))
                .next()
                .unwrap();
            occurrences[(first - 1) as usize] += 1.0;
        }
        let expected = draws as f64 / 3.0;
        let chi2: f64 = occurrences
            .iter()
            .map(|o| (o - expected) * (o - expected) / expected)
            .sum();
        assert!(chi2 < 5.99 * 2.0, "chi2={chi2}, occurrences={occurrences:?}");
    }
}
