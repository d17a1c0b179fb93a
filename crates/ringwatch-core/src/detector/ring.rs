//! Ring arithmetic over dense daemon ranks `1..=n`.
//!
//! Each daemon watches its predecessor and is watched by its successor.

use crate::process_id::Rank;
use std::collections::BTreeSet;

/// The rank `me` watches when the ring is first built.
pub fn initial_observing(me: Rank, n: u32) -> Rank {
    previous_rank(me, n)
}

/// The rank expected to watch `me` when the ring is first built.
pub fn initial_observer(me: Rank, n: u32) -> Rank {
    (n + me) % n + 1
}

/// The rank before `rank`, wrapping from 1 to `n`.
pub fn previous_rank(rank: Rank, n: u32) -> Rank {
    if rank <= 1 { n } else { rank - 1 }
}

/// How many steps ahead of `from` the rank `to` sits on the ring.
///
/// `ring_distance(r, r, n) == 0`; a direct successor is at distance 1.
pub fn ring_distance(from: Rank, to: Rank, n: u32) -> u32 {
    (n - from + to) % n
}

/// Walk backwards from `start` to the first rank not in `failed`.
///
/// Returns `None` when the walk comes back around to `me`, meaning every
/// other daemon has failed.
pub fn next_live_predecessor(
    start: Rank,
    me: Rank,
    n: u32,
    failed: &BTreeSet<Rank>,
) -> Option<Rank> {
    let mut rank = previous_rank(start, n);
    for _ in 0..n {
        if rank == me {
            return None;
        }
        if !failed.contains(&rank) {
            return Some(rank);
        }
        rank = previous_rank(rank, n);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_links_small_ring() {
        assert_eq!(initial_observing(1, 4), 4);
        assert_eq!(initial_observing(3, 4), 2);
        assert_eq!(initial_observer(4, 4), 1);
        assert_eq!(initial_observer(3, 4), 4);
        assert_eq!(initial_observer(1, 4), 2);
    }

    #[test]
    fn test_ring_is_a_single_cycle() {
        for n in 2..=50u32 {
            for start in 1..=n {
                let mut visited = BTreeSet::new();
                let mut rank = start;
                for _ in 0..n {
                    assert!(visited.insert(rank), "n={n} revisited {rank}");
                    rank = initial_observing(rank, n);
                }
                assert_eq!(rank, start);
                assert_eq!(visited.len() as u32, n);
            }
        }
    }

    #[test]
    fn test_observer_and_observing_are_inverse() {
        for n in 2..=50u32 {
            for rank in 1..=n {
                assert_eq!(initial_observing(initial_observer(rank, n), n), rank);
                assert_eq!(initial_observer(initial_observing(rank, n), n), rank);
            }
        }
    }

    #[test]
    fn test_ring_distance() {
        assert_eq!(ring_distance(2, 2, 4), 0);
        assert_eq!(ring_distance(2, 3, 4), 1);
        assert_eq!(ring_distance(2, 4, 4), 2);
        assert_eq!(ring_distance(2, 1, 4), 3);
        assert_eq!(ring_distance(4, 1, 4), 1);
    }

    #[test]
    fn test_next_live_predecessor_skips_failed() {
        let failed = BTreeSet::from([3, 2]);
        assert_eq!(next_live_predecessor(3, 4, 5, &failed), Some(1));

        let failed = BTreeSet::from([1]);
        assert_eq!(next_live_predecessor(1, 3, 4, &failed), Some(4));
    }

    #[test]
    fn test_next_live_predecessor_collapsed_ring() {
        let failed = BTreeSet::from([1, 2, 3]);
        assert_eq!(next_live_predecessor(3, 4, 4, &failed), None);
        assert_eq!(next_live_predecessor(1, 2, 2, &BTreeSet::from([1])), None);
    }
}
