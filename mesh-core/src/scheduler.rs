//! Holder scheduling: which swarm holder serves which chunk request.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::protocol::PeerId;

/// Pick one holder uniformly at random. `None` if there are no holders.
pub fn pick_holder<'a, R: Rng + ?Sized>(holders: &'a [PeerId], rng: &mut R) -> Option<&'a PeerId> {
    holders.choose(rng)
}

/// Assign each offset to a holder drawn independently at random.
/// If `holders` is empty, returns empty.
pub fn assign_offsets<R: Rng + ?Sized>(
    offsets: &[u64],
    holders: &[PeerId],
    rng: &mut R,
) -> Vec<(u64, PeerId)> {
    if holders.is_empty() {
        return vec![];
    }
    offsets
        .iter()
        .filter_map(|&off| pick_holder(holders, rng).map(|p| (off, p.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_zero_holders_empty() {
        let out = assign_offsets(&[0, 10], &[], &mut rand::thread_rng());
        assert!(out.is_empty());
    }

    #[test]
    fn assign_to_single_holder() {
        let holder = PeerId::from("d");
        let out = assign_offsets(&[0, 10, 20], &[holder.clone()], &mut rand::thread_rng());
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|(_, p)| *p == holder));
    }

    #[test]
    fn every_assignment_is_a_known_holder() {
        let holders = vec![PeerId::from("d"), PeerId::from("e")];
        let offsets: Vec<u64> = (0..200).collect();
        let out = assign_offsets(&offsets, &holders, &mut rand::thread_rng());
        assert_eq!(out.len(), offsets.len());
        assert!(out.iter().all(|(_, p)| holders.contains(p)));
        // 200 independent fair draws landing on a single holder is vanishingly unlikely.
        assert!(out.iter().any(|(_, p)| *p == holders[0]));
        assert!(out.iter().any(|(_, p)| *p == holders[1]));
    }
}
