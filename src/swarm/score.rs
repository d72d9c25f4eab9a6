//! Availability counting and the rarest-first-with-choke-adjustment peer
//! score.
use crate::bitfield::Bitfield;
use std::collections::HashMap;

/// For each piece the local client doesn't have, counts how many of
/// `peer_bitfields` have it. Pieces the local bitfield already has are
/// omitted from the result.
pub fn availability(local: &Bitfield, peer_bitfields: &[&Bitfield]) -> HashMap<usize, usize> {
    let mut counts = HashMap::new();
    for i in 0..local.num_pieces() {
        if local.has(i) {
            continue;
        }
        let count = peer_bitfields.iter().filter(|b| b.has(i)).count();
        counts.insert(i, count);
    }
    counts
}

/// Ranks a peer's usefulness to the local client.
///
/// A peer with nothing we need scores `1` if unchoked (it might pick up a
/// piece of interest later) and `0` otherwise. Otherwise the score sums
/// `1 + num_peers - availability[p]` over every piece `p` the peer has and
/// we need — rarer pieces (lower availability) score higher — halved while
/// we remain choked by that peer.
pub fn peer_score(
    peer_bitfield: &Bitfield,
    unchoked: bool,
    local: &Bitfield,
    availability: &HashMap<usize, usize>,
    num_peers: usize,
) -> u32 {
    let mut pieces_score: i64 = 0;
    let mut has_interest = false;

    for i in 0..local.num_pieces() {
        if local.has(i) || !peer_bitfield.has(i) {
            continue;
        }
        has_interest = true;
        let avail = *availability.get(&i).unwrap_or(&0) as i64;
        pieces_score += 1 + num_peers as i64 - avail;
    }

    if !has_interest {
        return if unchoked { 1 } else { 0 };
    }

    if unchoked {
        pieces_score as u32
    } else {
        (pieces_score / 2) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_with_no_interesting_piece_scores_by_choke_state_only() {
        let local = Bitfield::from_bytes(vec![0xff], 8);
        let peer = Bitfield::from_bytes(vec![0x00], 8);
        let avail = availability(&local, &[&peer]);
        assert_eq!(peer_score(&peer, true, &local, &avail, 1), 1);
        assert_eq!(peer_score(&peer, false, &local, &avail, 1), 0);
    }

    #[test]
    fn choked_peer_scores_half_of_unchoked_for_the_same_pieces() {
        let local = Bitfield::new(8);
        let peer = Bitfield::from_bytes(vec![0xff], 8);
        let avail = availability(&local, &[&peer]);
        let unchoked_score = peer_score(&peer, true, &local, &avail, 1);
        let choked_score = peer_score(&peer, false, &local, &avail, 1);
        assert_eq!(choked_score, unchoked_score / 2);
    }

    #[test]
    fn rarer_pieces_score_higher_than_common_ones() {
        let local = Bitfield::new(2);
        let rare_holder = Bitfield::from_bytes(vec![0b1000_0000], 2);
        let common_holder_a = Bitfield::from_bytes(vec![0b0100_0000], 2);
        let common_holder_b = Bitfield::from_bytes(vec![0b0100_0000], 2);
        let avail = availability(&local, &[&rare_holder, &common_holder_a, &common_holder_b]);
        let rare_score = peer_score(&rare_holder, true, &local, &avail, 3);
        let common_score = peer_score(&common_holder_a, true, &local, &avail, 3);
        assert!(rare_score > common_score);
    }
}
