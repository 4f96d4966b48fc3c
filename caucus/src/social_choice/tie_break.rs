//! Deterministic tie-breaking for genuine Condorcet ties.
//!
//! The draw is seeded from a stable hash of (deliberation id, round,
//! candidate ids), so re-running aggregation on the same inputs always
//! reproduces the same order.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

/// Derive the tie-break seed for one round's aggregation.
pub fn tie_break_seed(deliberation_id: &str, round: u32, candidate_ids: &[String]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(deliberation_id.as_bytes());
    hasher.update(round.to_be_bytes());
    for id in candidate_ids {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Order candidate indices by descending beat count, breaking equal counts
/// with a seeded shuffle. Returns the order (winner first) and whether any
/// tie had to be broken.
pub fn order_with_tie_break(beat_counts: &[u32], seed: u64) -> (Vec<usize>, bool) {
    let m = beat_counts.len();

    // Seeded permutation of candidate indices; a candidate's position in it
    // is its draw key.
    let mut shuffled: Vec<usize> = (0..m).collect();
    shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut draw_key = vec![0usize; m];
    for (pos, &candidate) in shuffled.iter().enumerate() {
        draw_key[candidate] = pos;
    }

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| {
        beat_counts[b]
            .cmp(&beat_counts[a])
            .then(draw_key[a].cmp(&draw_key[b]))
    });

    let mut sorted_counts = beat_counts.to_vec();
    sorted_counts.sort_unstable();
    let tie_broken = sorted_counts.windows(2).any(|w| w[0] == w[1]);

    (order, tie_broken)
}
