//! Schulze rank aggregation — a Condorcet-consistent social choice rule.
//!
//! Ballots are strict best-first permutations over the same candidate set.
//! The pipeline: pairwise defeat counts, strongest-path widening
//! (Floyd–Warshall over widest paths), strict beat counts, then a seeded
//! deterministic draw for genuinely tied candidates.
//!
//! This function is pure: no clocks, no I/O, and identical inputs (ballots
//! plus seed) always produce identical output.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tie_break::order_with_tie_break;

/// Error for malformed aggregation input.
///
/// Ballots are validated at submission time, so any of these reaching the
/// aggregator signals an internal bug upstream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error("no ballots to aggregate")]
    NoBallots,

    #[error("no candidates to rank")]
    NoCandidates,

    #[error("ballot {index} has length {got}, expected {expected}")]
    BallotLength {
        index: usize,
        got: usize,
        expected: usize,
    },

    #[error("ballot {index} is not a permutation of the candidate set")]
    NotAPermutation { index: usize },
}

/// Aggregated group ranking over one round's candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialRanking {
    /// Candidate indices, winner first. Always a total order.
    pub order: Vec<usize>,
    /// Dense 1-based rank per candidate with ties preserved — tied
    /// candidates share a rank here even though `order` is total.
    pub ranks: Vec<u32>,
    /// Number of candidates each candidate strictly beats.
    pub beat_counts: Vec<u32>,
    /// Whether the seeded draw had to break a tie.
    pub tie_broken: bool,
}

impl SocialRanking {
    /// The winning candidate index.
    pub fn winner(&self) -> usize {
        self.order[0]
    }
}

/// Aggregate strict ballots into a total group order.
///
/// `ballots[k]` is participant k's best-first permutation of candidate
/// indices `0..m`. `seed` drives the deterministic tie-break draw.
pub fn aggregate(ballots: &[Vec<usize>], seed: u64) -> Result<SocialRanking, AggregationError> {
    if ballots.is_empty() {
        return Err(AggregationError::NoBallots);
    }
    let m = ballots[0].len();
    if m == 0 {
        return Err(AggregationError::NoCandidates);
    }
    for (index, ballot) in ballots.iter().enumerate() {
        if ballot.len() != m {
            return Err(AggregationError::BallotLength {
                index,
                got: ballot.len(),
                expected: m,
            });
        }
        let mut seen = vec![false; m];
        for &candidate in ballot {
            if candidate >= m || seen[candidate] {
                return Err(AggregationError::NotAPermutation { index });
            }
            seen[candidate] = true;
        }
    }

    let defeats = pairwise_defeats(ballots, m);
    let paths = strongest_paths(&defeats);
    let beat_counts = beat_counts(&paths);
    let (order, tie_broken) = order_with_tie_break(&beat_counts, seed);
    let ranks = dense_ranks(&beat_counts);

    Ok(SocialRanking {
        order,
        ranks,
        beat_counts,
        tie_broken,
    })
}

/// `d[a][b]` = number of ballots placing a strictly above b.
fn pairwise_defeats(ballots: &[Vec<usize>], m: usize) -> Vec<Vec<u32>> {
    let mut defeats = vec![vec![0u32; m]; m];
    for ballot in ballots {
        let mut position = vec![0usize; m];
        for (pos, &candidate) in ballot.iter().enumerate() {
            position[candidate] = pos;
        }
        for a in 0..m {
            for b in 0..m {
                if a != b && position[a] < position[b] {
                    defeats[a][b] += 1;
                }
            }
        }
    }
    defeats
}

/// Widest-path strengths seeded from majority defeats.
fn strongest_paths(defeats: &[Vec<u32>]) -> Vec<Vec<u32>> {
    let m = defeats.len();
    let mut paths = vec![vec![0u32; m]; m];
    for a in 0..m {
        for b in 0..m {
            if a != b && defeats[a][b] > defeats[b][a] {
                paths[a][b] = defeats[a][b];
            }
        }
    }
    for via in 0..m {
        for a in 0..m {
            if a == via {
                continue;
            }
            for b in 0..m {
                if b == via || b == a {
                    continue;
                }
                paths[a][b] = paths[a][b].max(paths[a][via].min(paths[via][b]));
            }
        }
    }
    paths
}

/// Strict wins per candidate: a beats b iff `p[a][b] > p[b][a]`.
fn beat_counts(paths: &[Vec<u32>]) -> Vec<u32> {
    let m = paths.len();
    (0..m)
        .map(|a| {
            (0..m)
                .filter(|&b| b != a && paths[a][b] > paths[b][a])
                .count() as u32
        })
        .collect()
}

/// Dense 1-based ranks from beat counts; equal counts share a rank.
fn dense_ranks(beat_counts: &[u32]) -> Vec<u32> {
    let mut distinct: Vec<u32> = beat_counts.to_vec();
    distinct.sort_unstable_by(|a, b| b.cmp(a));
    distinct.dedup();
    beat_counts
        .iter()
        .map(|count| {
            distinct
                .iter()
                .position(|c| c == count)
                .map(|p| p as u32 + 1)
                .unwrap_or(0)
        })
        .collect()
}
