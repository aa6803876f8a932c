//! Candidate leader selection.
//!
//! Every candidate evaluates the same pure function over the same inputs, so
//! all honest nodes agree on the next producer without exchanging messages.

use crate::persistence::CandidateNode;

/// Producer elected for the next block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leader {
    /// Candidate id, or 0 for the first-block key holder.
    pub id: u64,
    pub public_key: String,
}

/// Number of most recent producers excluded from a round of `n` candidates.
pub fn window_size(n: usize) -> usize {
    let mut k = (n as f64).sqrt() as usize;
    while k * k < n {
        k += 1;
    }
    while k > 0 && (k - 1) * (k - 1) >= n {
        k -= 1;
    }
    k
}

/// Picks the next producer.
///
/// `recent_producers` holds the `node_position` of recent blocks, most recent
/// first; only the first `window_size(n)` entries are consulted.
/// `prev_position` is the producer of the current head.
pub fn select_leader(
    candidates: &[CandidateNode],
    recent_producers: &[u64],
    prev_position: u64,
    first_block_public_key: &str,
) -> Option<Leader> {
    let mut sorted: Vec<&CandidateNode> = candidates.iter().collect();
    sorted.sort_by_key(|c| c.id);

    let chosen = match sorted.len() {
        0 => {
            return Some(Leader {
                id: 0,
                public_key: first_block_public_key.to_string(),
            })
        }
        1 => sorted[0],
        2 => sorted
            .iter()
            .copied()
            .find(|c| c.id != prev_position)
            .unwrap_or(sorted[0]),
        n => {
            let window = &recent_producers[..window_size(n).min(recent_producers.len())];
            sorted
                .iter()
                .copied()
                .filter(|c| !window.contains(&c.id))
                // max_by_key keeps the last maximum, so compare on reversed id.
                .max_by_key(|c| (c.reply_count, std::cmp::Reverse(c.id)))?
        }
    };
    Some(Leader {
        id: chosen.id,
        public_key: chosen.node_pub_key.clone(),
    })
}
