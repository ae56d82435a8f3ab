use std::cmp::Ordering;
use std::collections::HashSet;

use super::factor_store::FactorStore;
use rayon::prelude::*;

/// Descending score, ties by ascending index.
fn by_score_then_index(a: &(usize, f64), b: &(usize, f64)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

/// Keeps the `top_k` best `(index, score)` pairs in ranked order.
pub fn rank_top_k(mut scored: Vec<(usize, f64)>, top_k: usize) -> Vec<(usize, f64)> {
    if top_k == 0 {
        return Vec::new();
    }
    if scored.len() > top_k {
        scored.select_nth_unstable_by(top_k - 1, by_score_then_index);
        scored.truncate(top_k);
    }
    scored.sort_by(by_score_then_index);
    scored
}

/// Scores every item not in `excluded` for user `u` and returns the best `top_k`.
///
/// The caller has already checked that `u` is in bounds.
pub fn score_candidates(
    store: &FactorStore,
    u: usize,
    excluded: &HashSet<usize>,
    top_k: usize,
) -> Vec<(usize, f64)> {
    let scored: Vec<(usize, f64)> = (0..store.n_items())
        .into_par_iter()
        .filter(|i| !excluded.contains(i))
        .map(|i| (i, store.predict_unchecked(u, i)))
        .collect();

    rank_top_k(scored, top_k)
}
