use crate::algorithms::FactorStore;
use crate::models::RatingTriple;

/// Triples whose indices fall outside the store are ignored.
fn residuals<'a>(
    store: &'a FactorStore,
    ratings: &'a [RatingTriple],
) -> impl Iterator<Item = f64> + 'a {
    ratings
        .iter()
        .filter_map(move |t| store.predict(t.user_idx, t.item_idx).ok().map(|p| t.rating - p))
}

pub fn rmse(store: &FactorStore, ratings: &[RatingTriple]) -> f64 {
    let (sum, count) = residuals(store, ratings).fold((0.0, 0usize), |(s, n), e| (s + e * e, n + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

pub fn mae(store: &FactorStore, ratings: &[RatingTriple]) -> f64 {
    let (sum, count) = residuals(store, ratings).fold((0.0, 0usize), |(s, n), e| (s + e.abs(), n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
