//! Elo rating arithmetic for pairwise comparisons.

/// Expected score of `rating_a` against `rating_b`.
pub fn expected_score(rating_a: f64, rating_b: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0))
}

/// Rating points transferred from loser to winner.
///
/// The winner gains `k * (1 - E_winner)` and the loser loses the same
/// amount, so every decisive comparison conserves total rating.
pub fn rating_delta(winner_rating: f64, loser_rating: f64, k_factor: f64) -> f64 {
    k_factor * (1.0 - expected_score(winner_rating, loser_rating))
}
