//! Pure scoring functions: cosine similarity, the recall-ranking formula,
//! narrative gravity, and word-overlap heuristics. Everything here is
//! deterministic and I/O-free.

use std::collections::HashSet;

/// Compute cosine similarity between two vectors. Mismatched lengths or
/// zero-norm inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// The central recall-ranking formula. Search results are ordered by this
/// composite, not by raw vector distance:
///
/// ```text
/// recall  = similarity * w_sim + (importance / 10) * w_imp + recency * w_rec
/// recency = exp(-days_since_last_access / decay_days)
/// ```
///
/// With the default weights (0.7 / 0.2 / 0.1) and a 30-day decay scale the
/// recency term halves roughly every 21 days.
pub fn recall_score(
    similarity: f32,
    importance: u8,
    days_since_access: f64,
    weights: (f64, f64, f64),
    decay_days: f64,
) -> f64 {
    let (w_sim, w_imp, w_rec) = weights;
    similarity as f64 * w_sim
        + (importance as f64 / 10.0) * w_imp
        + recency(days_since_access, decay_days) * w_rec
}

/// Exponential time decay on last access.
pub fn recency(days_since_access: f64, decay_days: f64) -> f64 {
    (-days_since_access.max(0.0) / decay_days).exp()
}

/// Time-decayed importance used to rank anchors for display:
/// `importance * max(0.5^(days_old / half_life), min_floor)`.
pub fn narrative_gravity(importance: u8, days_old: f64, half_life_days: f64, min_floor: f64) -> f64 {
    let decay = 0.5f64.powf(days_old.max(0.0) / half_life_days);
    importance as f64 * decay.max(min_floor)
}

/// Jaccard word overlap between two texts, case-insensitive.
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let wa: HashSet<String> = words(a);
    let wb: HashSet<String> = words(b);
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let intersection = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Fraction of `query` words that appear in `reference` words. Used by the
/// cheap topic-drift heuristic, where the cached context is much larger than
/// the query and plain Jaccard would always look drifted.
pub fn query_coverage(query: &str, reference: &[String]) -> f64 {
    let qw = words(query);
    if qw.is_empty() {
        return 1.0;
    }
    let rw: HashSet<String> = reference
        .iter()
        .flat_map(|s| words(s))
        .collect();
    let hits = qw.iter().filter(|w| rw.contains(*w)).count();
    hits as f64 / qw.len() as f64
}

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(String::from)
        .collect()
}
