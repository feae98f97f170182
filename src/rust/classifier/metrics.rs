use ndarray::ArrayView2;

use super::utils::argmax;
use crate::network::PROBABILITY_EPSILON;

/// Fraction of rows whose most probable column is the target.
pub fn accuracy(probabilities: ArrayView2<f32>, targets: &[usize]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let correct = probabilities
        .rows()
        .into_iter()
        .zip(targets)
        .filter(|(row, target)| argmax(row.view()) == **target)
        .count();
    correct as f64 / targets.len() as f64
}

/// Mean `-ln p[target]`, probabilities clipped away from zero.
pub fn cross_entropy(probabilities: ArrayView2<f32>, targets: &[usize]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let total: f64 = probabilities
        .rows()
        .into_iter()
        .zip(targets)
        .map(|(row, &target)| -(row[target].max(PROBABILITY_EPSILON) as f64).ln())
        .sum();
    total / targets.len() as f64
}

/// Multi-class log-loss. Each row is clipped to `[1e-7, 1 - 1e-7]` and
/// renormalised before the target probability is read.
pub fn log_loss(probabilities: ArrayView2<f32>, targets: &[usize]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let eps = PROBABILITY_EPSILON as f64;
    let total: f64 = probabilities
        .rows()
        .into_iter()
        .zip(targets)
        .map(|(row, &target)| {
            let clipped = |p: f32| (p as f64).clamp(eps, 1.0 - eps);
            let norm: f64 = row.iter().map(|&p| clipped(p)).sum();
            -(clipped(row[target]) / norm).ln()
        })
        .sum();
    total / targets.len() as f64
}

/// `"<metric>: <value>"` pairs sorted by metric name and joined by `" - "`.
pub fn format_scores(scores: &[(String, f64)]) -> String {
    let mut sorted: Vec<&(String, f64)> = scores.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted
        .iter()
        .map(|(name, value)| format!("{}: {:.5}", name, value))
        .collect::<Vec<_>>()
        .join(" - ")
}
