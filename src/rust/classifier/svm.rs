//! RBF-kernel support vector classification with probability estimates.
//!
//! Multi-class problems are decomposed one-vs-one. Each binary machine is
//! solved by SMO with maximal-violating-pair working set selection and
//! calibrated with Platt scaling; the pairwise probabilities are then coupled
//! into one distribution per sample. Kernel rows are computed on demand and
//! kept in a least-recently-used cache of bounded size.

use std::collections::HashMap;
use std::rc::Rc;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::error::{ClassifierError, Result};
use crate::config::Gamma;

const TOLERANCE: f64 = 1e-3;
const TAU: f64 = 1e-12;
const MIN_PAIR_PROBABILITY: f64 = 1e-7;
/// Memory the kernel row cache of one binary problem may use.
const KERNEL_CACHE_BYTES: usize = 200 * 1024 * 1024;

fn rbf(a: ArrayView1<f32>, b: ArrayView1<f32>, gamma: f64) -> f64 {
    let distance: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    (-gamma * distance).exp()
}

/// `1 / (n_features * var(X))`, or 1 when the features do not vary.
fn scale_gamma(x: ArrayView2<f32>) -> f64 {
    let n = x.len();
    if n == 0 {
        return 1.0;
    }
    let mean = x.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let variance = x.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n as f64;
    if variance > 0.0 {
        1.0 / (x.ncols() as f64 * variance)
    } else {
        1.0
    }
}

struct CachedRow {
    values: Rc<[f64]>,
    last_accessed: u64,
}

/// RBF kernel rows of a sample set, computed when first asked for. Once
/// `capacity` rows are held the least recently used one is evicted.
struct KernelCache<'a> {
    samples: ArrayView2<'a, f32>,
    gamma: f64,
    capacity: usize,
    rows: HashMap<usize, CachedRow>,
    clock: u64,
    misses: usize,
}

impl<'a> KernelCache<'a> {
    fn new(samples: ArrayView2<'a, f32>, gamma: f64, budget_bytes: usize) -> Self {
        let row_bytes = (samples.nrows() * std::mem::size_of::<f64>()).max(1);
        Self {
            samples,
            gamma,
            capacity: (budget_bytes / row_bytes).max(2),
            rows: HashMap::new(),
            clock: 0,
            misses: 0,
        }
    }

    /// `K(i, t)` for every sample `t`.
    fn row(&mut self, i: usize) -> Rc<[f64]> {
        self.clock += 1;
        if let Some(cached) = self.rows.get_mut(&i) {
            cached.last_accessed = self.clock;
            return Rc::clone(&cached.values);
        }

        if self.rows.len() >= self.capacity {
            if let Some(&oldest) = self
                .rows
                .iter()
                .min_by_key(|(_, cached)| cached.last_accessed)
                .map(|(key, _)| key)
            {
                self.rows.remove(&oldest);
            }
        }
        self.misses += 1;
        let x = self.samples.row(i);
        let values: Rc<[f64]> = self
            .samples
            .axis_iter(Axis(0))
            .map(|other| rbf(x, other, self.gamma))
            .collect();
        self.rows.insert(
            i,
            CachedRow {
                values: Rc::clone(&values),
                last_accessed: self.clock,
            },
        );
        values
    }

    fn diagonal(&self, i: usize) -> f64 {
        rbf(self.samples.row(i), self.samples.row(i), self.gamma)
    }
}

/// Dual coefficients of one binary problem, `+1` for `positive`.
struct DualSolution {
    alpha: Vec<f64>,
    rho: f64,
}

/// Solves `min ½αᵀQα − eᵀα` subject to `0 ≤ α ≤ C`, `yᵀα = 0`.
fn smo(kernel: &mut KernelCache, y: &[f64], c: f64) -> DualSolution {
    let n = y.len();
    let mut alpha = vec![0.0; n];
    let mut gradient = vec![-1.0; n];
    let upper = |a: f64| a >= c;
    let lower = |a: f64| a <= 0.0;

    let max_iterations = (100 * n).max(100_000);
    let mut iterations = 0;
    while iterations < max_iterations {
        iterations += 1;

        let mut g_max = f64::NEG_INFINITY;
        let mut g_max2 = f64::NEG_INFINITY;
        let mut i_sel = None;
        let mut j_sel = None;
        for t in 0..n {
            let in_up = if y[t] > 0.0 { !upper(alpha[t]) } else { !lower(alpha[t]) };
            let in_low = if y[t] > 0.0 { !lower(alpha[t]) } else { !upper(alpha[t]) };
            let violation = -y[t] * gradient[t];
            if in_up && violation > g_max {
                g_max = violation;
                i_sel = Some(t);
            }
            if in_low && -violation > g_max2 {
                g_max2 = -violation;
                j_sel = Some(t);
            }
        }
        let (Some(i), Some(j)) = (i_sel, j_sel) else {
            break;
        };
        if g_max + g_max2 < TOLERANCE {
            break;
        }

        let row_i = kernel.row(i);
        let row_j = kernel.row(j);
        let quad = (kernel.diagonal(i) + kernel.diagonal(j) - 2.0 * row_i[j]).max(TAU);
        let (old_i, old_j) = (alpha[i], alpha[j]);
        if y[i] != y[j] {
            let delta = (-gradient[i] - gradient[j]) / quad;
            let diff = alpha[i] - alpha[j];
            alpha[i] += delta;
            alpha[j] += delta;
            if diff > 0.0 {
                if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = diff;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = -diff;
            }
            if diff > 0.0 {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = c - diff;
                }
            } else if alpha[j] > c {
                alpha[j] = c;
                alpha[i] = c + diff;
            }
        } else {
            let delta = (gradient[i] - gradient[j]) / quad;
            let sum = alpha[i] + alpha[j];
            alpha[i] -= delta;
            alpha[j] += delta;
            if sum > c {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = sum - c;
                }
            } else if alpha[j] < 0.0 {
                alpha[j] = 0.0;
                alpha[i] = sum;
            }
            if sum > c {
                if alpha[j] > c {
                    alpha[j] = c;
                    alpha[i] = sum - c;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = sum;
            }
        }

        let (delta_i, delta_j) = (alpha[i] - old_i, alpha[j] - old_j);
        for (t, g) in gradient.iter_mut().enumerate() {
            *g += y[t] * (y[i] * row_i[t] * delta_i + y[j] * row_j[t] * delta_j);
        }
    }
    if iterations >= max_iterations {
        log::warn!("SMO stopped after {} iterations without converging", iterations);
    }

    let mut upper_bound = f64::INFINITY;
    let mut lower_bound = f64::NEG_INFINITY;
    let mut free_sum = 0.0;
    let mut free_count = 0usize;
    for t in 0..n {
        let yg = y[t] * gradient[t];
        if upper(alpha[t]) {
            if y[t] < 0.0 {
                upper_bound = upper_bound.min(yg);
            } else {
                lower_bound = lower_bound.max(yg);
            }
        } else if lower(alpha[t]) {
            if y[t] > 0.0 {
                upper_bound = upper_bound.min(yg);
            } else {
                lower_bound = lower_bound.max(yg);
            }
        } else {
            free_count += 1;
            free_sum += yg;
        }
    }
    let rho = if free_count > 0 {
        free_sum / free_count as f64
    } else {
        (upper_bound + lower_bound) / 2.0
    };

    DualSolution { alpha, rho }
}

/// Numerically stable `1 / (1 + exp(a·f + b))`.
fn platt_probability(decision: f64, a: f64, b: f64) -> f64 {
    let f_ab = decision * a + b;
    if f_ab >= 0.0 {
        (-f_ab).exp() / (1.0 + (-f_ab).exp())
    } else {
        1.0 / (1.0 + f_ab.exp())
    }
}

/// Fits Platt's sigmoid with the Newton method of Lin, Lin and Weng.
fn fit_sigmoid(decisions: &[f64], positive: &[bool]) -> (f64, f64) {
    let prior1 = positive.iter().filter(|&&p| p).count() as f64;
    let prior0 = positive.len() as f64 - prior1;
    let high_target = (prior1 + 1.0) / (prior1 + 2.0);
    let low_target = 1.0 / (prior0 + 2.0);
    let targets: Vec<f64> = positive
        .iter()
        .map(|&p| if p { high_target } else { low_target })
        .collect();

    let objective = |a: f64, b: f64| -> f64 {
        decisions
            .iter()
            .zip(&targets)
            .map(|(&f, &t)| {
                let f_ab = f * a + b;
                if f_ab >= 0.0 {
                    t * f_ab + (1.0 + (-f_ab).exp()).ln()
                } else {
                    (t - 1.0) * f_ab + (1.0 + f_ab.exp()).ln()
                }
            })
            .sum()
    };

    let (max_iterations, min_step, sigma, eps) = (100, 1e-10, 1e-12, 1e-5);
    let mut a = 0.0;
    let mut b = ((prior0 + 1.0) / (prior1 + 1.0)).ln();
    let mut value = objective(a, b);

    for _ in 0..max_iterations {
        let (mut h11, mut h22, mut h21, mut g1, mut g2) = (sigma, sigma, 0.0, 0.0, 0.0);
        for (&f, &t) in decisions.iter().zip(&targets) {
            let f_ab = f * a + b;
            let (p, q) = if f_ab >= 0.0 {
                let e = (-f_ab).exp();
                (e / (1.0 + e), 1.0 / (1.0 + e))
            } else {
                let e = f_ab.exp();
                (1.0 / (1.0 + e), e / (1.0 + e))
            };
            let d2 = p * q;
            h11 += f * f * d2;
            h22 += d2;
            h21 += f * d2;
            let d1 = t - p;
            g1 += f * d1;
            g2 += d1;
        }
        if g1.abs() < eps && g2.abs() < eps {
            break;
        }

        let det = h11 * h22 - h21 * h21;
        let da = -(h22 * g1 - h21 * g2) / det;
        let db = -(-h21 * g1 + h11 * g2) / det;
        let gd = g1 * da + g2 * db;

        let mut step = 1.0;
        while step >= min_step {
            let (new_a, new_b) = (a + step * da, b + step * db);
            let new_value = objective(new_a, new_b);
            if new_value < value + 1e-4 * step * gd {
                a = new_a;
                b = new_b;
                value = new_value;
                break;
            }
            step /= 2.0;
        }
        if step < min_step {
            log::debug!("Platt scaling line search failed");
            break;
        }
    }
    (a, b)
}

/// Couples pairwise probabilities `r[i][j] = P(i | i or j)` into one
/// distribution (Wu, Lin and Weng, second method).
fn couple(r: &Array2<f64>) -> Array1<f64> {
    let k = r.nrows();
    let mut q = Array2::<f64>::zeros((k, k));
    for t in 0..k {
        for j in 0..k {
            if j != t {
                q[[t, t]] += r[[j, t]] * r[[j, t]];
                q[[t, j]] = -r[[j, t]] * r[[t, j]];
            }
        }
    }

    let mut p = Array1::from_elem(k, 1.0 / k as f64);
    let eps = 0.005 / k as f64;
    for _ in 0..100.max(k) {
        let mut qp = q.dot(&p);
        let mut pqp = p.dot(&qp);
        let max_error = qp.iter().map(|v| (v - pqp).abs()).fold(0.0, f64::max);
        if max_error < eps {
            break;
        }
        for t in 0..k {
            let diff = (-qp[t] + pqp) / q[[t, t]];
            p[t] += diff;
            pqp = (pqp + diff * (diff * q[[t, t]] + 2.0 * qp[t])) / ((1.0 + diff) * (1.0 + diff));
            for j in 0..k {
                qp[j] = (qp[j] + diff * q[[t, j]]) / (1.0 + diff);
                p[j] /= 1.0 + diff;
            }
        }
    }
    p
}

/// One calibrated binary machine separating `positive` from `negative`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BinaryMachine {
    positive: usize,
    negative: usize,
    support_vectors: Array2<f32>,
    /// `αᵢ·yᵢ` for every support vector
    coefficients: Vec<f64>,
    rho: f64,
    platt_a: f64,
    platt_b: f64,
}

impl BinaryMachine {
    fn decision(&self, x: ArrayView1<f32>, gamma: f64) -> f64 {
        self.support_vectors
            .axis_iter(Axis(0))
            .zip(&self.coefficients)
            .map(|(sv, &coefficient)| coefficient * rbf(sv, x, gamma))
            .sum::<f64>()
            - self.rho
    }

    /// Probability that `x` belongs to `positive`.
    fn probability(&self, x: ArrayView1<f32>, gamma: f64) -> f64 {
        platt_probability(self.decision(x, gamma), self.platt_a, self.platt_b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportVectorClassifier {
    num_classes: usize,
    /// Classes seen during fitting, ascending
    classes: Vec<usize>,
    gamma: f64,
    machines: Vec<BinaryMachine>,
}

impl SupportVectorClassifier {
    /// Fits one machine per pair of classes present in `y`.
    ///
    /// # Errors
    /// - `TrainingFailure` if fewer than two classes are present
    pub fn fit(x: ArrayView2<f32>, y: &[usize], num_classes: usize, c: f64, gamma: Gamma) -> Result<Self> {
        let mut classes: Vec<usize> = y.to_vec();
        classes.sort_unstable();
        classes.dedup();
        if classes.len() < 2 {
            return Err(ClassifierError::TrainingFailure(format!(
                "The number of classes has to be greater than one; got {}",
                classes.len()
            )));
        }
        if let Some(&bad) = classes.iter().find(|&&class| class >= num_classes) {
            return Err(ClassifierError::TrainingFailure(format!(
                "Class {} is out of range for {} labels",
                bad, num_classes
            )));
        }

        let gamma = match gamma {
            Gamma::Scale => scale_gamma(x),
            Gamma::Value(value) => value,
        };
        log::debug!("Fitting {} binary SVMs with gamma {}", classes.len() * (classes.len() - 1) / 2, gamma);

        let mut machines = Vec::new();
        for (position, &positive) in classes.iter().enumerate() {
            for &negative in &classes[position + 1..] {
                machines.push(Self::fit_pair(x, y, positive, negative, c, gamma));
            }
        }

        Ok(Self {
            num_classes,
            classes,
            gamma,
            machines,
        })
    }

    fn fit_pair(x: ArrayView2<f32>, y: &[usize], positive: usize, negative: usize, c: f64, gamma: f64) -> BinaryMachine {
        let rows: Vec<usize> = (0..y.len()).filter(|&i| y[i] == positive || y[i] == negative).collect();
        let signs: Vec<f64> = rows.iter().map(|&i| if y[i] == positive { 1.0 } else { -1.0 }).collect();
        let samples = x.select(Axis(0), &rows);

        let n = rows.len();
        let mut kernel = KernelCache::new(samples.view(), gamma, KERNEL_CACHE_BYTES);
        let solution = smo(&mut kernel, &signs, c);
        let support: Vec<usize> = (0..n).filter(|&i| solution.alpha[i] > 0.0).collect();
        let coefficients: Vec<f64> = support.iter().map(|&i| solution.alpha[i] * signs[i]).collect();

        let mut decisions = vec![-solution.rho; n];
        for (&s, &coefficient) in support.iter().zip(&coefficients) {
            let row = kernel.row(s);
            for (decision, k) in decisions.iter_mut().zip(row.iter()) {
                *decision += coefficient * k;
            }
        }
        log::debug!(
            "Binary SVM {} vs {}: {} support vectors, {} kernel rows computed",
            positive,
            negative,
            support.len(),
            kernel.misses
        );
        let is_positive: Vec<bool> = signs.iter().map(|&s| s > 0.0).collect();
        let (platt_a, platt_b) = fit_sigmoid(&decisions, &is_positive);

        BinaryMachine {
            positive,
            negative,
            support_vectors: samples.select(Axis(0), &support),
            coefficients,
            rho: solution.rho,
            platt_a,
            platt_b,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_support_vectors(&self) -> usize {
        self.machines.iter().map(|m| m.support_vectors.nrows()).sum()
    }

    /// Class probabilities; classes absent from the training data get 0.
    pub fn predict_proba(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let k = self.classes.len();
        let slot = |class: usize| self.classes.iter().position(|&c| c == class);
        let mut probabilities = Array2::zeros((x.nrows(), self.num_classes));

        for (row, mut out) in x.axis_iter(Axis(0)).zip(probabilities.axis_iter_mut(Axis(0))) {
            let mut pairwise = Array2::<f64>::zeros((k, k));
            for machine in &self.machines {
                if let (Some(i), Some(j)) = (slot(machine.positive), slot(machine.negative)) {
                    let p = machine
                        .probability(row, self.gamma)
                        .clamp(MIN_PAIR_PROBABILITY, 1.0 - MIN_PAIR_PROBABILITY);
                    pairwise[[i, j]] = p;
                    pairwise[[j, i]] = 1.0 - p;
                }
            }
            for (position, p) in couple(&pairwise).iter().enumerate() {
                out[self.classes[position]] = *p as f32;
            }
        }
        probabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_coupling_two_classes_matches_pairwise() {
        let r = array![[0.0, 0.8], [0.2, 0.0]];
        let p = couple(&r);
        assert!((p[0] - 0.8).abs() < 1e-3);
        assert!((p.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_coupling_three_classes_is_distribution() {
        let r = array![[0.0, 0.9, 0.8], [0.1, 0.0, 0.6], [0.2, 0.4, 0.0]];
        let p = couple(&r);
        assert!((p.sum() - 1.0).abs() < 1e-6);
        assert!(p[0] > p[1] && p[0] > p[2]);
    }

    #[test]
    fn test_sigmoid_orders_decisions() {
        let decisions = [2.0, 1.5, 1.0, -1.0, -1.2, -2.0];
        let positive = [true, true, true, false, false, false];
        let (a, b) = fit_sigmoid(&decisions, &positive);
        assert!(a < 0.0);
        assert!(platt_probability(2.0, a, b) > 0.5);
        assert!(platt_probability(-2.0, a, b) < 0.5);
    }

    #[test]
    fn test_separates_two_clusters() {
        let x = array![
            [0.0f32, 0.1],
            [0.1, 0.0],
            [0.0, 0.0],
            [0.1, 0.1],
            [1.0, 0.9],
            [0.9, 1.0],
            [1.0, 1.0],
            [0.9, 0.9]
        ];
        let y = [0, 0, 0, 0, 1, 1, 1, 1];
        let svm = SupportVectorClassifier::fit(x.view(), &y, 2, 1.0, Gamma::Scale).unwrap();
        assert!(svm.num_support_vectors() > 0);

        let probabilities = svm.predict_proba(array![[0.05f32, 0.05], [0.95, 0.95]].view());
        assert!(probabilities[[0, 0]] > 0.5);
        assert!(probabilities[[1, 1]] > 0.5);
        for row in probabilities.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_absent_class_gets_zero_probability() {
        let x = array![[0.0f32], [0.1], [1.0], [0.9]];
        let y = [0, 0, 2, 2];
        let svm = SupportVectorClassifier::fit(x.view(), &y, 3, 1.0, Gamma::Value(1.0)).unwrap();
        let probabilities = svm.predict_proba(array![[0.0f32]].view());
        assert_eq!(probabilities.dim(), (1, 3));
        assert_eq!(probabilities[[0, 1]], 0.0);
        assert!(probabilities[[0, 0]] > probabilities[[0, 2]]);
    }

    #[test]
    fn test_kernel_cache_evicts_least_recently_used() {
        let samples = array![[0.0f32], [1.0], [2.0], [3.0]];
        // room for two rows of four values
        let mut cache = KernelCache::new(samples.view(), 0.5, 2 * 4 * 8);
        assert_eq!(cache.capacity, 2);

        let row = cache.row(0);
        assert_eq!(row.len(), 4);
        assert_eq!(row[0], 1.0);
        assert!((row[2] - (-2.0f64).exp()).abs() < 1e-12);
        assert_eq!(cache.diagonal(3), 1.0);

        cache.row(1);
        cache.row(0);
        cache.row(2);
        assert_eq!(cache.rows.len(), 2);
        assert!(cache.rows.contains_key(&0));
        assert!(!cache.rows.contains_key(&1));
        assert_eq!(cache.misses, 3);
    }

    #[test]
    fn test_small_kernel_cache_gives_same_solution() {
        let x = array![
            [0.0f32, 0.1],
            [0.1, 0.0],
            [0.4, 0.5],
            [0.1, 0.1],
            [1.0, 0.9],
            [0.5, 0.4],
            [1.0, 1.0],
            [0.9, 0.9]
        ];
        let y = [1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0];

        let full = smo(&mut KernelCache::new(x.view(), 2.0, KERNEL_CACHE_BYTES), &y, 1.0);
        let mut tiny = KernelCache::new(x.view(), 2.0, 0);
        let constrained = smo(&mut tiny, &y, 1.0);
        assert!(tiny.rows.len() <= 2);
        assert_eq!(constrained.alpha, full.alpha);
        assert_eq!(constrained.rho, full.rho);
    }

    #[test]
    fn test_single_class_fails() {
        let x = array![[0.0f32], [1.0]];
        assert!(matches!(
            SupportVectorClassifier::fit(x.view(), &[1, 1], 2, 1.0, Gamma::Scale),
            Err(ClassifierError::TrainingFailure(_))
        ));
    }
}
