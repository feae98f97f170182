use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::metrics::format_scores;

/// Parameters of the run that produced a history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryParams {
    pub batch_size: usize,
    pub epochs: usize,
    pub samples: usize,
    pub seed: u64,
    pub validation_samples: usize,
}

/// Per-epoch metrics of one training run.
///
/// Metric lists are keyed by name (`loss`, `acc`, `val_loss`, `val_acc`) and all
/// have one entry per completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Zero-based epoch numbers
    pub epoch: Vec<usize>,
    pub history: BTreeMap<String, Vec<f64>>,
    /// Metric minimised by checkpointing and used to pick the best epoch
    pub monitor: String,
    pub params: HistoryParams,
}

impl TrainingHistory {
    pub(crate) fn new(monitor: impl Into<String>, params: HistoryParams) -> Self {
        Self {
            epoch: Vec::new(),
            history: BTreeMap::new(),
            monitor: monitor.into(),
            params,
        }
    }

    pub(crate) fn record(&mut self, epoch: usize, scores: &[(String, f64)]) {
        self.epoch.push(epoch);
        for (name, value) in scores {
            self.history.entry(name.clone()).or_default().push(*value);
        }
    }

    /// Number of completed epochs
    pub fn epochs(&self) -> usize {
        self.epoch.len()
    }

    pub fn metric(&self, name: &str) -> Option<&[f64]> {
        self.history.get(name).map(Vec::as_slice)
    }

    /// Zero-based epoch where the monitored metric was lowest; the earliest wins ties.
    pub fn best_epoch(&self) -> Option<usize> {
        let values = self.metric(&self.monitor)?;
        values
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
                Some((_, best_value)) if best_value <= v => best,
                _ => Some((i, v)),
            })
            .map(|(i, _)| i)
    }

    /// Every metric's value at the best epoch, sorted by name.
    pub fn best_scores(&self) -> Vec<(String, f64)> {
        let Some(best) = self.best_epoch() else {
            return Vec::new();
        };
        self.history
            .iter()
            .filter_map(|(name, values)| values.get(best).map(|v| (name.clone(), *v)))
            .collect()
    }

    /// `Best epoch 3 of 10: acc: 0.91000 - loss: 0.25000 - ...`
    pub fn summary_line(&self) -> String {
        match self.best_epoch() {
            Some(best) => format!(
                "Best epoch {} of {}: {}",
                best + 1,
                self.epochs(),
                format_scores(&self.best_scores())
            ),
            None => format!("No epochs completed for {}", self.monitor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn history() -> TrainingHistory {
        let mut history = TrainingHistory::new(
            "val_loss",
            HistoryParams {
                batch_size: 2,
                epochs: 3,
                samples: 8,
                seed: 42,
                validation_samples: 2,
            },
        );
        let epoch = |loss: f64, val_loss: f64| {
            vec![
                ("loss".to_string(), loss),
                ("acc".to_string(), 0.5),
                ("val_loss".to_string(), val_loss),
                ("val_acc".to_string(), 1.0 - val_loss),
            ]
        };
        history.record(0, &epoch(0.9, 0.5));
        history.record(1, &epoch(0.6, 0.3));
        history.record(2, &epoch(0.4, 0.4));
        history
    }

    #[test]
    fn test_best_epoch_follows_monitor() {
        let history = history();
        assert_eq!(history.best_epoch(), Some(1));
        assert_eq!(
            history.summary_line(),
            "Best epoch 2 of 3: acc: 0.50000 - loss: 0.60000 - val_acc: 0.70000 - val_loss: 0.30000"
        );
    }

    #[test]
    fn test_ties_prefer_earliest_epoch() {
        let mut history = TrainingHistory::new("loss", history().params);
        history.record(0, &[("loss".to_string(), 0.2)]);
        history.record(1, &[("loss".to_string(), 0.2)]);
        assert_eq!(history.best_epoch(), Some(0));
    }

    #[test]
    fn test_serialized_keys_are_sorted() {
        let json = serde_json::to_string(&history()).unwrap();
        let acc = json.find("\"acc\"").unwrap();
        let loss = json.find("\"loss\"").unwrap();
        let val_acc = json.find("\"val_acc\"").unwrap();
        assert!(acc < loss && loss < val_acc);
        assert!(json.find("\"epoch\"").unwrap() < json.find("\"params\"").unwrap());

        let restored: TrainingHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, history());
    }

    #[test]
    fn test_empty_history() {
        let history = TrainingHistory::new("loss", history().params);
        assert_eq!(history.best_epoch(), None);
        assert!(history.best_scores().is_empty());
    }
}
