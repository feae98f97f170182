use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::error::{ClassifierError, Result};
use super::history::{HistoryParams, TrainingHistory};
use super::metrics::format_scores;
use crate::artifact::ArtifactDir;
use crate::config::TrainOptions;
use crate::network::TrainableModel;

/// Outcome of a fit: the history and whether the weights on disk already hold
/// the best epoch.
#[derive(Debug)]
pub(crate) struct TrainingRun {
    pub history: TrainingHistory,
    pub checkpointed: bool,
}

/// A row split into training and validation parts.
struct Split<T> {
    train_x: Array2<T>,
    train_y: Vec<usize>,
    validation: Option<(Array2<T>, Vec<usize>)>,
}

/// Partitions `0..n` into training and validation indices, holding out
/// `round(n * fraction)` random rows with at least one on each side.
pub(crate) fn holdout(n: usize, fraction: f64, rng: &mut StdRng) -> Result<(Vec<usize>, Vec<usize>)> {
    if n < 2 {
        return Err(ClassifierError::InvalidConfiguration(format!(
            "A validation split needs at least 2 samples, got {}",
            n
        )));
    }
    let held_out = ((n as f64 * fraction).round() as usize).clamp(1, n - 1);
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);
    let train = order.split_off(held_out);
    Ok((train, order))
}

fn split<T: Clone>(
    x: ArrayView2<T>,
    y: &[usize],
    fraction: Option<f64>,
    rng: &mut StdRng,
) -> Result<Split<T>> {
    let Some(fraction) = fraction else {
        return Ok(Split {
            train_x: x.to_owned(),
            train_y: y.to_vec(),
            validation: None,
        });
    };

    let (train, validation) = holdout(y.len(), fraction, rng)?;
    Ok(Split {
        train_x: x.select(Axis(0), &train),
        train_y: train.iter().map(|&i| y[i]).collect(),
        validation: Some((
            x.select(Axis(0), &validation),
            validation.iter().map(|&i| y[i]).collect(),
        )),
    })
}

fn as_training_failure(err: ClassifierError) -> ClassifierError {
    match err {
        ClassifierError::ValidationError(message) => ClassifierError::TrainingFailure(message),
        other => other,
    }
}

/// Runs the epoch loop for `options.epochs` epochs.
///
/// With a validation split `val_loss` is monitored, otherwise `loss`. When a
/// checkpoint directory is given together with a validation split, the weights
/// are written every time `val_loss` improves and the network is reset to the
/// best of them once the loop ends.
///
/// # Errors
/// - `TrainingFailure` on a non-finite loss or malformed inputs
/// - `PersistenceIo` if a checkpoint cannot be written
pub(crate) fn fit<N: TrainableModel>(
    network: &mut N,
    x: ArrayView2<N::Element>,
    y: &[usize],
    options: &TrainOptions,
    checkpoint: Option<&ArtifactDir>,
) -> Result<TrainingRun> {
    options.validate()?;
    if x.nrows() != y.len() {
        return Err(ClassifierError::InvalidConfiguration(format!(
            "{} encoded rows but {} labels",
            x.nrows(),
            y.len()
        )));
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let data = split(x, y, options.validation_fraction, &mut rng)?;
    let validating = data.validation.is_some();
    let monitor = if validating { "val_loss" } else { "loss" };
    let mut history = TrainingHistory::new(
        monitor,
        HistoryParams {
            batch_size: options.batch_size,
            epochs: options.epochs,
            samples: data.train_y.len(),
            seed: options.seed,
            validation_samples: data.validation.as_ref().map_or(0, |(_, vy)| vy.len()),
        },
    );
    if options.reports_progress() {
        log::info!(
            "Train on {} samples, validate on {} samples",
            history.params.samples,
            history.params.validation_samples
        );
    }

    let checkpoint = checkpoint.filter(|_| validating);
    let mut best: Option<f64> = None;
    let mut best_weights = None;

    for epoch in 0..options.epochs {
        let metrics = network
            .train_epoch(data.train_x.view(), &data.train_y, options.batch_size, &mut rng)
            .map_err(as_training_failure)?;
        if !metrics.loss.is_finite() {
            return Err(ClassifierError::TrainingFailure(format!(
                "loss became {} in epoch {}",
                metrics.loss,
                epoch + 1
            )));
        }

        let mut scores = vec![
            ("acc".to_string(), metrics.accuracy),
            ("loss".to_string(), metrics.loss),
        ];
        if let Some((vx, vy)) = &data.validation {
            let validation = network
                .evaluate(vx.view(), vy, options.batch_size)
                .map_err(as_training_failure)?;
            scores.extend(validation.into_iter().map(|(name, value)| (format!("val_{}", name), value)));
        }
        history.record(epoch, &scores);
        if options.reports_progress() {
            log::info!("Epoch {}/{} - {}", epoch + 1, options.epochs, format_scores(&scores));
        }

        let monitored = scores
            .iter()
            .find(|(name, _)| name == monitor)
            .map(|(_, value)| *value)
            .ok_or_else(|| ClassifierError::TrainingFailure(format!("network did not report {}", monitor)))?;
        if !monitored.is_finite() {
            return Err(ClassifierError::TrainingFailure(format!(
                "{} became {} in epoch {}",
                monitor,
                monitored,
                epoch + 1
            )));
        }

        if let Some(dir) = checkpoint {
            match best {
                Some(previous) if monitored >= previous => {
                    if options.reports_progress() {
                        log::info!("Epoch {}: {} did not improve from {:.5}", epoch + 1, monitor, previous);
                    }
                }
                _ => {
                    if options.reports_progress() {
                        log::info!(
                            "Epoch {}: {} improved from {:.5} to {:.5}, saving model to {}",
                            epoch + 1,
                            monitor,
                            best.unwrap_or(f64::INFINITY),
                            monitored,
                            dir.model_path().display()
                        );
                    }
                    let weights = network.weights()?;
                    dir.write_weights(&weights)?;
                    best = Some(monitored);
                    best_weights = Some(weights);
                }
            }
        }
    }

    let checkpointed = best_weights.is_some();
    if let Some(weights) = best_weights {
        log::debug!("Restoring weights of the best checkpoint ({} {:?})", monitor, best);
        network.set_weights(&weights)?;
    }

    Ok(TrainingRun {
        history,
        checkpointed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{EpochMetrics, Layer};

    /// Reports scripted validation losses; its weights are the number of epochs run.
    #[derive(Debug, Clone)]
    struct ScriptedNetwork {
        epochs_run: usize,
        validation_losses: Vec<f64>,
        training_loss: f64,
    }

    impl ScriptedNetwork {
        fn new(validation_losses: Vec<f64>) -> Self {
            Self {
                epochs_run: 0,
                validation_losses,
                training_loss: 1.0,
            }
        }
    }

    impl TrainableModel for ScriptedNetwork {
        type Element = f32;
        type Config = Vec<f64>;

        fn from_parts(config: Vec<f64>, weights: &[u8]) -> Result<Self> {
            let mut network = Self::new(config);
            network.set_weights(weights)?;
            Ok(network)
        }

        fn config(&self) -> &Vec<f64> {
            &self.validation_losses
        }

        fn weights(&self) -> Result<Vec<u8>> {
            Ok((self.epochs_run as u64).to_le_bytes().to_vec())
        }

        fn set_weights(&mut self, weights: &[u8]) -> Result<()> {
            let bytes: [u8; 8] = weights
                .try_into()
                .map_err(|_| ClassifierError::ValidationError("expected 8 bytes".into()))?;
            self.epochs_run = u64::from_le_bytes(bytes) as usize;
            Ok(())
        }

        fn output_size(&self) -> usize {
            2
        }

        fn train_epoch(
            &mut self,
            _x: ArrayView2<f32>,
            _y: &[usize],
            _batch_size: usize,
            _rng: &mut StdRng,
        ) -> Result<EpochMetrics> {
            self.epochs_run += 1;
            Ok(EpochMetrics {
                loss: self.training_loss / self.epochs_run as f64,
                accuracy: 0.5,
            })
        }

        fn predict(&self, x: ArrayView2<f32>, _batch_size: usize) -> Result<Array2<f32>> {
            Ok(Array2::from_elem((x.nrows(), 2), 0.5))
        }

        fn evaluate(&self, _x: ArrayView2<f32>, _y: &[usize], _batch_size: usize) -> Result<Vec<(String, f64)>> {
            Ok(vec![
                ("loss".to_string(), self.validation_losses[self.epochs_run - 1]),
                ("acc".to_string(), 0.5),
            ])
        }

        fn layers(&self) -> Vec<Layer> {
            Vec::new()
        }
    }

    fn data(n: usize) -> (Array2<f32>, Vec<usize>) {
        (Array2::zeros((n, 1)), (0..n).map(|i| i % 2).collect())
    }

    #[test]
    fn test_checkpoint_keeps_lowest_validation_loss() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ArtifactDir::create(dir.path()).unwrap();
        let (x, y) = data(10);
        let mut network = ScriptedNetwork::new(vec![0.5, 0.3, 0.4]);
        let options = TrainOptions::default().with_epochs(3).with_validation_fraction(0.2);

        let run = fit(&mut network, x.view(), &y, &options, Some(&artifact)).unwrap();

        assert!(run.checkpointed);
        assert_eq!(run.history.monitor, "val_loss");
        assert_eq!(run.history.metric("val_loss").unwrap(), &[0.5, 0.3, 0.4]);
        assert_eq!(run.history.best_epoch(), Some(1));
        assert_eq!(run.history.params.validation_samples, 2);
        assert_eq!(run.history.params.samples, 8);

        let digest = artifact.weights_digest().unwrap();
        let on_disk = artifact.read_weights(&digest).unwrap();
        assert_eq!(on_disk, 2u64.to_le_bytes());
        assert_eq!(network.epochs_run, 2);
    }

    #[test]
    fn test_without_validation_monitors_training_loss() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ArtifactDir::create(dir.path()).unwrap();
        let (x, y) = data(4);
        let mut network = ScriptedNetwork::new(vec![]);
        let options = TrainOptions::default().with_epochs(2);

        let run = fit(&mut network, x.view(), &y, &options, Some(&artifact)).unwrap();

        assert!(!run.checkpointed);
        assert_eq!(run.history.monitor, "loss");
        assert_eq!(run.history.epochs(), 2);
        assert!(run.history.metric("val_loss").is_none());
        assert!(!artifact.model_path().exists());
        assert_eq!(network.epochs_run, 2);
    }

    #[test]
    fn test_non_finite_loss_fails() {
        let (x, y) = data(4);
        let mut network = ScriptedNetwork::new(vec![]);
        network.training_loss = f64::NAN;
        let err = fit(&mut network, x.view(), &y, &TrainOptions::default(), None).unwrap_err();
        assert!(matches!(err, ClassifierError::TrainingFailure(_)));
    }

    #[test]
    fn test_split_sizes() {
        let (x, y) = data(5);
        let mut rng = StdRng::seed_from_u64(0);
        let split_data = split(x.view(), &y, Some(0.01), &mut rng).unwrap();
        assert_eq!(split_data.train_y.len(), 4);
        assert_eq!(split_data.validation.unwrap().1.len(), 1);

        let split_data = split(x.view(), &y, Some(0.99), &mut rng).unwrap();
        assert_eq!(split_data.train_y.len(), 1);

        let (x, y) = data(1);
        assert!(split(x.view(), &y, Some(0.5), &mut rng).is_err());
    }
}
