//! Trainable networks behind the embedding classifiers.
//!
//! Both networks are `burn` modules trained on the `ndarray` backend wrapped in
//! `Autodiff`, with Adam on sparse categorical cross-entropy. Inference runs on
//! the plain backend through `AutodiffModule::valid`, which also disables
//! dropout. Weights leave a network as a named MessagePack record so the
//! artifact layer can store them apart from the configuration.

pub mod dense;
pub mod recurrent;

use std::fmt::Write as _;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::{AutodiffModule, Module};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Data, ElementConversion, Int, Shape, Tensor};
use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::classifier::error::{ClassifierError, Result};
use crate::classifier::metrics;

pub use dense::{DenseConfig, SoftmaxModel, SoftmaxNetwork};
pub use recurrent::{RecurrentCell, RecurrentConfig, RecurrentModel, RecurrentNetwork, SequenceBatch, SequenceBatcher};

/// Backend the networks are trained on.
pub type TrainBackend = Autodiff<NdArray>;
/// Backend of the inference copies returned by `valid()`.
pub type InferenceBackend = NdArray;

pub(crate) type AdamOptimizer<M> = OptimizerAdaptor<Adam<InferenceBackend>, M, TrainBackend>;
type WeightsRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Smallest probability fed to a logarithm.
pub(crate) const PROBABILITY_EPSILON: f32 = 1e-7;
const LEARNING_RATE: f64 = 1e-3;

pub(crate) fn device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// Loss and accuracy over the training rows of one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

/// One named layer of a network, as reported by `summary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub kind: String,
    /// Output shape without the batch dimension
    pub output_shape: Vec<usize>,
    pub parameters: usize,
    pub trainable: bool,
}

/// A network the trainer can fit one epoch at a time.
pub trait TrainableModel: Sized {
    /// Element type of an input row
    type Element: Clone;
    /// Architecture description, persisted as light metadata
    type Config: Serialize + DeserializeOwned + Clone;

    /// Rebuilds a network from its configuration and an encoded weights record.
    ///
    /// # Errors
    /// - `ValidationError` if the record does not decode or its shapes do not fit
    fn from_parts(config: Self::Config, weights: &[u8]) -> Result<Self>;

    fn config(&self) -> &Self::Config;

    /// Learned parameters, encoded as the heavy weights blob.
    fn weights(&self) -> Result<Vec<u8>>;

    /// Replaces the weights, keeping the optimizer state.
    fn set_weights(&mut self, weights: &[u8]) -> Result<()>;

    /// Number of output probabilities per row
    fn output_size(&self) -> usize;

    /// Runs one shuffled pass over `x`, updating the weights after every batch.
    fn train_epoch(
        &mut self,
        x: ArrayView2<Self::Element>,
        y: &[usize],
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Result<EpochMetrics>;

    /// Class probabilities, one row per input row, computed `batch_size` rows at a time.
    fn predict(&self, x: ArrayView2<Self::Element>, batch_size: usize) -> Result<Array2<f32>>;

    /// Mean cross-entropy (`loss`) and accuracy (`acc`) of the inference pass.
    fn evaluate(
        &self,
        x: ArrayView2<Self::Element>,
        y: &[usize],
        batch_size: usize,
    ) -> Result<Vec<(String, f64)>> {
        check_targets(x.nrows(), y, self.output_size())?;
        let probabilities = self.predict(x, batch_size)?;
        Ok(vec![
            ("loss".to_string(), metrics::cross_entropy(probabilities.view(), y)),
            ("acc".to_string(), metrics::accuracy(probabilities.view(), y)),
        ])
    }

    fn layers(&self) -> Vec<Layer>;

    /// Looks a layer up by name (`embedding`, `rnn`, `dropout`, `softmax`).
    fn layer(&self, name: &str) -> Option<Layer> {
        self.layers().into_iter().find(|layer| layer.name == name)
    }

    /// Layer table with output shapes and parameter counts.
    fn summary(&self) -> String {
        let layers = self.layers();
        let mut out = String::new();
        let _ = writeln!(out, "{:<28}{:<20}{:>10}", "Layer (type)", "Output Shape", "Param #");
        let _ = writeln!(out, "{}", "=".repeat(58));
        for layer in &layers {
            let shape = std::iter::once("None".to_string())
                .chain(layer.output_shape.iter().map(usize::to_string))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(
                out,
                "{:<28}{:<20}{:>10}",
                format!("{} ({})", layer.name, layer.kind),
                format!("({})", shape),
                layer.parameters
            );
        }
        let total: usize = layers.iter().map(|l| l.parameters).sum();
        let trainable: usize = layers.iter().filter(|l| l.trainable).map(|l| l.parameters).sum();
        let _ = writeln!(out, "{}", "=".repeat(58));
        let _ = writeln!(out, "Total params: {}", total);
        let _ = writeln!(out, "Trainable params: {}", trainable);
        let _ = write!(out, "Non-trainable params: {}", total - trainable);
        out
    }
}

/// Adam with lr 0.001, β1 0.9, β2 0.999 and ε 1e-7.
pub(crate) fn adam<M: AutodiffModule<TrainBackend>>() -> AdamOptimizer<M> {
    AdamConfig::new().with_epsilon(1e-7).init()
}

/// Back-propagates `loss` and applies one optimizer update to `model`.
pub(crate) fn optimize<M, O>(model: M, loss: Tensor<TrainBackend, 1>, optimizer: &mut O) -> M
where
    M: AutodiffModule<TrainBackend>,
    O: Optimizer<M, TrainBackend>,
{
    let grads = GradientsParams::from_grads(loss.backward(), &model);
    optimizer.step(LEARNING_RATE, model, grads)
}

/// Encodes the parameters of `module` as a named MessagePack record.
pub(crate) fn encode_record<M: Module<TrainBackend>>(module: &M) -> Result<Vec<u8>> {
    <WeightsRecorder as Recorder<TrainBackend>>::record(&WeightsRecorder::default(), module.clone().into_record(), ())
        .map_err(|e| ClassifierError::ValidationError(format!("Cannot encode weights: {:?}", e)))
}

/// Loads an encoded record into a copy of `module`.
pub(crate) fn decode_record<M: Module<TrainBackend>>(module: &M, weights: &[u8]) -> Result<M> {
    let record = <WeightsRecorder as Recorder<TrainBackend>>::load::<M::Record>(
        &WeightsRecorder::default(),
        weights.to_vec(),
        &device(),
    )
    .map_err(|e| ClassifierError::ValidationError(format!("Cannot decode weights: {:?}", e)))?;
    let loaded = module.clone().load_record(record);
    if loaded.num_params() != module.num_params() {
        return Err(ClassifierError::ValidationError(format!(
            "Weights hold {} parameters, the network has {}",
            loaded.num_params(),
            module.num_params()
        )));
    }
    Ok(loaded)
}

/// A `[rows, columns]` float tensor holding `rows`.
pub(crate) fn float_batch<B: Backend>(rows: ArrayView2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let (n, columns) = rows.dim();
    let values: Vec<f32> = rows.iter().copied().collect();
    Tensor::from_data(Data::new(values, Shape::new([n, columns])).convert(), device)
}

pub(crate) fn class_targets<B: Backend>(y: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = y.iter().map(|&target| target as i64).collect();
    Tensor::from_data(Data::new(values, Shape::new([y.len()])).convert(), device)
}

/// Softmax over the logits, copied out of the backend.
pub(crate) fn probabilities<B: Backend>(logits: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [rows, columns] = logits.dims();
    let data = softmax(logits, 1).into_data().convert::<f32>();
    Array2::from_shape_vec((rows, columns), data.value)
        .map_err(|e| ClassifierError::ValidationError(format!("Malformed network output: {}", e)))
}

/// Running loss and accuracy of one epoch.
#[derive(Debug, Default)]
pub(crate) struct EpochTally {
    loss: f64,
    correct: usize,
    samples: usize,
}

impl EpochTally {
    /// Adds one batch given its mean loss, logits and targets.
    pub(crate) fn add<B: Backend>(&mut self, loss: Tensor<B, 1>, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) {
        let samples = targets.dims()[0];
        self.loss += loss.into_scalar().elem::<f64>() * samples as f64;
        let correct = logits
            .argmax(1)
            .flatten::<1>(0, 1)
            .equal(targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        self.correct += correct as usize;
        self.samples += samples;
    }

    pub(crate) fn finish(&self) -> EpochMetrics {
        let samples = self.samples.max(1) as f64;
        EpochMetrics {
            loss: self.loss / samples,
            accuracy: self.correct as f64 / samples,
        }
    }
}

/// Checks that the targets line up with the rows and the output layer.
pub(crate) fn check_targets(rows: usize, y: &[usize], outputs: usize) -> Result<()> {
    if rows != y.len() {
        return Err(ClassifierError::ValidationError(format!(
            "{} input rows but {} targets",
            rows,
            y.len()
        )));
    }
    if let Some(&bad) = y.iter().find(|&&t| t >= outputs) {
        return Err(ClassifierError::ValidationError(format!(
            "Target {} is out of range for {} outputs",
            bad, outputs
        )));
    }
    Ok(())
}

pub(crate) fn check_shape(what: &str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(ClassifierError::ValidationError(format!(
            "{} has shape {:?}, expected {:?}",
            what, actual, expected
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::loss::CrossEntropyLossConfig;
    use ndarray::array;

    #[test]
    fn test_probabilities_rows_sum_to_one() {
        let logits = float_batch::<InferenceBackend>(array![[1.0f32, 2.0, 3.0], [1000.0, 1000.0, 0.0]].view(), &device());
        let probabilities = probabilities(logits).unwrap();
        assert_eq!(probabilities.dim(), (2, 3));
        for row in probabilities.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((probabilities[[1, 0]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_epoch_tally_weights_batches_by_size() {
        let device = device();
        let loss = CrossEntropyLossConfig::new().init(&device);
        let mut tally = EpochTally::default();

        let logits = float_batch::<InferenceBackend>(array![[5.0f32, 0.0], [0.0, 5.0]].view(), &device);
        let targets = class_targets::<InferenceBackend>(&[0, 0], &device);
        tally.add(loss.forward(logits.clone(), targets.clone()), logits, targets);

        let logits = float_batch::<InferenceBackend>(array![[1.0f32, 0.0]].view(), &device);
        let targets = class_targets::<InferenceBackend>(&[1], &device);
        tally.add(loss.forward(logits.clone(), targets.clone()), logits, targets);

        let metrics = tally.finish();
        assert!((metrics.accuracy - 1.0 / 3.0).abs() < 1e-9);
        let confident = (1.0 + (-5.0f64).exp()).ln();
        let expected = (confident + (5.0 + confident) + (1.0 + (1.0 + (-1.0f64).exp()).ln())) / 3.0;
        assert!((metrics.loss - expected).abs() < 1e-4, "{} vs {}", metrics.loss, expected);
    }

    #[test]
    fn test_check_targets() {
        assert!(check_targets(2, &[0, 1], 2).is_ok());
        assert!(check_targets(3, &[0, 1], 2).is_err());
        assert!(check_targets(2, &[0, 2], 2).is_err());
    }
}
