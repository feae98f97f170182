use std::fmt;

use burn::module::{AutodiffModule, Module};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
    adam, check_shape, check_targets, class_targets, decode_record, device, encode_record, float_batch, optimize,
    probabilities, AdamOptimizer, EpochTally, EpochMetrics, Layer, TrainBackend, TrainableModel,
};
use crate::classifier::error::{ClassifierError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    pub input_size: usize,
    pub num_labels: usize,
    pub dropout: f32,
    pub seed: u64,
}

/// Dropout on the input features followed by a dense projection to the labels.
#[derive(Module, Debug)]
pub struct SoftmaxModel<B: Backend> {
    dropout: Dropout,
    softmax: Linear<B>,
}

impl<B: Backend> SoftmaxModel<B> {
    /// Logits, one row per feature row.
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.softmax.forward(self.dropout.forward(features))
    }
}

/// The bag-of-embeddings network and its optimizer state.
pub struct SoftmaxNetwork {
    config: DenseConfig,
    model: SoftmaxModel<TrainBackend>,
    optimizer: Option<AdamOptimizer<SoftmaxModel<TrainBackend>>>,
}

impl SoftmaxNetwork {
    pub fn new(config: DenseConfig) -> Self {
        TrainBackend::seed(config.seed);
        let model = SoftmaxModel {
            dropout: DropoutConfig::new(config.dropout as f64).init(),
            softmax: LinearConfig::new(config.input_size, config.num_labels)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init(&device()),
        };
        Self {
            config,
            model,
            optimizer: None,
        }
    }

    fn check_input(&self, x: &ArrayView2<f32>) -> Result<()> {
        if x.ncols() != self.config.input_size {
            return Err(ClassifierError::ValidationError(format!(
                "Input rows have {} features, the network expects {}",
                x.ncols(),
                self.config.input_size
            )));
        }
        Ok(())
    }
}

impl Clone for SoftmaxNetwork {
    /// Copies the weights; the copy starts with a fresh optimizer.
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            model: self.model.clone(),
            optimizer: None,
        }
    }
}

impl fmt::Debug for SoftmaxNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftmaxNetwork")
            .field("config", &self.config)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl TrainableModel for SoftmaxNetwork {
    type Element = f32;
    type Config = DenseConfig;

    fn from_parts(config: DenseConfig, weights: &[u8]) -> Result<Self> {
        let mut network = Self::new(config);
        network.set_weights(weights)?;
        Ok(network)
    }

    fn config(&self) -> &DenseConfig {
        &self.config
    }

    fn weights(&self) -> Result<Vec<u8>> {
        encode_record(&self.model)
    }

    fn set_weights(&mut self, weights: &[u8]) -> Result<()> {
        let model = decode_record(&self.model, weights)?;
        check_shape(
            "softmax kernel",
            &model.softmax.weight.val().dims(),
            &[self.config.input_size, self.config.num_labels],
        )?;
        self.model = model;
        Ok(())
    }

    fn output_size(&self) -> usize {
        self.config.num_labels
    }

    fn train_epoch(
        &mut self,
        x: ArrayView2<f32>,
        y: &[usize],
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Result<EpochMetrics> {
        self.check_input(&x)?;
        check_targets(x.nrows(), y, self.config.num_labels)?;

        TrainBackend::seed(rng.gen());
        let mut order: Vec<usize> = (0..y.len()).collect();
        order.shuffle(rng);

        let device = device();
        let loss = CrossEntropyLossConfig::new().init(&device);
        let mut optimizer = self.optimizer.take().unwrap_or_else(adam);
        let mut tally = EpochTally::default();
        for batch in order.chunks(batch_size.max(1)) {
            let inputs = float_batch::<TrainBackend>(x.select(Axis(0), batch).view(), &device);
            let targets: Vec<usize> = batch.iter().map(|&i| y[i]).collect();
            let targets = class_targets::<TrainBackend>(&targets, &device);

            let logits = self.model.forward(inputs);
            let batch_loss = loss.forward(logits.clone(), targets.clone());
            tally.add(batch_loss.clone().detach(), logits.detach(), targets);
            self.model = optimize(self.model.clone(), batch_loss, &mut optimizer);
        }
        self.optimizer = Some(optimizer);

        Ok(tally.finish())
    }

    fn predict(&self, x: ArrayView2<f32>, batch_size: usize) -> Result<Array2<f32>> {
        self.check_input(&x)?;
        let model = self.model.valid();
        let device = device();
        let mut out = Array2::zeros((x.nrows(), self.config.num_labels));
        for (rows, mut target) in x
            .axis_chunks_iter(Axis(0), batch_size.max(1))
            .zip(out.axis_chunks_iter_mut(Axis(0), batch_size.max(1)))
        {
            target.assign(&probabilities(model.forward(float_batch(rows, &device)))?);
        }
        Ok(out)
    }

    fn layers(&self) -> Vec<Layer> {
        vec![
            Layer {
                name: "dropout".into(),
                kind: "Dropout".into(),
                output_shape: vec![self.config.input_size],
                parameters: 0,
                trainable: true,
            },
            Layer {
                name: "softmax".into(),
                kind: "Dense".into(),
                output_shape: vec![self.config.num_labels],
                parameters: self.model.softmax.num_params(),
                trainable: true,
            },
        ]
    }
}
