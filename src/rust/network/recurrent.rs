use std::fmt;

use burn::data::dataloader::batcher::Batcher;
use burn::module::{AutodiffModule, Module, Param};
use burn::nn::gru::{Gru, GruConfig};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, EmbeddingRecord, Initializer, Linear,
    LinearConfig, Lstm, LstmConfig,
};
use burn::tensor::backend::Backend;
use burn::tensor::{Data, Int, Shape, Tensor};
use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
    adam, check_shape, check_targets, class_targets, decode_record, device, encode_record, optimize, probabilities,
    AdamOptimizer, EpochMetrics, EpochTally, InferenceBackend, Layer, TrainBackend, TrainableModel,
};
use crate::classifier::embedding::PADDING_ID;
use crate::classifier::error::{ClassifierError, Result};
use crate::config::CellKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentConfig {
    pub vocabulary_size: usize,
    pub embedding_size: usize,
    pub sequence_length: usize,
    pub cell: CellKind,
    pub units: usize,
    pub num_labels: usize,
    pub dropout: f32,
    pub seed: u64,
}

/// Token ids of a batch, ready for the recurrent model.
#[derive(Clone, Debug)]
pub struct SequenceBatch<B: Backend> {
    /// `[batch, steps]`, non-padding tokens first
    pub tokens: Tensor<B, 2, Int>,
    /// The same rows with their non-padding tokens in reverse order
    pub reversed: Tensor<B, 2, Int>,
    /// `[batch, steps, 1]`, 1 at the last non-padding position of each row
    pub last: Tensor<B, 3>,
}

/// Packs padded id rows into a `SequenceBatch`. Padding ids anywhere in a row are
/// dropped, so neither direction ever steps over them.
#[derive(Clone, Debug)]
pub struct SequenceBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SequenceBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<Vec<usize>, SequenceBatch<B>> for SequenceBatcher<B> {
    fn batch(&self, rows: Vec<Vec<usize>>) -> SequenceBatch<B> {
        let batch_size = rows.len();
        let steps = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let padding = PADDING_ID as i64;
        let mut tokens = vec![padding; batch_size * steps];
        let mut reversed = vec![padding; batch_size * steps];
        let mut last = vec![0.0f32; batch_size * steps];

        for (i, row) in rows.iter().enumerate() {
            let ids: Vec<i64> = row.iter().filter(|&&id| id != PADDING_ID).map(|&id| id as i64).collect();
            let start = i * steps;
            tokens[start..start + ids.len()].copy_from_slice(&ids);
            for (slot, &id) in reversed[start..].iter_mut().zip(ids.iter().rev()) {
                *slot = id;
            }
            if !ids.is_empty() {
                last[start + ids.len() - 1] = 1.0;
            }
        }

        SequenceBatch {
            tokens: Tensor::from_data(Data::new(tokens, Shape::new([batch_size, steps])).convert(), &self.device),
            reversed: Tensor::from_data(Data::new(reversed, Shape::new([batch_size, steps])).convert(), &self.device),
            last: Tensor::from_data(Data::new(last, Shape::new([batch_size, steps, 1])).convert(), &self.device),
        }
    }
}

/// One direction of the recurrent layer. Exactly one of the cells is set.
#[derive(Module, Debug)]
pub struct RecurrentCell<B: Backend> {
    lstm: Option<Lstm<B>>,
    gru: Option<Gru<B>>,
    units: usize,
}

impl<B: Backend> RecurrentCell<B> {
    fn new(cell: CellKind, input_size: usize, units: usize, device: &B::Device) -> Self {
        match cell {
            CellKind::Lstm => Self {
                lstm: Some(LstmConfig::new(input_size, units, true).init(device)),
                gru: None,
                units,
            },
            CellKind::Gru => Self {
                lstm: None,
                gru: Some(GruConfig::new(input_size, units, true).init(device)),
                units,
            },
        }
    }

    /// Hidden state after every step, `[batch, steps, units]`.
    pub fn forward(&self, inputs: Tensor<B, 3>) -> Tensor<B, 3> {
        match (&self.lstm, &self.gru) {
            (Some(lstm), _) => lstm.forward(inputs, None).1,
            (None, Some(gru)) => gru.forward(inputs, None),
            (None, None) => {
                let [batch, steps, _] = inputs.dims();
                Tensor::zeros([batch, steps, self.units], &inputs.device())
            }
        }
    }
}

/// Frozen embedding lookup, a bidirectional LSTM or GRU, dropout on the
/// concatenated final states and a dense projection to the labels.
#[derive(Module, Debug)]
pub struct RecurrentModel<B: Backend> {
    embedding: Embedding<B>,
    forward_rnn: RecurrentCell<B>,
    backward_rnn: RecurrentCell<B>,
    dropout: Dropout,
    softmax: Linear<B>,
}

impl<B: Backend> RecurrentModel<B> {
    /// Logits, one row per sequence.
    pub fn forward(&self, batch: SequenceBatch<B>) -> Tensor<B, 2> {
        let forward = self.final_state(&self.forward_rnn, batch.tokens, batch.last.clone());
        let backward = self.final_state(&self.backward_rnn, batch.reversed, batch.last);
        let features = Tensor::cat(vec![forward, backward], 1);
        self.softmax.forward(self.dropout.forward(features))
    }

    /// Hidden state of `rnn` at each row's last token, zeros for empty rows.
    fn final_state(&self, rnn: &RecurrentCell<B>, tokens: Tensor<B, 2, Int>, last: Tensor<B, 3>) -> Tensor<B, 2> {
        // the embedding table stays fixed
        let embedded = self.embedding.forward(tokens).detach();
        let hidden = rnn.forward(embedded);
        let [batch, _, units] = hidden.dims();
        (hidden * last.repeat(2, units)).sum_dim(1).reshape([batch, units])
    }
}

/// The sequence network and its optimizer state.
pub struct RecurrentNetwork {
    config: RecurrentConfig,
    model: RecurrentModel<TrainBackend>,
    optimizer: Option<AdamOptimizer<RecurrentModel<TrainBackend>>>,
}

impl RecurrentNetwork {
    /// Builds a freshly initialised network around a pretrained embedding matrix.
    pub fn new(config: RecurrentConfig, embedding: Array2<f32>) -> Result<Self> {
        check_shape(
            "embedding matrix",
            embedding.shape(),
            &[config.vocabulary_size, config.embedding_size],
        )?;
        TrainBackend::seed(config.seed);
        let device = device();
        let table = Tensor::from_data(
            Data::new(
                embedding.iter().copied().collect(),
                Shape::new([config.vocabulary_size, config.embedding_size]),
            )
            .convert(),
            &device,
        );
        let model = RecurrentModel {
            embedding: EmbeddingConfig::new(config.vocabulary_size, config.embedding_size)
                .init(&device)
                .load_record(EmbeddingRecord {
                    weight: Param::from_tensor(table),
                }),
            forward_rnn: RecurrentCell::new(config.cell, config.embedding_size, config.units, &device),
            backward_rnn: RecurrentCell::new(config.cell, config.embedding_size, config.units, &device),
            dropout: DropoutConfig::new(config.dropout as f64).init(),
            softmax: LinearConfig::new(2 * config.units, config.num_labels)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init(&device),
        };
        Ok(Self {
            config,
            model,
            optimizer: None,
        })
    }

    fn check_input(&self, x: &ArrayView2<usize>) -> Result<()> {
        if x.ncols() != self.config.sequence_length {
            return Err(ClassifierError::ValidationError(format!(
                "Input rows hold {} tokens, the network expects {}",
                x.ncols(),
                self.config.sequence_length
            )));
        }
        if let Some(&id) = x.iter().find(|&&id| id >= self.config.vocabulary_size) {
            return Err(ClassifierError::ValidationError(format!(
                "Token id {} is outside the vocabulary of {}",
                id, self.config.vocabulary_size
            )));
        }
        Ok(())
    }
}

impl Clone for RecurrentNetwork {
    /// Copies the weights; the copy starts with a fresh optimizer.
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            model: self.model.clone(),
            optimizer: None,
        }
    }
}

impl fmt::Debug for RecurrentNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurrentNetwork")
            .field("config", &self.config)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl TrainableModel for RecurrentNetwork {
    type Element = usize;
    type Config = RecurrentConfig;

    fn from_parts(config: RecurrentConfig, weights: &[u8]) -> Result<Self> {
        let embedding = Array2::zeros((config.vocabulary_size, config.embedding_size));
        let mut network = Self::new(config, embedding)?;
        network.set_weights(weights)?;
        Ok(network)
    }

    fn config(&self) -> &RecurrentConfig {
        &self.config
    }

    fn weights(&self) -> Result<Vec<u8>> {
        encode_record(&self.model)
    }

    fn set_weights(&mut self, weights: &[u8]) -> Result<()> {
        let model = decode_record(&self.model, weights)?;
        let config = &self.config;
        check_shape(
            "embedding matrix",
            &model.embedding.weight.val().dims(),
            &[config.vocabulary_size, config.embedding_size],
        )?;
        check_shape(
            "softmax kernel",
            &model.softmax.weight.val().dims(),
            &[2 * config.units, config.num_labels],
        )?;
        self.model = model;
        Ok(())
    }

    fn output_size(&self) -> usize {
        self.config.num_labels
    }

    fn train_epoch(
        &mut self,
        x: ArrayView2<usize>,
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
        let batcher = SequenceBatcher::<TrainBackend>::new(device);
        let loss = CrossEntropyLossConfig::new().init(&device);
        let mut optimizer = self.optimizer.take().unwrap_or_else(adam);
        let mut tally = EpochTally::default();
        for batch in order.chunks(batch_size.max(1)) {
            let inputs = batcher.batch(batch.iter().map(|&i| x.row(i).to_vec()).collect());
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

    fn predict(&self, x: ArrayView2<usize>, batch_size: usize) -> Result<Array2<f32>> {
        self.check_input(&x)?;
        let model = self.model.valid();
        let batcher = SequenceBatcher::<InferenceBackend>::new(device());
        let mut out = Array2::zeros((x.nrows(), self.config.num_labels));
        for (rows, mut target) in x
            .axis_chunks_iter(Axis(0), batch_size.max(1))
            .zip(out.axis_chunks_iter_mut(Axis(0), batch_size.max(1)))
        {
            let batch = batcher.batch(rows.rows().into_iter().map(|row| row.to_vec()).collect());
            target.assign(&probabilities(model.forward(batch))?);
        }
        Ok(out)
    }

    fn layers(&self) -> Vec<Layer> {
        let config = &self.config;
        vec![
            Layer {
                name: "embedding".into(),
                kind: "Embedding".into(),
                output_shape: vec![config.sequence_length, config.embedding_size],
                parameters: self.model.embedding.num_params(),
                trainable: false,
            },
            Layer {
                name: "rnn".into(),
                kind: format!("Bidirectional({})", config.cell),
                output_shape: vec![2 * config.units],
                parameters: self.model.forward_rnn.num_params() + self.model.backward_rnn.num_params(),
                trainable: true,
            },
            Layer {
                name: "dropout".into(),
                kind: "Dropout".into(),
                output_shape: vec![2 * config.units],
                parameters: 0,
                trainable: true,
            },
            Layer {
                name: "softmax".into(),
                kind: "Dense".into(),
                output_shape: vec![config.num_labels],
                parameters: self.model.softmax.num_params(),
                trainable: true,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    fn config(cell: CellKind) -> RecurrentConfig {
        RecurrentConfig {
            vocabulary_size: 6,
            embedding_size: 3,
            sequence_length: 4,
            cell,
            units: 2,
            num_labels: 2,
            dropout: 0.0,
            seed: 11,
        }
    }

    fn embedding() -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(5);
        let mut matrix = Array2::from_shape_fn((6, 3), |_| rng.gen_range(-1.0f32..1.0));
        matrix.row_mut(PADDING_ID).fill(0.0);
        matrix
    }

    #[test]
    fn test_batcher_drops_padding_and_marks_last_token() {
        let batcher = SequenceBatcher::<InferenceBackend>::new(device());
        let batch = batcher.batch(vec![vec![2, 3, 4, 0], vec![0, 0, 0, 0], vec![5, 0, 2, 0]]);

        assert_eq!(batch.tokens.into_data().value, vec![2, 3, 4, 0, 0, 0, 0, 0, 5, 2, 0, 0]);
        assert_eq!(batch.reversed.into_data().value, vec![4, 3, 2, 0, 0, 0, 0, 0, 2, 5, 0, 0]);
        assert_eq!(
            batch.last.into_data().value,
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_padding_length_does_not_change_predictions() {
        let network = RecurrentNetwork::new(config(CellKind::Gru), embedding()).unwrap();
        let short = RecurrentConfig {
            sequence_length: 2,
            ..config(CellKind::Gru)
        };
        let unpadded = RecurrentNetwork::from_parts(short, &network.weights().unwrap()).unwrap();

        let padded = network.predict(array![[2usize, 3, 0, 0]].view(), 1).unwrap();
        let direct = unpadded.predict(array![[2usize, 3]].view(), 1).unwrap();
        for (a, b) in padded.iter().zip(direct.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_batch_size_does_not_change_predictions() {
        let network = RecurrentNetwork::new(config(CellKind::Lstm), embedding()).unwrap();
        let x = array![[2usize, 3, 0, 0], [4, 5, 4, 0], [3, 0, 0, 0], [5, 2, 3, 4], [0, 0, 0, 0]];

        let whole = network.predict(x.view(), 5).unwrap();
        for batch_size in [1, 2, 3] {
            let chunked = network.predict(x.view(), batch_size).unwrap();
            assert_eq!(chunked.dim(), (5, 2));
            for (a, b) in chunked.iter().zip(whole.iter()) {
                assert!((a - b).abs() < 1e-6, "batch size {}: {} vs {}", batch_size, a, b);
            }
        }
    }

    #[test]
    fn test_learns_token_identity() {
        let x = array![[2usize, 3, 0, 0], [3, 2, 2, 0], [4, 5, 0, 0], [5, 4, 5, 0]];
        let y = [0, 0, 1, 1];
        let mut network = RecurrentNetwork::new(config(CellKind::Lstm), embedding()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let first = network.train_epoch(x.view(), &y, 1, &mut rng).unwrap();
        for _ in 0..800 {
            network.train_epoch(x.view(), &y, 1, &mut rng).unwrap();
        }
        let scores = network.evaluate(x.view(), &y, 4).unwrap();
        assert!(scores[0].1 < first.loss);
        assert_eq!(scores[1].1, 1.0);
    }

    #[test]
    fn test_embedding_stays_frozen() {
        let x = array![[2usize, 3, 0, 0], [4, 5, 0, 0]];
        let mut network = RecurrentNetwork::new(config(CellKind::Gru), embedding()).unwrap();
        let before = network.model.embedding.weight.val().into_data().value;
        network.train_epoch(x.view(), &[0, 1], 2, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(network.model.embedding.weight.val().into_data().value, before);
    }

    #[test]
    fn test_rejects_out_of_vocabulary_ids() {
        let network = RecurrentNetwork::new(config(CellKind::Lstm), embedding()).unwrap();
        assert!(network.predict(array![[2usize, 9, 0, 0]].view(), 1).is_err());
        assert!(network.predict(array![[2usize, 3]].view(), 1).is_err());
    }

    #[test]
    fn test_layers_and_weights() {
        let network = RecurrentNetwork::new(config(CellKind::Lstm), embedding()).unwrap();
        let rnn = network.layer("rnn").unwrap();
        // two directions of 4 gates, each an input and a hidden transform with bias
        assert_eq!(rnn.parameters, 2 * 4 * (3 * 2 + 2 + 2 * 2 + 2));
        let embedding_layer = network.layer("embedding").unwrap();
        assert!(!embedding_layer.trainable);
        assert_eq!(embedding_layer.parameters, 18);
        assert!(network.summary().contains("Bidirectional(LSTM)"));
        let names: Vec<String> = network.layers().into_iter().map(|layer| layer.name).collect();
        assert_eq!(names, vec!["embedding", "rnn", "dropout", "softmax"]);

        let x = array![[2usize, 3, 0, 0]];
        let restored = RecurrentNetwork::from_parts(network.config().clone(), &network.weights().unwrap()).unwrap();
        assert_eq!(restored.predict(x.view(), 1).unwrap(), network.predict(x.view(), 1).unwrap());
        assert!(RecurrentNetwork::new(config(CellKind::Gru), Array2::zeros((2, 3))).is_err());

        let gru = RecurrentConfig {
            cell: CellKind::Gru,
            ..network.config().clone()
        };
        assert!(RecurrentNetwork::from_parts(gru, &network.weights().unwrap()).is_err());
    }
}
