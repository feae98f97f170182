use std::fmt::Write as _;
use std::path::Path;

use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::classifier::ClassifierKind;
use super::embedding::{BagOfWordsEmbedder, Embedder, TextSequenceEmbedder, WordVectors};
use super::error::{ClassifierError, Result};
use super::history::TrainingHistory;
use super::labels::LabelSpace;
use super::trainer;
use super::utils::argmax;
use crate::artifact::ArtifactDir;
use crate::config::{BagOfEmbeddingsConfig, SequenceConfig, TrainOptions};
use crate::network::{DenseConfig, RecurrentConfig, RecurrentNetwork, SoftmaxNetwork, TrainableModel};

pub(crate) fn check_texts<S: AsRef<str>>(texts: &[S]) -> Result<()> {
    if texts.is_empty() {
        return Err(ClassifierError::ValidationError("Input texts cannot be empty".into()));
    }
    Ok(())
}

/// Checks a training set before any embedding or fitting work starts.
pub(crate) fn check_training_inputs<S: AsRef<str>>(
    labels: &LabelSpace,
    texts: &[S],
    y: &[usize],
) -> Result<()> {
    check_texts(texts)?;
    if texts.len() != y.len() {
        return Err(ClassifierError::InvalidConfiguration(format!(
            "{} texts but {} labels",
            texts.len(),
            y.len()
        )));
    }
    for &index in y {
        labels.name_of(index)?;
    }
    Ok(())
}

/// Indexes evaluation labels, rejecting values outside the label space.
pub(crate) fn evaluation_targets<S: AsRef<str>, L: AsRef<str>>(
    labels: &LabelSpace,
    texts: &[S],
    names: &[L],
) -> Result<Vec<usize>> {
    check_texts(texts)?;
    if texts.len() != names.len() {
        return Err(ClassifierError::InvalidConfiguration(format!(
            "{} texts but {} labels",
            texts.len(),
            names.len()
        )));
    }
    labels.indices_of(names)
}

/// Most probable label name of every row.
pub(crate) fn label_predictions(labels: &LabelSpace, probabilities: &Array2<f32>) -> Result<Vec<String>> {
    if probabilities.ncols() != labels.len() {
        return Err(ClassifierError::ValidationError(format!(
            "Model scored {} labels, the label space has {}",
            probabilities.ncols(),
            labels.len()
        )));
    }
    probabilities
        .rows()
        .into_iter()
        .map(|row| labels.name_of(argmax(row)).map(str::to_string))
        .collect()
}

/// Label space for a new classifier; duplicates are a configuration error.
pub(crate) fn unique_labels<S: AsRef<str>>(names: &[S]) -> Result<LabelSpace> {
    let labels = LabelSpace::new(names).map_err(|e| match e {
        ClassifierError::InvalidLabel(message) => ClassifierError::InvalidConfiguration(message),
        other => other,
    })?;
    if labels.len() < 2 {
        return Err(ClassifierError::InvalidConfiguration(format!(
            "At least two labels are required, got {:?}",
            labels.names()
        )));
    }
    Ok(labels)
}

/// Light half of an embedding artifact: everything but the network weights.
#[derive(Serialize, Deserialize)]
struct Metadata<V, E, C> {
    kind: ClassifierKind,
    labels: LabelSpace,
    config: V,
    embedder: E,
    network: C,
    weights_digest: String,
}

/// An embedder paired with the network that consumes its encodings.
#[derive(Debug, Clone)]
pub(crate) struct EmbeddingModel<E, N> {
    embedder: E,
    network: N,
}

struct Restored<V, E, N> {
    labels: LabelSpace,
    config: V,
    model: EmbeddingModel<E, N>,
    history: Option<TrainingHistory>,
}

impl<E, N> EmbeddingModel<E, N>
where
    E: Embedder + Serialize + DeserializeOwned,
    N: TrainableModel<Element = E::Element>,
{
    fn summary(&self) -> String {
        format!("{}\n\n{}", self.embedder, self.network.summary())
    }

    fn predict<S: AsRef<str>>(
        &self,
        labels: &LabelSpace,
        texts: &[S],
        batch_size: usize,
    ) -> Result<(Array2<f32>, Vec<String>)> {
        check_texts(texts)?;
        let probabilities = self.network.predict(self.embedder.encode(texts).view(), batch_size)?;
        let names = label_predictions(labels, &probabilities)?;
        Ok((probabilities, names))
    }

    fn evaluate<S: AsRef<str>, L: AsRef<str>>(
        &self,
        labels: &LabelSpace,
        texts: &[S],
        names: &[L],
        batch_size: usize,
    ) -> Result<Vec<(String, f64)>> {
        let y = evaluation_targets(labels, texts, names)?;
        self.network.evaluate(self.embedder.encode(texts).view(), &y, batch_size)
    }

    /// Runs the fit loop. With an artifact target the description is written
    /// before the first epoch and the complete artifact once training ends.
    #[allow(clippy::too_many_arguments)]
    fn train<S: AsRef<str>, V: Serialize>(
        &mut self,
        kind: ClassifierKind,
        labels: &LabelSpace,
        config: &V,
        description: &str,
        texts: &[S],
        y: &[usize],
        options: &TrainOptions,
    ) -> Result<TrainingHistory> {
        let dir = options
            .artifact
            .as_ref()
            .map(|path| ArtifactDir::create(path))
            .transpose()?;
        if let Some(dir) = &dir {
            dir.write_description(description)?;
        }

        let x = self.embedder.encode(texts);
        let run = trainer::fit(&mut self.network, x.view(), y, options, dir.as_ref())?;

        if let Some(dir) = &dir {
            let digest = if run.checkpointed {
                Some(dir.weights_digest()?)
            } else {
                None
            };
            self.save(dir, kind, labels, config, description, Some(&run.history), digest)?;
        }
        Ok(run.history)
    }

    /// Writes all four components. `weights_digest` is given when the weights on
    /// disk are already the ones to keep.
    #[allow(clippy::too_many_arguments)]
    fn save<V: Serialize>(
        &self,
        dir: &ArtifactDir,
        kind: ClassifierKind,
        labels: &LabelSpace,
        config: &V,
        description: &str,
        history: Option<&TrainingHistory>,
        weights_digest: Option<String>,
    ) -> Result<()> {
        let weights_digest = match weights_digest {
            Some(digest) => digest,
            None => dir.write_weights(&self.network.weights()?)?,
        };
        dir.write_metadata(&Metadata {
            kind,
            labels: labels.clone(),
            config,
            embedder: &self.embedder,
            network: self.network.config(),
            weights_digest,
        })?;
        dir.write_description(description)?;
        if let Some(history) = history {
            dir.write_history(history)?;
        }
        log::info!("Saved {} classifier to {:?}", kind, dir.root());
        Ok(())
    }

    /// Reads the metadata first, then reattaches the verified weights.
    fn load<V: DeserializeOwned>(dir: &ArtifactDir, expected: ClassifierKind) -> Result<Restored<V, E, N>> {
        let metadata: Metadata<V, E, N::Config> = dir.read_metadata()?;
        if metadata.kind != expected {
            return Err(ClassifierError::corrupt(
                dir.classifier_path(),
                format!("holds a {} classifier, expected {}", metadata.kind, expected),
            ));
        }

        let weights = dir.read_weights(&metadata.weights_digest)?;
        let network = N::from_parts(metadata.network, &weights)
            .map_err(|e| ClassifierError::corrupt(dir.model_path(), e))?;
        if network.output_size() != metadata.labels.len() {
            return Err(ClassifierError::corrupt(
                dir.model_path(),
                format!(
                    "network scores {} labels, metadata lists {}",
                    network.output_size(),
                    metadata.labels.len()
                ),
            ));
        }

        Ok(Restored {
            labels: metadata.labels,
            config: metadata.config,
            model: Self {
                embedder: metadata.embedder,
                network,
            },
            history: dir.read_history()?,
        })
    }
}

/// Frozen pretrained word embeddings fed through a bidirectional recurrent layer.
///
/// The vocabulary and the sequence length are learned from the first training
/// set, so the network only exists once `train` has been called.
#[derive(Debug, Clone)]
pub struct SequenceClassifier {
    labels: LabelSpace,
    config: SequenceConfig,
    model: Option<EmbeddingModel<TextSequenceEmbedder, RecurrentNetwork>>,
    history: Option<TrainingHistory>,
}

impl SequenceClassifier {
    /// Creates an untrained classifier.
    ///
    /// # Errors
    /// - `InvalidConfiguration` on duplicate label names or bad hyperparameters
    pub fn new<S: AsRef<str>>(label_names: &[S], config: SequenceConfig) -> Result<Self> {
        let labels = unique_labels(label_names)?;
        config.validate()?;
        Ok(Self {
            labels,
            config,
            model: None,
            history: None,
        })
    }

    fn build<S: AsRef<str>>(&self, texts: &[S]) -> Result<EmbeddingModel<TextSequenceEmbedder, RecurrentNetwork>> {
        let embedder = TextSequenceEmbedder::fit(
            texts,
            self.config.vocabulary_size,
            self.config.sequence_length,
            WordVectors::load(&self.config.vectors)?,
        )?;
        let embedding = embedder.embedding_matrix().ok_or_else(|| {
            ClassifierError::InvalidConfiguration("Sequence embedder has no embedding matrix".into())
        })?;
        let network = RecurrentNetwork::new(
            RecurrentConfig {
                vocabulary_size: embedding.nrows(),
                embedding_size: embedder.embedding_size(),
                sequence_length: embedder.sequence_length(),
                cell: self.config.cell,
                units: self.config.units,
                num_labels: self.labels.len(),
                dropout: self.config.dropout,
                seed: self.config.seed,
            },
            embedding,
        )?;
        Ok(EmbeddingModel { embedder, network })
    }

    /// Fits the network, building the vocabulary on the first call. A failed
    /// run leaves a previously trained model untouched.
    pub fn train<S: AsRef<str>>(
        &mut self,
        texts: &[S],
        labels: &[usize],
        options: &TrainOptions,
    ) -> Result<TrainingHistory> {
        check_training_inputs(&self.labels, texts, labels)?;
        options.validate()?;

        let mut model = match &self.model {
            Some(model) => model.clone(),
            None => self.build(texts)?,
        };
        let description = self.describe(Some(&model));
        let history = model.train(
            ClassifierKind::Sequence,
            &self.labels,
            &self.config,
            &description,
            texts,
            labels,
            options,
        )?;
        self.model = Some(model);
        self.history = Some(history.clone());
        Ok(history)
    }

    pub fn predict<S: AsRef<str>>(&self, texts: &[S], batch_size: usize) -> Result<(Array2<f32>, Vec<String>)> {
        self.trained()?.predict(&self.labels, texts, batch_size)
    }

    pub fn evaluate<S: AsRef<str>, L: AsRef<str>>(
        &self,
        texts: &[S],
        labels: &[L],
        batch_size: usize,
    ) -> Result<Vec<(String, f64)>> {
        self.trained()?.evaluate(&self.labels, texts, labels, batch_size)
    }

    fn trained(&self) -> Result<&EmbeddingModel<TextSequenceEmbedder, RecurrentNetwork>> {
        self.model.as_ref().ok_or(ClassifierError::NotTrained)
    }

    /// Units per direction, read back from the `rnn` layer once the network exists.
    pub fn rnn_units(&self) -> usize {
        self.model
            .as_ref()
            .and_then(|model| model.network.layer("rnn"))
            .and_then(|layer| layer.output_shape.first().map(|width| width / 2))
            .unwrap_or(self.config.units)
    }

    /// Tokens per text, `None` until the embedder has seen training data.
    pub fn sequence_length(&self) -> Option<usize> {
        self.model.as_ref().map(|model| model.embedder.sequence_length())
    }

    fn describe(&self, model: Option<&EmbeddingModel<TextSequenceEmbedder, RecurrentNetwork>>) -> String {
        let mut description = format!(
            "Neural text sequence classifier: {} labels, {} {} units, dropout rate {:.2}",
            self.labels.len(),
            self.config.units,
            self.config.cell,
            self.config.dropout
        );
        match model {
            Some(model) => {
                let _ = write!(description, "\n{}", model.summary());
            }
            None => description.push_str(" (untrained)"),
        }
        description
    }

    pub fn description(&self) -> String {
        self.describe(self.model.as_ref())
    }

    pub fn labels(&self) -> &LabelSpace {
        &self.labels
    }

    pub fn config(&self) -> &SequenceConfig {
        &self.config
    }

    pub fn history(&self) -> Option<&TrainingHistory> {
        self.history.as_ref()
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    pub fn save(&self, target: &Path) -> Result<()> {
        let model = self.trained()?;
        let dir = ArtifactDir::create(target)?;
        model.save(
            &dir,
            ClassifierKind::Sequence,
            &self.labels,
            &self.config,
            &self.description(),
            self.history.as_ref(),
            None,
        )
    }

    pub(crate) fn load(dir: &ArtifactDir) -> Result<Self> {
        let restored = EmbeddingModel::load(dir, ClassifierKind::Sequence)?;
        Ok(Self {
            labels: restored.labels,
            config: restored.config,
            model: Some(restored.model),
            history: restored.history,
        })
    }
}

/// A dense softmax layer over the mean word vector of each text.
#[derive(Debug, Clone)]
pub struct BagOfEmbeddingsClassifier {
    labels: LabelSpace,
    config: BagOfEmbeddingsConfig,
    model: Option<EmbeddingModel<BagOfWordsEmbedder, SoftmaxNetwork>>,
    history: Option<TrainingHistory>,
}

impl BagOfEmbeddingsClassifier {
    /// Creates an untrained classifier.
    ///
    /// # Errors
    /// - `InvalidConfiguration` on duplicate label names or a bad dropout rate
    pub fn new<S: AsRef<str>>(label_names: &[S], config: BagOfEmbeddingsConfig) -> Result<Self> {
        let labels = unique_labels(label_names)?;
        config.validate()?;
        Ok(Self {
            labels,
            config,
            model: None,
            history: None,
        })
    }

    fn build(&self) -> Result<EmbeddingModel<BagOfWordsEmbedder, SoftmaxNetwork>> {
        let embedder = BagOfWordsEmbedder::new(WordVectors::load(&self.config.vectors)?);
        let network = SoftmaxNetwork::new(DenseConfig {
            input_size: embedder.embedding_size(),
            num_labels: self.labels.len(),
            dropout: self.config.dropout,
            seed: self.config.seed,
        });
        Ok(EmbeddingModel { embedder, network })
    }

    /// Fits the network. A failed run leaves a previously trained model untouched.
    pub fn train<S: AsRef<str>>(
        &mut self,
        texts: &[S],
        labels: &[usize],
        options: &TrainOptions,
    ) -> Result<TrainingHistory> {
        check_training_inputs(&self.labels, texts, labels)?;
        options.validate()?;

        let mut model = match &self.model {
            Some(model) => model.clone(),
            None => self.build()?,
        };
        let description = self.describe(Some(&model));
        let history = model.train(
            ClassifierKind::BagOfEmbeddings,
            &self.labels,
            &self.config,
            &description,
            texts,
            labels,
            options,
        )?;
        self.model = Some(model);
        self.history = Some(history.clone());
        Ok(history)
    }

    pub fn predict<S: AsRef<str>>(&self, texts: &[S], batch_size: usize) -> Result<(Array2<f32>, Vec<String>)> {
        self.trained()?.predict(&self.labels, texts, batch_size)
    }

    pub fn evaluate<S: AsRef<str>, L: AsRef<str>>(
        &self,
        texts: &[S],
        labels: &[L],
        batch_size: usize,
    ) -> Result<Vec<(String, f64)>> {
        self.trained()?.evaluate(&self.labels, texts, labels, batch_size)
    }

    fn trained(&self) -> Result<&EmbeddingModel<BagOfWordsEmbedder, SoftmaxNetwork>> {
        self.model.as_ref().ok_or(ClassifierError::NotTrained)
    }

    fn describe(&self, model: Option<&EmbeddingModel<BagOfWordsEmbedder, SoftmaxNetwork>>) -> String {
        let mut description = format!(
            "Neural bag of words classifier: {} labels, dropout rate {:.2}",
            self.labels.len(),
            self.config.dropout
        );
        match model {
            Some(model) => {
                let _ = write!(description, "\n{}", model.summary());
            }
            None => description.push_str(" (untrained)"),
        }
        description
    }

    pub fn description(&self) -> String {
        self.describe(self.model.as_ref())
    }

    pub fn labels(&self) -> &LabelSpace {
        &self.labels
    }

    pub fn config(&self) -> &BagOfEmbeddingsConfig {
        &self.config
    }

    pub fn history(&self) -> Option<&TrainingHistory> {
        self.history.as_ref()
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    pub fn save(&self, target: &Path) -> Result<()> {
        let model = self.trained()?;
        let dir = ArtifactDir::create(target)?;
        model.save(
            &dir,
            ClassifierKind::BagOfEmbeddings,
            &self.labels,
            &self.config,
            &self.description(),
            self.history.as_ref(),
            None,
        )
    }

    pub(crate) fn load(dir: &ArtifactDir) -> Result<Self> {
        let restored = EmbeddingModel::load(dir, ClassifierKind::BagOfEmbeddings)?;
        Ok(Self {
            labels: restored.labels,
            config: restored.config,
            model: Some(restored.model),
            history: restored.history,
        })
    }
}
