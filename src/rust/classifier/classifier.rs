use std::fmt;
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::error::{ClassifierError, Result};
use super::history::TrainingHistory;
use super::labels::LabelSpace;
use super::model::{BagOfEmbeddingsClassifier, SequenceClassifier};
use super::term_frequency::TermFrequencyClassifier;
use crate::artifact::ArtifactDir;
use crate::config::TrainOptions;

/// Tag identifying a classifier variant inside its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Sequence,
    BagOfEmbeddings,
    TermFrequency,
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequence => write!(f, "text sequence"),
            Self::BagOfEmbeddings => write!(f, "bag of embeddings"),
            Self::TermFrequency => write!(f, "SVM TF-IDF"),
        }
    }
}

#[derive(Deserialize)]
struct KindHeader {
    kind: ClassifierKind,
}

/// A text classifier of one of the three supported families.
///
/// Every variant shares the same lifecycle: it is created untrained from its
/// label names and hyperparameters, `train` fits it, and once trained it can be
/// queried with `predict` and `evaluate` or written with `save`. `load` restores
/// a trained classifier from nothing but its artifact.
///
/// ```no_run
/// # fn main() -> Result<(), mycroft::ClassifierError> {
/// use mycroft::{Classifier, LabelSpace, TermFrequencyConfig, TrainOptions};
///
/// let texts = ["buy now", "cheap pills", "meeting at noon", "project deadline tomorrow"];
/// let (labels, indices) = LabelSpace::from_raw(&["spam", "spam", "ham", "ham"], None)?;
///
/// let mut classifier = Classifier::builder()
///     .with_labels(labels.names())?
///     .term_frequency(TermFrequencyConfig::default())
///     .build()?;
/// classifier.train(&texts, &indices, &TrainOptions::default())?;
///
/// let (probabilities, names) = classifier.predict(&["cheap pills now"], 32)?;
/// println!("{:?} {:?}", probabilities, names);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum Classifier {
    Sequence(SequenceClassifier),
    BagOfEmbeddings(BagOfEmbeddingsClassifier),
    TermFrequency(TermFrequencyClassifier),
}

impl Classifier {
    /// Creates a new ClassifierBuilder for fluent construction
    pub fn builder() -> super::builder::ClassifierBuilder {
        super::builder::ClassifierBuilder::new()
    }

    pub fn kind(&self) -> ClassifierKind {
        match self {
            Self::Sequence(_) => ClassifierKind::Sequence,
            Self::BagOfEmbeddings(_) => ClassifierKind::BagOfEmbeddings,
            Self::TermFrequency(_) => ClassifierKind::TermFrequency,
        }
    }

    /// Fits the classifier on `texts` and their label indices.
    ///
    /// # Errors
    /// - `InvalidConfiguration` if counts differ or the options are unusable
    /// - `UnknownLabel` if an index is outside the label space
    /// - `TrainingFailure` if fitting aborts
    /// - `PersistenceIo` if an artifact component cannot be written
    pub fn train<S: AsRef<str>>(
        &mut self,
        texts: &[S],
        labels: &[usize],
        options: &TrainOptions,
    ) -> Result<TrainingHistory> {
        log::info!(
            "Training {} classifier on {} texts",
            self.kind(),
            texts.len()
        );
        match self {
            Self::Sequence(classifier) => classifier.train(texts, labels, options),
            Self::BagOfEmbeddings(classifier) => classifier.train(texts, labels, options),
            Self::TermFrequency(classifier) => classifier.train(texts, labels, options),
        }
    }

    /// Label probabilities (one column per label, in label space order) and the
    /// most probable label of every text. The term frequency variant scores the
    /// whole batch at once and ignores `batch_size`.
    pub fn predict<S: AsRef<str>>(&self, texts: &[S], batch_size: usize) -> Result<(Array2<f32>, Vec<String>)> {
        match self {
            Self::Sequence(classifier) => classifier.predict(texts, batch_size),
            Self::BagOfEmbeddings(classifier) => classifier.predict(texts, batch_size),
            Self::TermFrequency(classifier) => classifier.predict(texts),
        }
    }

    /// Scores the classifier against labeled texts.
    ///
    /// # Errors
    /// - `UnknownLabel` if a label is not part of the label space
    pub fn evaluate<S: AsRef<str>, L: AsRef<str>>(
        &self,
        texts: &[S],
        labels: &[L],
        batch_size: usize,
    ) -> Result<Vec<(String, f64)>> {
        match self {
            Self::Sequence(classifier) => classifier.evaluate(texts, labels, batch_size),
            Self::BagOfEmbeddings(classifier) => classifier.evaluate(texts, labels, batch_size),
            Self::TermFrequency(classifier) => classifier.evaluate(texts, labels),
        }
    }

    pub fn labels(&self) -> &LabelSpace {
        match self {
            Self::Sequence(classifier) => classifier.labels(),
            Self::BagOfEmbeddings(classifier) => classifier.labels(),
            Self::TermFrequency(classifier) => classifier.labels(),
        }
    }

    pub fn label_names(&self) -> &[String] {
        self.labels().names()
    }

    pub fn num_labels(&self) -> usize {
        self.labels().len()
    }

    /// Variant name, label count and hyperparameters; trained embedding
    /// classifiers add their network summary.
    pub fn description(&self) -> String {
        match self {
            Self::Sequence(classifier) => classifier.description(),
            Self::BagOfEmbeddings(classifier) => classifier.description(),
            Self::TermFrequency(classifier) => classifier.description(),
        }
    }

    /// History of the last training run, if one is known.
    pub fn history(&self) -> Option<&TrainingHistory> {
        match self {
            Self::Sequence(classifier) => classifier.history(),
            Self::BagOfEmbeddings(classifier) => classifier.history(),
            Self::TermFrequency(classifier) => classifier.history(),
        }
    }

    pub fn is_trained(&self) -> bool {
        match self {
            Self::Sequence(classifier) => classifier.is_trained(),
            Self::BagOfEmbeddings(classifier) => classifier.is_trained(),
            Self::TermFrequency(classifier) => classifier.is_trained(),
        }
    }

    /// Returns information about the classifier's current state
    pub fn info(&self) -> super::ClassifierInfo {
        super::ClassifierInfo {
            kind: self.kind(),
            num_labels: self.num_labels(),
            label_names: self.label_names().to_vec(),
            trained: self.is_trained(),
            best_epoch: self.history().and_then(TrainingHistory::best_epoch),
        }
    }

    /// Writes the artifact: a directory for embedding classifiers, a single
    /// file for the term frequency classifier.
    pub fn save(&self, target: impl AsRef<Path>) -> Result<()> {
        let target = target.as_ref();
        match self {
            Self::Sequence(classifier) => classifier.save(target),
            Self::BagOfEmbeddings(classifier) => classifier.save(target),
            Self::TermFrequency(classifier) => classifier.save(target),
        }
    }

    /// Restores a trained classifier. A directory holds an embedding classifier,
    /// a file a term frequency classifier.
    ///
    /// # Errors
    /// - `ArtifactNotFound` if `source` is neither a directory nor a file
    /// - `CorruptArtifact` if a component does not decode or fails verification
    pub fn load(source: impl AsRef<Path>) -> Result<Self> {
        let source = source.as_ref();
        if source.is_dir() {
            let dir = ArtifactDir::open(source)?;
            let header: KindHeader = dir.read_metadata()?;
            let classifier = match header.kind {
                ClassifierKind::Sequence => Self::Sequence(SequenceClassifier::load(&dir)?),
                ClassifierKind::BagOfEmbeddings => Self::BagOfEmbeddings(BagOfEmbeddingsClassifier::load(&dir)?),
                ClassifierKind::TermFrequency => {
                    return Err(ClassifierError::corrupt(
                        dir.classifier_path(),
                        "a term frequency classifier is stored as a single file",
                    ))
                }
            };
            log::info!("Loaded {} classifier from {:?}", classifier.kind(), source);
            Ok(classifier)
        } else if source.is_file() {
            let classifier = Self::TermFrequency(TermFrequencyClassifier::load(source)?);
            log::info!("Loaded {} classifier from {:?}", classifier.kind(), source);
            Ok(classifier)
        } else {
            Err(ClassifierError::ArtifactNotFound(source.to_path_buf()))
        }
    }
}

impl fmt::Display for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<SequenceClassifier> for Classifier {
    fn from(classifier: SequenceClassifier) -> Self {
        Self::Sequence(classifier)
    }
}

impl From<BagOfEmbeddingsClassifier> for Classifier {
    fn from(classifier: BagOfEmbeddingsClassifier) -> Self {
        Self::BagOfEmbeddings(classifier)
    }
}

impl From<TermFrequencyClassifier> for Classifier {
    fn from(classifier: TermFrequencyClassifier) -> Self {
        Self::TermFrequency(classifier)
    }
}
