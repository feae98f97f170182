mod builder;
#[allow(clippy::module_inception)]
mod classifier;
pub mod embedding;
pub mod error;
pub mod history;
pub mod labels;
pub mod metrics;
mod model;
pub mod svm;
mod term_frequency;
pub mod tfidf;
pub(crate) mod trainer;
pub(crate) mod utils;

pub use builder::{ClassifierBuilder, VariantConfig};
pub use classifier::{Classifier, ClassifierKind};
pub use error::{ClassifierError, Result, Stage};
pub use history::{HistoryParams, TrainingHistory};
pub use labels::LabelSpace;
pub use model::{BagOfEmbeddingsClassifier, SequenceClassifier};
pub use term_frequency::TermFrequencyClassifier;

/// Information about the current state and configuration of a classifier
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierInfo {
    /// Which model family the classifier belongs to
    pub kind: ClassifierKind,
    /// Number of labels the classifier predicts over
    pub num_labels: usize,
    /// Label names in index order
    pub label_names: Vec<String>,
    /// Whether predict and evaluate can be used
    pub trained: bool,
    /// Zero-based best epoch of the last training run
    pub best_epoch: Option<usize>,
}
