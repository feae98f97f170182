//! Train, evaluate and persist text classifiers.
//!
//! Three model families share one train/predict/evaluate/persist contract:
//!
//! - [`SequenceClassifier`]: frozen word embeddings, a bidirectional LSTM or GRU
//!   and a softmax layer
//! - [`BagOfEmbeddingsClassifier`]: a softmax layer over the mean word vector
//! - [`TermFrequencyClassifier`]: sublinear TF-IDF features and a probability
//!   calibrated RBF support vector machine
//!
//! # Basic Usage
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use mycroft::{Classifier, LabelSpace, BagOfEmbeddingsConfig, TrainOptions};
//!
//! let texts = ["great fun movie", "loved it", "boring film", "hated it"];
//! let (labels, indices) = LabelSpace::from_raw(&["pos", "pos", "neg", "neg"], None)?;
//!
//! let mut classifier = Classifier::builder()
//!     .with_labels(labels.names())?
//!     .bag_of_embeddings(BagOfEmbeddingsConfig::default())
//!     .build()?;
//!
//! let options = TrainOptions::default()
//!     .with_epochs(5)
//!     .with_validation_fraction(0.5)
//!     .with_artifact("models/sentiment");
//! let history = classifier.train(&texts, &indices, &options)?;
//! println!("{}", history.summary_line());
//!
//! let restored = Classifier::load("models/sentiment")?;
//! let (probabilities, names) = restored.predict(&["what a great film"], 32)?;
//! println!("{}: {:?}", names[0], probabilities.row(0));
//! # Ok(())
//! # }
//! ```
//!
//! # Artifacts
//!
//! Embedding classifiers are saved as a directory holding `model.mpk`
//! (network weights as a MessagePack record), `classifier.json` (label space,
//! configuration and the word vectors in use), `description.txt` and
//! `history.json`. The term frequency classifier is saved as a single file.

pub mod artifact;
pub mod classifier;
pub mod config;
pub mod network;

pub use artifact::ArtifactDir;
pub use classifier::embedding::{BagOfWordsEmbedder, Embedder, TextSequenceEmbedder, VectorSource, WordVectors};
pub use classifier::metrics::format_scores;
pub use classifier::{
    BagOfEmbeddingsClassifier, Classifier, ClassifierBuilder, ClassifierError, ClassifierInfo, ClassifierKind,
    LabelSpace, SequenceClassifier, Stage, TermFrequencyClassifier, TrainingHistory, VariantConfig,
};
pub use config::{
    BagOfEmbeddingsConfig, CellKind, Gamma, SequenceConfig, StopWords, TermFrequencyConfig, TrainOptions,
};
pub use network::{Layer, TrainableModel};

pub fn init_logger() {
    env_logger::init();
}
