use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::classifier::embedding::VectorSource;
use crate::classifier::error::{ClassifierError, Result};

/// Options for a single training run, shared by every classifier variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainOptions {
    pub epochs: usize,
    pub batch_size: usize,
    /// Fraction of the samples held out for validation, `None` trains on everything
    pub validation_fraction: Option<f64>,
    /// Directory (embedding variants) or file (term frequency) to write the model to
    pub artifact: Option<PathBuf>,
    /// 0 silences progress reporting, 1 reports epochs and checkpoints
    pub verbosity: u8,
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            validation_fraction: None,
            artifact: None,
            verbosity: 1,
            seed: 42,
        }
    }
}

impl TrainOptions {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_validation_fraction(mut self, fraction: f64) -> Self {
        self.validation_fraction = Some(fraction);
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact = Some(path.into());
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Rejects option combinations no variant can honour.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(ClassifierError::InvalidConfiguration(
                "At least one epoch is required".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ClassifierError::InvalidConfiguration(
                "Batch size must be positive".into(),
            ));
        }
        if let Some(fraction) = self.validation_fraction {
            if !(fraction > 0.0 && fraction < 1.0) {
                return Err(ClassifierError::InvalidConfiguration(format!(
                    "Validation fraction must lie strictly between 0 and 1, got {}",
                    fraction
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn reports_progress(&self) -> bool {
        self.verbosity >= 1
    }
}

/// Recurrent cell used by the sequence classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    #[default]
    Lstm,
    Gru,
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lstm => write!(f, "LSTM"),
            Self::Gru => write!(f, "GRU"),
        }
    }
}

impl std::str::FromStr for CellKind {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lstm" => Ok(Self::Lstm),
            "gru" => Ok(Self::Gru),
            other => Err(ClassifierError::InvalidConfiguration(format!(
                "Unknown RNN type '{}', expected 'lstm' or 'gru'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Cap on vocabulary ids, reserved ids included
    pub vocabulary_size: Option<usize>,
    /// Tokens kept per text, defaults to the longest training text
    pub sequence_length: Option<usize>,
    pub cell: CellKind,
    pub units: usize,
    pub dropout: f32,
    /// Where the frozen word vectors come from
    pub vectors: VectorSource,
    pub seed: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            vocabulary_size: None,
            sequence_length: None,
            cell: CellKind::Lstm,
            units: 128,
            dropout: 0.5,
            vectors: VectorSource::default(),
            seed: 42,
        }
    }
}

impl SequenceConfig {
    pub fn with_vocabulary_size(mut self, size: usize) -> Self {
        self.vocabulary_size = Some(size);
        self
    }

    pub fn with_sequence_length(mut self, length: usize) -> Self {
        self.sequence_length = Some(length);
        self
    }

    pub fn with_cell(mut self, cell: CellKind) -> Self {
        self.cell = cell;
        self
    }

    pub fn with_units(mut self, units: usize) -> Self {
        self.units = units;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_vectors(mut self, vectors: impl Into<VectorSource>) -> Self {
        self.vectors = vectors.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.units == 0 {
            return Err(ClassifierError::InvalidConfiguration(
                "RNN units must be positive".into(),
            ));
        }
        validate_dropout(self.dropout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BagOfEmbeddingsConfig {
    pub dropout: f32,
    pub vectors: VectorSource,
    pub seed: u64,
}

impl Default for BagOfEmbeddingsConfig {
    fn default() -> Self {
        Self {
            dropout: 0.5,
            vectors: VectorSource::default(),
            seed: 42,
        }
    }
}

impl BagOfEmbeddingsConfig {
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_vectors(mut self, vectors: impl Into<VectorSource>) -> Self {
        self.vectors = vectors.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_dropout(self.dropout)
    }
}

fn validate_dropout(dropout: f32) -> Result<()> {
    if (0.0..1.0).contains(&dropout) {
        Ok(())
    } else {
        Err(ClassifierError::InvalidConfiguration(format!(
            "Dropout rate must lie in [0, 1), got {}",
            dropout
        )))
    }
}

/// Which words the TF-IDF vectorizer ignores.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopWords {
    English,
    #[default]
    None,
    Custom(Vec<String>),
}

/// Kernel width of the RBF support vector machine.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gamma {
    /// `1 / (n_features * var(X))`
    #[default]
    Scale,
    Value(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermFrequencyConfig {
    pub stop_words: StopWords,
    /// Soft margin penalty
    pub c: f64,
    pub gamma: Gamma,
}

impl Default for TermFrequencyConfig {
    fn default() -> Self {
        Self {
            stop_words: StopWords::None,
            c: 1.0,
            gamma: Gamma::Scale,
        }
    }
}

impl TermFrequencyConfig {
    pub fn with_stop_words(mut self, stop_words: StopWords) -> Self {
        self.stop_words = stop_words;
        self
    }

    pub fn with_c(mut self, c: f64) -> Self {
        self.c = c;
        self
    }

    pub fn with_gamma(mut self, gamma: Gamma) -> Self {
        self.gamma = gamma;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.c > 0.0) {
            return Err(ClassifierError::InvalidConfiguration(format!(
                "Penalty C must be positive, got {}",
                self.c
            )));
        }
        if let Gamma::Value(gamma) = self.gamma {
            if !(gamma > 0.0) {
                return Err(ClassifierError::InvalidConfiguration(format!(
                    "Gamma must be positive, got {}",
                    gamma
                )));
            }
        }
        Ok(())
    }
}
