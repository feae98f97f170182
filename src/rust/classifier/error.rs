use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Represents the different types of errors that can occur while building, training,
/// querying or persisting a text classifier.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// The classifier was configured inconsistently (duplicate label names, mismatched
    /// text/label counts, out-of-range hyperparameters)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// A label set could not be built from the given values
    #[error("Invalid label: {0}")]
    InvalidLabel(String),
    /// A label name or index is absent from the classifier's label space
    #[error("Unknown label: {0}")]
    UnknownLabel(String),
    /// Nothing loadable exists at the given path
    #[error("No model artifact found at {}", .0.display())]
    ArtifactNotFound(PathBuf),
    /// Fitting aborted; the model state must not be used
    #[error("Training failed: {0}")]
    TrainingFailure(String),
    /// Reading or writing an artifact component failed
    #[error("Cannot access {}: {source}", path.display())]
    PersistenceIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// An artifact component exists but cannot be decoded or fails verification
    #[error("Corrupt artifact {}: {reason}", path.display())]
    CorruptArtifact { path: PathBuf, reason: String },
    /// Prediction or evaluation was requested before a successful fit
    #[error("Classifier has not been trained")]
    NotTrained,
    /// Input parameters are malformed
    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ClassifierError>;

/// The lifecycle stage an error is reported against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuration,
    Training,
    Evaluation,
    Persistence,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Training => write!(f, "training"),
            Self::Evaluation => write!(f, "evaluation"),
            Self::Persistence => write!(f, "persistence"),
        }
    }
}

impl ClassifierError {
    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::PersistenceIo {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Self::CorruptArtifact {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Stage this error belongs to, used for single-line diagnostics.
    pub fn stage(&self) -> Stage {
        match self {
            Self::InvalidConfiguration(_) | Self::InvalidLabel(_) | Self::ValidationError(_) => {
                Stage::Configuration
            }
            Self::TrainingFailure(_) => Stage::Training,
            Self::UnknownLabel(_) | Self::NotTrained => Stage::Evaluation,
            Self::ArtifactNotFound(_) | Self::PersistenceIo { .. } | Self::CorruptArtifact { .. } => {
                Stage::Persistence
            }
        }
    }

    /// One-line diagnostic naming the failed stage, e.g.
    /// `persistence failed: No model artifact found at models/spam`.
    pub fn diagnostic(&self) -> String {
        format!("{} failed: {}", self.stage(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_names_stage() {
        let err = ClassifierError::ArtifactNotFound(PathBuf::from("missing/model"));
        assert_eq!(
            err.diagnostic(),
            "persistence failed: No model artifact found at missing/model"
        );

        let err = ClassifierError::TrainingFailure("loss diverged".into());
        assert_eq!(err.stage(), Stage::Training);
        assert!(!err.diagnostic().contains('\n'));
    }

    #[test]
    fn test_io_error_names_path() {
        let err = ClassifierError::io(
            "out/model.json",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("out/model.json"));
        assert_eq!(err.stage(), Stage::Persistence);
    }
}
