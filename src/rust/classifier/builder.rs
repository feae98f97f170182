use std::collections::HashSet;

use log::info;

use super::classifier::Classifier;
use super::error::ClassifierError;
use super::model::{BagOfEmbeddingsClassifier, SequenceClassifier};
use super::term_frequency::TermFrequencyClassifier;
use crate::config::{BagOfEmbeddingsConfig, SequenceConfig, TermFrequencyConfig};

/// Hyperparameters of the classifier family to build.
#[derive(Debug, Clone)]
pub enum VariantConfig {
    Sequence(SequenceConfig),
    BagOfEmbeddings(BagOfEmbeddingsConfig),
    TermFrequency(TermFrequencyConfig),
}

/// A builder for constructing a Classifier with a fluent interface.
///
/// Labels are validated as they are added, so a duplicate name fails before any
/// model is built.
///
/// # Example
/// ```
/// use mycroft::{Classifier, BagOfEmbeddingsConfig};
///
/// let classifier = Classifier::builder()
///     .add_label("negative")?
///     .add_label("positive")?
///     .bag_of_embeddings(BagOfEmbeddingsConfig::default().with_dropout(0.2))
///     .build()?;
/// assert_eq!(classifier.num_labels(), 2);
/// # Ok::<(), mycroft::ClassifierError>(())
/// ```
#[derive(Default, Debug)]
pub struct ClassifierBuilder {
    labels: Vec<String>,
    seen: HashSet<String>,
    variant: Option<VariantConfig>,
}

impl ClassifierBuilder {
    /// Creates a new empty ClassifierBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a label name:
    /// - it must not be empty
    /// - it must not already be present
    fn validate_label(&self, label: &str) -> Result<(), ClassifierError> {
        if label.is_empty() {
            return Err(ClassifierError::ValidationError("Label name cannot be empty".into()));
        }
        if self.seen.contains(label) {
            return Err(ClassifierError::InvalidConfiguration(format!(
                "Non-unique label name '{}' in {:?}",
                label, self.labels
            )));
        }
        Ok(())
    }

    /// Appends a label; its index is the number of labels added before it.
    pub fn add_label(mut self, label: impl Into<String>) -> Result<Self, ClassifierError> {
        let label = label.into();
        self.validate_label(&label)?;
        self.seen.insert(label.clone());
        self.labels.push(label);
        Ok(self)
    }

    /// Appends every name of `labels`, in order.
    pub fn with_labels<S: AsRef<str>>(self, labels: &[S]) -> Result<Self, ClassifierError> {
        labels
            .iter()
            .try_fold(self, |builder, label| builder.add_label(label.as_ref()))
    }

    pub fn with_variant(mut self, variant: VariantConfig) -> Self {
        self.variant = Some(variant);
        self
    }

    pub fn sequence(self, config: SequenceConfig) -> Self {
        self.with_variant(VariantConfig::Sequence(config))
    }

    pub fn bag_of_embeddings(self, config: BagOfEmbeddingsConfig) -> Self {
        self.with_variant(VariantConfig::BagOfEmbeddings(config))
    }

    pub fn term_frequency(self, config: TermFrequencyConfig) -> Self {
        self.with_variant(VariantConfig::TermFrequency(config))
    }

    /// Builds an untrained classifier.
    ///
    /// # Errors
    /// - `InvalidConfiguration` if no variant was chosen, fewer than two labels
    ///   were added or the hyperparameters are out of range
    pub fn build(self) -> Result<Classifier, ClassifierError> {
        let variant = self.variant.ok_or_else(|| {
            ClassifierError::InvalidConfiguration("No classifier variant selected".into())
        })?;
        let classifier: Classifier = match variant {
            VariantConfig::Sequence(config) => SequenceClassifier::new(&self.labels, config)?.into(),
            VariantConfig::BagOfEmbeddings(config) => BagOfEmbeddingsClassifier::new(&self.labels, config)?.into(),
            VariantConfig::TermFrequency(config) => TermFrequencyClassifier::new(&self.labels, config)?.into(),
        };
        info!("Built {} classifier over {} labels", classifier.kind(), classifier.num_labels());
        Ok(classifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifierKind;

    #[test]
    fn test_duplicate_label_rejected_immediately() {
        let result = ClassifierBuilder::new()
            .add_label("spam")
            .and_then(|builder| builder.add_label("spam"));
        assert!(matches!(result, Err(ClassifierError::InvalidConfiguration(_))));

        let result = ClassifierBuilder::new().with_labels(&["a", "b", "a"]);
        assert!(matches!(result, Err(ClassifierError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_empty_label_rejected() {
        assert!(matches!(
            ClassifierBuilder::new().add_label(""),
            Err(ClassifierError::ValidationError(_))
        ));
    }

    #[test]
    fn test_build_requires_variant_and_two_labels() {
        let result = ClassifierBuilder::new().with_labels(&["a", "b"]).unwrap().build();
        assert!(matches!(result, Err(ClassifierError::InvalidConfiguration(_))));

        let result = ClassifierBuilder::new()
            .add_label("only")
            .unwrap()
            .term_frequency(TermFrequencyConfig::default())
            .build();
        assert!(matches!(result, Err(ClassifierError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_builds_each_variant_in_label_order() {
        let variants = [
            VariantConfig::Sequence(SequenceConfig::default()),
            VariantConfig::BagOfEmbeddings(BagOfEmbeddingsConfig::default()),
            VariantConfig::TermFrequency(TermFrequencyConfig::default()),
        ];
        let kinds = [
            ClassifierKind::Sequence,
            ClassifierKind::BagOfEmbeddings,
            ClassifierKind::TermFrequency,
        ];
        for (variant, kind) in variants.into_iter().zip(kinds) {
            let classifier = ClassifierBuilder::new()
                .with_labels(&["zeta", "alpha"])
                .unwrap()
                .with_variant(variant)
                .build()
                .unwrap();
            assert_eq!(classifier.kind(), kind);
            assert_eq!(classifier.label_names(), &["zeta", "alpha"]);
            assert!(!classifier.is_trained());
        }
    }
}
