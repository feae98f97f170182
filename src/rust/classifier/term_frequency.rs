use std::path::Path;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::classifier::ClassifierKind;
use super::error::{ClassifierError, Result};
use super::history::{HistoryParams, TrainingHistory};
use super::labels::LabelSpace;
use super::metrics::{self, format_scores};
use super::model::{check_training_inputs, evaluation_targets, label_predictions, unique_labels};
use super::svm::SupportVectorClassifier;
use super::tfidf::TfIdfVectorizer;
use super::trainer::holdout;
use crate::artifact::{read_json, write_json};
use crate::config::{TermFrequencyConfig, TrainOptions};

/// The fitted two-stage pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pipeline {
    vectorizer: TfIdfVectorizer,
    svm: SupportVectorClassifier,
}

impl Pipeline {
    fn predict_proba<S: AsRef<str>>(&self, texts: &[S]) -> Array2<f32> {
        self.svm.predict_proba(self.vectorizer.transform(texts).view())
    }
}

/// Everything a term frequency classifier needs, stored as one file.
#[derive(Serialize, Deserialize)]
struct TermFrequencyArtifact {
    kind: ClassifierKind,
    labels: LabelSpace,
    config: TermFrequencyConfig,
    pipeline: Pipeline,
    history: Option<TrainingHistory>,
}

/// Sublinear TF-IDF features scored by a probability calibrated RBF SVM.
#[derive(Debug, Clone)]
pub struct TermFrequencyClassifier {
    labels: LabelSpace,
    config: TermFrequencyConfig,
    pipeline: Option<Pipeline>,
    history: Option<TrainingHistory>,
}

impl TermFrequencyClassifier {
    /// Creates an untrained classifier.
    ///
    /// # Errors
    /// - `InvalidConfiguration` on duplicate label names or bad SVM parameters
    pub fn new<S: AsRef<str>>(label_names: &[S], config: TermFrequencyConfig) -> Result<Self> {
        let labels = unique_labels(label_names)?;
        config.validate()?;
        Ok(Self {
            labels,
            config,
            pipeline: None,
            history: None,
        })
    }

    /// Fits the whole pipeline in one pass; `epochs` and `batch_size` do not apply.
    ///
    /// A validation split is only scored, there is no checkpointing. The returned
    /// history holds a single epoch. With an artifact target the fitted pipeline
    /// is written to that file.
    pub fn train<S: AsRef<str>>(
        &mut self,
        texts: &[S],
        labels: &[usize],
        options: &TrainOptions,
    ) -> Result<TrainingHistory> {
        check_training_inputs(&self.labels, texts, labels)?;
        options.validate()?;

        let mut rng = StdRng::seed_from_u64(options.seed);
        let (train_rows, validation_rows) = match options.validation_fraction {
            Some(fraction) => holdout(texts.len(), fraction, &mut rng)?,
            None => ((0..texts.len()).collect(), Vec::new()),
        };
        let train_texts: Vec<&str> = train_rows.iter().map(|&i| texts[i].as_ref()).collect();
        let train_labels: Vec<usize> = train_rows.iter().map(|&i| labels[i]).collect();

        let vectorizer = TfIdfVectorizer::fit(&train_texts, self.config.stop_words.clone())?;
        let svm = SupportVectorClassifier::fit(
            vectorizer.transform(&train_texts).view(),
            &train_labels,
            self.labels.len(),
            self.config.c,
            self.config.gamma,
        )?;
        let pipeline = Pipeline { vectorizer, svm };

        let validating = !validation_rows.is_empty();
        let mut history = TrainingHistory::new(
            if validating { "val_loss" } else { "loss" },
            HistoryParams {
                batch_size: train_rows.len(),
                epochs: 1,
                samples: train_rows.len(),
                seed: options.seed,
                validation_samples: validation_rows.len(),
            },
        );
        let mut scores = Self::score(&pipeline, &train_texts, &train_labels);
        if validating {
            let texts: Vec<&str> = validation_rows.iter().map(|&i| texts[i].as_ref()).collect();
            let targets: Vec<usize> = validation_rows.iter().map(|&i| labels[i]).collect();
            scores.extend(
                Self::score(&pipeline, &texts, &targets)
                    .into_iter()
                    .map(|(name, value)| (format!("val_{}", name), value)),
            );
        }
        history.record(0, &scores);
        if options.reports_progress() {
            log::info!("SVM TF-IDF fit - {}", format_scores(&scores));
        }

        self.pipeline = Some(pipeline);
        self.history = Some(history.clone());
        if let Some(path) = &options.artifact {
            self.save(path)?;
        }
        Ok(history)
    }

    fn score(pipeline: &Pipeline, texts: &[&str], targets: &[usize]) -> Vec<(String, f64)> {
        let probabilities = pipeline.predict_proba(texts);
        vec![
            ("acc".to_string(), metrics::accuracy(probabilities.view(), targets)),
            ("loss".to_string(), metrics::log_loss(probabilities.view(), targets)),
        ]
    }

    /// Scores the whole batch at once.
    pub fn predict<S: AsRef<str>>(&self, texts: &[S]) -> Result<(Array2<f32>, Vec<String>)> {
        let pipeline = self.trained()?;
        if texts.is_empty() {
            return Err(ClassifierError::ValidationError("Input texts cannot be empty".into()));
        }
        let probabilities = pipeline.predict_proba(texts);
        let names = label_predictions(&self.labels, &probabilities)?;
        Ok((probabilities, names))
    }

    /// Accuracy and log-loss, the latter over the classifier's own label set.
    ///
    /// # Errors
    /// - `UnknownLabel` if a label is not part of the label space
    pub fn evaluate<S: AsRef<str>, L: AsRef<str>>(&self, texts: &[S], labels: &[L]) -> Result<Vec<(String, f64)>> {
        let pipeline = self.trained()?;
        let targets = evaluation_targets(&self.labels, texts, labels)?;
        let probabilities = pipeline.predict_proba(texts);
        // columns must follow the label space order before scoring
        if probabilities.ncols() != self.labels.len() {
            return Err(ClassifierError::ValidationError(format!(
                "Model scored {} labels, the label space has {}",
                probabilities.ncols(),
                self.labels.len()
            )));
        }
        Ok(vec![
            ("acc".to_string(), metrics::accuracy(probabilities.view(), &targets)),
            ("loss".to_string(), metrics::log_loss(probabilities.view(), &targets)),
        ])
    }

    fn trained(&self) -> Result<&Pipeline> {
        self.pipeline.as_ref().ok_or(ClassifierError::NotTrained)
    }

    pub fn description(&self) -> String {
        let mut description = format!("SVM TF-IDF classifier: {} labels", self.labels.len());
        if let Some(pipeline) = &self.pipeline {
            description.push_str(&format!(
                ", {} terms, {} support vectors",
                pipeline.vectorizer.vocabulary_size(),
                pipeline.svm.num_support_vectors()
            ));
        }
        description
    }

    pub fn labels(&self) -> &LabelSpace {
        &self.labels
    }

    pub fn config(&self) -> &TermFrequencyConfig {
        &self.config
    }

    pub fn history(&self) -> Option<&TrainingHistory> {
        self.history.as_ref()
    }

    pub fn is_trained(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Writes the fitted pipeline as a single file.
    pub fn save(&self, target: &Path) -> Result<()> {
        let artifact = TermFrequencyArtifact {
            kind: ClassifierKind::TermFrequency,
            labels: self.labels.clone(),
            config: self.config.clone(),
            pipeline: self.trained()?.clone(),
            history: self.history.clone(),
        };
        write_json(target, &artifact)?;
        log::info!("Saved {} classifier to {:?}", ClassifierKind::TermFrequency, target);
        Ok(())
    }

    pub(crate) fn load(source: &Path) -> Result<Self> {
        let artifact: TermFrequencyArtifact = read_json(source)?;
        if artifact.kind != ClassifierKind::TermFrequency {
            return Err(ClassifierError::corrupt(
                source,
                format!("holds a {} classifier, expected {}", artifact.kind, ClassifierKind::TermFrequency),
            ));
        }
        if artifact.pipeline.svm.num_classes() != artifact.labels.len() {
            return Err(ClassifierError::corrupt(
                source,
                format!(
                    "SVM scores {} labels, the file lists {}",
                    artifact.pipeline.svm.num_classes(),
                    artifact.labels.len()
                ),
            ));
        }
        Ok(Self {
            labels: artifact.labels,
            config: artifact.config,
            pipeline: Some(artifact.pipeline),
            history: artifact.history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopWords;

    fn spam_ham() -> (Vec<&'static str>, Vec<usize>, TermFrequencyClassifier) {
        let texts = vec!["buy now", "cheap pills", "meeting at noon", "project deadline tomorrow"];
        let (labels, indices) = LabelSpace::from_raw(&["spam", "spam", "ham", "ham"], None).unwrap();
        let classifier = TermFrequencyClassifier::new(labels.names(), TermFrequencyConfig::default()).unwrap();
        (texts, indices, classifier)
    }

    #[test]
    fn test_default_config_keeps_query_words() {
        let (texts, labels, mut classifier) = spam_ham();
        classifier.train(&texts, &labels, &TrainOptions::default()).unwrap();
        let (probabilities, names) = classifier.predict(&["free money now"]).unwrap();
        assert_eq!(probabilities.ncols(), 2);
        assert_eq!(names, vec!["spam".to_string()]);
        assert_eq!(classifier.config().stop_words, StopWords::None);
    }

    #[test]
    fn test_single_epoch_history() {
        let (texts, labels, mut classifier) = spam_ham();
        let history = classifier.train(&texts, &labels, &TrainOptions::default()).unwrap();
        assert_eq!(history.epochs(), 1);
        assert_eq!(history.monitor, "loss");
        assert_eq!(history.metric("acc").unwrap(), &[1.0]);
        assert!(classifier.description().starts_with("SVM TF-IDF classifier: 2 labels"));
    }

    #[test]
    fn test_validation_split_is_scored() {
        let texts = [
            "buy now", "cheap pills now", "buy cheap", "pills for sale",
            "meeting at noon", "project deadline", "noon meeting moved", "deadline for project",
        ];
        let labels = [1, 1, 1, 1, 0, 0, 0, 0];
        let mut classifier = TermFrequencyClassifier::new(&["ham", "spam"], TermFrequencyConfig::default()).unwrap();
        let options = TrainOptions::default().with_validation_fraction(0.25);
        let history = classifier.train(&texts, &labels, &options).unwrap();
        assert_eq!(history.monitor, "val_loss");
        assert_eq!(history.params.validation_samples, 2);
        assert!(history.metric("val_acc").is_some());
    }

    #[test]
    fn test_evaluate_rejects_unknown_label() {
        let (texts, labels, mut classifier) = spam_ham();
        classifier.train(&texts, &labels, &TrainOptions::default()).unwrap();
        let err = classifier.evaluate(&["free money"], &["eggs"]).unwrap_err();
        assert!(matches!(err, ClassifierError::UnknownLabel(_)));

        let scores = classifier.evaluate(&texts, &["spam", "spam", "ham", "ham"]).unwrap();
        assert_eq!(scores[0], ("acc".to_string(), 1.0));
        assert!(scores[1].1.is_finite());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svm.json");
        let (texts, labels, mut classifier) = spam_ham();
        classifier
            .train(&texts, &labels, &TrainOptions::default().with_artifact(&path))
            .unwrap();

        let restored = TermFrequencyClassifier::load(&path).unwrap();
        assert_eq!(restored.labels(), classifier.labels());
        let (before, _) = classifier.predict(&["cheap meeting"]).unwrap();
        let (after, _) = restored.predict(&["cheap meeting"]).unwrap();
        assert_eq!(before, after);
    }
}
