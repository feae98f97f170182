use std::fs;

use mycroft::{
    ArtifactDir, BagOfEmbeddingsConfig, CellKind, Classifier, ClassifierError, ClassifierKind, SequenceConfig,
    TermFrequencyConfig, TrainOptions, VariantConfig, VectorSource,
};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

const TEXTS: [&str; 8] = [
    "cheap pills for sale",
    "buy cheap watches now",
    "win money fast today",
    "free prize claim now",
    "lunch meeting at noon",
    "project review on friday",
    "notes from the team call",
    "agenda for the planning meeting",
];
const TARGETS: [usize; 8] = [1, 1, 1, 1, 0, 0, 0, 0];
const QUERIES: [&str; 3] = ["cheap prize now", "team meeting notes", "unseen words entirely"];

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

fn train_into(variant: VariantConfig, target: &std::path::Path, options: TrainOptions) -> Classifier {
    init_logging();
    let mut classifier = Classifier::builder()
        .with_labels(&["ham", "spam"])
        .unwrap()
        .with_variant(variant)
        .build()
        .unwrap();
    classifier
        .train(&TEXTS, &TARGETS, &options.with_artifact(target).with_verbosity(0))
        .unwrap();
    classifier
}

#[test]
fn test_save_load_prediction_equality() {
    let dir = tempdir().unwrap();
    let cases = [
        (
            VariantConfig::Sequence(SequenceConfig::default().with_units(6).with_cell(CellKind::Gru)),
            dir.path().join("sequence"),
        ),
        (
            VariantConfig::BagOfEmbeddings(BagOfEmbeddingsConfig::default()),
            dir.path().join("bag"),
        ),
        (
            VariantConfig::TermFrequency(TermFrequencyConfig::default()),
            dir.path().join("svm.json"),
        ),
    ];

    for (variant, target) in cases {
        let original = train_into(variant, &target, TrainOptions::default().with_epochs(3).with_batch_size(4));
        let restored = Classifier::load(&target).unwrap();

        assert_eq!(restored.kind(), original.kind());
        assert_eq!(restored.label_names(), original.label_names());
        assert!(restored.is_trained());

        let (before, names_before) = original.predict(&QUERIES, 2).unwrap();
        let (after, names_after) = restored.predict(&QUERIES, 2).unwrap();
        assert_eq!(names_before, names_after);
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-6, "{} vs {} for {}", a, b, original.kind());
        }
    }
}

#[test]
fn test_explicit_save_then_load() {
    let dir = tempdir().unwrap();
    let mut classifier = Classifier::builder()
        .with_labels(&["ham", "spam"])
        .unwrap()
        .bag_of_embeddings(BagOfEmbeddingsConfig::default())
        .build()
        .unwrap();
    assert!(matches!(
        classifier.save(dir.path().join("early")),
        Err(ClassifierError::NotTrained)
    ));

    classifier
        .train(&TEXTS, &TARGETS, &TrainOptions::default().with_epochs(2).with_verbosity(0))
        .unwrap();
    let target = dir.path().join("later");
    classifier.save(&target).unwrap();

    let restored = Classifier::load(&target).unwrap();
    assert_eq!(restored.kind(), ClassifierKind::BagOfEmbeddings);
    assert_eq!(restored.description(), classifier.description());
}

#[test]
fn test_artifact_directory_layout() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("model");
    train_into(
        VariantConfig::BagOfEmbeddings(BagOfEmbeddingsConfig::default()),
        &target,
        TrainOptions::default().with_epochs(2).with_validation_fraction(0.25),
    );

    let artifact = ArtifactDir::open(&target).unwrap();
    for path in [
        artifact.model_path(),
        artifact.classifier_path(),
        artifact.description_path(),
        artifact.history_path(),
    ] {
        assert!(path.is_file(), "{} is missing", path.display());
    }
    assert!(artifact
        .read_description()
        .unwrap()
        .starts_with("Neural bag of words classifier: 2 labels"));

    let history = artifact.read_history().unwrap().unwrap();
    assert_eq!(history.epochs(), 2);
    assert_eq!(history.monitor, "val_loss");
}

#[test]
fn test_history_keys_are_sorted() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("model");
    train_into(
        VariantConfig::BagOfEmbeddings(BagOfEmbeddingsConfig::default()),
        &target,
        TrainOptions::default().with_epochs(2).with_validation_fraction(0.25),
    );

    let raw = fs::read_to_string(target.join("history.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let metrics: Vec<&String> = value["history"].as_object().unwrap().keys().collect();
    assert_eq!(metrics, vec!["acc", "loss", "val_acc", "val_loss"]);

    let positions: Vec<usize> = ["\"epoch\"", "\"history\"", "\"monitor\"", "\"params\""]
        .iter()
        .map(|key| raw.find(key).unwrap())
        .collect();
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]), "{}", raw);
    assert!(raw.contains("\n    \""), "expected four space indentation");
}

#[test]
fn test_checkpoint_keeps_best_epoch() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("model");
    let classifier = train_into(
        VariantConfig::BagOfEmbeddings(BagOfEmbeddingsConfig::default()),
        &target,
        TrainOptions::default().with_epochs(6).with_validation_fraction(0.25),
    );

    let history = classifier.history().unwrap();
    let best = history.best_epoch().unwrap();
    let restored = Classifier::load(&target).unwrap();
    assert_eq!(restored.history().unwrap().best_epoch(), Some(best));

    let (before, _) = classifier.predict(&QUERIES, 8).unwrap();
    let (after, _) = restored.predict(&QUERIES, 8).unwrap();
    for (a, b) in before.iter().zip(after.iter()) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn test_load_missing_path() {
    let dir = tempdir().unwrap();
    let err = Classifier::load(dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, ClassifierError::ArtifactNotFound(_)));
}

#[test]
fn test_tampered_weights_are_corrupt() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("model");
    train_into(
        VariantConfig::BagOfEmbeddings(BagOfEmbeddingsConfig::default()),
        &target,
        TrainOptions::default().with_epochs(1),
    );

    let model_path = target.join("model.mpk");
    let mut raw = fs::read(&model_path).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0xff;
    fs::write(&model_path, raw).unwrap();

    let err = Classifier::load(&target).unwrap_err();
    assert!(matches!(err, ClassifierError::CorruptArtifact { .. }), "{:?}", err);
}

#[test]
fn test_table_vectors_are_stored_in_the_artifact() {
    let dir = tempdir().unwrap();
    let table = dir.path().join("vectors.txt");
    fs::write(
        &table,
        "cheap 1.0 0.0 0.2\nprize 0.9 0.1 0.0\nnow 0.7 0.2 0.1\nmeeting 0.0 1.0 0.3\nteam 0.1 0.8 0.0\nnotes 0.0 0.9 0.2\n",
    )
    .unwrap();
    let target = dir.path().join("bag");
    let config = BagOfEmbeddingsConfig::default().with_vectors(VectorSource::Table { path: table.clone() });
    let classifier = train_into(
        VariantConfig::BagOfEmbeddings(config),
        &target,
        TrainOptions::default().with_epochs(3),
    );
    let (before, _) = classifier.predict(&QUERIES, 8).unwrap();

    fs::remove_file(&table).unwrap();
    let restored = Classifier::load(&target).unwrap();
    let (after, _) = restored.predict(&QUERIES, 8).unwrap();
    assert_eq!(before, after);
    assert!(restored.description().contains("vocabulary of 6 words"));
}
