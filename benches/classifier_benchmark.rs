use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mycroft::{
    BagOfEmbeddingsConfig, Classifier, SequenceConfig, TermFrequencyConfig, TrainOptions, VariantConfig,
};

const TEXTS: [&str; 8] = [
    "the striker scored a late goal",
    "fans cheered the winning team",
    "the coach praised the defense",
    "a record win in the final match",
    "the compiler release fixed bugs",
    "developers merged the network patch",
    "new firmware speeds up the laptop",
    "servers scale under heavy traffic",
];
const TARGETS: [usize; 8] = [0, 0, 0, 0, 1, 1, 1, 1];

fn setup_benchmark_classifier(variant: VariantConfig) -> Classifier {
    let mut classifier = Classifier::builder()
        .with_labels(&["sports", "tech"])
        .unwrap()
        .with_variant(variant)
        .build()
        .unwrap();
    classifier
        .train(&TEXTS, &TARGETS, &TrainOptions::default().with_epochs(2).with_verbosity(0))
        .unwrap();
    classifier
}

fn variants() -> Vec<(&'static str, VariantConfig)> {
    vec![
        ("sequence", VariantConfig::Sequence(SequenceConfig::default().with_units(32))),
        ("bag_of_embeddings", VariantConfig::BagOfEmbeddings(BagOfEmbeddingsConfig::default())),
        ("term_frequency", VariantConfig::TermFrequency(TermFrequencyConfig::default())),
    ]
}

fn bench_single_prediction(c: &mut Criterion) {
    let mut group = c.benchmark_group("Single Prediction");
    group.sample_size(50);
    group.warm_up_time(std::time::Duration::from_secs(1));

    for (name, variant) in variants() {
        let classifier = setup_benchmark_classifier(variant);
        group.bench_function(name, |b| {
            b.iter(|| classifier.predict(black_box(&["the team fixed the compiler"]), 1).unwrap())
        });
    }
    group.finish();
}

fn bench_batch_prediction(c: &mut Criterion) {
    let mut group = c.benchmark_group("Batch Prediction");
    group.sample_size(20);

    for (name, variant) in variants() {
        let classifier = setup_benchmark_classifier(variant);
        for size in [8usize, 64, 256] {
            let batch: Vec<&str> = TEXTS.iter().copied().cycle().take(size).collect();
            group.bench_with_input(BenchmarkId::new(name, size), &batch, |b, batch| {
                b.iter(|| classifier.predict(black_box(batch), 32).unwrap())
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_single_prediction, bench_batch_prediction);
criterion_main!(benches);
