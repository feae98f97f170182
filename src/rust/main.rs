use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use mycroft::{
    format_scores, BagOfEmbeddingsConfig, CellKind, Classifier, ClassifierError, LabelSpace, SequenceConfig,
    TermFrequencyConfig, TrainOptions, VariantConfig,
};

#[derive(Parser)]
#[command(author, version, about = "Mycroft classifies text to categorical labels", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train every model family on a small built-in corpus, save, reload and evaluate it
    Demo {
        /// Training epochs for the embedding models
        #[arg(long, default_value_t = 10)]
        epochs: usize,
        /// Where to write the model artifacts
        #[arg(long, default_value = ".")]
        output_directory: PathBuf,
        /// Recurrent cell of the sequence model (lstm or gru)
        #[arg(long, default_value = "lstm")]
        rnn_type: CellKind,
    },
    /// Show details of a trained model
    Details {
        /// Model directory or file
        model: PathBuf,
    },
}

const CORPUS: [(&str, &str); 12] = [
    ("The new release ships a faster compiler and better tooling", "tech"),
    ("Engineers fixed the memory leak in the database driver", "tech"),
    ("The laptop battery lasts all day with the latest firmware", "tech"),
    ("Open source developers merged the networking patch", "tech"),
    ("Programmers debate the new language features", "tech"),
    ("Cloud servers scale automatically under heavy traffic", "tech"),
    ("The striker scored twice in the championship final", "sports"),
    ("Fans cheered as the team won the league title", "sports"),
    ("The coach praised the defense after the narrow victory", "sports"),
    ("She broke the world record in the marathon", "sports"),
    ("The goalkeeper saved a penalty in extra time", "sports"),
    ("Players trained hard before the tournament match", "sports"),
];

const HELD_OUT: [(&str, &str); 4] = [
    ("Developers released a patch for the compiler", "tech"),
    ("The team scored in the final minute of the match", "sports"),
    ("New firmware makes the servers faster", "tech"),
    ("The coach celebrated the league victory with fans", "sports"),
];

fn run_variant(name: &str, variant: VariantConfig, options: TrainOptions, target: &Path) -> Result<()> {
    let start = Instant::now();
    let texts: Vec<&str> = CORPUS.iter().map(|(text, _)| *text).collect();
    let raw_labels: Vec<&str> = CORPUS.iter().map(|(_, label)| *label).collect();
    let (labels, indices) = LabelSpace::from_raw(&raw_labels, None)?;

    let mut classifier = Classifier::builder()
        .with_labels(labels.names())?
        .with_variant(variant)
        .build()?;

    info!("=== Training {} model ===", name);
    let history = classifier.train(&texts, &indices, &options.with_artifact(target))?;
    println!("{}", history.summary_line());

    let restored = Classifier::load(target)
        .with_context(|| format!("reloading {} model from {}", name, target.display()))?;
    println!("\n{}\n", restored);

    let test_texts: Vec<&str> = HELD_OUT.iter().map(|(text, _)| *text).collect();
    let test_labels: Vec<&str> = HELD_OUT.iter().map(|(_, label)| *label).collect();
    let scores = restored.evaluate(&test_texts, &test_labels, 32)?;
    println!("{}", format_scores(&scores));

    let (probabilities, predicted) = restored.predict(&test_texts, 32)?;
    for ((text, label), row) in test_texts.iter().zip(&predicted).zip(probabilities.rows()) {
        println!("  {:<55} {:<8} {:?}", text, label, row.to_vec());
    }
    info!("{} model done in {:.2?}", name, start.elapsed());
    Ok(())
}

fn demo(epochs: usize, output_directory: &Path, rnn_type: CellKind) -> Result<()> {
    std::fs::create_dir_all(output_directory)
        .with_context(|| format!("creating {}", output_directory.display()))?;
    let options = TrainOptions::default()
        .with_epochs(epochs)
        .with_batch_size(4)
        .with_validation_fraction(0.25);

    run_variant(
        "sequence",
        VariantConfig::Sequence(SequenceConfig::default().with_units(16).with_cell(rnn_type)),
        options.clone(),
        &output_directory.join("sequence-model"),
    )?;
    run_variant(
        "bag of embeddings",
        VariantConfig::BagOfEmbeddings(BagOfEmbeddingsConfig::default()),
        options.clone(),
        &output_directory.join("bag-model"),
    )?;
    run_variant(
        "SVM TF-IDF",
        VariantConfig::TermFrequency(TermFrequencyConfig::default()),
        options,
        &output_directory.join("svm-model.json"),
    )
}

fn details(model: &Path) -> Result<()> {
    let classifier = Classifier::load(model)?;
    println!("{}", classifier);
    if let Some(history) = classifier.history() {
        println!("\n{}", history.summary_line());
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let result = match args.command {
        Command::Demo {
            epochs,
            output_directory,
            rnn_type,
        } => demo(epochs, &output_directory, rnn_type),
        Command::Details { model } => details(&model),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ClassifierError>() {
                Some(classifier_error) => eprintln!("{}", classifier_error.diagnostic()),
                None => eprintln!("{:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}
