//! 命令行入口
//!
//! ```text
//! code-transformer train --data corpus.txt --out model/ [--config run.json]
//! code-transformer predict --model model/ snippet.java
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use code_transformer::configs;
use code_transformer::{load_labeled_corpus, CodeClassifier, RunConfig};

#[derive(Parser, Debug)]
#[command(
    name = "code-transformer",
    version,
    about = "Train a small transformer to classify source-code snippets, then run predictions."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a classifier on a `<code>|||LABEL|||<n>` corpus
    Train(TrainArgs),

    /// Classify a source file with a trained classifier
    Predict(PredictArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Labeled corpus file
    #[arg(long)]
    data: PathBuf,

    /// Output directory for the model and vocabulary
    #[arg(long)]
    out: PathBuf,

    /// JSON run configuration (defaults to the production preset)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the learning rate
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Seed for parameter initialization and shuffling
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct PredictArgs {
    /// Directory written by `train`
    #[arg(long)]
    model: PathBuf,

    /// Source file to classify
    file: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("code_transformer=info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Train(args) => train(args),
        Commands::Predict(args) => predict(args),
    }
}

fn train(args: TrainArgs) -> Result<()> {
    let mut run_config = match &args.config {
        Some(path) => RunConfig::from_json_file(path)
            .with_context(|| format!("reading config '{}'", path.display()))?,
        None => configs::production(),
    };
    if let Some(epochs) = args.epochs {
        run_config.trainer.epochs = epochs;
    }
    if let Some(lr) = args.learning_rate {
        run_config.trainer.learning_rate = lr;
    }
    if let Some(seed) = args.seed {
        run_config.model.seed = Some(seed);
        run_config.trainer.shuffle_seed = Some(seed);
    }

    let corpus = load_labeled_corpus(&args.data)
        .with_context(|| format!("loading corpus '{}'", args.data.display()))?;
    tracing::info!("Loaded {} labeled snippets", corpus.len());

    let (classifier, history) = CodeClassifier::train(&corpus, &run_config)?;
    classifier
        .save(&args.out)
        .with_context(|| format!("saving classifier to '{}'", args.out.display()))?;

    println!("{}", history.summary());
    Ok(())
}

fn predict(args: PredictArgs) -> Result<()> {
    let classifier = CodeClassifier::load(&args.model)
        .with_context(|| format!("loading classifier from '{}'", args.model.display()))?;
    let code = fs::read_to_string(&args.file)
        .with_context(|| format!("reading '{}'", args.file.display()))?;

    let prediction = classifier.analyze(&code)?;
    println!(
        "Predicted class: {} with probability {:.2}%",
        prediction.class,
        prediction.probability * 100.0
    );
    Ok(())
}
