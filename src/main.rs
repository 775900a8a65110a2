//! gatetrace: train, elicit and inspect instrumented LSTM sequence models.
//!
//! This is the CLI binary entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::Level;

use gatetrace::core::corpus::{read_jsonl, vocabularies};
use gatetrace::core::instruments::InstrumentSet;
use gatetrace::core::model::{ModelConfig, Task};
use gatetrace::execution::{AnnotationPolicy, DiskSinkFactory, ElicitConfig, ElicitationPipeline};
use gatetrace::learning::trainer::{Plateau, TrainingParameters};
use gatetrace::runtime::{GraphEvaluator, LstmEvaluator, StepwiseSession};

/// gatetrace CLI.
#[derive(Parser, Debug)]
#[command(
    name = "gatetrace",
    about = "Instrumented multi-layer LSTMs: training, checkpoints and activation elicitation",
    version
)]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TaskArg {
    Lm,
    Classification,
}

impl From<TaskArg> for Task {
    fn from(task: TaskArg) -> Self {
        match task {
            TaskArg::Lm => Task::LanguageModel,
            TaskArg::Classification => Task::Classification,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model on a JSON-lines corpus and save it as a new version.
    Train {
        /// Training corpus (`{"inputs": [...], "targets": [...]}` per line).
        #[arg(long)]
        corpus: PathBuf,

        /// Held-out corpus reported after training.
        #[arg(long)]
        test: Option<PathBuf>,

        #[arg(short, long, default_value = "./model")]
        model_dir: PathBuf,

        /// Version to save under.
        #[arg(long, default_value = "1")]
        version: String,

        /// Make the saved version the latest.
        #[arg(long, default_value_t = false)]
        latest: bool,

        #[arg(long, value_enum, default_value_t = TaskArg::Lm)]
        task: TaskArg,

        #[arg(long, default_value_t = gatetrace::config::DEFAULT_LAYERS)]
        layers: usize,

        #[arg(long, default_value_t = gatetrace::config::DEFAULT_WIDTH)]
        width: usize,

        #[arg(long, default_value_t = gatetrace::config::DEFAULT_EMBEDDING_WIDTH)]
        embedding_width: usize,

        #[arg(long, default_value_t = 100)]
        epochs: usize,

        /// Stop after this many epochs without improvement.
        #[arg(long, default_value_t = 5)]
        patience: usize,

        #[arg(long, default_value_t = gatetrace::config::DEFAULT_LEARNING_RATE)]
        learning_rate: f32,

        #[arg(long, default_value_t = 0.0)]
        dropout: f32,

        #[arg(long, default_value_t = gatetrace::config::DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Harvest per-part, per-layer activations into on-disk streams.
    Elicit {
        #[arg(short, long, default_value = "./model")]
        model_dir: PathBuf,

        /// Version to load (latest if omitted).
        #[arg(long)]
        version: Option<String>,

        #[arg(long)]
        train: PathBuf,

        #[arg(long)]
        test: PathBuf,

        /// Output directory for the `train/` and `test/` streams.
        #[arg(long, default_value = "./states")]
        states_dir: PathBuf,

        #[arg(long, default_value_t = gatetrace::config::DEFAULT_SAMPLE_RATE)]
        train_rate: f64,

        #[arg(long, default_value_t = gatetrace::config::DEFAULT_SAMPLE_RATE)]
        test_rate: f64,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Annotate every timestep with the sequence's first label (the
        /// default for classification models).
        #[arg(long, default_value_t = false)]
        whole_sequence: bool,

        /// Report sampling counts only.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Probe a parameter, or step through symbols printing predictions.
    Inspect {
        #[arg(short, long, default_value = "./model")]
        model_dir: PathBuf,

        #[arg(long)]
        version: Option<String>,

        /// Parameter name, e.g. `forget_gate.bias`.
        #[arg(long)]
        parameter: Option<String>,

        #[arg(long)]
        layer: Option<usize>,

        /// Symbols to feed one at a time.
        #[arg(trailing_var_arg = true)]
        symbols: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("gatetrace v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Train {
            corpus,
            test,
            model_dir,
            version,
            latest,
            task,
            layers,
            width,
            embedding_width,
            epochs,
            patience,
            learning_rate,
            dropout,
            batch_size,
            seed,
        } => {
            let train_corpus = read_jsonl(&corpus)
                .with_context(|| format!("reading {}", corpus.display()))?;
            if train_corpus.is_empty() {
                bail!("{} contains no sequences", corpus.display());
            }
            let (words, targets) = vocabularies(&train_corpus);
            let config = ModelConfig {
                layers,
                width,
                embedding_width,
                task: task.into(),
            };
            tracing::info!(
                "Config: {} layers, width={}, embedding_width={}, vocab={}, outputs={}",
                layers,
                width,
                embedding_width,
                words.len(),
                targets.len(),
            );

            let mut evaluator = LstmEvaluator::new(config, words, targets, seed)?;
            let params = TrainingParameters::default()
                .with_learning_rate(learning_rate)
                .with_dropout_rate(dropout)
                .with_batch_size(batch_size)
                .with_seed(seed);
            let mut stop = Plateau {
                patience,
                min_delta: 1e-4,
                max_epochs: epochs,
            };
            let report = evaluator.train(&train_corpus, &params, &mut stop)?;
            tracing::info!(
                "Trained {} epochs, final loss {:.4} ({})",
                report.epochs,
                report.final_loss().unwrap_or(f32::NAN),
                report.reason
            );

            if let Some(test) = test {
                let test_corpus = read_jsonl(&test)
                    .with_context(|| format!("reading {}", test.display()))?;
                let result = evaluator.test(&test_corpus, true)?;
                tracing::info!("Test loss {:.4}, perplexity {:.4}", result.loss, result.perplexity);
            }

            let path = evaluator
                .save(&model_dir, &version, latest)
                .with_context(|| format!("saving to {}", model_dir.display()))?;
            tracing::info!("Saved version {} to {}", version, path.display());
        }

        Command::Elicit {
            model_dir,
            version,
            train,
            test,
            states_dir,
            train_rate,
            test_rate,
            seed,
            whole_sequence,
            dry_run,
        } => {
            let evaluator = LstmEvaluator::load(&model_dir, version.as_deref())
                .with_context(|| format!("loading from {}", model_dir.display()))?;
            let train_corpus = read_jsonl(&train)
                .with_context(|| format!("reading {}", train.display()))?;
            let test_corpus = read_jsonl(&test)
                .with_context(|| format!("reading {}", test.display()))?;

            let config = ElicitConfig {
                sample_rate_train: train_rate,
                sample_rate_test: test_rate,
                seed,
                policy: whole_sequence.then_some(AnnotationPolicy::WholeSequence),
                handle_unknown: true,
            };
            let pipeline = ElicitationPipeline::new(Arc::new(evaluator), config)?;

            if dry_run {
                pipeline.dry_run(&train_corpus, &test_corpus);
                return Ok(());
            }

            let factory = DiskSinkFactory::new(&states_dir);
            let (train_report, test_report) = pipeline.run(&train_corpus, &test_corpus, &factory)?;
            tracing::info!(
                "Wrote {} + {} streams under {}",
                train_report.records.len(),
                test_report.records.len(),
                states_dir.display()
            );
        }

        Command::Inspect {
            model_dir,
            version,
            parameter,
            layer,
            symbols,
        } => {
            let evaluator = Arc::new(
                LstmEvaluator::load(&model_dir, version.as_deref())
                    .with_context(|| format!("loading from {}", model_dir.display()))?,
            );

            if let Some(name) = parameter {
                let value = evaluator.probe(&name, layer)?;
                println!("{} {:?}", name, value.shape());
                println!("{}", value);
            }

            if !symbols.is_empty() {
                let mut rng = StdRng::seed_from_u64(0);
                let mut session = StepwiseSession::new(Arc::clone(&evaluator), true, &mut rng);
                for symbol in &symbols {
                    let outcome = session.step(symbol, &InstrumentSet::empty())?;
                    println!(
                        "{}\t{}\t{}\t{:.4}",
                        session.t(),
                        symbol,
                        outcome.prediction.label,
                        outcome.prediction.probability
                    );
                }
                if let Some(state) = session.state() {
                    tracing::info!(
                        "Session {}: top cell norm {:.4}, healthy {}",
                        session.name(),
                        state.cell_norm(),
                        state.is_healthy()
                    );
                }
            }
        }
    }

    tracing::info!("Done.");
    Ok(())
}
