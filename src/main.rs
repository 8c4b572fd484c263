//! Seisdec CLI - Deep Embedded Clustering for seismic spectrograms
//!
//! Command-line interface for training, sweeping and applying DEC models.

use clap::{Parser, Subcommand};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use log::error;
use ndarray::Array2;
use seisdec::cluster::{select_k, GapReference, KSelectionOptions};
use seisdec::data::{MmapStore, SpectrogramWriter, SyntheticConfig};
use seisdec::inference::{compare_models, InferenceEngine};
use seisdec::storage::{load_snapshot, read_header, ModelKind};
use seisdec::train::RunStatus;
use seisdec::{Autoencoder, BatchLoader, DecModel, Mode, Result, RunConfig, RunContext, SampleStore, SeisdecError, Snapshot};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "seisdec")]
#[command(version)]
#[command(about = "Deep Embedded Clustering for seismic spectrograms", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pretraining, fine-tuning or prediction as described by a config file
    Run {
        /// JSON configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Override the configured mode (pretrain, train, predict)
        #[arg(short, long)]
        mode: Option<String>,

        /// Override the output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a labelled synthetic spectrogram store
    Synth {
        /// Output store file
        #[arg(short, long)]
        output: PathBuf,

        /// Number of samples
        #[arg(short = 'n', long, default_value = "1000")]
        samples: usize,

        /// Number of clusters
        #[arg(short = 'k', long, default_value = "3")]
        clusters: usize,

        /// Frequency bins
        #[arg(long, default_value = "16")]
        height: usize,

        /// Time bins
        #[arg(long, default_value = "16")]
        width: usize,

        /// Noise standard deviation
        #[arg(long, default_value = "0.05")]
        noise: f32,

        /// Write ground-truth labels to this CSV
        #[arg(long)]
        labels: Option<PathBuf>,

        /// Random seed
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },

    /// Score candidate cluster counts on pretrained latents
    SelectK {
        /// Spectrogram store
        #[arg(long)]
        store: PathBuf,

        /// Pretrained autoencoder snapshot
        #[arg(short, long)]
        autoencoder: PathBuf,

        /// Smallest candidate K
        #[arg(long, default_value = "2")]
        k_min: usize,

        /// Largest candidate K
        #[arg(long, default_value = "10")]
        k_max: usize,

        /// Reference datasets per gap estimate
        #[arg(long, default_value = "5")]
        refs: usize,

        /// Write the score table to this CSV
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Encoding batch size
        #[arg(short, long, default_value = "1024")]
        batch_size: usize,

        /// Random seed
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },

    /// Describe a store or snapshot file
    Info {
        /// Store or snapshot file
        path: PathBuf,
    },

    /// Cross-tabulate the labels of two DEC snapshots
    Compare {
        /// First snapshot (e.g. dec_initial.ckpt)
        #[arg(long)]
        before: PathBuf,

        /// Second snapshot (e.g. dec_final.ckpt)
        #[arg(long)]
        after: PathBuf,

        /// Spectrogram store
        #[arg(long)]
        store: PathBuf,

        /// Inference batch size
        #[arg(short, long, default_value = "1024")]
        batch_size: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let result = match cli.command {
        Commands::Run { config, mode, output } => run(config, mode, output),

        Commands::Synth {
            output,
            samples,
            clusters,
            height,
            width,
            noise,
            labels,
            seed,
        } => synth(
            output,
            SyntheticConfig {
                n_samples: samples,
                n_clusters: clusters,
                height,
                width,
                noise,
                seed,
                ..Default::default()
            },
            labels,
        ),

        Commands::SelectK {
            store,
            autoencoder,
            k_min,
            k_max,
            refs,
            output,
            batch_size,
            seed,
        } => select(store, autoencoder, k_min..=k_max, refs, output, batch_size, seed),

        Commands::Info { path } => show_info(path),

        Commands::Compare {
            before,
            after,
            store,
            batch_size,
        } => compare(before, after, store, batch_size),
    };

    if let Err(e) = result {
        error!("Error: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn spinner(message: impl Into<std::borrow::Cow<'static, str>>) -> Result<ProgressBar> {
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg} [{elapsed_precise}]")
        .map_err(|e| SeisdecError::Config(e.to_string()))?;
    let pb = ProgressBar::new_spinner();
    pb.set_style(style);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn run(config_path: PathBuf, mode: Option<String>, output: Option<PathBuf>) -> Result<()> {
    let start = Instant::now();
    let mut config = RunConfig::from_file(&config_path)?;
    if let Some(mode) = mode {
        config.mode = match mode.as_str() {
            "pretrain" => Mode::Pretrain,
            "train" => Mode::Train,
            "predict" => Mode::Predict,
            other => return Err(SeisdecError::Config(format!("unknown mode {:?}", other))),
        };
    }
    if let Some(output) = output {
        config.output_dir = output;
    }

    println!("Seisdec {} ({} mode)", seisdec::VERSION, config.mode);
    println!("   Config: {}", config_path.display());
    println!("   Output: {}", config.output_dir.display());
    println!();

    let runs = config.expand()?;
    let pb = spinner(format!("Executing {} run(s)...", runs.len()))?;
    let context = RunContext::new(&config.runtime)?;
    let store: Arc<dyn SampleStore> = Arc::new(MmapStore::open(&config.data.store)?);
    let report = seisdec::train::run_with_store(&config, runs, store, context);
    pb.finish_and_clear();
    let report = report?;

    for record in &report.runs {
        match &record.status {
            RunStatus::Completed { summary } => println!("✓ {} - {}", record.params.id(), summary),
            RunStatus::Failed { error, diverged } => println!(
                "✗ {} - {}{}",
                record.params.id(),
                if *diverged { "diverged: " } else { "" },
                error
            ),
        }
    }
    let failed = report.failed().count();
    println!();
    println!(
        "{} of {} runs completed in {}",
        report.runs.len() - failed,
        report.runs.len(),
        HumanDuration(start.elapsed())
    );

    if failed == report.runs.len() {
        return Err(SeisdecError::Training("every run failed".to_string()));
    }
    Ok(())
}

fn synth(output: PathBuf, config: SyntheticConfig, labels: Option<PathBuf>) -> Result<()> {
    let pb = spinner(format!("Generating {} samples...", config.n_samples))?;
    let data = config.generate()?;
    let mut writer = SpectrogramWriter::create(&output, config.height, config.width)?;
    writer.append_store(&data.store)?;
    let header = writer.finish()?;
    pb.finish_and_clear();
    println!(
        "✓ Wrote {} samples of {}x{} to {}",
        header.num_samples,
        header.height,
        header.width,
        output.display()
    );

    if let Some(path) = labels {
        let mut csv = csv::Writer::from_path(&path)?;
        csv.write_record(["index", "label"])?;
        for (i, label) in data.labels.iter().enumerate() {
            csv.write_record([i.to_string(), label.to_string()])?;
        }
        csv.flush()?;
        println!("✓ Wrote ground-truth labels to {}", path.display());
    }
    Ok(())
}

fn encode_store(model: &Autoencoder, loader: &BatchLoader) -> Result<Array2<f32>> {
    let pb = ProgressBar::new(loader.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)")
            .map_err(|e| SeisdecError::Config(e.to_string()))?,
    );
    pb.set_message("Encoding store...");

    let mut latents = Array2::zeros((loader.len(), model.latent_dim()));
    for batch in loader.iter()? {
        let batch = batch?;
        let z = model.encode(&batch.data)?;
        for (row, &pos) in z.rows().into_iter().zip(&batch.positions) {
            latents.row_mut(pos).assign(&row);
        }
        pb.inc(batch.len() as u64);
    }
    pb.finish_and_clear();
    Ok(latents)
}

fn select(
    store_path: PathBuf,
    autoencoder: PathBuf,
    candidates: std::ops::RangeInclusive<usize>,
    refs: usize,
    output: Option<PathBuf>,
    batch_size: usize,
    seed: u64,
) -> Result<()> {
    let start = Instant::now();
    let candidates: Vec<usize> = candidates.filter(|&k| k >= 1).collect();
    let snapshot: Snapshot<Autoencoder> = load_snapshot(&autoencoder)?;
    let store: Arc<dyn SampleStore> = Arc::new(MmapStore::open(&store_path)?);
    if store.shape() != snapshot.shape {
        return Err(SeisdecError::Shape {
            expected: format!("{:?}", snapshot.shape),
            actual: format!("{:?}", store.shape()),
        });
    }

    let context = RunContext::with_seed(seed, num_workers(), 4)?;
    let loader = BatchLoader::full(store, batch_size, snapshot.transform, context.clone());
    let latents = encode_store(&snapshot.model, &loader)?;
    println!("✓ Encoded {} samples into {} dimensions", latents.nrows(), latents.ncols());

    let pb = spinner(format!("Scoring K in {:?}...", candidates))?;
    let options = KSelectionOptions {
        n_refs: refs,
        seed,
        ..Default::default()
    };
    let report = context.pool().install(|| select_k(&latents, &candidates, &options));
    pb.finish_and_clear();
    let report = report?;

    println!("{:>4} {:>14} {:>10} {:>10} {:>10}", "k", "inertia", "silhouette", "gap(unif)", "gap(gauss)");
    for s in &report.scores {
        println!(
            "{:>4} {:>14.3} {:>10} {:>10.4} {:>10.4}",
            s.k,
            s.inertia,
            s.silhouette.map_or("-".to_string(), |v| format!("{:.4}", v)),
            s.gap_uniform,
            s.gap_gaussian
        );
    }
    println!();
    let show = |k: Option<usize>| k.map_or("-".to_string(), |k| k.to_string());
    println!("Best K by silhouette:      {}", show(report.best_by_silhouette()));
    println!("Best K by gap (uniform):   {}", show(report.best_by_gap(GapReference::Uniform)));
    println!("Best K by gap (gaussian):  {}", show(report.best_by_gap(GapReference::Gaussian)));

    if let Some(path) = output {
        report.write_csv(&path)?;
        println!("✓ Wrote scores to {}", path.display());
    }
    println!("Completed in {}", HumanDuration(start.elapsed()));
    Ok(())
}

fn show_info(path: PathBuf) -> Result<()> {
    if let Ok(header) = read_header(&path) {
        println!("Snapshot: {}", path.display());
        println!("  Format version: {}", header.version);
        println!("  Model: {}", header.kind);
        println!("  Epoch: {}", header.epoch);
        println!("  Payload: {} bytes", header.payload_len);
        match header.kind {
            ModelKind::Autoencoder => {
                let snapshot: Snapshot<Autoencoder> = load_snapshot(&path)?;
                println!("  Input: {:?} ({:?})", snapshot.shape, snapshot.transform);
                println!("  Latent dimension: {}", snapshot.model.latent_dim());
            }
            ModelKind::Dec => {
                let snapshot: Snapshot<DecModel> = load_snapshot(&path)?;
                println!("  Input: {:?} ({:?})", snapshot.shape, snapshot.transform);
                println!("  Latent dimension: {}", snapshot.model.latent_dim());
                println!("  Clusters: {}", snapshot.model.n_clusters());
                println!("  Alpha: {}", snapshot.model.clustering().alpha());
            }
        }
        return Ok(());
    }

    let store = MmapStore::open(&path)?;
    let header = store.header();
    println!("Store: {}", path.display());
    println!("  Samples: {}", header.num_samples);
    println!("  Shape: {}x{} (frequency x time)", header.height, header.width);
    if !store.is_empty() {
        let first = store.metadata(0)?;
        let last = store.metadata(store.len() - 1)?;
        println!("  First sample: {} at {}", first.station, first.timestamp);
        println!("  Last sample: {} at {}", last.station, last.timestamp);
    }
    println!("  File size: {} bytes", file_size(&path)?);
    Ok(())
}

fn compare(before: PathBuf, after: PathBuf, store_path: PathBuf, batch_size: usize) -> Result<()> {
    let first: Snapshot<DecModel> = load_snapshot(&before)?;
    let second: Snapshot<DecModel> = load_snapshot(&after)?;
    if first.transform != second.transform || first.shape != second.shape {
        return Err(SeisdecError::Config(
            "snapshots were trained on different inputs".to_string(),
        ));
    }
    let store: Arc<dyn SampleStore> = Arc::new(MmapStore::open(&store_path)?);

    let pb = spinner("Predicting with both snapshots...")?;
    let engine = InferenceEngine::new(batch_size, RunContext::with_seed(0, num_workers(), 4)?);
    let table = compare_models(&engine, &first.model, &second.model, store, first.transform);
    pb.finish_and_clear();
    let table = table?;

    println!("Rows: {} ({}), columns: {} ({})", before.display(), first.model.n_clusters(), after.display(), second.model.n_clusters());
    for (a, row) in table.counts.rows().into_iter().enumerate() {
        let cells: Vec<String> = row.iter().map(|c| format!("{:>7}", c)).collect();
        println!("{:>4} {}", a, cells.join(" "));
    }
    println!();
    println!("Samples: {}", table.total());
    println!("Purity: {:.4}", table.purity());
    Ok(())
}

fn num_workers() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get())
}

fn file_size(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}
