use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    config::Config,
    module::AutodiffModule,
    optim::AdamConfig,
    tensor::backend::AutodiffBackend,
};
use clap::{Args, Parser, Subcommand};
use optreg_core::ExecutionContext;
use optreg_io::NiftiPairSource;
use optreg_model::{
    LossWeights, NetworkVariant, RegistrationNetwork, TransMorphConfig, ViTVNetConfig, VoxelMorphConfig,
};
use optreg_train::{CheckpointStore, ConsoleObserver, DatasetId, DatasetProfile, Pairing, Trainer, TrainingConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod progress;

use progress::ProgressObserver;

#[cfg(feature = "ndarray")]
type Backend = burn::backend::Autodiff<burn::backend::NdArray>;
#[cfg(not(feature = "ndarray"))]
type Backend = burn::backend::Autodiff<burn::backend::Wgpu>;

#[derive(Parser)]
#[command(name = "optreg")]
#[command(about = "Train deformable registration networks with per-sample refinement")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a network
    Train(TrainArgs),

    /// Print the built-in dataset profiles
    Datasets,

    /// List the checkpoints of a run in resume-index order
    Checkpoints {
        /// Run directory, e.g. checkpoints/TransMorph_IXI_opt
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Load every option from a JSON config instead of the flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// IXI, OASIS or LPBA
    #[arg(long, default_value = "IXI")]
    dataset: DatasetId,

    /// TransMorph, VoxelMorph or ViTVNet
    #[arg(long, default_value = "TransMorph")]
    network: NetworkVariant,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, default_value = "data/Train")]
    train_dir: PathBuf,

    #[arg(long, default_value = "data/Val")]
    val_dir: PathBuf,

    /// Segmentations stored apart from the images, matched by file name
    #[arg(long)]
    label_dir: Option<PathBuf>,

    /// Atlas image for atlas-paired datasets
    #[arg(long)]
    atlas_path: Option<PathBuf>,

    #[arg(long)]
    atlas_labels: Option<PathBuf>,

    /// Comma-separated label ids replacing the dataset's scored labels
    #[arg(long, value_delimiter = ',')]
    labels: Option<Vec<u32>>,

    #[arg(long, default_value_t = 1e-4)]
    lr: f64,

    #[arg(long, default_value_t = 0.1)]
    refiner_lr: f64,

    #[arg(long, default_value_t = 0)]
    epoch_start: usize,

    #[arg(long, default_value_t = 500)]
    max_epoch: usize,

    /// Refiner steps per sample; 0 trains without refinement
    #[arg(long, default_value_t = 10)]
    refiner_iterations: usize,

    /// `similarity,regularization` weights of the network loss
    #[arg(long, default_value = "1,0.02", value_parser = parse_weights)]
    network_weights: LossWeights,

    /// `similarity,regularization` weights of the refiner loss
    #[arg(long, default_value = "1,1", value_parser = parse_weights)]
    refiner_weights: LossWeights,

    /// Checkpoint to resume from; negative values count from the end
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    checkpoint_index: i64,

    #[arg(long, default_value = "checkpoints")]
    checkpoint_root: PathBuf,

    #[arg(long, default_value = "logs")]
    log_root: PathBuf,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Log every n-th training iteration
    #[arg(long, default_value_t = 10)]
    log_interval: usize,
}

impl TrainArgs {
    fn to_config(&self) -> Result<TrainingConfig> {
        if let Some(path) = &self.config {
            return TrainingConfig::load(path).map_err(|err| anyhow!("Failed to load config {:?}: {:?}", path, err));
        }
        Ok(TrainingConfig::new(self.dataset, self.network)
            .with_batch_size(self.batch_size)
            .with_train_dir(self.train_dir.clone())
            .with_val_dir(self.val_dir.clone())
            .with_label_dir(self.label_dir.clone())
            .with_atlas_path(self.atlas_path.clone())
            .with_atlas_labels(self.atlas_labels.clone())
            .with_labels(self.labels.clone())
            .with_network_lr(self.lr)
            .with_refiner_lr(self.refiner_lr)
            .with_epoch_start(self.epoch_start)
            .with_max_epoch(self.max_epoch)
            .with_refiner_iterations(self.refiner_iterations)
            .with_network_weights(self.network_weights)
            .with_refiner_weights(self.refiner_weights)
            .with_checkpoint_index(self.checkpoint_index)
            .with_checkpoint_root(self.checkpoint_root.clone())
            .with_log_root(self.log_root.clone())
            .with_seed(self.seed))
    }
}

fn parse_weights(s: &str) -> std::result::Result<LossWeights, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [similarity, regularization] = parts.as_slice() else {
        return Err(format!("expected two comma-separated weights, got '{}'", s));
    };
    let parse = |v: &str| v.parse::<f64>().map_err(|err| format!("invalid weight '{}': {}", v, err));
    LossWeights::new(parse(*similarity)?, parse(*regularization)?).map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train(&args)?,
        Commands::Datasets => list_datasets(),
        Commands::Checkpoints { dir } => list_checkpoints(dir)?,
    }

    Ok(())
}

fn train(args: &TrainArgs) -> Result<()> {
    let config = args.to_config()?;
    config.validate()?;
    let profile = config.profile();
    let (train, val) = sources(&config, &profile)?;
    info!(
        run = %config.run_name(),
        train = train.pairs().len(),
        val = val.pairs().len(),
        shape = %profile.image_shape,
        "data ready"
    );

    let ctx = ExecutionContext::<Backend>::default();
    let device = ctx.device().clone();
    match config.network {
        NetworkVariant::TransMorph => {
            let model = TransMorphConfig::for_shape(profile.image_shape).init::<Backend>(&device);
            fit(config, model, ctx, &train, &val, args.log_interval)
        }
        NetworkVariant::VoxelMorph => {
            let model = VoxelMorphConfig::new().init::<Backend>(&device);
            fit(config, model, ctx, &train, &val, args.log_interval)
        }
        NetworkVariant::ViTVNet => {
            let model = ViTVNetConfig::new(profile.image_shape).init::<Backend>(&device);
            fit(config, model, ctx, &train, &val, args.log_interval)
        }
    }
}

fn fit<M>(
    config: TrainingConfig,
    model: M,
    ctx: ExecutionContext<Backend>,
    train: &NiftiPairSource,
    val: &NiftiPairSource,
    log_interval: usize,
) -> Result<()>
where
    M: RegistrationNetwork<Backend> + AutodiffModule<Backend>,
    M::InnerModule: RegistrationNetwork<<Backend as AutodiffBackend>::InnerBackend>,
{
    let optimizer = AdamConfig::new().init::<Backend, M>();
    let mut trainer = Trainer::new(config, model, optimizer, ctx)?
        .with_observer(ConsoleObserver::new(log_interval))
        .with_observer(ProgressObserver::new()?);

    let summary = trainer.fit(train, val)?;
    info!(
        best_dice = summary.best_dice,
        last_checkpoint = ?summary.last_checkpoint(),
        "training finished"
    );
    Ok(())
}

fn sources(config: &TrainingConfig, profile: &DatasetProfile) -> Result<(NiftiPairSource, NiftiPairSource)> {
    let label_dir = config.label_dir.as_deref();
    match profile.pairing {
        Pairing::Atlas => {
            let Some(atlas) = config.atlas_path.clone() else {
                bail!("{} pairs subjects with an atlas; pass --atlas-path", profile.id);
            };
            let train = NiftiPairSource::atlas(&config.train_dir, atlas.clone(), config.atlas_labels.clone(), label_dir)
                .context("Failed to index training data")?;
            let val = NiftiPairSource::atlas(&config.val_dir, atlas, config.atlas_labels.clone(), label_dir)
                .context("Failed to index validation data")?;
            Ok((train, val))
        }
        Pairing::Pairwise => {
            let train = NiftiPairSource::pairwise(&config.train_dir, label_dir).context("Failed to index training data")?;
            let val = NiftiPairSource::pairwise(&config.val_dir, label_dir).context("Failed to index validation data")?;
            Ok((train, val))
        }
    }
}

fn list_datasets() {
    println!("Available datasets:");
    println!();
    for id in DatasetId::ALL {
        let profile = DatasetProfile::for_id(id);
        println!(
            "  {:<6} shape {}, {} labels, {:?} pairing{}",
            id.name(),
            profile.image_shape,
            profile.labels.len(),
            profile.pairing,
            if profile.bidirectional { ", bidirectional" } else { "" }
        );
    }
}

fn list_checkpoints(dir: PathBuf) -> Result<()> {
    let store = CheckpointStore::new(dir);
    let bundles = store.list()?;
    if bundles.is_empty() {
        println!("No checkpoints in {}", store.dir().display());
        return Ok(());
    }
    let count = bundles.len() as i64;
    for (i, bundle) in bundles.iter().enumerate() {
        let meta = store.load_meta(bundle)?;
        println!(
            "{:>4} ({:>4})  {}  epoch {} dice {:.4} best {:.4}",
            i,
            i as i64 - count,
            bundle.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            meta.epoch,
            meta.dice,
            meta.best_dice
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> TrainArgs {
        let mut argv = vec!["optreg", "train"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Train(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_map_onto_config() {
        let config = parse(&[
            "--dataset",
            "oasis",
            "--network",
            "VoxelMorph",
            "--refiner-iterations",
            "0",
            "--network-weights",
            "1,0.5",
            "--checkpoint-index",
            "-2",
            "--labels",
            "1,2,3",
        ])
        .to_config()
        .unwrap();
        assert_eq!(config.dataset, DatasetId::Oasis);
        assert_eq!(config.network, NetworkVariant::VoxelMorph);
        assert_eq!(config.run_name(), "VoxelMorph_OASIS");
        assert_eq!(config.network_weights.regularization, 0.5);
        assert_eq!(config.checkpoint_index, -2);
        assert_eq!(config.labels, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_unknown_identifiers_fail_fast() {
        assert!(Cli::try_parse_from(["optreg", "train", "--dataset", "ADNI"]).is_err());
        assert!(Cli::try_parse_from(["optreg", "train", "--network", "UNet"]).is_err());
        assert!(Cli::try_parse_from(["optreg", "train", "--refiner-weights", "1"]).is_err());
        assert!(Cli::try_parse_from(["optreg", "train", "--refiner-weights", "1,-1"]).is_err());
    }

    #[test]
    fn test_config_file_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        TrainingConfig::new(DatasetId::Lpba, NetworkVariant::ViTVNet)
            .with_seed(3)
            .save(&path)
            .unwrap();

        let config = parse(&["--config", path.to_str().unwrap(), "--seed", "9"])
            .to_config()
            .unwrap();
        assert_eq!(config.dataset, DatasetId::Lpba);
        assert_eq!(config.seed, 3);
    }

    #[test]
    fn test_atlas_datasets_need_an_atlas() {
        let config = TrainingConfig::new(DatasetId::Ixi, NetworkVariant::TransMorph);
        let err = sources(&config, &config.profile()).unwrap_err();
        assert!(err.to_string().contains("--atlas-path"));
    }
}
