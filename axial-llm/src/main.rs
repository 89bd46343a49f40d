use anyhow::Result;
use axial_core::distributed::{
    Collective, DistributedConfig, LocalCollective, NcclCollective, ProcessMesh,
};
use axial_core::init::MaterializedInit;
use axial_core::partition::{DATA, infer_resource_partitions};
use candle_core::Device;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use axial_llm::config::{LmConfig, TrainingConfig};
use axial_llm::data::{DataLoader, Dataset};
use axial_llm::export::export_checkpoint;
use axial_llm::tokenizer::Tokenizer;
use axial_llm::training::Trainer;

#[derive(Parser)]
#[command(name = "axial-llm")]
#[command(about = "Train GPT-2 style models on named-axis module trees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a new model from scratch
    Train {
        /// Path to training data file (reads from stdin if not provided)
        #[arg(short, long)]
        data: Option<String>,

        /// Path to tokenizer.json
        #[arg(short, long)]
        tokenizer: String,

        /// Model configuration preset (nano, tiny, gpt2-small) or a config JSON file
        #[arg(short, long, default_value = "tiny")]
        model: String,

        /// Output directory for checkpoints
        #[arg(short, long, default_value = "checkpoints")]
        output: String,

        /// Learning rate
        #[arg(long, default_value = "3e-4")]
        lr: f64,

        /// Batch size per data-parallel process
        #[arg(short, long, default_value = "32")]
        batch_size: usize,

        /// Examples per micro-batch; batches are accumulated over micro-batches
        #[arg(long, default_value = "8")]
        per_device_parallelism: usize,

        /// Number of epochs
        #[arg(short, long, default_value = "1")]
        epochs: usize,

        /// Sequence length
        #[arg(long, default_value = "256")]
        seq_len: usize,

        /// Save a checkpoint every N steps (0 to disable)
        #[arg(long, default_value = "1000")]
        save_every: usize,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "true")]
        gpu: bool,

        /// GPU device index (for multi-GPU systems)
        #[arg(long, default_value = "0")]
        gpu_id: usize,

        /// World size for distributed training (number of GPUs)
        #[arg(long, default_value = "1")]
        world_size: usize,

        /// Rank for distributed training (0 to world_size-1)
        #[arg(long, default_value = "0")]
        rank: usize,

        /// Processes per model replica (tensor parallelism)
        #[arg(long, default_value = "1")]
        model_parallelism: usize,

        /// Communication file for NCCL ID exchange
        #[arg(long, default_value = "nccl_id.txt")]
        comm_file: String,
    },

    /// Export a checkpoint in the Hugging Face GPT-2 layout
    Export {
        /// Path to a training checkpoint
        #[arg(short, long)]
        checkpoint: String,

        /// Path to the model config saved during training
        #[arg(long)]
        config: String,

        /// Tokenizer to ship with the model; its size sets the exported vocabulary
        #[arg(short, long)]
        tokenizer: Option<String>,

        /// Output directory
        #[arg(short, long)]
        output: String,
    },

    /// Show model info
    Info {
        /// Model configuration preset
        #[arg(short, long, default_value = "gpt2-small")]
        model: String,

        /// Print the partition spec of every parameter
        #[arg(long)]
        partitions: bool,
    },
}

#[allow(unused_variables)]
fn get_device(use_gpu: bool, gpu_id: usize) -> Result<Device> {
    if use_gpu {
        #[cfg(feature = "metal")]
        {
            return Ok(Device::new_metal(gpu_id)?);
        }
        #[cfg(feature = "cuda")]
        {
            return Ok(Device::new_cuda(gpu_id)?);
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            tracing::warn!(
                "No GPU feature enabled, using CPU. Build with --features metal or --features cuda"
            );
            return Ok(Device::Cpu);
        }
    }
    Ok(Device::Cpu)
}

fn get_config(name: &str) -> Result<LmConfig> {
    if let Some(config) = LmConfig::preset(name) {
        return Ok(config);
    }
    if Path::new(name).exists() {
        return LmConfig::from_json(name);
    }
    anyhow::bail!("Unknown model config '{}'", name)
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            data,
            tokenizer: tokenizer_path,
            model,
            output,
            lr,
            batch_size,
            per_device_parallelism,
            epochs,
            seq_len,
            save_every,
            gpu,
            gpu_id,
            world_size,
            rank,
            model_parallelism,
            comm_file,
        } => {
            // For distributed training, use rank as GPU ID
            let actual_gpu_id = if world_size > 1 { rank } else { gpu_id };
            let device = get_device(gpu, actual_gpu_id)?;

            let dist_config = DistributedConfig {
                world_size,
                rank,
                comm_file,
                model_parallelism,
            };

            if dist_config.is_distributed() {
                info!("Distributed training: rank {}/{}", rank, world_size);
            }
            info!("Using device: {:?}", device);

            let tokenizer = Tokenizer::from_file(&tokenizer_path)?;
            info!("Tokenizer vocab size: {}", tokenizer.vocab_size());

            let mut config = get_config(&model)?;
            config.vocab_size = tokenizer.vocab_size();
            config.max_seq_len = config.max_seq_len.max(seq_len);
            info!("Model config: {:?}", config);

            let comm: Arc<dyn Collective> = if dist_config.is_distributed() {
                Arc::new(NcclCollective::new(&dist_config)?)
            } else {
                Arc::new(LocalCollective)
            };
            let mesh = ProcessMesh::new(comm, dist_config.mesh()?)?;
            info!("Process mesh: {}", mesh.mesh());

            let dataset = match &data {
                Some(path) => {
                    info!("Loading dataset from {}", path);
                    Dataset::from_files(&[path], &tokenizer, seq_len)?
                }
                None => {
                    info!("Loading dataset from stdin...");
                    Dataset::from_stdin(&tokenizer, seq_len)?
                }
            };
            info!("Dataset size: {} tokens", dataset.tokens().len());

            let data_shard = mesh.mesh().coordinate(rank, DATA)?;
            let data_shards = mesh.mesh().axis_size(DATA).unwrap_or(1);
            let training_config = TrainingConfig {
                learning_rate: lr,
                batch_size,
                per_device_parallelism,
                epochs,
                seq_len,
                save_every,
                ..Default::default()
            };
            let mut train_loader = DataLoader::new(dataset, batch_size, true)
                .with_seed(training_config.seed)
                .with_shard(data_shard, data_shards)?;
            info!("Number of batches: {}", train_loader.num_batches());

            std::fs::create_dir_all(&output)?;

            let mut trainer = Trainer::new(&config, training_config, device, mesh)?;

            // Only rank 0 saves config
            if dist_config.is_main_process() {
                config.save_json(&format!("{}/config.json", output))?;
                info!("Saved config to {}/config.json", output);
            }

            trainer.train(&mut train_loader, None, Some(output.as_str()))?;

            if dist_config.is_main_process() {
                info!("Training complete!");
            }
        }

        Commands::Export {
            checkpoint,
            config,
            tokenizer,
            output,
        } => {
            let config = LmConfig::from_json(&config)?;
            let tokenizer = tokenizer.map(Tokenizer::from_file).transpose()?;
            export_checkpoint(
                Path::new(&checkpoint),
                &config,
                tokenizer.as_ref(),
                Path::new(&output),
            )?;
            info!("Exported {} to {}", checkpoint, output);
        }

        Commands::Info { model, partitions } => {
            let config = get_config(&model)?;
            println!("Model: {}", model);
            println!("  Vocab size: {}", config.vocab_size);
            println!("  Max sequence length: {}", config.max_seq_len);
            println!("  Hidden size: {}", config.hidden_size);
            println!("  Num layers: {}", config.num_layers);
            println!("  Num heads: {}", config.num_heads);
            println!("  Intermediate size: {}", config.intermediate_size);
            println!("  Head dimension: {}", config.head_dim());

            let total = config.num_parameters();
            println!(
                "  Estimated parameters: {} ({:.2}M)",
                total,
                total as f64 / 1_000_000.0
            );

            if partitions {
                let mut init = MaterializedInit::new(Device::Cpu, 0);
                let built = config.build(config.vocab_size, &mut init)?;
                let mapping = TrainingConfig::default().axis_mapping;
                for (key, spec) in infer_resource_partitions(&built, &mapping)? {
                    println!("  {key}: {spec}");
                }
            }
        }
    }

    Ok(())
}
