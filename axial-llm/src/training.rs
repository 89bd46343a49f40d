use anyhow::Result;
use axial_core::checkpoint::{CheckpointWriter, load_state_dict};
use axial_core::distributed::{ProcessMesh, gather_tree};
use axial_core::grad_accum::{accumulate_gradients_sharded, value_and_grad};
use axial_core::init::{Initializer, MaterializedInit, PartitionedInit};
use axial_core::partition::shard_tree;
use axial_core::state_dict::StateDictSerialize;
use axial_core::tree::{self, Leaf};
use candle_core::{Device, Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tracing::info;

use crate::config::{LmConfig, TrainingConfig, padded_vocab_size};
use crate::data::DataLoader;
use crate::loss::{LmExample, compute_loss};
use crate::model::{BATCH, Gpt2LmHeadModel};

/// Sum of `param * grad` over all leaves, with the gradients detached. Its
/// gradient with respect to each parameter is exactly the supplied gradient,
/// which is how a gradient tree is handed to a candle optimizer.
fn surrogate_loss(params: &Gpt2LmHeadModel, grads: &Gpt2LmHeadModel) -> Result<Tensor> {
    let params = tree::leaves(params)?;
    let grads = tree::leaves(grads)?;
    let terms = params
        .iter()
        .zip(&grads)
        .map(|(p, g)| p.array().mul(&g.array().detach())?.sum_all())
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::stack(&terms, 0)?.sum_all()?)
}

pub struct Trainer {
    model: Gpt2LmHeadModel,
    vars: Vec<Var>,
    optimizer: AdamW,
    training_config: TrainingConfig,
    mesh: ProcessMesh,
    writer: CheckpointWriter,
    device: Device,
    global_step: usize,
}

impl Trainer {
    /// Builds the model with every parameter held as a [`Var`]. In a multi-process
    /// run parameters are allocated directly as local shards under the
    /// configured axis mapping.
    pub fn new(
        config: &LmConfig,
        training_config: TrainingConfig,
        device: Device,
        mesh: ProcessMesh,
    ) -> Result<Self> {
        let vocab_size = padded_vocab_size(config.vocab_size, training_config.vocab_multiple);
        let mut init: Box<dyn Initializer> = if mesh.world_size() > 1 {
            Box::new(PartitionedInit::new(
                device.clone(),
                training_config.seed,
                training_config.axis_mapping.clone(),
                mesh.mesh().clone(),
                mesh.rank(),
            ))
        } else {
            Box::new(MaterializedInit::new(device.clone(), training_config.seed))
        };
        let model = config.build(vocab_size, init.as_mut())?;

        let mut vars = Vec::new();
        let model = tree::map(&model, |leaf: Leaf| {
            let var = Var::from_tensor(leaf.array())?;
            let tracked = var.as_tensor().clone();
            vars.push(var);
            leaf.with_array(tracked)
        })?;

        let params = ParamsAdamW {
            lr: training_config.learning_rate,
            beta1: training_config.beta1,
            beta2: training_config.beta2,
            weight_decay: training_config.weight_decay,
            eps: 1e-8,
        };
        let optimizer = AdamW::new(vars.clone(), params)?;

        info!(
            "Initialized model with {} parameters (vocab padded to {})",
            model.config.num_parameters(),
            vocab_size
        );

        let writer = CheckpointWriter::new(mesh.collective());
        Ok(Self {
            model,
            vars,
            optimizer,
            training_config,
            mesh,
            writer,
            device,
            global_step: 0,
        })
    }

    /// One optimizer step on `batch`, accumulated over micro-batches of
    /// `per_device_parallelism` examples. Returns the mean loss.
    pub fn train_step(&mut self, batch: &LmExample) -> Result<f32> {
        let loss_and_grad = value_and_grad(compute_loss);
        let (loss, grads) = accumulate_gradients_sharded(
            &loss_and_grad,
            BATCH,
            &self.model,
            batch,
            self.training_config.per_device_parallelism,
            &self.training_config.axis_mapping,
            &self.mesh,
        )?;
        let grads = surrogate_loss(&self.model, &grads)?.backward()?;
        self.optimizer.step(&grads)?;
        self.global_step += 1;
        Ok(loss.to_scalar::<f32>()?)
    }

    pub fn train_epoch(&mut self, train_loader: &mut DataLoader, checkpoint_dir: Option<&str>) -> Result<f64> {
        let num_batches = train_loader.num_batches();
        let pb = ProgressBar::new(num_batches as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss: {msg}")?
                .progress_chars("##-"),
        );

        let mut total_loss = 0.0;
        let mut num_steps = 0;

        train_loader.reset();

        while let Some(batch) = train_loader.next_batch(&self.device)? {
            let loss = self.train_step(&batch)? as f64;
            total_loss += loss;
            num_steps += 1;

            if self
                .global_step
                .is_multiple_of(self.training_config.log_every.max(1))
            {
                pb.set_message(format!("{:.4}", loss));
            }

            let save_every = self.training_config.save_every;
            if save_every > 0
                && self.global_step.is_multiple_of(save_every)
                && let Some(dir) = checkpoint_dir
            {
                let path = format!("{}/checkpoint_step_{}.safetensors", dir, self.global_step);
                self.save_checkpoint(&path)?;
            }

            pb.inc(1);
        }

        pb.finish_with_message("done");

        if num_steps > 0 {
            Ok(total_loss / num_steps as f64)
        } else {
            Ok(0.0)
        }
    }

    pub fn evaluate(&self, eval_loader: &mut DataLoader) -> Result<f64> {
        let model = gather_tree(&self.model, self.mesh.comm())?;
        let mut total_loss = 0.0;
        let mut num_batches = 0;

        eval_loader.reset();

        while let Some(batch) = eval_loader.next_batch(&self.device)? {
            let loss = compute_loss(&model, &batch)?;
            total_loss += loss.to_scalar::<f32>()? as f64;
            num_batches += 1;
        }

        if num_batches > 0 {
            Ok(total_loss / num_batches as f64)
        } else {
            Ok(0.0)
        }
    }

    pub fn train(
        &mut self,
        train_loader: &mut DataLoader,
        mut eval_loader: Option<&mut DataLoader>,
        checkpoint_dir: Option<&str>,
    ) -> Result<()> {
        info!(
            "Starting training for {} epochs",
            self.training_config.epochs
        );

        for epoch in 0..self.training_config.epochs {
            info!("Epoch {}/{}", epoch + 1, self.training_config.epochs);

            let train_loss = self.train_epoch(train_loader, checkpoint_dir)?;
            info!("Epoch {} train loss: {:.4}", epoch + 1, train_loss);

            if let Some(ref mut eval) = eval_loader {
                let eval_loss = self.evaluate(eval)?;
                info!("Epoch {} eval loss: {:.4}", epoch + 1, eval_loss);
            }

            // Every process takes part: shards are gathered before rank 0 writes
            if let Some(dir) = checkpoint_dir {
                let path = format!("{}/checkpoint_epoch_{}.safetensors", dir, epoch + 1);
                self.save_checkpoint(&path)?;
            }
        }

        Ok(())
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.writer.save_module(&self.model, None, path)?;
        Ok(())
    }

    /// Loads parameter values into the existing variables, so optimizer state
    /// keeps referring to them.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let state_dict = load_state_dict(path, &self.device)?;
        let full = gather_tree(&self.model, self.mesh.comm())?;
        let mut loaded = full.from_state_dict(&state_dict, None)?;
        if self.mesh.world_size() > 1 {
            loaded = shard_tree(
                &loaded,
                &self.training_config.axis_mapping,
                self.mesh.mesh(),
                self.mesh.rank(),
            )?;
        }
        for (var, leaf) in self.vars.iter().zip(tree::leaves(&loaded)?) {
            var.set(leaf.array())?;
        }
        Ok(())
    }

    pub fn model(&self) -> &Gpt2LmHeadModel {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn checkpoints_written(&self) -> usize {
        self.writer.save_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use axial_core::distributed::{Collective, ThreadCollective};
    use axial_core::partition::{DATA, MODEL, Mesh};
    use std::sync::Arc;

    fn config() -> LmConfig {
        LmConfig {
            vocab_size: 10,
            max_seq_len: 8,
            hidden_size: 16,
            num_layers: 1,
            num_heads: 2,
            intermediate_size: 32,
            layer_norm_eps: 1e-5,
            use_bias: true,
            initializer_range: 0.02,
        }
    }

    fn training_config() -> TrainingConfig {
        TrainingConfig {
            learning_rate: 1e-2,
            weight_decay: 0.0,
            batch_size: 4,
            per_device_parallelism: 2,
            epochs: 1,
            save_every: 0,
            seq_len: 4,
            vocab_multiple: 8,
            ..Default::default()
        }
    }

    fn repeating_dataset() -> Dataset {
        Dataset::new((0..64).map(|i| (i % 5) as u32).collect(), 4)
    }

    fn trainer() -> Trainer {
        Trainer::new(&config(), training_config(), Device::Cpu, ProcessMesh::local()).unwrap()
    }

    #[test]
    fn test_vocab_is_padded() {
        assert_eq!(trainer().model().vocab().size, 16);
    }

    #[test]
    fn test_training_reduces_loss_on_repeating_text() {
        let mut trainer = trainer();
        let batch = repeating_dataset().get_batch(&[0, 1, 2, 3], &Device::Cpu).unwrap();
        let first = trainer.train_step(&batch).unwrap();
        let mut last = first;
        for _ in 0..20 {
            last = trainer.train_step(&batch).unwrap();
        }
        assert_eq!(trainer.global_step(), 21);
        assert!(last < first, "{last} >= {first}");
    }

    #[test]
    fn test_epoch_writes_checkpoint_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_str().unwrap();
        let mut trainer = trainer();
        let mut loader = DataLoader::new(repeating_dataset(), 4, true);
        trainer.train(&mut loader, None, Some(out)).unwrap();
        assert_eq!(trainer.checkpoints_written(), 1);

        let path = dir.path().join("checkpoint_epoch_1.safetensors");
        let saved = load_state_dict(&path, &Device::Cpu).unwrap();
        assert!(saved.contains_key("h.0.attn.c_attn.weight"));

        let mut fresh = Trainer::new(
            &config(),
            TrainingConfig {
                seed: 42,
                ..training_config()
            },
            Device::Cpu,
            ProcessMesh::local(),
        )
        .unwrap();
        fresh.load_checkpoint(&path).unwrap();
        let expected = tree::leaves(trainer.model()).unwrap();
        let actual = tree::leaves(fresh.model()).unwrap();
        for (e, a) in expected.iter().zip(&actual) {
            let e = e.array().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let a = a.array().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(e, a);
        }
    }

    fn replica_parameters(trainer: &Trainer) -> Vec<Vec<f32>> {
        let full = gather_tree(trainer.model(), trainer.mesh.comm()).unwrap();
        tree::leaves(&full)
            .unwrap()
            .iter()
            .map(|leaf| leaf.array().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_data_parallel_replicas_stay_identical() {
        let handles: Vec<_> = ThreadCollective::group(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let rank = comm.rank();
                    let comm: Arc<dyn Collective> = Arc::new(comm);
                    let mesh = ProcessMesh::new(comm, Mesh::new([(DATA, 2), (MODEL, 1)]).unwrap()).unwrap();
                    let mut trainer = Trainer::new(&config(), training_config(), Device::Cpu, mesh).unwrap();
                    let initial = replica_parameters(&trainer);

                    // each replica sees different windows
                    let start = rank * 8;
                    let indices: Vec<usize> = (start..start + 4).collect();
                    let batch = repeating_dataset().get_batch(&indices, &Device::Cpu).unwrap();
                    trainer.train_step(&batch).unwrap();
                    (initial, replica_parameters(&trainer))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0].0, results[1].0);
        assert_eq!(results[0].1, results[1].1);
        assert_ne!(results[0].0, results[0].1);
    }
}
