//! Export to the Hugging Face GPT-2 layout
//!
//! A training checkpoint holds the padded vocabulary and unprefixed keys. The
//! exported directory holds `model.safetensors` with keys under `transformer.`,
//! the vocabulary trimmed back to the tokenizer's size, a GPT-2 `config.json`
//! and, when given, `tokenizer.json`.

use anyhow::{Context, Result, bail};
use axial_core::checkpoint::{load_state_dict, write_state_dict};
use axial_core::init::MaterializedInit;
use axial_core::state_dict::{StateDictSerialize, join_key};
use candle_core::Device;
use std::path::Path;
use tracing::info;

use crate::config::LmConfig;
use crate::model::Gpt2LmHeadModel;
use crate::tokenizer::Tokenizer;

pub const HF_PREFIX: &str = "transformer";
pub const MODEL_FILE: &str = "model.safetensors";

/// Loads a model whose keys live under `prefix`; the vocabulary size is taken
/// from the stored token embeddings.
pub fn load_model<P: AsRef<Path>>(
    path: P,
    config: &LmConfig,
    prefix: Option<&str>,
    device: &Device,
) -> Result<Gpt2LmHeadModel> {
    let path = path.as_ref();
    let state_dict = load_state_dict(path, device)
        .with_context(|| format!("reading checkpoint {}", path.display()))?;
    let vocab_size = state_dict.require(&join_key(prefix, "wte.weight"))?.dim(0)?;
    let template = config.build(vocab_size, &mut MaterializedInit::new(device.clone(), 0))?;
    Ok(template.from_state_dict(&state_dict.with_shape_checks(true), prefix)?)
}

/// Writes `model` to `output_dir` in the Hugging Face GPT-2 layout, with the
/// vocabulary resized to `vocab_size`.
pub fn export_model(
    model: &Gpt2LmHeadModel,
    vocab_size: usize,
    tokenizer: Option<&Tokenizer>,
    output_dir: &Path,
) -> Result<()> {
    if vocab_size == 0 {
        bail!("cannot export an empty vocabulary");
    }
    std::fs::create_dir_all(output_dir)?;
    let model = model.resize_vocab(vocab_size)?;

    let state_dict = model.to_state_dict(Some(HF_PREFIX))?;
    let model_path = output_dir.join(MODEL_FILE);
    write_state_dict(&state_dict, &model_path)?;
    info!("Wrote {} tensors to {:?}", state_dict.len(), model_path);

    let config = serde_json::to_string_pretty(&model.config.to_hf_config())?;
    std::fs::write(output_dir.join("config.json"), config)?;

    if let Some(tokenizer) = tokenizer {
        tokenizer.save(output_dir.join("tokenizer.json"))?;
    }
    Ok(())
}

/// Converts a training checkpoint into an exported model directory.
pub fn export_checkpoint(
    checkpoint: &Path,
    config: &LmConfig,
    tokenizer: Option<&Tokenizer>,
    output_dir: &Path,
) -> Result<()> {
    let model = load_model(checkpoint, config, None, &Device::Cpu)?;
    let vocab_size = tokenizer.map_or(config.vocab_size, Tokenizer::vocab_size);
    info!(
        "Exporting {:?}: vocab {} -> {}",
        checkpoint,
        model.vocab().size,
        vocab_size
    );
    export_model(&model, vocab_size, tokenizer, output_dir)
}

/// Reads a model previously written by [`export_model`].
pub fn import_model(dir: &Path, config: &LmConfig, device: &Device) -> Result<Gpt2LmHeadModel> {
    load_model(dir.join(MODEL_FILE), config, Some(HF_PREFIX), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tests::word_level;
    use axial_core::checkpoint::read_format;
    use axial_core::named::NamedArray;

    fn config() -> LmConfig {
        LmConfig {
            vocab_size: 5,
            max_seq_len: 4,
            hidden_size: 8,
            num_layers: 2,
            num_heads: 2,
            intermediate_size: 16,
            layer_norm_eps: 1e-5,
            use_bias: true,
            initializer_range: 0.02,
        }
    }

    fn values(a: &NamedArray) -> Vec<f32> {
        a.array().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_export_writes_hf_layout_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = word_level(dir.path());
        let model = config().build(8, &mut MaterializedInit::new(Device::Cpu, 1)).unwrap();

        let checkpoint = dir.path().join("checkpoint.safetensors");
        write_state_dict(&model.to_state_dict(None).unwrap(), &checkpoint).unwrap();

        let out = dir.path().join("export");
        export_checkpoint(&checkpoint, &config(), Some(&tokenizer), &out).unwrap();
        assert!(out.join("tokenizer.json").exists());
        assert_eq!(read_format(out.join(MODEL_FILE)).unwrap().as_deref(), Some("pt"));

        let hf = load_state_dict(out.join(MODEL_FILE), &Device::Cpu).unwrap();
        assert_eq!(hf.get("transformer.wte.weight").unwrap().dims(), &[5, 8]);
        assert_eq!(hf.get("transformer.h.1.attn.c_attn.weight").unwrap().dims(), &[8, 24]);
        assert!(hf.keys().all(|k| k.starts_with("transformer.")));

        let config_json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("config.json")).unwrap()).unwrap();
        assert_eq!(config_json["vocab_size"], 5);
        assert_eq!(config_json["n_layer"], 2);

        let imported = import_model(&out, &config(), &Device::Cpu).unwrap();
        assert_eq!(imported.vocab().size, 5);
        let expected = model.resize_vocab(5).unwrap();
        assert_eq!(
            values(&imported.embeddings.token_embeddings.weight),
            values(&expected.embeddings.token_embeddings.weight)
        );
        assert_eq!(
            values(&imported.transformer.blocks.attn.c_attn.weight),
            values(&model.transformer.blocks.attn.c_attn.weight)
        );
    }

    #[test]
    fn test_missing_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = export_checkpoint(&dir.path().join("nope.safetensors"), &config(), None, dir.path())
            .unwrap_err();
        assert!(format!("{err:#}").contains("nope.safetensors"));
    }
}
