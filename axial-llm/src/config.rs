use axial_core::partition::{AxisMapping, DATA, MODEL};
use serde::{Deserialize, Serialize};

/// GPT-2 model hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum sequence length (context window)
    pub max_seq_len: usize,
    /// Embedding dimension
    pub hidden_size: usize,
    /// Number of transformer layers
    pub num_layers: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Intermediate size in the MLP (typically 4x hidden_size)
    pub intermediate_size: usize,
    /// Layer norm epsilon
    pub layer_norm_eps: f64,
    /// Whether to use bias in linear layers
    pub use_bias: bool,
    /// Standard deviation of the initial weights
    pub initializer_range: f64,
}

impl LmConfig {
    /// GPT-2 Small configuration (124M parameters)
    pub fn gpt2_small() -> Self {
        Self {
            vocab_size: 50257,
            max_seq_len: 1024,
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            intermediate_size: 3072,
            layer_norm_eps: 1e-5,
            use_bias: true,
            initializer_range: 0.02,
        }
    }

    /// Nano configuration (~500K params) - fastest for testing
    pub fn nano() -> Self {
        Self {
            vocab_size: 1000,
            max_seq_len: 128,
            hidden_size: 64,
            num_layers: 2,
            num_heads: 2,
            intermediate_size: 256,
            layer_norm_eps: 1e-5,
            use_bias: true,
            initializer_range: 0.02,
        }
    }

    /// Tiny configuration for testing/debugging
    pub fn tiny() -> Self {
        Self {
            vocab_size: 1000,
            max_seq_len: 256,
            hidden_size: 128,
            num_layers: 4,
            num_heads: 4,
            intermediate_size: 512,
            layer_norm_eps: 1e-5,
            use_bias: true,
            initializer_range: 0.02,
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "nano" => Some(Self::nano()),
            "tiny" => Some(Self::tiny()),
            "gpt2-small" | "gpt2_small" => Some(Self::gpt2_small()),
            _ => None,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn num_parameters(&self) -> usize {
        let embed_params = (self.vocab_size + self.max_seq_len) * self.hidden_size;
        let bias = usize::from(self.use_bias);
        let attn_params =
            4 * self.hidden_size * self.hidden_size + bias * 4 * self.hidden_size;
        let mlp_params = 2 * self.hidden_size * self.intermediate_size
            + bias * (self.intermediate_size + self.hidden_size);
        let norm_params = (1 + bias) * self.hidden_size;
        let layer_params = attn_params + mlp_params + 2 * norm_params;
        embed_params + self.num_layers * layer_params + norm_params
    }

    pub fn from_json(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_json(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `config.json` in the layout of Hugging Face GPT-2 checkpoints
    pub fn to_hf_config(&self) -> serde_json::Value {
        serde_json::json!({
            "architectures": ["GPT2LMHeadModel"],
            "model_type": "gpt2",
            "vocab_size": self.vocab_size,
            "n_positions": self.max_seq_len,
            "n_ctx": self.max_seq_len,
            "n_embd": self.hidden_size,
            "n_layer": self.num_layers,
            "n_head": self.num_heads,
            "n_inner": self.intermediate_size,
            "activation_function": "gelu_new",
            "layer_norm_epsilon": self.layer_norm_eps,
            "initializer_range": self.initializer_range,
            "tie_word_embeddings": true,
        })
    }
}

/// Rounds `vocab_size` up to a multiple of `multiple` so the vocabulary axis can
/// be split evenly across model-parallel processes.
pub fn padded_vocab_size(vocab_size: usize, multiple: usize) -> usize {
    if multiple <= 1 {
        return vocab_size;
    }
    vocab_size.div_ceil(multiple) * multiple
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Weight decay for AdamW
    pub weight_decay: f64,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    /// Global batch size per step on each process
    pub batch_size: usize,
    /// Examples per micro-batch on each process
    pub per_device_parallelism: usize,
    /// Number of training epochs
    pub epochs: usize,
    /// Save checkpoint every N steps (0 disables step checkpoints)
    pub save_every: usize,
    /// Log every N steps
    pub log_every: usize,
    /// Sequence length for training
    pub seq_len: usize,
    /// Vocabulary is padded to a multiple of this
    pub vocab_multiple: usize,
    /// Seed for parameter initialization
    pub seed: u64,
    /// Logical axis to mesh axis bindings for parameters and batches
    #[serde(default = "default_axis_mapping")]
    pub axis_mapping: AxisMapping,
}

/// Batches split over the data axis; MLP and attention heads over the model axis
pub fn default_axis_mapping() -> AxisMapping {
    AxisMapping::new()
        .with("batch", DATA)
        .with("mlp", MODEL)
        .with("heads", MODEL)
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.95,
            batch_size: 32,
            per_device_parallelism: 8,
            epochs: 1,
            save_every: 1000,
            log_every: 10,
            seq_len: 512,
            vocab_multiple: 128,
            seed: 0,
            axis_mapping: default_axis_mapping(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let path = path.to_str().unwrap();
        LmConfig::nano().save_json(path).unwrap();
        assert_eq!(LmConfig::from_json(path).unwrap(), LmConfig::nano());
    }

    #[test]
    fn test_presets() {
        assert_eq!(LmConfig::preset("gpt2-small").unwrap().num_layers, 12);
        assert!(LmConfig::preset("llama").is_none());
        assert_eq!(LmConfig::tiny().head_dim(), 32);
    }

    #[test]
    fn test_gpt2_small_parameter_count() {
        // 124M including position embeddings, tied head
        let params = LmConfig::gpt2_small().num_parameters();
        assert_eq!(params, 124_439_808);
    }

    #[test]
    fn test_padded_vocab_size() {
        assert_eq!(padded_vocab_size(50257, 128), 50304);
        assert_eq!(padded_vocab_size(1000, 1), 1000);
        assert_eq!(padded_vocab_size(1024, 128), 1024);
    }

    #[test]
    fn test_training_config_default_mapping_survives_json() {
        let config: TrainingConfig =
            serde_json::from_str(&serde_json::to_string(&TrainingConfig::default()).unwrap()).unwrap();
        assert_eq!(config.axis_mapping.get("batch"), Some(DATA));
        assert_eq!(config.axis_mapping.get("mlp"), Some(MODEL));
    }
}
