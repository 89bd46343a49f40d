//! GPT-2 on named axes
//!
//! The blocks of the transformer are stored as a single [`Block`] whose
//! parameters carry a leading `layers` axis. Its state dict is written in the
//! Hugging Face GPT-2 layout: per-layer keys `h.<i>.*`, Conv1D weights laid out
//! `[in, out]`, and the token embedding tied to the output projection.

use axial_core::error::{Error, Result};
use axial_core::init::Initializer;
use axial_core::named::{Axis, NamedArray};
use axial_core::nn::{Embedding, LayerNorm, Linear};
use axial_core::state_dict::linear::{from_state_dict_flattened, update_state_dict_flattened};
use axial_core::state_dict::stack::{stack_state_dict, unstack_state_dict};
use axial_core::state_dict::{StateDict, StateDictSerialize, join_key};
use axial_core::tree;
use candle_core::{DType, Device, Tensor};

use crate::config::LmConfig;

pub const BATCH: &str = "batch";
pub const POSITION: &str = "position";
pub const KEY_POSITION: &str = "key_position";
pub const MAX_POSITION: &str = "max_position";
pub const EMBED: &str = "embed";
pub const HEADS: &str = "heads";
pub const HEAD_SIZE: &str = "head_size";
pub const QKV: &str = "qkv";
pub const MLP: &str = "mlp";
pub const VOCAB: &str = "vocab";
pub const LAYERS: &str = "layers";

const MASK_VALUE: f32 = -1e9;

/// Additive mask that hides keys after each query position
pub fn causal_mask(position: &Axis, dtype: DType, device: &Device) -> Result<NamedArray> {
    let n = position.size;
    let data: Vec<f32> = (0..n)
        .flat_map(|i| (0..n).map(move |j| if j <= i { 0.0 } else { MASK_VALUE }))
        .collect();
    let mask = Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)?;
    NamedArray::new(
        mask,
        vec![position.clone(), Axis::new(KEY_POSITION, n)],
    )
}

/// Multi-head self attention with a fused query/key/value projection
#[derive(Debug, Clone)]
pub struct Attention {
    pub c_attn: Linear,
    pub c_proj: Linear,
}

axial_core::module!(@custom_state_dict Attention { c_attn, c_proj });

// Conv1D layout: flattened weights are stored [in, out]
impl StateDictSerialize for Attention {
    fn update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()> {
        update_state_dict_flattened(self, state_dict, prefix, Some(false))
    }

    fn from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self> {
        from_state_dict_flattened(self, state_dict, prefix, Some(false))
    }
}

impl Attention {
    pub fn init(extra: &[Axis], config: &LmConfig, init: &mut dyn Initializer) -> Result<Self> {
        let embed = Axis::new(EMBED, config.hidden_size);
        let heads = Axis::new(HEADS, config.num_heads);
        let head_size = Axis::new(HEAD_SIZE, config.head_dim());
        let std = config.initializer_range;
        let c_attn = Linear::init(
            extra,
            std::slice::from_ref(&embed),
            &[Axis::new(QKV, 3), heads.clone(), head_size.clone()],
            config.use_bias,
            false,
            std,
            init,
        )?;
        let c_proj = Linear::init(
            extra,
            &[heads, head_size],
            &[embed],
            config.use_bias,
            false,
            std / (2.0 * config.num_layers as f64).sqrt(),
            init,
        )?;
        Ok(Self { c_attn, c_proj })
    }

    pub fn forward(&self, x: &NamedArray, mask: &NamedArray) -> Result<NamedArray> {
        let qkv = self.c_attn.forward(x)?;
        let q = qkv.index_axis(QKV, 0)?;
        let k = qkv.index_axis(QKV, 1)?.rename(POSITION, KEY_POSITION)?;
        let v = qkv.index_axis(QKV, 2)?.rename(POSITION, KEY_POSITION)?;

        let scale = 1.0 / (q.axis_size(HEAD_SIZE)? as f64).sqrt();
        let scores = q.dot(&k, &[HEAD_SIZE])?.affine(scale, 0.0)?.add(mask)?;
        let weights = scores.softmax(KEY_POSITION)?;
        let out = weights.dot(&v, &[KEY_POSITION])?;
        self.c_proj.forward(&out)
    }
}

#[derive(Debug, Clone)]
pub struct Mlp {
    pub c_fc: Linear,
    pub c_proj: Linear,
}

axial_core::module!(@custom_state_dict Mlp { c_fc, c_proj });

impl StateDictSerialize for Mlp {
    fn update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()> {
        update_state_dict_flattened(self, state_dict, prefix, Some(false))
    }

    fn from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self> {
        from_state_dict_flattened(self, state_dict, prefix, Some(false))
    }
}

impl Mlp {
    pub fn init(extra: &[Axis], config: &LmConfig, init: &mut dyn Initializer) -> Result<Self> {
        let embed = Axis::new(EMBED, config.hidden_size);
        let mlp = Axis::new(MLP, config.intermediate_size);
        let std = config.initializer_range;
        let c_fc = Linear::init(
            extra,
            std::slice::from_ref(&embed),
            std::slice::from_ref(&mlp),
            config.use_bias,
            false,
            std,
            init,
        )?;
        let c_proj = Linear::init(
            extra,
            &[mlp],
            &[embed],
            config.use_bias,
            false,
            std / (2.0 * config.num_layers as f64).sqrt(),
            init,
        )?;
        Ok(Self { c_fc, c_proj })
    }

    pub fn forward(&self, x: &NamedArray) -> Result<NamedArray> {
        let hidden = self.c_fc.forward(x)?.map(|t| t.gelu())?;
        self.c_proj.forward(&hidden)
    }
}

/// Pre-norm transformer block
#[derive(Debug, Clone)]
pub struct Block {
    pub ln_1: LayerNorm,
    pub attn: Attention,
    pub ln_2: LayerNorm,
    pub mlp: Mlp,
}

axial_core::module!(Block { ln_1, attn, ln_2, mlp });

impl Block {
    pub fn init(extra: &[Axis], config: &LmConfig, init: &mut dyn Initializer) -> Result<Self> {
        let embed = Axis::new(EMBED, config.hidden_size);
        Ok(Self {
            ln_1: LayerNorm::init(extra, embed.clone(), config.layer_norm_eps, config.use_bias, init)?,
            attn: Attention::init(extra, config, init)?,
            ln_2: LayerNorm::init(extra, embed, config.layer_norm_eps, config.use_bias, init)?,
            mlp: Mlp::init(extra, config, init)?,
        })
    }

    pub fn forward(&self, x: &NamedArray, mask: &NamedArray) -> Result<NamedArray> {
        let x = x.add(&self.attn.forward(&self.ln_1.forward(x)?, mask)?)?;
        x.add(&self.mlp.forward(&self.ln_2.forward(&x)?)?)
    }
}

/// Stacked blocks plus the final layer norm
#[derive(Debug, Clone)]
pub struct Transformer {
    pub blocks: Block,
    pub ln_f: LayerNorm,
    pub layers: Axis,
}

axial_core::module!(@custom_state_dict Transformer { blocks => "h", ln_f } static { layers });

// Blocks are stored per layer (`h.<i>.*`) and stacked on load.
impl StateDictSerialize for Transformer {
    fn update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()> {
        let h = join_key(prefix, "h");
        let blocks = self.blocks.to_state_dict(Some(h.as_str()))?;
        state_dict.extend(unstack_state_dict(&blocks, Some(h.as_str()))?);
        self.ln_f
            .update_state_dict(state_dict, Some(join_key(prefix, "ln_f").as_str()))
    }

    fn from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self> {
        let h = join_key(prefix, "h");
        let stacked = stack_state_dict(state_dict, Some(h.as_str()))?;
        Ok(Self {
            blocks: self.blocks.from_state_dict(&stacked, Some(h.as_str()))?,
            ln_f: self
                .ln_f
                .from_state_dict(state_dict, Some(join_key(prefix, "ln_f").as_str()))?,
            layers: self.layers.clone(),
        })
    }
}

impl Transformer {
    pub fn init(config: &LmConfig, init: &mut dyn Initializer) -> Result<Self> {
        let layers = Axis::new(LAYERS, config.num_layers);
        let blocks = Block::init(std::slice::from_ref(&layers), config, init)?;
        let ln_f = LayerNorm::init(
            &[],
            Axis::new(EMBED, config.hidden_size),
            config.layer_norm_eps,
            config.use_bias,
            init,
        )?;
        Ok(Self { blocks, ln_f, layers })
    }

    pub fn forward(&self, x: &NamedArray, mask: &NamedArray) -> Result<NamedArray> {
        let mut x = x.clone();
        for layer in 0..self.layers.size {
            let block = tree::index_axis(&self.blocks, LAYERS, layer)?;
            x = block.forward(&x, mask)?;
        }
        self.ln_f.forward(&x)
    }
}

#[derive(Debug, Clone)]
pub struct Embeddings {
    pub token_embeddings: Embedding,
    pub position_embeddings: Embedding,
}

axial_core::module!(Embeddings { token_embeddings => "wte", position_embeddings => "wpe" });

impl Embeddings {
    pub fn init(vocab: Axis, config: &LmConfig, init: &mut dyn Initializer) -> Result<Self> {
        let embed = Axis::new(EMBED, config.hidden_size);
        let std = config.initializer_range;
        Ok(Self {
            token_embeddings: Embedding::init(vocab, embed.clone(), std, init)?,
            position_embeddings: Embedding::init(
                Axis::new(MAX_POSITION, config.max_seq_len),
                embed,
                std / 2.0,
                init,
            )?,
        })
    }

    pub fn embed(&self, tokens: &NamedArray) -> Result<NamedArray> {
        let position = tokens.axis(POSITION)?.clone();
        if position.size > self.position_embeddings.vocab.size {
            return Err(Error::Axis(format!(
                "sequence of {} tokens exceeds the context window of {}",
                position.size, self.position_embeddings.vocab.size
            )));
        }
        let ids = Tensor::arange(0u32, position.size as u32, tokens.device())?;
        let positions = NamedArray::new(ids, vec![position])?;
        self.token_embeddings
            .embed(tokens)?
            .add(&self.position_embeddings.embed(&positions)?)
    }
}

/// GPT-2 language model with the unembedding tied to the token embeddings
#[derive(Debug, Clone)]
pub struct Gpt2LmHeadModel {
    pub transformer: Transformer,
    pub embeddings: Embeddings,
    pub config: LmConfig,
}

axial_core::module!(Gpt2LmHeadModel { transformer => _, embeddings => _ } static { config });

impl LmConfig {
    /// Builds a freshly initialized model over a vocabulary of `vocab_size`
    /// tokens (which may be padded beyond `self.vocab_size`).
    pub fn build(&self, vocab_size: usize, init: &mut dyn Initializer) -> Result<Gpt2LmHeadModel> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(Error::Axis(format!(
                "hidden size {} is not divisible into {} heads",
                self.hidden_size, self.num_heads
            )));
        }
        let config = Self {
            vocab_size,
            ..self.clone()
        };
        Ok(Gpt2LmHeadModel {
            transformer: Transformer::init(&config, init)?,
            embeddings: Embeddings::init(Axis::new(VOCAB, vocab_size), &config, init)?,
            config,
        })
    }
}

impl Gpt2LmHeadModel {
    pub fn vocab(&self) -> &Axis {
        &self.embeddings.token_embeddings.vocab
    }

    /// Logits over `vocab` for `tokens` with axes `(batch, position)`
    pub fn forward(&self, tokens: &NamedArray) -> Result<NamedArray> {
        self.forward_masked(tokens, None)
    }

    /// Like [`Self::forward`], with attention further limited by `attn_mask`.
    ///
    /// `attn_mask` holds 1 where a query may attend to a key and 0 elsewhere. Its
    /// axes are any of `batch`, `position` and `key_position`.
    pub fn forward_masked(&self, tokens: &NamedArray, attn_mask: Option<&NamedArray>) -> Result<NamedArray> {
        let x = self.embeddings.embed(tokens)?;
        let mut mask = causal_mask(tokens.axis(POSITION)?, x.dtype(), x.device())?;
        if let Some(attn_mask) = attn_mask {
            let dtype = x.dtype();
            let hidden = attn_mask.map(|m| {
                m.to_dtype(dtype)?
                    .affine(-(MASK_VALUE as f64), MASK_VALUE as f64)
            })?;
            mask = mask.add(&hidden)?;
        }
        let x = self.transformer.forward(&x, &mask)?;
        self.embeddings.token_embeddings.unembed(&x)
    }

    /// Trims (or zero-pads) the vocabulary to `size` tokens.
    pub fn resize_vocab(&self, size: usize) -> Result<Self> {
        let mut model = self.clone();
        model.embeddings.token_embeddings = self.embeddings.token_embeddings.resize_vocab(size)?;
        model.config.vocab_size = size;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axial_core::init::MaterializedInit;
    use axial_core::tree::leaves;

    fn config() -> LmConfig {
        LmConfig {
            vocab_size: 11,
            max_seq_len: 6,
            hidden_size: 8,
            num_layers: 2,
            num_heads: 2,
            intermediate_size: 16,
            layer_norm_eps: 1e-5,
            use_bias: true,
            initializer_range: 0.02,
        }
    }

    fn model(seed: u64) -> Gpt2LmHeadModel {
        let mut init = MaterializedInit::new(Device::Cpu, seed);
        config().build(11, &mut init).unwrap()
    }

    fn tokens(ids: &[u32], batch: usize) -> NamedArray {
        let seq = ids.len() / batch;
        NamedArray::new(
            Tensor::from_slice(ids, (batch, seq), &Device::Cpu).unwrap(),
            vec![Axis::new(BATCH, batch), Axis::new(POSITION, seq)],
        )
        .unwrap()
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_state_dict_uses_gpt2_layout() {
        let sd = model(0).to_state_dict(None).unwrap();
        let dims = |key: &str| sd.get(key).unwrap_or_else(|| panic!("missing {key}")).dims().to_vec();
        assert_eq!(dims("wte.weight"), vec![11, 8]);
        assert_eq!(dims("wpe.weight"), vec![6, 8]);
        assert_eq!(dims("h.0.ln_1.weight"), vec![8]);
        assert_eq!(dims("h.1.ln_2.bias"), vec![8]);
        assert_eq!(dims("h.0.attn.c_attn.weight"), vec![8, 24]);
        assert_eq!(dims("h.0.attn.c_attn.bias"), vec![24]);
        assert_eq!(dims("h.1.attn.c_proj.weight"), vec![8, 8]);
        assert_eq!(dims("h.0.mlp.c_fc.weight"), vec![8, 16]);
        assert_eq!(dims("h.1.mlp.c_proj.weight"), vec![16, 8]);
        assert_eq!(dims("ln_f.weight"), vec![8]);
        assert!(sd.keys().all(|k| !k.starts_with("h.attn") && !k.starts_with("h.ln")));
        // 2 layers x 12 tensors + ln_f (2) + wte + wpe
        assert_eq!(sd.len(), 28);
    }

    #[test]
    fn test_state_dict_round_trip() {
        let source = model(0);
        let sd = source.to_state_dict(Some("transformer")).unwrap();
        let loaded = model(1).from_state_dict(&sd, Some("transformer")).unwrap();
        let expected = leaves(&source).unwrap();
        let actual = leaves(&loaded).unwrap();
        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(&actual) {
            assert_eq!(e.axes(), a.axes());
            assert_eq!(flat(e.array()), flat(a.array()));
        }
    }

    #[test]
    fn test_forward_axes() {
        let logits = model(0).forward(&tokens(&[1, 2, 3, 4, 5, 6, 7, 8], 2)).unwrap();
        assert_eq!(logits.axis_names(), vec![BATCH, POSITION, VOCAB]);
        assert_eq!(logits.shape(), vec![2, 4, 11]);
    }

    #[test]
    fn test_attention_is_causal() {
        let m = model(3);
        let a = m.forward(&tokens(&[1, 2, 3, 4], 1)).unwrap();
        let b = m.forward(&tokens(&[1, 2, 9, 10], 1)).unwrap();
        let prefix = |l: &NamedArray| flat(l.narrow_axis(POSITION, 0, 2).unwrap().array());
        let (pa, pb) = (prefix(&a), prefix(&b));
        for (x, y) in pa.iter().zip(&pb) {
            assert!((x - y).abs() < 1e-5);
        }
        assert_ne!(flat(a.array()), flat(b.array()));
    }

    #[test]
    fn test_attention_mask_hides_keys() {
        let m = model(0);
        let input = tokens(&[1, 2, 3, 4, 5, 6, 7, 8], 2);
        let open = NamedArray::ones(
            vec![Axis::new(BATCH, 2), Axis::new(KEY_POSITION, 4)],
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        let logits = |a: NamedArray| {
            a.rearrange(&[BATCH, POSITION, VOCAB])
                .unwrap()
                .into_array()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        let close = |a: &[f32], b: &[f32]| a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-6);
        let plain = logits(m.forward(&input).unwrap());
        assert!(close(&logits(m.forward_masked(&input, Some(&open)).unwrap()), &plain));

        // hiding the first key of the second sequence only changes that sequence
        let data = Tensor::new(&[[1f32, 1., 1., 1.], [0., 1., 1., 1.]], &Device::Cpu).unwrap();
        let padded = open.with_array(data).unwrap();
        let masked = logits(m.forward_masked(&input, Some(&padded)).unwrap());
        let row = 4 * 11;
        assert!(close(&masked[..row], &plain[..row]));
        assert!(!close(&masked[row..], &plain[row..]));
    }

    #[test]
    fn test_sequence_longer_than_context_is_rejected() {
        assert!(model(0).forward(&tokens(&[0; 7], 1)).is_err());
    }

    #[test]
    fn test_resize_vocab() {
        let m = model(0);
        let trimmed = m.resize_vocab(9).unwrap();
        assert_eq!(trimmed.vocab().size, 9);
        assert_eq!(trimmed.config.vocab_size, 9);
        let sd = trimmed.to_state_dict(None).unwrap();
        assert_eq!(sd.get("wte.weight").unwrap().dims(), &[9, 8]);
        let padded = m.resize_vocab(16).unwrap();
        let logits = padded.forward(&tokens(&[1, 2], 1)).unwrap();
        assert_eq!(logits.axis_size(VOCAB).unwrap(), 16);
    }

    #[test]
    fn test_causal_mask() {
        let mask = causal_mask(&Axis::new(POSITION, 3), DType::F32, &Device::Cpu).unwrap();
        let values = mask.array().to_vec2::<f32>().unwrap();
        assert_eq!(values[0][0], 0.0);
        assert_eq!(values[0][1], MASK_VALUE);
        assert_eq!(values[2], vec![0.0, 0.0, 0.0]);
    }
}
