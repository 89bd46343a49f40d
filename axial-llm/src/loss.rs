use axial_core::error::Result;
use axial_core::named::{Axis, NamedArray};
use candle_core::{DType, Tensor};

use crate::model::{BATCH, Gpt2LmHeadModel, KEY_POSITION, POSITION, VOCAB};

/// Causal language-modelling batch with axes `(batch, position)`
///
/// `targets` holds the next token for every position; positions where
/// `loss_mask` is zero do not contribute to the loss. `attn_mask`, when set,
/// restricts attention on top of the causal mask (see
/// [`Gpt2LmHeadModel::forward_masked`]).
#[derive(Debug, Clone)]
pub struct LmExample {
    pub tokens: NamedArray,
    pub targets: NamedArray,
    pub attn_mask: Option<NamedArray>,
    pub loss_mask: NamedArray,
}

axial_core::module!(LmExample { tokens, targets, attn_mask, loss_mask });

impl LmExample {
    /// `tokens` and `targets` are `[batch, seq]` u32 tensors; every position counts.
    pub fn new(tokens: Tensor, targets: Tensor) -> Result<Self> {
        let (batch, seq) = tokens.dims2()?;
        let axes = vec![Axis::new(BATCH, batch), Axis::new(POSITION, seq)];
        let loss_mask = Tensor::ones((batch, seq), DType::F32, tokens.device())?;
        Ok(Self {
            tokens: NamedArray::new(tokens, axes.clone())?,
            targets: NamedArray::new(targets, axes.clone())?,
            attn_mask: None,
            loss_mask: NamedArray::new(loss_mask, axes)?,
        })
    }

    pub fn with_loss_mask(self, loss_mask: Tensor) -> Result<Self> {
        let loss_mask = self.loss_mask.with_array(loss_mask.to_dtype(DType::F32)?)?;
        Ok(Self { loss_mask, ..self })
    }

    /// `attn_mask` is 1 where attention is allowed, over any of the `batch`,
    /// `position` and `key_position` axes.
    pub fn with_attn_mask(self, attn_mask: NamedArray) -> Self {
        Self {
            attn_mask: Some(attn_mask),
            ..self
        }
    }

    pub fn num_examples(&self) -> Result<usize> {
        self.tokens.axis_size(BATCH)
    }
}

/// Mean next-token cross entropy over the unmasked positions of `example`.
pub fn compute_loss(model: &Gpt2LmHeadModel, example: &LmExample) -> Result<Tensor> {
    let log_probs = model
        .forward_masked(&example.tokens, example.attn_mask.as_ref())?
        .log_softmax(VOCAB)?
        .rearrange(&[BATCH, POSITION, VOCAB])?
        .into_array()
        .contiguous()?;
    let targets = example
        .targets
        .rearrange(&[BATCH, POSITION])?
        .into_array()
        .unsqueeze(2)?
        .contiguous()?;
    let picked = log_probs.gather(&targets, 2)?.squeeze(2)?;
    let mask = example
        .loss_mask
        .rearrange(&[BATCH, POSITION])?
        .into_array()
        .to_dtype(picked.dtype())?;
    let total = picked.mul(&mask)?.sum_all()?.neg()?;
    let count = mask.sum_all()?.maximum(1.0)?;
    Ok(total.div(&count)?)
}
