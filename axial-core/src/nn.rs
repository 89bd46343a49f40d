//! Named-axis layers
//!
//! Building blocks whose state-dict layout the linear and stack adapters target.
//! Every `init` takes `extra` axes that are prepended to each parameter, which
//! is how a group of identical blocks is built with a leading `layers` axis.

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::init::Initializer;
use crate::named::{Axis, NamedArray};
use crate::state_dict::join_key;
use crate::tree::{LeafMapper, LeafVisitor, LinearVisitor, TensorTree};

/// Affine map from the `input` axis group to the `output` axis group
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: NamedArray,
    pub bias: Option<NamedArray>,
    pub input: Vec<Axis>,
    pub output: Vec<Axis>,
    /// Whether the weight is laid out `(output, input)` rather than `(input, output)`
    pub out_first: bool,
}

crate::module!(@custom_tree Linear { weight, bias } static { input, output, out_first });

impl Linear {
    pub fn init(
        extra: &[Axis],
        input: &[Axis],
        output: &[Axis],
        use_bias: bool,
        out_first: bool,
        std: f64,
        init: &mut dyn Initializer,
    ) -> Result<Self> {
        if input.is_empty() || output.is_empty() {
            return Err(Error::Axis(
                "linear layers need non-empty input and output axes".into(),
            ));
        }
        let weight_axes = if out_first {
            [extra, output, input].concat()
        } else {
            [extra, input, output].concat()
        };
        let weight = init.normal(&weight_axes, std)?;
        let bias = if use_bias {
            Some(init.zeros(&[extra, output].concat())?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            input: input.to_vec(),
            output: output.to_vec(),
            out_first,
        })
    }

    pub fn forward(&self, x: &NamedArray) -> Result<NamedArray> {
        let input: Vec<&str> = self.input.iter().map(|a| a.name.as_str()).collect();
        let out = x.dot(&self.weight, &input)?;
        match &self.bias {
            Some(bias) => out.add(bias),
            None => Ok(out),
        }
    }
}

impl TensorTree for Linear {
    fn visit_leaves(&self, path: Option<&str>, f: &mut LeafVisitor<'_>) -> Result<()> {
        self.weight.visit_leaves(Some(join_key(path, "weight").as_str()), f)?;
        self.bias.visit_leaves(Some(join_key(path, "bias").as_str()), f)
    }

    fn map_leaves(&self, path: Option<&str>, f: &mut LeafMapper<'_>) -> Result<Self> {
        Ok(Self {
            weight: self.weight.map_leaves(Some(join_key(path, "weight").as_str()), f)?,
            bias: self.bias.map_leaves(Some(join_key(path, "bias").as_str()), f)?,
            ..self.clone()
        })
    }

    fn visit_linear(&self, path: Option<&str>, f: &mut LinearVisitor<'_>) -> Result<()> {
        f(path, self)
    }
}

/// Layer normalization over one axis
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Option<NamedArray>,
    pub bias: Option<NamedArray>,
    pub axis: Axis,
    pub eps: f64,
}

crate::module!(LayerNorm { weight, bias } static { axis, eps });

impl LayerNorm {
    pub fn init(
        extra: &[Axis],
        axis: Axis,
        eps: f64,
        use_bias: bool,
        init: &mut dyn Initializer,
    ) -> Result<Self> {
        let axes = [extra, std::slice::from_ref(&axis)].concat();
        let weight = Some(init.ones(&axes)?);
        let bias = if use_bias { Some(init.zeros(&axes)?) } else { None };
        Ok(Self {
            weight,
            bias,
            axis,
            eps,
        })
    }

    pub fn forward(&self, x: &NamedArray) -> Result<NamedArray> {
        let axis = [self.axis.name.as_str()];
        let mean = x.mean(&axis)?;
        let centered = x.sub(&mean)?;
        let variance = centered.map(|t| t.sqr())?.mean(&axis)?;
        let std = variance.map(|t| t.affine(1.0, self.eps)?.sqrt())?;
        let normed = centered.div(&std)?;
        let normed = match &self.weight {
            Some(weight) => normed.mul(weight)?,
            None => normed,
        };
        match &self.bias {
            Some(bias) => normed.add(bias),
            None => Ok(normed),
        }
    }
}

/// Token embedding table, also used as the tied output projection
#[derive(Debug, Clone)]
pub struct Embedding {
    pub weight: NamedArray,
    pub vocab: Axis,
    pub embed: Axis,
}

crate::module!(Embedding { weight } static { vocab, embed });

impl Embedding {
    pub fn init(vocab: Axis, embed: Axis, std: f64, init: &mut dyn Initializer) -> Result<Self> {
        let weight = init.normal(&[vocab.clone(), embed.clone()], std)?;
        Ok(Self { weight, vocab, embed })
    }

    /// Looks up integer `ids`; the result has the axes of `ids` plus `embed`.
    pub fn embed(&self, ids: &NamedArray) -> Result<NamedArray> {
        let table = self.weight.rearrange(&[self.vocab.name.as_str(), self.embed.name.as_str()])?;
        let flat = ids.array().flatten_all()?;
        let rows = table.array().index_select(&flat, 0)?;
        let mut axes = ids.axes().to_vec();
        axes.push(self.embed.clone());
        let shape: Vec<usize> = axes.iter().map(|a| a.size).collect();
        NamedArray::new(rows.reshape(shape)?, axes)
    }

    /// Logits over `vocab` for hidden states carrying `embed`
    pub fn unembed(&self, hidden: &NamedArray) -> Result<NamedArray> {
        hidden.dot(&self.weight, &[self.embed.name.as_str()])
    }

    /// Keeps the first `size` vocabulary rows.
    pub fn resize_vocab(&self, size: usize) -> Result<Self> {
        let weight = if size <= self.vocab.size {
            self.weight.take_prefix(&self.vocab.name, size)?
        } else {
            let pad_axes: Vec<Axis> = self
                .weight
                .axes()
                .iter()
                .map(|a| if a.name == self.vocab.name { a.resize(size - self.vocab.size) } else { a.clone() })
                .collect();
            let dim = self.weight.resolve(&self.vocab.name)?;
            let pad = Tensor::zeros(
                pad_axes.iter().map(|a| a.size).collect::<Vec<_>>(),
                self.weight.dtype(),
                self.weight.device(),
            )?;
            let array = Tensor::cat(&[self.weight.array(), &pad], dim)?;
            let axes = self
                .weight
                .axes()
                .iter()
                .map(|a| if a.name == self.vocab.name { a.resize(size) } else { a.clone() })
                .collect();
            NamedArray::new(array, axes)?
        };
        Ok(Self {
            weight,
            vocab: self.vocab.resize(size),
            embed: self.embed.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::MaterializedInit;
    use crate::state_dict::{Module, StateDictSerialize};
    use candle_core::{DType, Device};

    #[test]
    fn test_linear_forward_multi_axis() {
        let mut init = MaterializedInit::new(Device::Cpu, 0);
        let input = [Axis::new("embed", 4)];
        let output = [Axis::new("heads", 2), Axis::new("head_dim", 3)];
        let linear = Linear::init(&[], &input, &output, true, false, 0.1, &mut init).unwrap();
        assert_eq!(linear.weight.axis_names(), vec!["embed", "heads", "head_dim"]);

        let x = NamedArray::ones(vec![Axis::new("pos", 5), Axis::new("embed", 4)], DType::F32, &Device::Cpu).unwrap();
        let y = linear.forward(&x).unwrap();
        assert_eq!(y.axis_names(), vec!["pos", "heads", "head_dim"]);
        assert!(Linear::init(&[], &[], &output, false, true, 0.1, &mut init).is_err());
    }

    #[test]
    fn test_layer_norm_normalizes() {
        let mut init = MaterializedInit::new(Device::Cpu, 0);
        let ln = LayerNorm::init(&[], Axis::new("embed", 4), 1e-5, true, &mut init).unwrap();
        let t = Tensor::new(&[[1f32, 2.0, 3.0, 4.0], [2.0, 2.0, 2.0, 6.0]], &Device::Cpu).unwrap();
        let x = NamedArray::new(t, vec![Axis::new("pos", 2), Axis::new("embed", 4)]).unwrap();
        let y = ln.forward(&x).unwrap();
        let means = y.mean(&["embed"]).unwrap().array().to_vec1::<f32>().unwrap();
        for m in means {
            assert!(m.abs() < 1e-5);
        }
        assert_eq!(LayerNorm::fields().len(), 4);
        let sd = ln.to_state_dict(Some("ln_f")).unwrap();
        assert!(sd.contains_key("ln_f.weight") && sd.contains_key("ln_f.bias"));
    }

    #[test]
    fn test_embedding_lookup_and_resize() {
        let mut init = MaterializedInit::new(Device::Cpu, 0);
        let emb = Embedding::init(Axis::new("vocab", 5), Axis::new("embed", 3), 1.0, &mut init).unwrap();
        let ids = Tensor::new(&[[4u32, 0], [1, 1]], &Device::Cpu).unwrap();
        let ids = NamedArray::new(ids, vec![Axis::new("batch", 2), Axis::new("position", 2)]).unwrap();
        let hidden = emb.embed(&ids).unwrap();
        assert_eq!(hidden.axis_names(), vec!["batch", "position", "embed"]);
        let row = hidden.index_axis("batch", 0).unwrap().index_axis("position", 0).unwrap();
        let expected = emb.weight.index_axis("vocab", 4).unwrap();
        assert_eq!(
            row.array().to_vec1::<f32>().unwrap(),
            expected.array().to_vec1::<f32>().unwrap()
        );
        assert_eq!(emb.unembed(&hidden).unwrap().axis_names(), vec!["batch", "position", "vocab"]);

        assert_eq!(emb.resize_vocab(3).unwrap().weight.shape(), vec![3, 3]);
        let grown = emb.resize_vocab(8).unwrap();
        assert_eq!(grown.weight.shape(), vec![8, 3]);
        assert_eq!(grown.vocab.size, 8);
    }
}
