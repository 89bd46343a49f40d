//! Linear-layer flattening
//!
//! Named linear layers may have several input and output axes (for example
//! `embed -> (qkv, heads, head_dim)`). Foreign checkpoints store them as 2-D
//! weights and 1-D biases. Flattening collapses the output group into
//! `__OUT__` and the input group into `__IN__`; unflattening reverses it using an
//! exemplar tree for the axis names. Axes that belong to neither group (a
//! stacked `layers` axis, say) stay in front.

use candle_core::Tensor;

use crate::error::Result;
use crate::named::{Axis, NamedArray, axis_product};
use crate::nn::Linear;
use crate::state_dict::{Module, StateDict, join_key};
use crate::tree::TensorTree;

pub const OUT: &str = "__OUT__";
pub const IN: &str = "__IN__";

fn names(axes: &[Axis]) -> Vec<&str> {
    axes.iter().map(|a| a.name.as_str()).collect()
}

fn extra_axes(array: &NamedArray, groups: &[&[Axis]]) -> Vec<Axis> {
    array
        .axes()
        .iter()
        .filter(|a| !groups.iter().any(|g| g.iter().any(|b| b.name == a.name)))
        .cloned()
        .collect()
}

fn flatten_linear(layer: &Linear, out_first: bool) -> Result<(Tensor, Option<Tensor>)> {
    let output = names(&layer.output);
    let input = names(&layer.input);
    let weight = layer
        .weight
        .flatten_axes(&output, OUT)?
        .flatten_axes(&input, IN)?;
    let trailing = if out_first { [OUT, IN] } else { [IN, OUT] };
    let weight = weight.rearrange_trailing(&trailing)?.into_array();
    let bias = match &layer.bias {
        Some(bias) => Some(
            bias.flatten_axes(&output, OUT)?
                .rearrange_trailing(&[OUT])?
                .into_array(),
        ),
        None => None,
    };
    Ok((weight, bias))
}

fn unflatten_weight(layer: &Linear, flat: &Tensor, out_first: bool) -> Result<Tensor> {
    let mut axes = extra_axes(&layer.weight, &[&layer.input, &layer.output]);
    let out_axis = Axis::new(OUT, axis_product(&layer.output));
    let in_axis = Axis::new(IN, axis_product(&layer.input));
    if out_first {
        axes.extend([out_axis, in_axis]);
    } else {
        axes.extend([in_axis, out_axis]);
    }
    let named = NamedArray::new(flat.clone(), axes)?
        .unflatten_axis(OUT, &layer.output)?
        .unflatten_axis(IN, &layer.input)?;
    Ok(named.rearrange(&layer.weight.axis_names())?.into_array())
}

fn unflatten_bias(template: &NamedArray, output: &[Axis], flat: &Tensor) -> Result<Tensor> {
    let mut axes = extra_axes(template, &[output]);
    axes.push(Axis::new(OUT, axis_product(output)));
    let named = NamedArray::new(flat.clone(), axes)?.unflatten_axis(OUT, output)?;
    Ok(named.rearrange(&template.axis_names())?.into_array())
}

/// Flattened `<key>.weight` / `<key>.bias` entries for every linear layer in
/// `tree`.
///
/// `out_first` of `None` or `Some(true)` lays weights out as
/// `[..extra, __OUT__, __IN__]`; `Some(false)` as `[..extra, __IN__, __OUT__]`.
pub fn flatten_linear_layers<T: TensorTree>(
    prefix: Option<&str>,
    tree: &T,
    out_first: Option<bool>,
) -> Result<StateDict> {
    let out_first = out_first.unwrap_or(true);
    let mut state_dict = StateDict::new();
    tree.visit_linear(prefix, &mut |path: Option<&str>, layer: &Linear| {
        let (weight, bias) = flatten_linear(layer, out_first)?;
        state_dict.insert(join_key(path, "weight"), weight);
        if let Some(bias) = bias {
            state_dict.insert(join_key(path, "bias"), bias);
        }
        Ok(())
    })?;
    Ok(state_dict)
}

/// Inverse of [`flatten_linear_layers`]: reads the flat entries for every linear
/// layer of `exemplar` and lays them out exactly as the exemplar's weight and
/// bias. With `out_first` of `None` each layer's own orientation is assumed.
pub fn unflatten_linear_layers<T: TensorTree>(
    prefix: Option<&str>,
    state_dict: &StateDict,
    exemplar: &T,
    out_first: Option<bool>,
) -> Result<StateDict> {
    let mut out = state_dict.empty_like();
    exemplar.visit_linear(prefix, &mut |path: Option<&str>, layer: &Linear| {
        let orientation = out_first.unwrap_or(layer.out_first);
        let weight_key = join_key(path, "weight");
        let weight = unflatten_weight(layer, state_dict.require(&weight_key)?, orientation)?;
        out.insert(weight_key, weight);
        if let Some(bias) = &layer.bias {
            let bias_key = join_key(path, "bias");
            let flat = state_dict.require(&bias_key)?;
            out.insert(bias_key, unflatten_bias(bias, &layer.output, flat)?);
        }
        Ok(())
    })?;
    Ok(out)
}

/// Field-by-field serialization with every linear layer written flattened.
pub fn update_state_dict_flattened<M: Module + TensorTree>(
    module: &M,
    state_dict: &mut StateDict,
    prefix: Option<&str>,
    out_first: Option<bool>,
) -> Result<()> {
    module.default_update_state_dict(state_dict, prefix)?;
    state_dict.extend(flatten_linear_layers(prefix, module, out_first)?);
    Ok(())
}

/// Reads a module whose linear layers were written by
/// [`update_state_dict_flattened`].
pub fn from_state_dict_flattened<M: Module + TensorTree>(
    module: &M,
    state_dict: &StateDict,
    prefix: Option<&str>,
    out_first: Option<bool>,
) -> Result<M> {
    let mut unflattened = state_dict.clone();
    unflattened.extend(unflatten_linear_layers(prefix, state_dict, module, out_first)?);
    module.default_from_state_dict(&unflattened, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::named::axis_sizes;
    use crate::state_dict::StateDictSerialize;
    use candle_core::{DType, Device};

    fn arange(axes: Vec<Axis>, offset: f32) -> NamedArray {
        let n = axis_product(&axes) as u32;
        let t = Tensor::arange(0u32, n, &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .affine(1.0, offset as f64)
            .unwrap()
            .reshape(axis_sizes(&axes))
            .unwrap();
        NamedArray::new(t, axes).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn layer(extra: &[Axis], out_first: bool) -> Linear {
        let input = vec![Axis::new("A", 2), Axis::new("B", 3)];
        let output = vec![Axis::new("C", 4)];
        let mut weight_axes = extra.to_vec();
        if out_first {
            weight_axes.extend(output.iter().cloned().chain(input.iter().cloned()));
        } else {
            weight_axes.extend(input.iter().cloned().chain(output.iter().cloned()));
        }
        let mut bias_axes = extra.to_vec();
        bias_axes.extend(output.iter().cloned());
        Linear {
            weight: arange(weight_axes, 0.0),
            bias: Some(arange(bias_axes, 100.0)),
            input,
            output,
            out_first,
        }
    }

    #[test]
    fn test_flatten_unflatten_inverse_both_orientations() {
        for out_first in [true, false] {
            let linear = layer(&[], false);
            let flat = flatten_linear_layers(Some("proj"), &linear, Some(out_first)).unwrap();
            let weight = flat.get("proj.weight").unwrap();
            if out_first {
                assert_eq!(weight.dims(), &[4, 6]);
            } else {
                assert_eq!(weight.dims(), &[6, 4]);
            }
            assert_eq!(flat.get("proj.bias").unwrap().dims(), &[4]);

            let restored = unflatten_linear_layers(Some("proj"), &flat, &linear, Some(out_first)).unwrap();
            assert_eq!(
                values(restored.get("proj.weight").unwrap()),
                values(linear.weight.array())
            );
            assert_eq!(
                values(restored.get("proj.bias").unwrap()),
                values(linear.bias.as_ref().unwrap().array())
            );
        }
    }

    #[test]
    fn test_flatten_layout_matches_2d_matrix() {
        // weight axes (C, A, B): row c of the [out, in] matrix is weight[c] flattened
        let linear = layer(&[], true);
        let flat = flatten_linear_layers(None, &linear, None).unwrap();
        let weight = flat.get("weight").unwrap();
        assert_eq!(weight.dims(), &[4, 6]);
        assert_eq!(values(&weight.get(1).unwrap()), (6..12).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_extra_axes_stay_in_front() {
        let layers = Axis::new("layers", 2);
        let linear = layer(std::slice::from_ref(&layers), true);
        let flat = flatten_linear_layers(Some("l"), &linear, Some(false)).unwrap();
        assert_eq!(flat.get("l.weight").unwrap().dims(), &[2, 6, 4]);
        assert_eq!(flat.get("l.bias").unwrap().dims(), &[2, 4]);

        let restored = unflatten_linear_layers(Some("l"), &flat, &linear, Some(false)).unwrap();
        assert_eq!(restored.get("l.weight").unwrap().dims(), &[2, 4, 2, 3]);
        assert_eq!(
            values(restored.get("l.weight").unwrap()),
            values(linear.weight.array())
        );
    }

    #[test]
    fn test_unflatten_defaults_to_layer_orientation() {
        let linear = layer(&[], false);
        let flat = flatten_linear_layers(Some("p"), &linear, Some(false)).unwrap();
        let restored = unflatten_linear_layers(Some("p"), &flat, &linear, None).unwrap();
        assert_eq!(
            values(restored.get("p.weight").unwrap()),
            values(linear.weight.array())
        );
    }

    #[derive(Debug, Clone)]
    struct Projection {
        proj: Linear,
        gain: NamedArray,
    }

    crate::module!(@custom_state_dict Projection { proj => "c_proj", gain });

    impl StateDictSerialize for Projection {
        fn update_state_dict(&self, state_dict: &mut StateDict, prefix: Option<&str>) -> Result<()> {
            update_state_dict_flattened(self, state_dict, prefix, Some(false))
        }

        fn from_state_dict(&self, state_dict: &StateDict, prefix: Option<&str>) -> Result<Self> {
            from_state_dict_flattened(self, state_dict, prefix, Some(false))
        }
    }

    #[test]
    fn test_custom_module_round_trip() {
        let module = Projection {
            proj: layer(&[], true),
            gain: arange(vec![Axis::new("C", 4)], 1.0),
        };
        let sd = module.to_state_dict(Some("block")).unwrap();
        assert_eq!(sd.get("block.c_proj.weight").unwrap().dims(), &[6, 4]);
        assert_eq!(sd.get("block.gain").unwrap().dims(), &[4]);

        let restored = module.from_state_dict(&sd, Some("block")).unwrap();
        assert_eq!(restored.proj.weight.shape(), vec![4, 2, 3]);
        assert_eq!(values(restored.proj.weight.array()), values(module.proj.weight.array()));
    }
}
