//! Sharded gradient accumulation
//!
//! A batch that does not fit through the model at once is split along its batch
//! axis into micro-batches of `per_device_parallelism` examples. Losses and
//! gradients are accumulated weighted by micro-batch size and divided by the
//! example count, so the result equals a single full-batch step up to
//! floating-point ordering. When the batch axis is bound to a mesh axis with
//! more than one process, sums and counts are all-reduced across that group first
//! and the result is the global batch mean.

use candle_core::{DType, Device, Tensor, Var};
use tracing::{debug, info};

use crate::distributed::{ProcessMesh, gather_tree};
use crate::error::{Error, Result};
use crate::partition::AxisMapping;
use crate::tree::{self, Leaf, TensorTree};

/// Mean loss and mean gradient of `f` over `batch`.
///
/// `f(params, micro_batch)` returns a scalar loss and a gradient tree shaped like
/// `params`. Parameters sharded across processes are gathered once before the
/// loop; the returned gradients are sharded the same way as `model`.
/// `axis_mapping` binds `batch_axis` (and parameter axes) to mesh axes.
pub fn accumulate_gradients_sharded<M, B, F>(
    mut f: F,
    batch_axis: &str,
    model: &M,
    batch: &B,
    per_device_parallelism: usize,
    axis_mapping: &AxisMapping,
    mesh: &ProcessMesh,
) -> Result<(Tensor, M)>
where
    M: TensorTree,
    B: TensorTree,
    F: FnMut(&M, &B) -> Result<(Tensor, M)>,
{
    if per_device_parallelism == 0 {
        return Err(Error::Axis("per-device parallelism must be at least 1".into()));
    }
    let examples = tree::axis_size(batch, batch_axis)?;

    let params = gather_tree(model, mesh.comm())?;
    let steps = examples.div_ceil(per_device_parallelism);
    info!(
        examples,
        micro_batch = per_device_parallelism,
        steps,
        "accumulating gradients"
    );

    let mut total: Option<(Tensor, M)> = None;
    for step in 0..steps {
        let start = step * per_device_parallelism;
        let len = per_device_parallelism.min(examples - start);
        let micro = tree::narrow_axis(batch, batch_axis, start, len)?;
        let (loss, grad) = f(&params, &micro)?;
        debug!(step, len, "micro-batch done");

        let weight = len as f64;
        let loss = loss.affine(weight, 0.0)?;
        let grad = tree::scale_tree(&grad, weight)?;
        total = Some(match total {
            Some((acc_loss, acc_grad)) => (acc_loss.add(&loss)?, tree::add_trees(&acc_grad, &grad)?),
            None => (loss, grad),
        });
    }
    // An empty local batch still takes part in the reductions below
    let (mut loss, mut grad) = match total {
        Some(total) => total,
        None => zero_contribution(&params)?,
    };

    let mut count = examples as f64;
    if let Some(mesh_axis) = axis_mapping.get(batch_axis) {
        let group = mesh.group_along(mesh_axis)?;
        if group.len() > 1 {
            let comm = mesh.comm();
            loss = comm.all_reduce_sum(&loss, &group)?;
            grad = tree::map(&grad, |leaf| {
                let reduced = comm.all_reduce_sum(leaf.array(), &group)?;
                leaf.with_array(reduced)
            })?;
            let local = Tensor::new(&[examples as f64], loss.device())?;
            count = comm.all_reduce_sum(&local, &group)?.to_vec1::<f64>()?[0];
            debug!(mesh_axis, count, "reduced gradients across data group");
        }
    }
    if count == 0.0 {
        return Err(Error::Axis(format!("batch axis '{batch_axis}' is empty")));
    }

    let loss = loss.affine(1.0 / count, 0.0)?;
    let grad = tree::scale_tree(&grad, 1.0 / count)?;
    let grad = reshard_like(model, &grad, mesh)?;
    Ok((loss, grad))
}

/// Zero loss and zero gradients shaped like `params`. The loss takes the dtype
/// and device of the first leaf.
fn zero_contribution<M: TensorTree>(params: &M) -> Result<(Tensor, M)> {
    let loss = match tree::leaves(params)?.first() {
        Some(leaf) => Tensor::zeros((), leaf.array().dtype(), leaf.array().device())?,
        None => Tensor::zeros((), DType::F32, &Device::Cpu)?,
    };
    let grad = tree::map(params, |leaf| leaf.map(|t| t.zeros_like()))?;
    Ok((loss, grad))
}

/// Shards every leaf of `grad` the way the matching leaf of `model` is sharded.
fn reshard_like<M: TensorTree>(model: &M, grad: &M, mesh: &ProcessMesh) -> Result<M> {
    tree::zip_map(grad, model, |g, param| match (g, param) {
        (Leaf::Named(g), Leaf::Named(param)) => match param.sharding() {
            Some(sharding) if !param.is_fully_addressable() => {
                Ok(Leaf::Named(g.shard(sharding.clone(), mesh.rank())?))
            }
            _ => Ok(Leaf::Named(g)),
        },
        (g, _) => Ok(g),
    })
}

/// Turns a scalar loss into the `(loss, gradient tree)` form taken by
/// [`accumulate_gradients_sharded`] using candle autograd. Leaves that do not
/// influence the loss get zero gradients.
pub fn value_and_grad<M, B>(
    loss_fn: impl Fn(&M, &B) -> Result<Tensor>,
) -> impl Fn(&M, &B) -> Result<(Tensor, M)>
where
    M: TensorTree,
{
    move |model: &M, batch: &B| {
        let tracked = tree::map(model, |leaf| {
            let var = Var::from_tensor(leaf.array())?;
            leaf.with_array(var.as_tensor().clone())
        })?;
        let loss = loss_fn(&tracked, batch)?;
        let grads = loss.backward()?;
        let grad = tree::map(&tracked, |leaf| {
            let g = match grads.get(leaf.array()) {
                Some(g) => g.clone(),
                None => leaf.array().zeros_like()?,
            };
            leaf.with_array(g)
        })?;
        Ok((loss.detach(), grad))
    }
}
