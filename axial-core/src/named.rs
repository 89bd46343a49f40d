//! Named-axis arrays
//!
//! A [`NamedArray`] pairs a candle [`Tensor`] with an ordered list of uniquely
//! named [`Axis`] values. Operations address dimensions by name, so a caller
//! never tracks positional layouts by hand.
//!
//! A named array may hold only the local shard of a larger logical array (see
//! [`Sharding`]). Its axes always carry the logical sizes; the local tensor is
//! smaller along every partitioned dimension. Most operations require a fully
//! addressable array and fail with [`Error::Axis`] on a shard.

use std::fmt;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::partition::Sharding;

/// A named dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub size: usize,
}

impl Axis {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Same name, different size
    pub fn resize(&self, size: usize) -> Self {
        Self::new(self.name.clone(), size)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.size)
    }
}

/// Sizes of `axes`, in order
pub fn axis_sizes(axes: &[Axis]) -> Vec<usize> {
    axes.iter().map(|a| a.size).collect()
}

/// Product of the sizes of `axes` (1 for an empty group)
pub fn axis_product(axes: &[Axis]) -> usize {
    axes.iter().map(|a| a.size).product()
}

pub(crate) fn describe(axes: &[Axis]) -> String {
    let parts: Vec<String> = axes.iter().map(|a| a.to_string()).collect();
    format!("({})", parts.join(", "))
}

fn check_unique(axes: &[Axis]) -> Result<()> {
    for (i, axis) in axes.iter().enumerate() {
        if axes[..i].iter().any(|other| other.name == axis.name) {
            return Err(Error::Axis(format!(
                "axis '{}' appears twice in {}",
                axis.name,
                describe(axes)
            )));
        }
    }
    Ok(())
}

/// A tensor whose dimensions are addressed by name
#[derive(Debug, Clone)]
pub struct NamedArray {
    array: Tensor,
    axes: Vec<Axis>,
    sharding: Option<Sharding>,
}

impl NamedArray {
    /// Wraps `array`, checking that its shape matches `axes` and that axis names
    /// are unique.
    pub fn new(array: Tensor, axes: Vec<Axis>) -> Result<Self> {
        check_unique(&axes)?;
        let expected = axis_sizes(&axes);
        if array.dims() != expected.as_slice() {
            return Err(Error::Axis(format!(
                "array of shape {:?} does not match axes {}",
                array.dims(),
                describe(&axes)
            )));
        }
        Ok(Self {
            array,
            axes,
            sharding: None,
        })
    }

    /// Wraps `array` without comparing its shape to `axes`.
    ///
    /// The state-dict codec uses this so that tensors whose shapes drifted from the
    /// template still load; the first named operation on such an array reports the
    /// mismatch.
    pub fn new_unchecked(array: Tensor, axes: Vec<Axis>) -> Self {
        Self {
            array,
            axes,
            sharding: None,
        }
    }

    /// Wraps the local shard `array` of a logical array with axes `axes`.
    pub fn sharded(array: Tensor, axes: Vec<Axis>, sharding: Sharding, rank: usize) -> Result<Self> {
        check_unique(&axes)?;
        let ranges = sharding.local_ranges(&axis_sizes(&axes), rank)?;
        let local: Vec<usize> = ranges.iter().map(|&(_, len)| len).collect();
        if array.dims() != local.as_slice() {
            return Err(Error::Partition(format!(
                "local shard of shape {:?} does not match {} under {}",
                array.dims(),
                describe(&axes),
                sharding.spec()
            )));
        }
        Ok(Self {
            array,
            axes,
            sharding: Some(sharding),
        })
    }

    pub fn zeros(axes: Vec<Axis>, dtype: DType, device: &Device) -> Result<Self> {
        let array = Tensor::zeros(axis_sizes(&axes), dtype, device)?;
        Self::new(array, axes)
    }

    pub fn ones(axes: Vec<Axis>, dtype: DType, device: &Device) -> Result<Self> {
        let array = Tensor::ones(axis_sizes(&axes), dtype, device)?;
        Self::new(array, axes)
    }

    /// The underlying tensor (the local shard for sharded arrays)
    pub fn array(&self) -> &Tensor {
        &self.array
    }

    pub fn into_array(self) -> Tensor {
        self.array
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn axis_names(&self) -> Vec<&str> {
        self.axes.iter().map(|a| a.name.as_str()).collect()
    }

    /// Logical shape, one entry per axis
    pub fn shape(&self) -> Vec<usize> {
        axis_sizes(&self.axes)
    }

    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    pub fn dtype(&self) -> DType {
        self.array.dtype()
    }

    pub fn device(&self) -> &Device {
        self.array.device()
    }

    pub fn sharding(&self) -> Option<&Sharding> {
        self.sharding.as_ref()
    }

    pub fn has_axis(&self, name: &str) -> bool {
        self.axis_index(name).is_some()
    }

    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|a| a.name == name)
    }

    /// Position of `name`, or an error naming the available axes
    pub fn resolve(&self, name: &str) -> Result<usize> {
        self.axis_index(name).ok_or_else(|| {
            Error::Axis(format!("no axis '{name}' in {}", describe(&self.axes)))
        })
    }

    pub fn axis(&self, name: &str) -> Result<&Axis> {
        Ok(&self.axes[self.resolve(name)?])
    }

    pub fn axis_size(&self, name: &str) -> Result<usize> {
        Ok(self.axis(name)?.size)
    }

    /// True unless the array is a shard of a partitioned logical array
    pub fn is_fully_addressable(&self) -> bool {
        self.sharding.as_ref().is_none_or(|s| !s.is_partitioned())
    }

    fn local(&self) -> Result<&Tensor> {
        if !self.is_fully_addressable() {
            return Err(Error::Axis(format!(
                "array {} is sharded; gather it before operating on it",
                describe(&self.axes)
            )));
        }
        Ok(&self.array)
    }

    /// Replaces the tensor, keeping axes (and sharding, when the local shape is
    /// unchanged).
    pub fn with_array(&self, array: Tensor) -> Result<Self> {
        if let Some(sharding) = &self.sharding
            && array.dims() == self.array.dims()
        {
            return Ok(Self {
                array,
                axes: self.axes.clone(),
                sharding: Some(sharding.clone()),
            });
        }
        Self::new(array, self.axes.clone())
    }

    /// Applies a shape-preserving tensor function
    pub fn map(&self, f: impl FnOnce(&Tensor) -> candle_core::Result<Tensor>) -> Result<Self> {
        self.with_array(f(&self.array)?)
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            array: self.array.to_device(device)?,
            axes: self.axes.clone(),
            sharding: self.sharding.clone(),
        })
    }

    /// Host copy; arrays already on the CPU are returned as is
    pub fn to_host(&self) -> Result<Self> {
        if self.array.device().is_cpu() {
            return Ok(self.clone());
        }
        self.to_device(&Device::Cpu)
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        self.map(|t| t.to_dtype(dtype))
    }

    /// Drops sharding metadata from an array whose local tensor is the whole
    /// logical array.
    pub(crate) fn into_unsharded(self) -> Result<Self> {
        if self.sharding.is_none() {
            return Ok(self);
        }
        Self::new(self.array, self.axes)
    }

    /// Permutes to exactly `order`, which must name every axis once.
    pub fn rearrange(&self, order: &[&str]) -> Result<Self> {
        if order.len() != self.axes.len() {
            return Err(Error::Axis(format!(
                "cannot rearrange {} into {order:?}",
                describe(&self.axes)
            )));
        }
        let perm = order
            .iter()
            .map(|name| self.resolve(name))
            .collect::<Result<Vec<_>>>()?;
        let axes: Vec<Axis> = perm.iter().map(|&i| self.axes[i].clone()).collect();
        check_unique(&axes)?;
        if perm.iter().enumerate().all(|(i, &p)| i == p) {
            return Ok(self.clone());
        }
        let array = self.local()?.permute(perm)?;
        Self::new(array, axes)
    }

    /// Moves `trailing` to the end in the given order, leaving the remaining axes
    /// in front in their current order.
    pub fn rearrange_trailing(&self, trailing: &[&str]) -> Result<Self> {
        let mut order: Vec<&str> = self
            .axes
            .iter()
            .map(|a| a.name.as_str())
            .filter(|name| !trailing.contains(name))
            .collect();
        for name in trailing {
            self.resolve(name)?;
            order.push(name);
        }
        self.rearrange(&order)
    }

    /// Collapses `group` into one axis named `new_name`, placed where the first
    /// member of the group currently sits.
    pub fn flatten_axes(&self, group: &[&str], new_name: &str) -> Result<Self> {
        if group.is_empty() {
            return Err(Error::Axis(format!("cannot flatten an empty group into '{new_name}'")));
        }
        let indices = group
            .iter()
            .map(|name| self.resolve(name))
            .collect::<Result<Vec<_>>>()?;
        let first = indices.iter().copied().min().unwrap_or(0);

        let mut order: Vec<&str> = Vec::with_capacity(self.axes.len());
        for (i, axis) in self.axes.iter().enumerate() {
            if i == first {
                order.extend(group.iter().copied());
            } else if !indices.contains(&i) {
                order.push(&axis.name);
            }
        }
        let arranged = self.rearrange(&order)?;

        let size = indices.iter().map(|&i| self.axes[i].size).product();
        let mut axes = Vec::with_capacity(self.axes.len() + 1 - group.len());
        for axis in arranged.axes() {
            if axis.name == group[0] {
                axes.push(Axis::new(new_name, size));
            } else if !group.contains(&axis.name.as_str()) {
                axes.push(axis.clone());
            }
        }
        check_unique(&axes)?;
        let array = arranged.array.reshape(axis_sizes(&axes))?;
        Self::new(array, axes)
    }

    /// Splits axis `name` into `group`, in place.
    pub fn unflatten_axis(&self, name: &str, group: &[Axis]) -> Result<Self> {
        let index = self.resolve(name)?;
        let size = self.axes[index].size;
        if axis_product(group) != size {
            return Err(Error::Axis(format!(
                "cannot split '{name}' of size {size} into {}",
                describe(group)
            )));
        }
        let mut axes = self.axes[..index].to_vec();
        axes.extend(group.iter().cloned());
        axes.extend(self.axes[index + 1..].iter().cloned());
        check_unique(&axes)?;
        let array = self.local()?.reshape(axis_sizes(&axes))?;
        Self::new(array, axes)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<Self> {
        let index = self.resolve(from)?;
        let mut axes = self.axes.clone();
        axes[index].name = to.to_string();
        check_unique(&axes)?;
        Ok(Self {
            array: self.array.clone(),
            axes,
            sharding: self.sharding.clone(),
        })
    }

    /// Selects `index` along `name`, dropping the axis.
    pub fn index_axis(&self, name: &str, index: usize) -> Result<Self> {
        let dim = self.resolve(name)?;
        if index >= self.axes[dim].size {
            return Err(Error::Axis(format!(
                "index {index} out of range for axis {}",
                self.axes[dim]
            )));
        }
        let array = self.local()?.narrow(dim, index, 1)?.squeeze(dim)?;
        let mut axes = self.axes.clone();
        axes.remove(dim);
        Self::new(array, axes)
    }

    /// Restricts `name` to `start..start + len`.
    pub fn narrow_axis(&self, name: &str, start: usize, len: usize) -> Result<Self> {
        let dim = self.resolve(name)?;
        if start + len > self.axes[dim].size {
            return Err(Error::Axis(format!(
                "range {start}..{} out of bounds for axis {}",
                start + len,
                self.axes[dim]
            )));
        }
        let array = self.local()?.narrow(dim, start, len)?;
        let mut axes = self.axes.clone();
        axes[dim].size = len;
        Self::new(array, axes)
    }

    /// Keeps the first `size` entries of `name`.
    pub fn take_prefix(&self, name: &str, size: usize) -> Result<Self> {
        self.narrow_axis(name, 0, size)
    }

    /// Broadcasts to `axes`, which must contain every axis of `self` with the same
    /// size. Axes missing from `self` are repeated.
    pub fn broadcast_to(&self, axes: &[Axis]) -> Result<Self> {
        for own in &self.axes {
            match axes.iter().find(|a| a.name == own.name) {
                Some(target) if target.size == own.size => {}
                _ => {
                    return Err(Error::Axis(format!(
                        "cannot broadcast {} to {}",
                        describe(&self.axes),
                        describe(axes)
                    )));
                }
            }
        }
        let order: Vec<&str> = axes
            .iter()
            .filter(|a| self.has_axis(&a.name))
            .map(|a| a.name.as_str())
            .collect();
        let arranged = self.rearrange(&order)?;
        let padded: Vec<usize> = axes
            .iter()
            .map(|a| if self.has_axis(&a.name) { a.size } else { 1 })
            .collect();
        let array = arranged
            .array
            .reshape(padded)?
            .broadcast_as(axis_sizes(axes))?;
        Self::new(array, axes.to_vec())
    }

    fn zip_with(
        &self,
        other: &NamedArray,
        op: impl FnOnce(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
    ) -> Result<Self> {
        let mut axes = self.axes.clone();
        for axis in other.axes() {
            if !self.has_axis(&axis.name) {
                axes.push(axis.clone());
            }
        }
        let lhs = self.broadcast_to(&axes)?;
        let rhs = other.broadcast_to(&axes)?;
        Self::new(op(&lhs.array, &rhs.array)?, axes)
    }

    /// Elementwise sum, broadcasting by axis name
    pub fn add(&self, other: &NamedArray) -> Result<Self> {
        self.zip_with(other, |a, b| a.add(b))
    }

    pub fn sub(&self, other: &NamedArray) -> Result<Self> {
        self.zip_with(other, |a, b| a.sub(b))
    }

    pub fn mul(&self, other: &NamedArray) -> Result<Self> {
        self.zip_with(other, |a, b| a.mul(b))
    }

    pub fn div(&self, other: &NamedArray) -> Result<Self> {
        self.zip_with(other, |a, b| a.div(b))
    }

    /// `self * mul + add`
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        self.map(|t| t.affine(mul, add))
    }

    /// Contracts `contract` between `self` and `other`.
    ///
    /// Axes present in both operands but not contracted are batch axes. The result
    /// carries the batch axes, then the free axes of `self`, then the free axes of
    /// `other`.
    pub fn dot(&self, other: &NamedArray, contract: &[&str]) -> Result<Self> {
        let mut contracted = Vec::with_capacity(contract.len());
        for name in contract {
            let lhs = self.axis(name)?;
            let rhs = other.axis(name)?;
            if lhs.size != rhs.size {
                return Err(Error::Axis(format!("cannot contract {lhs} with {rhs}")));
            }
            contracted.push(lhs.clone());
        }

        let mut batch = Vec::new();
        let mut lhs_free = Vec::new();
        for axis in &self.axes {
            if contract.contains(&axis.name.as_str()) {
                continue;
            }
            match other.axis_index(&axis.name) {
                Some(i) if other.axes[i].size == axis.size => batch.push(axis.clone()),
                Some(i) => {
                    return Err(Error::Axis(format!(
                        "batch axis {axis} does not match {}",
                        other.axes[i]
                    )));
                }
                None => lhs_free.push(axis.clone()),
            }
        }
        let rhs_free: Vec<Axis> = other
            .axes
            .iter()
            .filter(|a| !contract.contains(&a.name.as_str()) && !self.has_axis(&a.name))
            .cloned()
            .collect();

        let names = |group: &[Axis]| -> Vec<String> { group.iter().map(|a| a.name.clone()).collect() };
        let lhs_order = [names(&batch), names(&lhs_free), names(&contracted)].concat();
        let rhs_order = [names(&batch), names(&contracted), names(&rhs_free)].concat();
        let lhs_order: Vec<&str> = lhs_order.iter().map(String::as_str).collect();
        let rhs_order: Vec<&str> = rhs_order.iter().map(String::as_str).collect();

        let (s, m, k, n) = (
            axis_product(&batch),
            axis_product(&lhs_free),
            axis_product(&contracted),
            axis_product(&rhs_free),
        );
        let lhs = self
            .rearrange(&lhs_order)?
            .array
            .reshape((s, m, k))?
            .contiguous()?;
        let rhs = other
            .rearrange(&rhs_order)?
            .array
            .reshape((s, k, n))?
            .contiguous()?;
        let out = lhs.matmul(&rhs)?;

        let axes = [batch, lhs_free, rhs_free].concat();
        check_unique(&axes)?;
        Self::new(out.reshape(axis_sizes(&axes))?, axes)
    }

    fn reduce(
        &self,
        axes: &[&str],
        op: impl Fn(&Tensor, usize) -> candle_core::Result<Tensor>,
    ) -> Result<Self> {
        let mut dims = axes
            .iter()
            .map(|name| self.resolve(name))
            .collect::<Result<Vec<_>>>()?;
        dims.sort_unstable_by(|a, b| b.cmp(a));
        dims.dedup();
        let mut array = self.local()?.clone();
        for &dim in &dims {
            array = op(&array, dim)?;
        }
        let remaining = self
            .axes
            .iter()
            .enumerate()
            .filter(|(i, _)| !dims.contains(i))
            .map(|(_, a)| a.clone())
            .collect();
        Self::new(array, remaining)
    }

    pub fn sum(&self, axes: &[&str]) -> Result<Self> {
        self.reduce(axes, |t, d| t.sum(d))
    }

    pub fn mean(&self, axes: &[&str]) -> Result<Self> {
        self.reduce(axes, |t, d| t.mean(d))
    }

    pub fn max(&self, axes: &[&str]) -> Result<Self> {
        self.reduce(axes, |t, d| t.max(d))
    }

    /// Numerically stable softmax over `axis`
    pub fn softmax(&self, axis: &str) -> Result<Self> {
        let dim = self.resolve(axis)?;
        let x = self.local()?;
        let max = x.max_keepdim(dim)?;
        let exp = x.broadcast_sub(&max)?.exp()?;
        let total = exp.sum_keepdim(dim)?;
        self.with_array(exp.broadcast_div(&total)?)
    }

    pub fn log_softmax(&self, axis: &str) -> Result<Self> {
        let dim = self.resolve(axis)?;
        let x = self.local()?;
        let max = x.max_keepdim(dim)?;
        let shifted = x.broadcast_sub(&max)?;
        let log_total = shifted.exp()?.sum_keepdim(dim)?.log()?;
        self.with_array(shifted.broadcast_sub(&log_total)?)
    }

    /// Local shard of `self` owned by `rank` under `sharding`
    pub fn shard(&self, sharding: Sharding, rank: usize) -> Result<Self> {
        let ranges = sharding.local_ranges(&self.shape(), rank)?;
        let mut local = self.local()?.clone();
        for (dim, &(start, len)) in ranges.iter().enumerate() {
            if len != self.axes[dim].size {
                local = local.narrow(dim, start, len)?;
            }
        }
        Self::sharded(local, self.axes.clone(), sharding, rank)
    }
}

impl fmt::Display for NamedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamedArray{}", describe(&self.axes))?;
        if let Some(sharding) = &self.sharding {
            write!(f, " sharded {}", sharding.spec())?;
        }
        Ok(())
    }
}
