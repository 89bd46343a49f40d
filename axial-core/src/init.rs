//! Parameter initialization
//!
//! Layers receive an [`Initializer`] when they are built. [`MaterializedInit`]
//! allocates full arrays. [`PartitionedInit`] allocates only the local shard of
//! every named array under an [`AxisMapping`], so a sharded model never exists
//! unsharded in memory.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};
use crate::named::{Axis, NamedArray, axis_sizes};
use crate::partition::{AxisMapping, Mesh, PartitionSpec, Sharding};

pub trait Initializer {
    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    fn zeros(&mut self, axes: &[Axis]) -> Result<NamedArray>;

    fn ones(&mut self, axes: &[Axis]) -> Result<NamedArray>;

    /// Samples from `N(0, std^2)`
    fn normal(&mut self, axes: &[Axis], std: f64) -> Result<NamedArray>;
}

fn sample_normal(
    rng: &mut StdRng,
    shape: &[usize],
    std: f64,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let normal = Normal::new(0.0f32, std as f32)
        .map_err(|e| Error::Init(format!("invalid standard deviation {std}: {e}")))?;
    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| normal.sample(rng)).collect();
    Ok(Tensor::from_vec(values, shape.to_vec(), device)?.to_dtype(dtype)?)
}

/// Allocates full arrays on one device from a seeded generator
pub struct MaterializedInit {
    device: Device,
    dtype: DType,
    rng: StdRng,
}

impl MaterializedInit {
    pub fn new(device: Device, seed: u64) -> Self {
        Self {
            device,
            dtype: DType::F32,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }
}

impl Initializer for MaterializedInit {
    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn zeros(&mut self, axes: &[Axis]) -> Result<NamedArray> {
        NamedArray::zeros(axes.to_vec(), self.dtype, &self.device)
    }

    fn ones(&mut self, axes: &[Axis]) -> Result<NamedArray> {
        NamedArray::ones(axes.to_vec(), self.dtype, &self.device)
    }

    fn normal(&mut self, axes: &[Axis], std: f64) -> Result<NamedArray> {
        let array = sample_normal(&mut self.rng, &axis_sizes(axes), std, self.dtype, &self.device)?;
        NamedArray::new(array, axes.to_vec())
    }
}

/// Allocates each named array directly at the shard shape owned by `rank`
///
/// Every array draws from its own stream, keyed by the seed, the order of the
/// call and the rank's coordinates along the mesh axes the array is split
/// over. Ranks holding the same shard, including every rank for a replicated
/// array, draw identical values.
pub struct PartitionedInit {
    device: Device,
    dtype: DType,
    seed: u64,
    draws: u64,
    mapping: AxisMapping,
    mesh: Arc<Mesh>,
    rank: usize,
}

/// SplitMix64 finalizer, used to combine stream keys
fn mix(key: u64, value: u64) -> u64 {
    let mut z = key ^ value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl PartitionedInit {
    pub fn new(device: Device, seed: u64, mapping: AxisMapping, mesh: Arc<Mesh>, rank: usize) -> Self {
        Self {
            device,
            dtype: DType::F32,
            seed,
            draws: 0,
            mapping,
            mesh,
            rank,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    fn local_shape(&self, axes: &[Axis]) -> Result<(Sharding, Vec<usize>)> {
        let sharding = Sharding::new(self.mesh.clone(), PartitionSpec::for_axes(axes, &self.mapping))?;
        let shape = sharding
            .local_ranges(&axis_sizes(axes), self.rank)?
            .into_iter()
            .map(|(_, len)| len)
            .collect();
        Ok((sharding, shape))
    }

    /// Generator for the next array; only the partitioned dimensions of
    /// `sharding` select the shard.
    fn shard_rng(&mut self, sharding: &Sharding) -> Result<StdRng> {
        let mut key = mix(self.seed, self.draws);
        self.draws += 1;
        for (dim, mesh_axis) in sharding.spec().dims().iter().enumerate() {
            if let Some(mesh_axis) = mesh_axis {
                let coordinate = self.mesh.coordinate(self.rank, mesh_axis)?;
                key = mix(key, ((dim as u64) << 32) | coordinate as u64);
            }
        }
        Ok(StdRng::seed_from_u64(key))
    }

    fn wrap(&self, array: Tensor, axes: &[Axis], sharding: Sharding) -> Result<NamedArray> {
        if sharding.is_partitioned() {
            NamedArray::sharded(array, axes.to_vec(), sharding, self.rank)
        } else {
            NamedArray::new(array, axes.to_vec())
        }
    }
}

impl Initializer for PartitionedInit {
    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn zeros(&mut self, axes: &[Axis]) -> Result<NamedArray> {
        let (sharding, shape) = self.local_shape(axes)?;
        let array = Tensor::zeros(shape, self.dtype, &self.device)?;
        self.wrap(array, axes, sharding)
    }

    fn ones(&mut self, axes: &[Axis]) -> Result<NamedArray> {
        let (sharding, shape) = self.local_shape(axes)?;
        let array = Tensor::ones(shape, self.dtype, &self.device)?;
        self.wrap(array, axes, sharding)
    }

    fn normal(&mut self, axes: &[Axis], std: f64) -> Result<NamedArray> {
        let (sharding, shape) = self.local_shape(axes)?;
        let mut rng = self.shard_rng(&sharding)?;
        let array = sample_normal(&mut rng, &shape, std, self.dtype, &self.device)?;
        self.wrap(array, axes, sharding)
    }
}
