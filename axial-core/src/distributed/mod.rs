//! Collective communication
//!
//! Processes cooperate through the [`Collective`] trait: all-gather, all-reduce
//! and named barriers over groups of ranks. A [`ProcessMesh`] binds a collective
//! to the logical [`Mesh`] used for sharding, so a mesh axis name resolves to the
//! group of ranks that share every other coordinate.
//!
//! Backends:
//! - [`LocalCollective`]: a single process
//! - [`ThreadCollective`]: in-process ranks over channels, for tests and simulation
//! - [`NcclCollective`]: NCCL over CUDA (feature `nccl`)

mod nccl;
mod thread;

pub use nccl::NcclCollective;
pub use thread::ThreadCollective;

use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::named::NamedArray;
use crate::partition::{DATA, MODEL, Mesh};
use crate::tree::{Leaf, TensorTree};

/// Blocking collective operations. Every rank of `group` must make the same call
/// in the same order; there are no timeouts.
pub trait Collective {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Concatenates `tensor` from every rank of `group` along `dim`, in group order.
    fn all_gather(&self, tensor: &Tensor, dim: usize, group: &[usize]) -> Result<Tensor>;

    /// Elementwise sum of `tensor` over `group`
    fn all_reduce_sum(&self, tensor: &Tensor, group: &[usize]) -> Result<Tensor>;

    /// Blocks until every rank has entered the barrier called `name`.
    fn barrier(&self, name: &str) -> Result<()>;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
}

/// Distributed configuration for multi-process training
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Total number of processes
    pub world_size: usize,
    /// This process's rank (0 to world_size-1)
    pub rank: usize,
    /// Path to communication file for NCCL ID exchange
    pub comm_file: String,
    /// Processes per model replica; the rest of the world is data parallel
    #[serde(default = "default_model_parallelism")]
    pub model_parallelism: usize,
}

fn default_model_parallelism() -> usize {
    1
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            comm_file: "nccl_id.txt".to_string(),
            model_parallelism: 1,
        }
    }
}

impl DistributedConfig {
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    /// `data x model` mesh covering the world
    pub fn mesh(&self) -> Result<Mesh> {
        let model = self.model_parallelism.max(1);
        if self.world_size % model != 0 {
            return Err(Error::Partition(format!(
                "model parallelism {model} does not divide world size {}",
                self.world_size
            )));
        }
        Mesh::new([(DATA, self.world_size / model), (MODEL, model)])
    }
}

fn check_local_group(group: &[usize]) -> Result<()> {
    if !matches!(group, [0]) {
        return Err(Error::Collective(format!(
            "group {group:?} is not valid in a single-process run"
        )));
    }
    Ok(())
}

/// Collective for a world of one
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, tensor: &Tensor, _dim: usize, group: &[usize]) -> Result<Tensor> {
        check_local_group(group)?;
        Ok(tensor.clone())
    }

    fn all_reduce_sum(&self, tensor: &Tensor, group: &[usize]) -> Result<Tensor> {
        check_local_group(group)?;
        Ok(tensor.clone())
    }

    fn barrier(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// A collective bound to the mesh its shardings refer to
#[derive(Clone)]
pub struct ProcessMesh {
    comm: Arc<dyn Collective>,
    mesh: Arc<Mesh>,
}

impl ProcessMesh {
    pub fn new(comm: Arc<dyn Collective>, mesh: Mesh) -> Result<Self> {
        if mesh.num_processes() != comm.world_size() {
            return Err(Error::Collective(format!(
                "mesh {mesh} needs {} processes but the world has {}",
                mesh.num_processes(),
                comm.world_size()
            )));
        }
        Ok(Self {
            comm,
            mesh: Arc::new(mesh),
        })
    }

    /// Single process, one-element data axis
    pub fn local() -> Self {
        Self {
            comm: Arc::new(LocalCollective),
            mesh: Arc::new(Mesh::data_parallel(1)),
        }
    }

    pub fn comm(&self) -> &dyn Collective {
        self.comm.as_ref()
    }

    /// Shared handle to the collective, for owners that outlive this mesh
    pub fn collective(&self) -> Arc<dyn Collective> {
        self.comm.clone()
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    pub fn is_main_process(&self) -> bool {
        self.comm.is_main_process()
    }

    /// Ranks sharing every coordinate with this process except along `axis`
    pub fn group_along(&self, axis: &str) -> Result<Vec<usize>> {
        self.mesh.group_along(self.rank(), axis)
    }
}

impl fmt::Debug for ProcessMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMesh")
            .field("rank", &self.rank())
            .field("mesh", &self.mesh)
            .finish()
    }
}

/// Reassembles a sharded array by all-gathering every partitioned dimension over
/// the process group of its mesh axis. Fully addressable arrays are returned as
/// is.
pub fn all_gather_named(array: &NamedArray, comm: &dyn Collective) -> Result<NamedArray> {
    let Some(sharding) = array.sharding() else {
        return Ok(array.clone());
    };
    if !sharding.is_partitioned() {
        return Ok(array.clone());
    }
    let mut local = array.array().clone();
    for (dim, mesh_axis) in sharding.spec().dims().iter().enumerate() {
        let Some(mesh_axis) = mesh_axis else {
            continue;
        };
        let group = sharding.mesh().group_along(comm.rank(), mesh_axis)?;
        if group.len() > 1 {
            debug!(axis = %array.axes()[dim], mesh_axis = mesh_axis.as_str(), "gathering sharded dimension");
            local = comm.all_gather(&local.contiguous()?, dim, &group)?;
        }
    }
    NamedArray::new(local, array.axes().to_vec())
}

/// Gathers every sharded leaf of `tree`.
pub fn gather_tree<T: TensorTree>(tree: &T, comm: &dyn Collective) -> Result<T> {
    tree.map_leaves(None, &mut |_: Option<&str>, leaf: Leaf| match leaf {
        Leaf::Named(array) if !array.is_fully_addressable() => {
            Ok(Leaf::Named(all_gather_named(&array, comm)?))
        }
        Leaf::Named(array) => Ok(Leaf::Named(array.into_unsharded()?)),
        plain => Ok(plain),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::named::Axis;
    use crate::partition::{AxisMapping, shard_tree};
    use candle_core::{DType, Device};

    #[test]
    fn test_distributed_config_mesh() {
        let config = DistributedConfig {
            world_size: 4,
            model_parallelism: 2,
            ..Default::default()
        };
        let mesh = config.mesh().unwrap();
        assert_eq!(mesh.axis_size(DATA), Some(2));
        assert_eq!(mesh.axis_size(MODEL), Some(2));

        let bad = DistributedConfig {
            world_size: 3,
            model_parallelism: 2,
            ..Default::default()
        };
        assert!(bad.mesh().is_err());
    }

    #[test]
    fn test_local_collective() {
        let t = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(LocalCollective.all_gather(&t, 0, &[0]).unwrap().dims(), &[2]);
        assert!(LocalCollective.all_reduce_sum(&t, &[0, 1]).is_err());
        let mesh = ProcessMesh::local();
        assert_eq!(mesh.group_along(DATA).unwrap(), vec![0]);
        assert!(ProcessMesh::new(Arc::new(LocalCollective), Mesh::data_parallel(2)).is_err());
    }

    #[test]
    fn test_gather_sharded_tree_across_threads() {
        let world = 4;
        let axes = vec![Axis::new("rows", 4), Axis::new("cols", 6)];
        let full = Tensor::arange(0f32, 24f32, &Device::Cpu).unwrap().reshape((4, 6)).unwrap();
        let tree = vec![NamedArray::new(full.clone(), axes).unwrap()];
        let expected = full.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let handles: Vec<_> = ThreadCollective::group(world)
            .into_iter()
            .map(|comm| {
                let tree = tree.clone();
                std::thread::spawn(move || {
                    let mesh = Arc::new(Mesh::new([(DATA, 2), (MODEL, 2)]).unwrap());
                    let mapping = AxisMapping::new().with("rows", DATA).with("cols", MODEL);
                    let local = shard_tree(&tree, &mapping, &mesh, comm.rank()).unwrap();
                    assert_eq!(local[0].array().dims(), &[2, 3]);
                    let gathered = gather_tree(&local, &comm).unwrap();
                    assert!(gathered[0].is_fully_addressable());
                    gathered[0].array().flatten_all().unwrap().to_vec1::<f32>().unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
