//! Resource partitioning
//!
//! Logical axis names are bound to mesh axes through an [`AxisMapping`]. For every
//! named leaf of a module tree the mapping yields a [`PartitionSpec`] (one mesh
//! axis or `None` per dimension); unnamed leaves and unmapped axes are
//! replicated. A [`Sharding`] combines a spec with the [`Mesh`] it refers to and
//! knows which slice of the logical array each process owns.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::named::{Axis, NamedArray};
use crate::tree::{Leaf, TensorTree};

/// Conventional mesh axis for data parallelism
pub const DATA: &str = "data";
/// Conventional mesh axis for model (tensor) parallelism
pub const MODEL: &str = "model";

/// Logical axis name -> mesh axis name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AxisMapping(BTreeMap<String, String>);

impl AxisMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, axis: impl Into<String>, mesh_axis: impl Into<String>) -> Self {
        self.insert(axis, mesh_axis);
        self
    }

    pub fn insert(&mut self, axis: impl Into<String>, mesh_axis: impl Into<String>) {
        self.0.insert(axis.into(), mesh_axis.into());
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0.get(axis).map(String::as_str)
    }

    /// Logical axes bound to `mesh_axis`
    pub fn axes_on<'a>(&'a self, mesh_axis: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(_, m)| m.as_str() == mesh_axis)
            .map(|(a, _)| a.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(a, m)| (a.as_str(), m.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AxisMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// One mesh axis (or `None` for replicated) per array dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionSpec(Vec<Option<String>>);

impl PartitionSpec {
    pub fn new(dims: Vec<Option<String>>) -> Self {
        Self(dims)
    }

    pub fn replicated(rank: usize) -> Self {
        Self(vec![None; rank])
    }

    pub fn for_axes(axes: &[Axis], mapping: &AxisMapping) -> Self {
        Self(
            axes.iter()
                .map(|a| mapping.get(&a.name).map(str::to_string))
                .collect(),
        )
    }

    pub fn dims(&self) -> &[Option<String>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_replicated(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .0
            .iter()
            .map(|d| d.as_deref().unwrap_or("None"))
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Partition specs keyed by state-dict path
pub type PartitionSpecs = BTreeMap<String, PartitionSpec>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshAxis {
    pub name: String,
    pub size: usize,
}

/// Logical arrangement of processes; rank `r` sits at the row-major coordinates
/// of `r` over the axis sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mesh {
    axes: Vec<MeshAxis>,
}

impl Mesh {
    pub fn new<S: Into<String>>(axes: impl IntoIterator<Item = (S, usize)>) -> Result<Self> {
        let axes: Vec<MeshAxis> = axes
            .into_iter()
            .map(|(name, size)| MeshAxis {
                name: name.into(),
                size,
            })
            .collect();
        for (i, axis) in axes.iter().enumerate() {
            if axis.size == 0 {
                return Err(Error::Partition(format!("mesh axis '{}' has size 0", axis.name)));
            }
            if axes[..i].iter().any(|a| a.name == axis.name) {
                return Err(Error::Partition(format!("mesh axis '{}' declared twice", axis.name)));
            }
        }
        Ok(Self { axes })
    }

    /// One-dimensional mesh over [`DATA`]
    pub fn data_parallel(size: usize) -> Self {
        Self {
            axes: vec![MeshAxis {
                name: DATA.to_string(),
                size: size.max(1),
            }],
        }
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    pub fn num_processes(&self) -> usize {
        self.axes.iter().map(|a| a.size).product()
    }

    pub fn axis_size(&self, name: &str) -> Option<usize> {
        self.axes.iter().find(|a| a.name == name).map(|a| a.size)
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.axes
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| Error::Partition(format!("mesh {self} has no axis '{name}'")))
    }

    pub fn coordinates(&self, rank: usize) -> Result<Vec<usize>> {
        if rank >= self.num_processes() {
            return Err(Error::Partition(format!("rank {rank} outside mesh {self}")));
        }
        let mut rest = rank;
        let mut coords = vec![0; self.axes.len()];
        for (i, axis) in self.axes.iter().enumerate().rev() {
            coords[i] = rest % axis.size;
            rest /= axis.size;
        }
        Ok(coords)
    }

    pub fn coordinate(&self, rank: usize, axis: &str) -> Result<usize> {
        let index = self.position(axis)?;
        Ok(self.coordinates(rank)?[index])
    }

    fn rank_of(&self, coords: &[usize]) -> usize {
        coords
            .iter()
            .zip(&self.axes)
            .fold(0, |rank, (&c, axis)| rank * axis.size + c)
    }

    /// Ranks that share every coordinate with `rank` except along `axis`, ordered
    /// by their coordinate on `axis`.
    pub fn group_along(&self, rank: usize, axis: &str) -> Result<Vec<usize>> {
        let index = self.position(axis)?;
        let coords = self.coordinates(rank)?;
        Ok((0..self.axes[index].size)
            .map(|c| {
                let mut other = coords.clone();
                other[index] = c;
                self.rank_of(&other)
            })
            .collect())
    }
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .axes
            .iter()
            .map(|a| format!("{}={}", a.name, a.size))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// A partition spec bound to a mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sharding {
    mesh: Arc<Mesh>,
    spec: PartitionSpec,
}

impl Sharding {
    pub fn new(mesh: Arc<Mesh>, spec: PartitionSpec) -> Result<Self> {
        let mut seen: Vec<&str> = Vec::new();
        for mesh_axis in spec.dims().iter().flatten() {
            if mesh.axis_size(mesh_axis).is_none() {
                return Err(Error::Partition(format!(
                    "spec {spec} names unknown mesh axis '{mesh_axis}' of {mesh}"
                )));
            }
            if seen.contains(&mesh_axis.as_str()) {
                return Err(Error::Partition(format!(
                    "spec {spec} uses mesh axis '{mesh_axis}' for more than one dimension"
                )));
            }
            seen.push(mesh_axis);
        }
        Ok(Self { mesh, spec })
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn spec(&self) -> &PartitionSpec {
        &self.spec
    }

    /// True when at least one dimension is split across more than one process
    pub fn is_partitioned(&self) -> bool {
        self.spec
            .dims()
            .iter()
            .flatten()
            .any(|m| self.mesh.axis_size(m).unwrap_or(1) > 1)
    }

    /// `(start, len)` per dimension of the slice of `global` owned by `rank`
    pub fn local_ranges(&self, global: &[usize], rank: usize) -> Result<Vec<(usize, usize)>> {
        if global.len() != self.spec.len() {
            return Err(Error::Partition(format!(
                "spec {} does not fit an array of rank {}",
                self.spec,
                global.len()
            )));
        }
        global
            .iter()
            .zip(self.spec.dims())
            .map(|(&size, dim)| match dim {
                None => Ok((0, size)),
                Some(mesh_axis) => {
                    let parts = self.mesh.axis_size(mesh_axis).unwrap_or(1);
                    if size % parts != 0 {
                        return Err(Error::Partition(format!(
                            "dimension of size {size} cannot be split {parts} ways along '{mesh_axis}'"
                        )));
                    }
                    let len = size / parts;
                    let coord = self.mesh.coordinate(rank, mesh_axis)?;
                    Ok((coord * len, len))
                }
            })
            .collect()
    }
}

/// Partition spec for every leaf of `tree`, keyed by state-dict path.
///
/// Named leaves get one entry per axis from `mapping`; plain tensors are fully
/// replicated.
pub fn infer_resource_partitions<T: TensorTree>(
    tree: &T,
    mapping: &AxisMapping,
) -> Result<PartitionSpecs> {
    let mut specs = PartitionSpecs::new();
    tree.visit_leaves(None, &mut |path: Option<&str>, leaf: Leaf| {
        let spec = match &leaf {
            Leaf::Named(array) => PartitionSpec::for_axes(array.axes(), mapping),
            Leaf::Plain(tensor) => PartitionSpec::replicated(tensor.rank()),
        };
        specs.insert(path.unwrap_or_default().to_string(), spec);
        Ok(())
    })?;
    Ok(specs)
}

/// Replaces every named leaf of a fully addressable `tree` by the shard `rank`
/// owns under `mapping`.
pub fn shard_tree<T: TensorTree>(
    tree: &T,
    mapping: &AxisMapping,
    mesh: &Arc<Mesh>,
    rank: usize,
) -> Result<T> {
    tree.map_leaves(None, &mut |path: Option<&str>, leaf: Leaf| match leaf {
        Leaf::Named(array) => {
            let sharding = Sharding::new(mesh.clone(), PartitionSpec::for_axes(array.axes(), mapping))?;
            if !sharding.is_partitioned() {
                return Ok(Leaf::Named(array));
            }
            debug!(key = path.unwrap_or_default(), spec = %sharding.spec(), "sharding leaf");
            Ok(Leaf::Named(array.shard(sharding, rank)?))
        }
        plain => Ok(plain),
    })
}

/// Sharding of `array` under `mapping`, if any dimension is partitioned
pub fn sharding_for(array: &NamedArray, mapping: &AxisMapping, mesh: &Arc<Mesh>) -> Result<Option<Sharding>> {
    let sharding = Sharding::new(mesh.clone(), PartitionSpec::for_axes(array.axes(), mapping))?;
    Ok(sharding.is_partitioned().then_some(sharding))
}
