//! Axial - named-axis module trees for distributed training
//!
//! This library provides:
//! - Named-axis tensors over candle (`NamedArray`)
//! - Module trees with a flat state-dict codec, key maps and copy-with loading
//! - Linear-layer flattening and stacked-block adapters for foreign layouts
//! - Resource-partition inference and sharding over a logical process mesh
//! - Collectives (local, in-process threads, NCCL) and cross-host gather
//! - Safetensors checkpoints written by the coordinator
//! - Sharded gradient accumulation over micro-batches

pub mod checkpoint;
pub mod distributed;
pub mod error;
pub mod grad_accum;
pub mod init;
pub mod named;
pub mod nn;
pub mod partition;
pub mod state_dict;
pub mod tree;

pub use checkpoint::{CheckpointWriter, load_state_dict, to_portable_state_dict, write_state_dict};
pub use distributed::{
    Collective, DistributedConfig, LocalCollective, NcclCollective, ProcessMesh,
    ThreadCollective, all_gather_named, gather_tree,
};
pub use error::{Error, Result};
pub use grad_accum::{accumulate_gradients_sharded, value_and_grad};
pub use init::{Initializer, MaterializedInit, PartitionedInit};
pub use named::{Axis, NamedArray};
pub use nn::{Embedding, LayerNorm, Linear};
pub use partition::{
    AxisMapping, DATA, MODEL, Mesh, PartitionSpec, PartitionSpecs, Sharding,
    infer_resource_partitions, shard_tree,
};
pub use state_dict::linear::{flatten_linear_layers, unflatten_linear_layers};
pub use state_dict::stack::{stack_state_dict, unstack_state_dict};
pub use state_dict::{FieldDescriptor, Module, StateDict, StateDictSerialize};
pub use tree::{Leaf, TensorTree};
