//! Checkpoint persistence
//!
//! Checkpoints are safetensors archives holding a flat state dict, tagged with
//! `{"format": "pt"}` metadata. Before a module is written every sharded leaf is
//! all-gathered and every leaf is copied to host memory, so the archive holds
//! dense arrays only.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use tracing::{debug, info, warn};

use crate::distributed::{Collective, all_gather_named};
use crate::error::{Error, Result};
use crate::state_dict::{StateDict, StateDictSerialize};
use crate::tree::{Leaf, TensorTree};

pub const FORMAT_KEY: &str = "format";
pub const FORMAT: &str = "pt";

/// State dict of `module` with every leaf gathered and on the host.
///
/// Every process must call this; sharded leaves are all-gathered over the
/// process groups of their mesh axes.
pub fn to_portable_state_dict<M: StateDictSerialize + TensorTree>(
    module: &M,
    prefix: Option<&str>,
    comm: &dyn Collective,
) -> Result<StateDict> {
    let portable = module.map_leaves(None, &mut |path: Option<&str>, leaf: Leaf| match leaf {
        Leaf::Named(array) if !array.is_fully_addressable() => {
            debug!(key = path.unwrap_or_default(), "gathering sharded leaf");
            Ok(Leaf::Named(all_gather_named(&array, comm)?.to_host()?))
        }
        Leaf::Named(array) => Ok(Leaf::Named(array.into_unsharded()?.to_host()?)),
        Leaf::Plain(tensor) if tensor.device().is_cpu() => Ok(Leaf::Plain(tensor)),
        Leaf::Plain(tensor) => Ok(Leaf::Plain(tensor.to_device(&Device::Cpu)?)),
    })?;
    portable.to_state_dict(prefix)
}

/// Writes checkpoints from the coordinator and keeps every process in step.
///
/// The save counter advances once per save on every process and names the
/// barrier that follows each write, so mismatched saves are detected by
/// collectives that check barrier names.
pub struct CheckpointWriter {
    comm: Arc<dyn Collective>,
    save_count: usize,
}

impl CheckpointWriter {
    pub fn new(comm: Arc<dyn Collective>) -> Self {
        Self {
            comm,
            save_count: 0,
        }
    }

    pub fn save_count(&self) -> usize {
        self.save_count
    }

    /// Drops `None` entries, writes the archive on process 0, then waits for every
    /// process at the barrier `"save {count}"`.
    pub fn save(&mut self, state_dict: StateDict, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let state_dict = state_dict.without_none();
        if self.comm.is_main_process() {
            write_state_dict(&state_dict, path)?;
            info!("Saved {} tensors to {:?}", state_dict.len(), path);
        }
        self.comm.barrier(&format!("save {}", self.save_count))?;
        self.save_count += 1;
        Ok(())
    }

    /// Gathers `module` and saves it under `prefix`.
    pub fn save_module<M: StateDictSerialize + TensorTree>(
        &mut self,
        module: &M,
        prefix: Option<&str>,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let state_dict = to_portable_state_dict(module, prefix, self.comm.as_ref())?;
        self.save(state_dict, path)
    }
}

fn to_safetensors_dtype(dtype: DType) -> Result<Dtype> {
    Ok(match dtype {
        DType::U8 => Dtype::U8,
        DType::U32 => Dtype::U32,
        DType::I64 => Dtype::I64,
        DType::BF16 => Dtype::BF16,
        DType::F16 => Dtype::F16,
        DType::F32 => Dtype::F32,
        DType::F64 => Dtype::F64,
        #[allow(unreachable_patterns)]
        other => {
            return Err(Error::Structure(format!(
                "dtype {other:?} cannot be stored in a checkpoint"
            )));
        }
    })
}

fn from_safetensors_dtype(dtype: Dtype) -> Result<DType> {
    Ok(match dtype {
        Dtype::U8 => DType::U8,
        Dtype::U32 => DType::U32,
        Dtype::I64 => DType::I64,
        Dtype::BF16 => DType::BF16,
        Dtype::F16 => DType::F16,
        Dtype::F32 => DType::F32,
        Dtype::F64 => DType::F64,
        other => {
            return Err(Error::Structure(format!(
                "checkpoint dtype {other:?} is not supported"
            )));
        }
    })
}

fn le_bytes<T, const N: usize>(values: Vec<T>, to_bytes: fn(T) -> [u8; N]) -> Vec<u8> {
    values.into_iter().flat_map(to_bytes).collect()
}

fn tensor_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    Ok(match tensor.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?,
        DType::U32 => le_bytes(flat.to_vec1::<u32>()?, u32::to_le_bytes),
        DType::I64 => le_bytes(flat.to_vec1::<i64>()?, i64::to_le_bytes),
        DType::BF16 => le_bytes(flat.to_vec1::<half::bf16>()?, half::bf16::to_le_bytes),
        DType::F16 => le_bytes(flat.to_vec1::<half::f16>()?, half::f16::to_le_bytes),
        DType::F32 => le_bytes(flat.to_vec1::<f32>()?, f32::to_le_bytes),
        DType::F64 => le_bytes(flat.to_vec1::<f64>()?, f64::to_le_bytes),
        #[allow(unreachable_patterns)]
        other => {
            return Err(Error::Structure(format!(
                "dtype {other:?} cannot be stored in a checkpoint"
            )));
        }
    })
}

/// Writes `state_dict` to a safetensors archive tagged with the checkpoint format.
/// `None` entries are skipped.
pub fn write_state_dict(state_dict: &StateDict, path: &Path) -> Result<()> {
    let mut buffers = Vec::with_capacity(state_dict.len());
    for (key, tensor) in state_dict.iter() {
        let Some(tensor) = tensor else {
            continue;
        };
        let tensor = tensor.to_device(&Device::Cpu)?;
        buffers.push((
            key.to_string(),
            to_safetensors_dtype(tensor.dtype())?,
            tensor.dims().to_vec(),
            tensor_bytes(&tensor)?,
        ));
    }
    let views = buffers
        .iter()
        .map(|(key, dtype, shape, bytes)| Ok((key.as_str(), TensorView::new(*dtype, shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>>>()?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let metadata = HashMap::from([(FORMAT_KEY.to_string(), FORMAT.to_string())]);
    safetensors::serialize_to_file(views, Some(metadata), path)?;
    Ok(())
}

/// Reads a safetensors archive into a state dict, placing tensors on `device`.
pub fn load_state_dict(path: impl AsRef<Path>, device: &Device) -> Result<StateDict> {
    let path = path.as_ref();
    let buffer = std::fs::read(path)?;
    let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
    match metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(FORMAT_KEY))
    {
        Some(format) if format == FORMAT => {}
        Some(format) => warn!("Checkpoint {:?} has format '{}', expected '{}'", path, format, FORMAT),
        None => warn!("Checkpoint {:?} has no format tag", path),
    }

    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut state_dict = StateDict::new();
    for (name, view) in tensors.tensors() {
        let dtype = from_safetensors_dtype(view.dtype())?;
        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?;
        state_dict.insert(name, tensor);
    }
    info!("Loaded {} tensors from {:?}", state_dict.len(), path);
    Ok(state_dict)
}

/// Format tag stored in an archive's metadata, if any
pub fn read_format(path: impl AsRef<Path>) -> Result<Option<String>> {
    let buffer = std::fs::read(path)?;
    let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
    Ok(metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(FORMAT_KEY).cloned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalCollective, ThreadCollective};
    use crate::named::{Axis, NamedArray};
    use crate::partition::{AxisMapping, DATA, Mesh, shard_tree};
    use tempfile::TempDir;

    #[derive(Debug, Clone)]
    struct Tiny {
        weight: NamedArray,
        counts: Tensor,
        missing: Option<NamedArray>,
    }

    crate::module!(Tiny { weight => "w", counts, missing });

    fn tiny() -> Tiny {
        let t = Tensor::arange(0f32, 8f32, &Device::Cpu).unwrap().reshape((4, 2)).unwrap();
        Tiny {
            weight: NamedArray::new(t, vec![Axis::new("rows", 4), Axis::new("cols", 2)]).unwrap(),
            counts: Tensor::new(&[1u32, 2, 3], &Device::Cpu).unwrap(),
            missing: None,
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt").join("model.safetensors");
        let mut writer = CheckpointWriter::new(Arc::new(LocalCollective));

        let mut sd = StateDict::new();
        sd.insert_optional("none", None);
        sd.insert("half", Tensor::ones(3, DType::F16, &Device::Cpu).unwrap());
        writer.save(sd, &path).unwrap();
        writer.save_module(&tiny(), Some("model"), &path).unwrap();
        assert_eq!(writer.save_count(), 2);

        assert_eq!(read_format(&path).unwrap().as_deref(), Some(FORMAT));
        let loaded = load_state_dict(&path, &Device::Cpu).unwrap();
        let keys: Vec<&str> = loaded.keys().collect();
        assert_eq!(keys, vec!["model.counts", "model.w"]);
        assert_eq!(loaded.get("model.counts").unwrap().to_vec1::<u32>().unwrap(), vec![1, 2, 3]);

        let restored = tiny().from_state_dict(&loaded, Some("model")).unwrap();
        assert_eq!(
            restored.weight.array().to_vec2::<f32>().unwrap(),
            tiny().weight.array().to_vec2::<f32>().unwrap()
        );
        assert!(restored.missing.is_none());
    }

    #[test]
    fn test_none_entries_are_dropped_and_half_precision_survives() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("half.safetensors");
        let mut sd = StateDict::new();
        sd.insert_optional("gone", None);
        sd.insert("h", Tensor::new(&[1.5f32, -2.0], &Device::Cpu).unwrap().to_dtype(DType::BF16).unwrap());
        CheckpointWriter::new(Arc::new(LocalCollective)).save(sd, &path).unwrap();
        let loaded = load_state_dict(&path, &Device::Cpu).unwrap();
        assert!(!loaded.contains_key("gone"));
        let h = loaded.get("h").unwrap();
        assert_eq!(h.dtype(), DType::BF16);
        assert_eq!(h.to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn test_only_rank_zero_writes_sharded_checkpoint() {
        let dir = TempDir::new().unwrap();
        let world = 2;
        let handles: Vec<_> = ThreadCollective::group(world)
            .into_iter()
            .map(|comm| {
                let dir = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let rank = comm.rank();
                    let comm: Arc<dyn Collective> = Arc::new(comm);
                    let mesh = Arc::new(Mesh::new([(DATA, 2)]).unwrap());
                    let mapping = AxisMapping::new().with("rows", DATA);
                    let local = shard_tree(&tiny(), &mapping, &mesh, rank).unwrap();
                    assert_eq!(local.weight.array().dims(), &[2, 2]);

                    let mut writer = CheckpointWriter::new(comm);
                    let path = dir.join(format!("rank{rank}.safetensors"));
                    writer.save_module(&local, None, &path).unwrap();
                    writer.save_module(&local, None, &path).unwrap();
                    (writer.save_count(), path.exists())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![(2, true), (2, false)]);

        let loaded = load_state_dict(dir.path().join("rank0.safetensors"), &Device::Cpu).unwrap();
        assert_eq!(loaded.get("w").unwrap().dims(), &[4, 2]);
        assert_eq!(
            loaded.get("w").unwrap().to_vec2::<f32>().unwrap(),
            tiny().weight.array().to_vec2::<f32>().unwrap()
        );
    }
}
