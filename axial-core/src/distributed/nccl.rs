//! NCCL collective
//!
//! Multi-GPU collectives over NVIDIA's NCCL library. One communicator spans the
//! whole world, so only full-world groups are supported; meshes with more than
//! one non-trivial axis need a communicator per group.

use candle_core::Tensor;

use super::{Collective, DistributedConfig};
use crate::error::{Error, Result};

#[cfg(feature = "nccl")]
use cudarc::driver::safe::{CudaContext, CudaStream};
#[cfg(feature = "nccl")]
use cudarc::nccl::safe::{Comm, Id, ReduceOp};
#[cfg(feature = "nccl")]
use std::sync::Arc;

fn check_world_group(group: &[usize], world_size: usize) -> Result<()> {
    if group.len() != world_size || group.iter().enumerate().any(|(i, &r)| i != r) {
        return Err(Error::Collective(format!(
            "NCCL collectives only support the full world group, got {group:?}"
        )));
    }
    Ok(())
}

/// Tensors travel through NCCL as f32 buffers, which only holds float data.
fn check_float(tensor: &Tensor) -> Result<()> {
    if !tensor.dtype().is_float() {
        return Err(Error::Collective(format!(
            "NCCL collectives only carry float tensors, got {:?}",
            tensor.dtype()
        )));
    }
    Ok(())
}

#[cfg(feature = "nccl")]
fn nccl_error(context: &str, e: impl std::fmt::Debug) -> Error {
    Error::Collective(format!("{context}: {e:?}"))
}

/// NCCL communicator over the whole world
#[cfg(feature = "nccl")]
pub struct NcclCollective {
    comm: Comm,
    stream: Arc<CudaStream>,
    rank: usize,
    world_size: usize,
}

#[cfg(feature = "nccl")]
impl NcclCollective {
    /// Initialize NCCL communicator
    ///
    /// Rank 0 creates the NCCL ID and writes it to `config.comm_file`.
    /// Other ranks wait for the file and read the ID.
    pub fn new(config: &DistributedConfig) -> Result<Self> {
        use std::io::Write;

        let comm_file = std::path::PathBuf::from(&config.comm_file);

        let id = if config.rank == 0 {
            if comm_file.exists() {
                std::fs::remove_file(&comm_file)?;
            }

            let id = Id::new().map_err(|e| nccl_error("Failed to create NCCL ID", e))?;

            // Write to a temporary file then rename, so readers never see a partial ID
            let tmp_file = comm_file.with_extension("tmp");
            let mut file = std::fs::File::create(&tmp_file)?;
            file.write_all(&id.internal().iter().map(|&i| i as u8).collect::<Vec<_>>())?;
            std::fs::rename(&tmp_file, &comm_file)?;

            tracing::info!("Rank 0: Created NCCL ID and wrote to {:?}", comm_file);
            id
        } else {
            tracing::info!("Rank {}: Waiting for NCCL ID file...", config.rank);
            while !comm_file.exists() {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            std::thread::sleep(std::time::Duration::from_millis(100));

            let data = std::fs::read(&comm_file)?;
            let internal: [i8; 128] = data
                .into_iter()
                .map(|i| i as i8)
                .collect::<Vec<_>>()
                .try_into()
                .map_err(|_| Error::Collective("Invalid NCCL ID file".into()))?;

            tracing::info!("Rank {}: Read NCCL ID from {:?}", config.rank, comm_file);
            Id::uninit(internal)
        };

        // When CUDA_VISIBLE_DEVICES is set, the visible GPU is always device 0
        let ctx = CudaContext::new(0).map_err(|e| nccl_error("Failed to create CUDA context", e))?;
        let stream = ctx.default_stream();

        let comm = Comm::from_rank(stream.clone(), config.rank, config.world_size, id)
            .map_err(|e| nccl_error("Failed to create NCCL communicator", e.0))?;

        if config.rank == 0 {
            // Give the other ranks time to read the ID before removing it
            std::thread::sleep(std::time::Duration::from_secs(2));
            if comm_file.exists() {
                let _ = std::fs::remove_file(&comm_file);
            }
        }

        tracing::info!("Rank {}: NCCL communicator initialized", config.rank);

        Ok(Self {
            comm,
            stream,
            rank: config.rank,
            world_size: config.world_size,
        })
    }

    fn upload(&self, tensor: &Tensor) -> Result<cudarc::driver::CudaSlice<f32>> {
        check_float(tensor)?;
        let data: Vec<f32> = tensor
            .to_dtype(candle_core::DType::F32)?
            .flatten_all()?
            .to_vec1()?;
        self.stream
            .clone_htod(&data)
            .map_err(|e| nccl_error("Failed to copy data to GPU", e))
    }

    fn download(&self, buffer: &cudarc::driver::CudaSlice<f32>) -> Result<Vec<f32>> {
        self.stream
            .clone_dtoh(buffer)
            .map_err(|e| nccl_error("Failed to copy data from GPU", e))
    }
}

#[cfg(feature = "nccl")]
impl Collective for NcclCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, tensor: &Tensor, dim: usize, group: &[usize]) -> Result<Tensor> {
        check_world_group(group, self.world_size)?;
        let send = self.upload(tensor)?;
        let mut recv = self
            .stream
            .alloc_zeros::<f32>(tensor.elem_count() * self.world_size)
            .map_err(|e| nccl_error("Failed to allocate GPU buffer", e))?;
        self.comm
            .all_gather(&send, &mut recv)
            .map_err(|e| nccl_error("NCCL all-gather failed", e.0))?;

        // The receive buffer holds each rank's tensor back to back
        let mut shape = vec![self.world_size];
        shape.extend_from_slice(tensor.dims());
        let stacked = Tensor::from_vec(self.download(&recv)?, shape, tensor.device())?;
        let parts = (0..self.world_size)
            .map(|r| stacked.get(r))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, dim)?.to_dtype(tensor.dtype())?)
    }

    fn all_reduce_sum(&self, tensor: &Tensor, group: &[usize]) -> Result<Tensor> {
        check_world_group(group, self.world_size)?;
        let send = self.upload(tensor)?;
        let mut recv = self
            .stream
            .alloc_zeros::<f32>(tensor.elem_count())
            .map_err(|e| nccl_error("Failed to allocate GPU buffer", e))?;
        self.comm
            .all_reduce(&send, &mut recv, &ReduceOp::Sum)
            .map_err(|e| nccl_error("NCCL all-reduce failed", e.0))?;
        let result = Tensor::from_vec(self.download(&recv)?, tensor.shape(), tensor.device())?;
        Ok(result.to_dtype(tensor.dtype())?)
    }

    fn barrier(&self, name: &str) -> Result<()> {
        // A one-element all-reduce stands in for a barrier
        let dummy = self
            .stream
            .clone_htod(&[0.0f32])
            .map_err(|e| nccl_error("Failed to copy data to GPU", e))?;
        let mut out = self
            .stream
            .alloc_zeros::<f32>(1)
            .map_err(|e| nccl_error("Failed to allocate GPU buffer", e))?;
        self.comm
            .all_reduce(&dummy, &mut out, &ReduceOp::Sum)
            .map_err(|e| nccl_error(&format!("NCCL barrier '{name}' failed"), e.0))?;
        Ok(())
    }
}

/// Stub communicator for non-NCCL builds
#[cfg(not(feature = "nccl"))]
pub struct NcclCollective {
    rank: usize,
    world_size: usize,
}

#[cfg(not(feature = "nccl"))]
impl NcclCollective {
    pub fn new(_config: &DistributedConfig) -> Result<Self> {
        Err(Error::Collective(
            "NCCL support not enabled. Build with --features nccl".into(),
        ))
    }
}

#[cfg(not(feature = "nccl"))]
impl Collective for NcclCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, tensor: &Tensor, _dim: usize, group: &[usize]) -> Result<Tensor> {
        check_world_group(group, self.world_size)?;
        check_float(tensor)?;
        Ok(tensor.clone())
    }

    fn all_reduce_sum(&self, tensor: &Tensor, group: &[usize]) -> Result<Tensor> {
        check_world_group(group, self.world_size)?;
        check_float(tensor)?;
        Ok(tensor.clone())
    }

    fn barrier(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_world_groups_are_accepted() {
        assert!(check_world_group(&[0, 1, 2], 3).is_ok());
        assert!(check_world_group(&[0, 2], 3).is_err());
        assert!(check_world_group(&[1, 0], 2).is_err());
    }

    #[test]
    fn test_integer_tensors_are_refused() {
        let device = candle_core::Device::Cpu;
        assert!(check_float(&Tensor::new(&[1.5f32, 2.0], &device).unwrap()).is_ok());
        assert!(check_float(&Tensor::new(&[0.5f64], &device).unwrap()).is_ok());
        assert!(check_float(&Tensor::new(&[1u32, 2], &device).unwrap()).is_err());
        assert!(check_float(&Tensor::new(&[7i64], &device).unwrap()).is_err());
    }

    #[cfg(not(feature = "nccl"))]
    #[test]
    fn test_stub_refuses_to_start() {
        assert!(NcclCollective::new(&DistributedConfig::default()).is_err());
    }
}
