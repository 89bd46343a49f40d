//! In-process collective
//!
//! Every rank is a thread and ranks exchange tensors over crossbeam channels.
//! Messages from a rank arrive in the order that rank sent them; a message that
//! arrives before its receiver asks for it is parked per sender.

use std::collections::VecDeque;

use candle_core::Tensor;
use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use super::Collective;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Payload {
    Tensor(Tensor),
    Barrier(String),
}

struct Message {
    from: usize,
    payload: Payload,
}

pub struct ThreadCollective {
    rank: usize,
    peers: Vec<Sender<Message>>,
    inbox: Receiver<Message>,
    parked: Mutex<Vec<VecDeque<Payload>>>,
}

impl ThreadCollective {
    /// One connected collective per rank; move each into its own thread.
    pub fn group(world_size: usize) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self {
                rank,
                peers: senders.clone(),
                inbox,
                parked: Mutex::new((0..world_size).map(|_| VecDeque::new()).collect()),
            })
            .collect()
    }

    fn send(&self, to: usize, payload: Payload) -> Result<()> {
        self.peers[to]
            .send(Message {
                from: self.rank,
                payload,
            })
            .map_err(|_| Error::Collective(format!("rank {to} has shut down")))
    }

    fn receive(&self, from: usize) -> Result<Payload> {
        let mut parked = self.parked.lock();
        if let Some(payload) = parked[from].pop_front() {
            return Ok(payload);
        }
        loop {
            let message = self
                .inbox
                .recv()
                .map_err(|_| Error::Collective(format!("rank {from} has shut down")))?;
            if message.from == from {
                return Ok(message.payload);
            }
            parked[message.from].push_back(message.payload);
        }
    }

    fn check_group(&self, group: &[usize]) -> Result<()> {
        if !group.contains(&self.rank) || group.iter().any(|&r| r >= self.peers.len()) {
            return Err(Error::Collective(format!(
                "rank {} cannot take part in group {group:?}",
                self.rank
            )));
        }
        Ok(())
    }

    /// `tensor` from every member of `group`, in group order
    fn exchange(&self, tensor: &Tensor, group: &[usize]) -> Result<Vec<Tensor>> {
        self.check_group(group)?;
        for &peer in group {
            if peer != self.rank {
                self.send(peer, Payload::Tensor(tensor.clone()))?;
            }
        }
        group
            .iter()
            .map(|&peer| {
                if peer == self.rank {
                    return Ok(tensor.clone());
                }
                match self.receive(peer)? {
                    Payload::Tensor(t) => Ok(t),
                    Payload::Barrier(name) => Err(Error::Collective(format!(
                        "rank {peer} entered barrier '{name}' during a tensor exchange"
                    ))),
                }
            })
            .collect()
    }
}

impl Collective for ThreadCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.peers.len()
    }

    fn all_gather(&self, tensor: &Tensor, dim: usize, group: &[usize]) -> Result<Tensor> {
        let parts = self.exchange(tensor, group)?;
        Ok(Tensor::cat(&parts, dim)?)
    }

    fn all_reduce_sum(&self, tensor: &Tensor, group: &[usize]) -> Result<Tensor> {
        let parts = self.exchange(tensor, group)?;
        let mut total = parts[0].clone();
        for part in &parts[1..] {
            total = total.add(part)?;
        }
        Ok(total)
    }

    fn barrier(&self, name: &str) -> Result<()> {
        for peer in 0..self.peers.len() {
            if peer != self.rank {
                self.send(peer, Payload::Barrier(name.to_string()))?;
            }
        }
        for peer in 0..self.peers.len() {
            if peer == self.rank {
                continue;
            }
            match self.receive(peer)? {
                Payload::Barrier(other) if other == name => {}
                Payload::Barrier(other) => {
                    return Err(Error::Collective(format!(
                        "rank {} entered barrier '{name}' but rank {peer} entered '{other}'",
                        self.rank
                    )));
                }
                Payload::Tensor(_) => {
                    return Err(Error::Collective(format!(
                        "rank {peer} sent a tensor while rank {} waited in barrier '{name}'",
                        self.rank
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    fn run<T: Send + 'static>(world: usize, f: impl Fn(ThreadCollective) -> T + Send + Sync + Copy + 'static) -> Vec<T> {
        let handles: Vec<_> = ThreadCollective::group(world)
            .into_iter()
            .map(|comm| thread::spawn(move || f(comm)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_all_reduce_and_gather() {
        let results = run(3, |comm| {
            let t = Tensor::new(&[comm.rank() as f32 + 1.0], &Device::Cpu).unwrap();
            let sum = comm.all_reduce_sum(&t, &[0, 1, 2]).unwrap().to_vec1::<f32>().unwrap();
            let gathered = comm.all_gather(&t, 0, &[0, 1, 2]).unwrap().to_vec1::<f32>().unwrap();
            (sum, gathered)
        });
        for (sum, gathered) in results {
            assert_eq!(sum, vec![6.0]);
            assert_eq!(gathered, vec![1.0, 2.0, 3.0]);
        }
    }

    #[test]
    fn test_subgroups() {
        let results = run(4, |comm| {
            let group = if comm.rank() % 2 == 0 { [0, 2] } else { [1, 3] };
            let t = Tensor::new(&[comm.rank() as f32], &Device::Cpu).unwrap();
            comm.all_reduce_sum(&t, &group).unwrap().to_vec1::<f32>().unwrap()[0]
        });
        assert_eq!(results, vec![2.0, 4.0, 2.0, 4.0]);
    }

    #[test]
    fn test_barrier_name_mismatch() {
        let results = run(2, |comm| {
            let name = if comm.rank() == 0 { "save 0" } else { "save 1" };
            comm.barrier(name).is_err()
        });
        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn test_rank_outside_group() {
        let results = run(2, |comm| comm.all_reduce_sum(&Tensor::new(&[1f32], &Device::Cpu).unwrap(), &[1]).is_err());
        assert_eq!(results, vec![true, false]);
    }
}
