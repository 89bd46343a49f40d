use anyhow::{Result, bail};
use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::io;
use std::path::Path;

use crate::io as file_io;
use crate::loss::LmExample;
use crate::tokenizer::Tokenizer;

/// A token stream cut into overlapping windows of `seq_len + 1` tokens
pub struct Dataset {
    tokens: Vec<u32>,
    seq_len: usize,
}

impl Dataset {
    pub fn new(tokens: Vec<u32>, seq_len: usize) -> Self {
        Self { tokens, seq_len }
    }

    /// Tokenizes `texts`, separating documents with the end-of-text token.
    pub fn from_texts<S: AsRef<str>>(texts: &[S], tokenizer: &Tokenizer, seq_len: usize) -> Result<Self> {
        let mut tokens = Vec::new();
        for text in texts {
            tokens.extend(tokenizer.encode(text.as_ref(), false)?);
            tokens.push(tokenizer.eos_token_id());
        }
        Ok(Self::new(tokens, seq_len))
    }

    /// Load dataset from JSONL files where each line has a "text" field.
    /// Supports .gz and .zst/.zstd compressed files.
    pub fn from_files<P: AsRef<Path>>(paths: &[P], tokenizer: &Tokenizer, seq_len: usize) -> Result<Self> {
        let mut texts = Vec::new();
        for path in paths {
            texts.extend(file_io::read_texts(file_io::open_file(path)?)?);
        }
        Self::from_texts(&texts, tokenizer, seq_len)
    }

    /// Load dataset from stdin (JSONL format).
    pub fn from_stdin(tokenizer: &Tokenizer, seq_len: usize) -> Result<Self> {
        let texts = file_io::read_texts(io::stdin().lock())?;
        Self::from_texts(&texts, tokenizer, seq_len)
    }

    pub fn len(&self) -> usize {
        self.tokens.len().saturating_sub(self.seq_len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Windows starting at `indices`, with targets shifted by one token
    pub fn get_batch(&self, indices: &[usize], device: &Device) -> Result<LmExample> {
        let batch_size = indices.len();
        let mut input_data = Vec::with_capacity(batch_size * self.seq_len);
        let mut target_data = Vec::with_capacity(batch_size * self.seq_len);

        for &start in indices {
            if start + self.seq_len >= self.tokens.len() {
                bail!("window {start} runs past the end of the dataset");
            }
            input_data.extend_from_slice(&self.tokens[start..start + self.seq_len]);
            target_data.extend_from_slice(&self.tokens[start + 1..start + self.seq_len + 1]);
        }

        let input = Tensor::from_vec(input_data, (batch_size, self.seq_len), device)?;
        let target = Tensor::from_vec(target_data, (batch_size, self.seq_len), device)?;
        Ok(LmExample::new(input, target)?)
    }
}

/// Batches of windows, optionally shuffled, split across data-parallel processes
///
/// Every process walks the same global order; process `shard` of `num_shards`
/// takes its own contiguous `batch_size` slice of each global batch.
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    shard: usize,
    num_shards: usize,
    indices: Vec<usize>,
    current_pos: usize,
}

impl DataLoader {
    pub fn new(dataset: Dataset, batch_size: usize, shuffle: bool) -> Self {
        let len = dataset.len();
        Self {
            dataset,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(0),
            shard: 0,
            num_shards: 1,
            indices: (0..len).collect(),
            current_pos: 0,
        }
    }

    /// Every process must use the same seed so shards stay disjoint.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_shard(mut self, shard: usize, num_shards: usize) -> Result<Self> {
        if num_shards == 0 || shard >= num_shards {
            bail!("invalid data shard {shard} of {num_shards}");
        }
        self.shard = shard;
        self.num_shards = num_shards;
        Ok(self)
    }

    fn global_batch(&self) -> usize {
        self.batch_size * self.num_shards
    }

    pub fn reset(&mut self) {
        self.current_pos = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len() / self.global_batch()
    }

    pub fn next_batch(&mut self, device: &Device) -> Result<Option<LmExample>> {
        let global = self.global_batch();
        if self.current_pos + global > self.indices.len() {
            return Ok(None);
        }

        let start = self.current_pos + self.shard * self.batch_size;
        let batch_indices = &self.indices[start..start + self.batch_size];
        self.current_pos += global;

        Ok(Some(self.dataset.get_batch(batch_indices, device)?))
    }
}
