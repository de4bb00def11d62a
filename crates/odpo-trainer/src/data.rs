//! Prompt datasets and the prompt loader.
//!
//! Prompts arrive pre-tokenized. The loader left-pads every batch to its
//! longest prompt so that responses start at the same column on every row.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use mlx_rs::Array;
use odpo_core::{OdpoError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// One JSONL line of a prompt file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    /// Tokenized prompt.
    pub input_ids: Vec<i32>,
}

/// An in-memory collection of tokenized prompts.
#[derive(Debug, Clone, Default)]
pub struct PromptDataset {
    prompts: Vec<Vec<i32>>,
}

impl PromptDataset {
    /// Wrap already tokenized prompts.
    pub fn from_prompts(prompts: Vec<Vec<i32>>) -> Result<Self> {
        if let Some(idx) = prompts.iter().position(|p| p.is_empty()) {
            return Err(OdpoError::InvalidArgument(format!("prompt {idx} is empty")));
        }
        Ok(Self { prompts })
    }

    /// Load `{"input_ids": [...]}` lines from a JSONL file. Blank lines are skipped.
    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            OdpoError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open prompt file {}: {}", path.as_ref().display(), e),
            ))
        })?;

        let mut prompts = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: PromptRecord = serde_json::from_str(&line).map_err(|e| {
                OdpoError::Serialization(format!("line {}: {}", line_num + 1, e))
            })?;
            prompts.push(record.input_ids);
        }
        Self::from_prompts(prompts)
    }

    /// Number of prompts.
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    /// Whether the dataset has no prompts.
    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Prompt at `idx`.
    pub fn get(&self, idx: usize) -> Option<&[i32]> {
        self.prompts.get(idx).map(Vec::as_slice)
    }
}

/// Left-pad `prompts` with `pad_token_id` into a `[B, max_len]` array.
pub fn left_pad(prompts: &[&[i32]], pad_token_id: i32) -> Array {
    let width = prompts.iter().map(|p| p.len()).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(prompts.len() * width);
    for prompt in prompts {
        flat.extend(std::iter::repeat(pad_token_id).take(width - prompt.len()));
        flat.extend_from_slice(prompt);
    }
    Array::from_slice(&flat, &[prompts.len() as i32, width as i32])
}

/// Loader settings.
#[derive(Debug, Clone)]
pub struct PromptLoaderConfig {
    /// Prompts per batch on this worker.
    pub batch_size: usize,
    /// Shuffle on every pass.
    pub shuffle: bool,
    /// Shuffle seed, shared by all workers.
    pub seed: u64,
    /// Restart (and reshuffle) when a pass is exhausted.
    pub cycle: bool,
    /// Padding token.
    pub pad_token_id: i32,
    /// This worker's rank.
    pub rank: usize,
    /// Number of workers sharing the dataset.
    pub world_size: usize,
}

/// Batches prompts for one worker.
///
/// All workers shuffle identically. Each global step consumes `world_size`
/// consecutive batches and worker `rank` keeps the `rank`-th. Incomplete
/// steps at the end of a pass are dropped.
pub struct PromptLoader<'a> {
    dataset: &'a PromptDataset,
    config: PromptLoaderConfig,
    rng: StdRng,
    indices: Vec<usize>,
    position: usize,
}

impl<'a> PromptLoader<'a> {
    /// Create a loader.
    ///
    /// A cycling loader fails when the dataset cannot fill a single step. A
    /// single-pass loader over such a dataset simply yields no batches.
    pub fn new(dataset: &'a PromptDataset, config: PromptLoaderConfig) -> Result<Self> {
        if config.batch_size == 0 || config.world_size == 0 || config.rank >= config.world_size {
            return Err(OdpoError::InvalidArgument(format!(
                "invalid loader shape: batch_size={} rank={} world_size={}",
                config.batch_size, config.rank, config.world_size
            )));
        }
        let step = config.batch_size * config.world_size;
        if config.cycle && dataset.len() < step {
            return Err(OdpoError::Config(format!(
                "dataset has {} prompts, fewer than one step of {} ({} per worker x {} workers)",
                dataset.len(),
                step,
                config.batch_size,
                config.world_size
            )));
        }

        let mut loader = Self {
            dataset,
            rng: StdRng::seed_from_u64(config.seed),
            indices: (0..dataset.len()).collect(),
            position: 0,
            config,
        };
        loader.start_pass();
        Ok(loader)
    }

    fn start_pass(&mut self) {
        self.position = 0;
        if self.config.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Complete batches per pass for each worker.
    pub fn num_batches(&self) -> usize {
        self.dataset.len() / (self.config.batch_size * self.config.world_size)
    }

    /// Next `[batch_size, context_length]` batch of left-padded prompts.
    ///
    /// Returns `None` at the end of a pass unless the loader cycles.
    pub fn next_batch(&mut self) -> Option<Array> {
        let step = self.config.batch_size * self.config.world_size;
        if self.position + step > self.indices.len() {
            if !self.config.cycle {
                return None;
            }
            self.start_pass();
        }

        let start = self.position + self.config.rank * self.config.batch_size;
        let prompts: Vec<&[i32]> = self.indices[start..start + self.config.batch_size]
            .iter()
            .filter_map(|&i| self.dataset.get(i))
            .collect();
        self.position += step;
        Some(left_pad(&prompts, self.config.pad_token_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn dataset(n: usize) -> PromptDataset {
        PromptDataset::from_prompts((0..n).map(|i| vec![i as i32 + 1; 1 + i % 3]).collect()).unwrap()
    }

    fn config(batch_size: usize, shuffle: bool, cycle: bool) -> PromptLoaderConfig {
        PromptLoaderConfig {
            batch_size,
            shuffle,
            seed: 7,
            cycle,
            pad_token_id: 0,
            rank: 0,
            world_size: 1,
        }
    }

    #[test]
    fn test_left_pad() {
        let a = [5, 6, 7];
        let b = [8];
        let out = left_pad(&[&a, &b], 0);
        out.eval().unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.as_slice::<i32>(), &[5, 6, 7, 0, 0, 8]);
    }

    #[test]
    fn test_single_pass_drops_last() {
        let ds = dataset(5);
        let mut loader = PromptLoader::new(&ds, config(2, false, false)).unwrap();
        assert_eq!(loader.num_batches(), 2);
        assert!(loader.next_batch().is_some());
        assert!(loader.next_batch().is_some());
        assert!(loader.next_batch().is_none());
    }

    #[test]
    fn test_cycling_never_ends() {
        let ds = dataset(4);
        let mut loader = PromptLoader::new(&ds, config(3, true, true)).unwrap();
        for _ in 0..10 {
            let batch = loader.next_batch().unwrap();
            assert_eq!(batch.dim(0), 3);
        }
    }

    #[test]
    fn test_same_seed_same_order() {
        let ds = dataset(16);
        let mut a = PromptLoader::new(&ds, config(4, true, false)).unwrap();
        let mut b = PromptLoader::new(&ds, config(4, true, false)).unwrap();
        while let (Some(x), Some(y)) = (a.next_batch(), b.next_batch()) {
            x.eval().unwrap();
            y.eval().unwrap();
            assert_eq!(x.as_slice::<i32>(), y.as_slice::<i32>());
        }
    }

    #[test]
    fn test_ranks_take_disjoint_shards() {
        let ds = PromptDataset::from_prompts((1..=8).map(|i| vec![i]).collect()).unwrap();
        let mut seen = Vec::new();
        for rank in 0..2 {
            let mut cfg = config(2, false, false);
            cfg.rank = rank;
            cfg.world_size = 2;
            let mut loader = PromptLoader::new(&ds, cfg).unwrap();
            while let Some(batch) = loader.next_batch() {
                batch.eval().unwrap();
                seen.extend_from_slice(batch.as_slice::<i32>());
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn test_dataset_smaller_than_step() {
        let ds = dataset(3);
        assert!(PromptLoader::new(&ds, config(4, true, true)).is_err());

        let mut single_pass = PromptLoader::new(&ds, config(4, false, false)).unwrap();
        assert_eq!(single_pass.num_batches(), 0);
        assert!(single_pass.next_batch().is_none());
    }

    #[test]
    fn test_from_jsonl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"input_ids": [1, 2, 3]}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"input_ids": [4]}}"#).unwrap();
        let ds = PromptDataset::from_jsonl(file.path()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(1), Some(&[4][..]));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, r#"{{"input_ids": []}}"#).unwrap();
        assert!(PromptDataset::from_jsonl(bad.path()).is_err());
    }
}
