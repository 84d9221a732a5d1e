use crate::error::{Result, SortError};

use std::path::PathBuf;
use std::time::Duration;

const ONE_MIB: u64 = 1 << 20;
const ONE_GIB: u64 = 1 << 30;

/// Tuning parameters for [`FileSorter`](crate::FileSorter).
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of one read buffer, which is also the size of a freshly sorted run.
    pub base_run_size: u64,
    /// Largest run that may be written as a single chunk file. Bounds the number of ranks.
    pub max_run_size: u64,
    /// Capacity of the queue between the input reader and the sort workers.
    pub queue_length: usize,
    pub sort_workers: usize,
    pub merge_workers: usize,
    pub flush_workers: usize,
    /// Capacity of every buffered file reader and writer.
    pub buffer_size: usize,
    pub memory_budget: u64,
    /// Fraction of `memory_budget` above which the input reader pauses.
    pub memory_threshold: f64,
    /// Pause between two memory probes while over the threshold.
    pub memory_backoff: Duration,
    /// Lines per batch handed from a group merger to the final merger.
    pub batch_size: usize,
    /// Skip chunking when the chunk directory already exists.
    pub reuse_chunks: bool,
    /// Leave the chunk files in place after the final merge.
    pub keep_chunks: bool,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(4, |n| n.get());
        Self {
            base_run_size: 32 * ONE_MIB,
            max_run_size: 1024 * ONE_MIB,
            queue_length: 4,
            sort_workers: cpus.saturating_sub(4).clamp(1, 16),
            merge_workers: 2,
            flush_workers: 1,
            buffer_size: ONE_MIB as usize,
            memory_budget: 16 * ONE_GIB,
            memory_threshold: 0.85,
            memory_backoff: Duration::from_secs(1),
            batch_size: 100_000,
            reuse_chunks: false,
            keep_chunks: true,
        }
    }
}

impl Config {
    /// Upper bound on base-size buffers alive at once while chunking.
    ///
    /// Queued and in-work buffers, plus the rank table (one run per rank, `2^(max_rank + 1) - 1` buffers together),
    /// plus one rank-0 pair per flush worker and one waiting in the flush queue.
    pub fn buffers_held(&self) -> u64 {
        let in_flight = (self.queue_length + self.sort_workers + self.merge_workers + 2) as u64;
        let ranks = crate::rank::max_rank(self.max_run_size, self.base_run_size).clamp(0, 62) as u32;
        let pair = 1u64 << (ranks + 1);
        let ranked = pair - 1;
        let flushing = pair.saturating_mul(self.flush_workers as u64 + 1);
        in_flight.saturating_add(ranked).saturating_add(flushing)
    }

    /// Checks every range at once and reports all violations together.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, message: String| {
            if !ok {
                errors.push(message);
            }
        };

        check(
            (1..=2047 * ONE_MIB).contains(&self.base_run_size),
            format!("base run size must be between 1 byte and 2047 MiB, got {}", self.base_run_size),
        );
        check(
            self.max_run_size >= self.base_run_size,
            format!(
                "max run size ({}) must not be smaller than the base run size ({})",
                self.max_run_size, self.base_run_size
            ),
        );
        // A run indexes its buffers with 16 bits.
        check(
            crate::rank::max_rank(self.max_run_size, self.base_run_size) <= 14,
            "max run size is more than 2^15 times the base run size; raise the base run size".to_string(),
        );
        check(
            (1..=100).contains(&self.queue_length),
            format!("queue length must be between 1 and 100, got {}", self.queue_length),
        );
        check(
            (1..=64).contains(&self.sort_workers),
            format!("sort worker count must be between 1 and 64, got {}", self.sort_workers),
        );
        check(
            (1..=10).contains(&self.merge_workers),
            format!("merge worker count must be between 1 and 10, got {}", self.merge_workers),
        );
        check(
            (1..=10).contains(&self.flush_workers),
            format!("flush worker count must be between 1 and 10, got {}", self.flush_workers),
        );
        check(
            (1..=32 * ONE_MIB as usize).contains(&self.buffer_size),
            format!("I/O buffer size must be between 1 byte and 32 MiB, got {}", self.buffer_size),
        );
        check(
            self.memory_threshold > 0.0 && self.memory_threshold <= 1.0,
            format!("memory threshold must be in (0, 1], got {}", self.memory_threshold),
        );
        check(
            self.batch_size > 0,
            "merge batch size must be positive".to_string(),
        );

        let buffers = self.buffers_held();
        check(
            self.base_run_size.saturating_mul(buffers) <= self.memory_budget,
            format!(
                "memory budget of {} bytes cannot hold {buffers} read buffers of {} bytes (queue, workers, ranked runs \
                 and runs waiting to be flushed); reduce the base run size, the max run size or worker counts, \
                 or raise the budget",
                self.memory_budget, self.base_run_size
            ),
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SortError::InvalidConfig(errors))
        }
    }
}

/// Where the input, the intermediate chunk files and the output live.
#[derive(Clone, Debug)]
pub struct SortPaths {
    pub input: PathBuf,
    pub chunk_dir: PathBuf,
    pub output: PathBuf,
}

impl SortPaths {
    /// Conventional layout under one working directory.
    pub fn in_dir(dir: impl Into<PathBuf>, input_name: &str, output_name: &str) -> Self {
        let dir = dir.into();
        Self {
            input: dir.join(input_name),
            chunk_dir: dir.join("chunks"),
            output: dir.join(output_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn reports_every_violation() {
        let config = Config {
            base_run_size: 0,
            queue_length: 0,
            merge_workers: 11,
            batch_size: 0,
            ..Config::default()
        };
        match config.validate() {
            Err(SortError::InvalidConfig(errors)) => assert_eq!(errors.len(), 4, "{errors:?}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_budget_too_small_for_buffers() {
        let config = Config {
            memory_budget: 64 * ONE_MIB,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reduce the base run size"));
    }

    #[test]
    fn budget_covers_runs_resting_in_the_rank_table() {
        // Queue, workers and reader fit easily; the ranked and flushing runs do not.
        let config = Config {
            base_run_size: 4096,
            max_run_size: 131_072,
            queue_length: 1,
            sort_workers: 1,
            merge_workers: 1,
            flush_workers: 1,
            memory_budget: 65_536,
            ..Config::default()
        };
        // max rank 4: 5 in flight + 31 ranked + 2 * 32 flushing.
        assert_eq!(config.buffers_held(), 100);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reduce the base run size"), "{err}");

        let roomy = Config {
            memory_budget: 100 * 4096,
            ..config
        };
        roomy.validate().unwrap();
    }

    #[test]
    fn rejects_too_many_ranks() {
        let config = Config {
            base_run_size: 1,
            max_run_size: 1 << 20,
            memory_budget: ONE_GIB,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
