use crate::chunker::{input_size, ChunkOutcome, Chunker};
use crate::config::{Config, SortPaths};
use crate::disk::{FreeSpace, SystemDisks};
use crate::error::{Result, SortError};
use crate::leftovers::remove_leftovers;
use crate::memory::{MemoryProbe, ProcessMemoryProbe};
use crate::merge::{merge_chunk_files, MergeOutcome};
use crate::progress::Progress;

use std::sync::Arc;
use std::time::Duration;

/// Sorts one line file: split into sorted chunk files, then merge them into the output.
pub struct FileSorter {
    config: Config,
    paths: SortPaths,
    progress: Arc<Progress>,
    probe: Box<dyn MemoryProbe>,
    free_space: Box<dyn FreeSpace>,
    report_every: Option<Duration>,
}

/// What a completed sort did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortReport {
    pub chunking: ChunkOutcome,
    pub merge: MergeOutcome,
}

impl FileSorter {
    pub fn new(config: Config, paths: SortPaths) -> Self {
        Self {
            config,
            paths,
            progress: Arc::new(Progress::default()),
            probe: Box::new(ProcessMemoryProbe::new()),
            free_space: Box::new(SystemDisks),
            report_every: None,
        }
    }

    /// Replaces the process memory probe that drives read backpressure.
    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replaces the free-space query used before each step writes.
    pub fn with_free_space(mut self, free_space: Box<dyn FreeSpace>) -> Self {
        self.free_space = free_space;
        self
    }

    /// Logs progress at this interval while sorting.
    pub fn with_progress_reports(mut self, interval: Duration) -> Self {
        self.report_every = Some(interval);
        self
    }

    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    pub fn sort(self) -> Result<SortReport> {
        self.config.validate()?;

        let FileSorter {
            config,
            paths,
            progress,
            probe,
            free_space,
            report_every,
        } = self;

        let will_chunk = !(config.reuse_chunks && paths.chunk_dir.is_dir());
        if will_chunk {
            let required = input_size(&paths.input);
            if let Some(available) = free_space.available(&paths.chunk_dir) {
                if available < required {
                    return Err(SortError::InsufficientDisk {
                        path: paths.chunk_dir.clone(),
                        required,
                        available,
                    });
                }
            }
        }

        let _reporter = report_every.map(|interval| progress.spawn_reporter("sort", interval));

        let chunking = Chunker::new(config.clone(), paths.clone(), Arc::clone(&progress), probe).run()?;
        let merge = merge_chunk_files(&config, &paths.chunk_dir, &paths.output, &progress, free_space.as_ref())?;

        if !config.keep_chunks {
            remove_leftovers(&paths, false)?;
        }

        Ok(SortReport { chunking, merge })
    }
}
