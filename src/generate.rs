//! Synthetic input files of random `<number>. <words>` lines.

use crate::disk::FreeSpace;
use crate::error::{Result, SortError};
use crate::progress::Progress;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

const WORDS: [&str; 18] = [
    "berry",
    "apple",
    "banana",
    "cherry",
    "date",
    "fig",
    "grape",
    "kiwi",
    "lemon",
    "mango",
    "orange",
    "pear",
    "strawberry",
    "watermelon",
    "yogurt",
    "zucchini",
    "pineapple",
    "peach",
];

// Soft cap on the text after the separator; the first word is always written.
const TEXT_MAX_LEN: usize = 100;
const BATCH_LINES: usize = 512;

/// What [`InputGenerator::generate`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// An existing file was at least as large as requested and was kept.
    Reused { bytes: u64 },
    Generated { bytes: u64, lines: u64 },
}

/// Writes random lines until the file reaches the requested size.
///
/// Lines are written in batches, so the file ends up to one batch larger than requested.
pub struct InputGenerator {
    size: u64,
    reuse: bool,
    buffer_size: usize,
    rng: SmallRng,
}

impl InputGenerator {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            reuse: false,
            buffer_size: 1 << 22,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Makes the output reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Keeps an existing file that is already at least the requested size.
    pub fn reuse_existing(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn generate(mut self, path: &Path, progress: &Progress, free_space: &dyn FreeSpace) -> Result<GenerateOutcome> {
        if self.size == 0 {
            return Err(SortError::InvalidConfig(vec![
                "generated file size must be positive".to_string(),
            ]));
        }

        if self.reuse {
            if let Ok(metadata) = fs::metadata(path) {
                if metadata.is_file() && metadata.len() >= self.size {
                    log::info!("Reusing {} ({} bytes)", path.display(), metadata.len());
                    return Ok(GenerateOutcome::Reused { bytes: metadata.len() });
                }
            }
        }

        if let Some(available) = free_space.available(path) {
            if available < self.size {
                return Err(SortError::InsufficientDisk {
                    path: path.to_owned(),
                    required: self.size,
                    available,
                });
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let span = tracing::info_span!("generate_input");
        let _guard = span.enter();
        let start = Instant::now();
        log::info!("Generating {} of {} bytes", path.display(), self.size);

        let mut writer = BufWriter::with_capacity(self.buffer_size, File::create(path)?);
        let mut batch = Vec::with_capacity((TEXT_MAX_LEN + 20) * BATCH_LINES);
        let mut bytes = 0;
        let mut lines = 0;
        while bytes < self.size {
            batch.clear();
            for _ in 0..BATCH_LINES {
                self.push_line(&mut batch)?;
            }
            writer.write_all(&batch)?;
            bytes += batch.len() as u64;
            lines += BATCH_LINES as u64;
            progress.add_written(batch.len() as u64);
        }
        writer.flush()?;

        log::info!(
            "Generated {lines} lines ({bytes} bytes) in {:.1}s",
            start.elapsed().as_secs_f64()
        );
        Ok(GenerateOutcome::Generated { bytes, lines })
    }

    fn push_line(&mut self, batch: &mut Vec<u8>) -> std::io::Result<()> {
        let number = self.rng.gen_range(0..=i32::MAX as u32);
        write!(batch, "{number}. ")?;

        let soft_len = self.rng.gen_range(0..TEXT_MAX_LEN);
        let mut word = self.word();
        batch.extend_from_slice(word.as_bytes());
        let mut len = word.len();
        word = self.word();
        while len + word.len() <= soft_len {
            batch.push(b' ');
            batch.extend_from_slice(word.as_bytes());
            len += word.len() + 1;
            word = self.word();
        }
        batch.push(b'\n');
        Ok(())
    }

    fn word(&mut self) -> &'static str {
        WORDS[self.rng.gen_range(0..WORDS.len())]
    }
}
