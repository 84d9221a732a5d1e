//! # Line Rank Sort
//!
//! Sort text files of `<number>.<text>` lines that don't fit in memory.
//!
//! Every line is ordered by its text first (byte-wise, after dropping one space that may follow the `.`) and by its number
//! second. The output holds the input lines verbatim, only reordered.
//!
//! ```sh
//! $ RUST_LOG=info line-rank-sort --sort -d /ssd_data/ -i unsorted.txt -o sorted.txt --memory-budget 8GiB
//! [2026-03-02T10:14:07Z INFO  line_rank_sort::chunker] Splitting /ssd_data/unsorted.txt (10737418240 bytes) into sorted chunks in /ssd_data/chunks
//! [2026-03-02T10:16:41Z INFO  line_rank_sort::chunker] Split into 11 sorted chunk files in 154.2s
//! [2026-03-02T10:16:41Z INFO  line_rank_sort::merge] Merging 11 chunk files into /ssd_data/sorted.txt: 3 group mergers, 100 batches of 100000 lines queued per group
//! [2026-03-02T10:19:02Z INFO  line_rank_sort::merge] Merged 11 chunk files (10737418240 bytes) in 141.0s
//! ```
//!
//! `--generate` writes a random input of `--size` first, and `--delete` removes every created file afterwards.
//!
//! ## Implementation
//!
//! Sorting happens in two steps, each of which is a small pipeline of threads joined by bounded channels.
//!
//! **Chunking.** A single reader fills fixed-size buffers from the input and hands them to sort workers. A sorted buffer is
//! a *run* of zero-copy [`Record`] views into that buffer. Runs are combined by rank like a binary counter: a fresh run
//! enters at the highest rank, and two runs of the same rank merge into one of the next lower rank. When two runs collide at
//! rank 0 they are streamed together into a chunk file instead. At end of input the remaining runs are folded and flushed.
//!
//! **Merging.** The chunk files are split into about `√n` groups. Each group is k-way merged on its own thread into batches
//! of lines, and a final k-way merge over the group streams writes the output file.
//!
//! ## Memory Usage
//!
//! The reader pauses while the process uses more than `memory_threshold` of `memory_budget` and some buffer is still on its
//! way to the rank table or a chunk file. Runs resting in the rank table only leave it when more input arrives, so once
//! nothing else is in flight the reader goes on regardless. The budget must therefore cover every buffer that can be alive
//! at once, [`Config::buffers_held`] of them. [`Config::validate`] rejects configurations where it does not.
//!
//! ## File System Usage
//!
//! The chunk directory needs about as much free space as the input, and the output needs the same again.

mod buffer;
mod chunker;
mod config;
mod disk;
mod error;
mod generate;
mod leftovers;
mod memory;
mod merge;
mod progress;
mod rank;
mod record;
mod run;
mod sorter;

pub use chunker::{chunk_file_name, ChunkOutcome, Chunker};
pub use config::{Config, SortPaths};
pub use disk::{FreeSpace, SystemDisks};
pub use error::{Result, SortError};
pub use generate::{GenerateOutcome, InputGenerator};
pub use leftovers::remove_leftovers;
pub use memory::{MemoryGovernor, MemoryProbe, ProcessMemoryProbe};
pub use merge::{merge_chunk_files, MergeOutcome};
pub use progress::{Progress, ProgressSnapshot, Reporter};
pub use record::{Record, SortKey};
pub use sorter::{FileSorter, SortReport};
