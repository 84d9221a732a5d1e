use crate::buffer::RawBuffer;
use crate::config::{Config, SortPaths};
use crate::error::{Result, SortError};
use crate::memory::{MemoryGovernor, MemoryProbe};
use crate::progress::Progress;
use crate::rank::{max_rank, FlushPair, RankTable};
use crate::run::Run;

use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

/// What the chunking step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The chunk directory already existed and reuse was requested.
    Reused,
    Chunked { input_bytes: u64, chunk_files: usize },
}

/// Splits the input file into sorted chunk files.
///
/// ```text
/// reader -> [queue_length] -> sorters -> [1] -> rank mergers -> [1] -> flushers -> chunk files
/// ```
///
/// Every arrow is a bounded channel, so a slow stage blocks the ones before it. On top of that the reader waits for the
/// memory governor before allocating each buffer.
pub struct Chunker {
    config: Config,
    paths: SortPaths,
    progress: Arc<Progress>,
    probe: Box<dyn MemoryProbe>,
}

// State touched by more than one worker.
struct Shared {
    table: RankTable,
    chunk_dir: PathBuf,
    buffer_size: usize,
    next_chunk: Mutex<usize>,
    progress: Arc<Progress>,
    aborted: AtomicBool,
    // Buffers sent by the reader whose run has not yet settled in the table or reached a chunk file.
    pending: AtomicUsize,
}

impl Shared {
    fn next_chunk_path(&self) -> PathBuf {
        let mut counter = self.next_chunk.lock().unwrap_or_else(PoisonError::into_inner);
        let name = chunk_file_name(*counter);
        *counter += 1;
        self.chunk_dir.join(name)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    fn start_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn finish_pending(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether some run is still on its way to a flush. Runs resting in the table only leave it when more input arrives.
    fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }
}

pub fn chunk_file_name(index: usize) -> String {
    format!("chunk_{index:05}.txt")
}

impl Chunker {
    pub fn new(config: Config, paths: SortPaths, progress: Arc<Progress>, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            config,
            paths,
            progress,
            probe,
        }
    }

    pub fn run(self) -> Result<ChunkOutcome> {
        let Some(input_bytes) = self.prepare_chunk_dir()? else {
            log::info!("Reusing chunks from {}", self.paths.chunk_dir.display());
            return Ok(ChunkOutcome::Reused);
        };

        let start = Instant::now();
        log::info!(
            "Splitting {} ({input_bytes} bytes) into sorted chunks in {}",
            self.paths.input.display(),
            self.paths.chunk_dir.display()
        );

        let Chunker {
            config,
            paths,
            progress,
            probe,
        } = self;

        let input = File::open(&paths.input)?;
        let governor = MemoryGovernor::new(
            probe,
            config.memory_budget,
            config.memory_threshold,
            config.memory_backoff,
        );
        let shared = Arc::new(Shared {
            table: RankTable::new(max_rank(config.max_run_size, config.base_run_size)),
            chunk_dir: paths.chunk_dir.clone(),
            buffer_size: config.buffer_size,
            next_chunk: Mutex::new(0),
            progress,
            aborted: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
        });

        // Unsorted buffers are the bulk of our memory, so this queue is the one to tune.
        let (unsorted_tx, unsorted_rx) = bounded(config.queue_length);
        // A single slot caps how many freshly sorted runs wait for the rank table.
        let (sorted_tx, sorted_rx) = bounded(1);
        let (flush_tx, flush_rx) = bounded(1);

        let base_run_size = config.base_run_size as usize;
        let reader_shared = Arc::clone(&shared);
        let reader = thread::spawn(move || {
            let result = run_reader(input, input_bytes, base_run_size, &governor, &reader_shared, unsorted_tx);
            if result.is_err() {
                reader_shared.abort();
            }
            result
        });

        let sorters = spawn_workers(config.sort_workers, &shared, |shared| {
            let unsorted_rx = unsorted_rx.clone();
            let sorted_tx = sorted_tx.clone();
            move || run_sorter(&shared, unsorted_rx, sorted_tx)
        });
        let mergers = spawn_workers(config.merge_workers, &shared, |shared| {
            let sorted_rx = sorted_rx.clone();
            let flush_tx = flush_tx.clone();
            move || run_rank_merger(&shared, sorted_rx, flush_tx)
        });
        let flushers = spawn_workers(config.flush_workers, &shared, |shared| {
            let flush_rx = flush_rx.clone();
            move || run_flusher(&shared, flush_rx)
        });
        // Only the workers may hold channel ends, otherwise a failing stage could leave its neighbours blocked forever.
        drop((unsorted_rx, sorted_tx, sorted_rx, flush_rx));

        let mut first_error = None;
        join_stage(vec![reader], "reader", &mut first_error);
        join_stage(sorters, "sort", &mut first_error);
        join_stage(mergers, "rank merge", &mut first_error);

        // All merge workers are gone, so the table is ours alone.
        if first_error.is_none() {
            if let Some(pair) = shared.table.drain() {
                shared.start_pending();
                // A send error means every flusher failed; their error surfaces below.
                let _ = flush_tx.send(pair);
            }
        }
        drop(flush_tx);
        join_stage(flushers, "flush", &mut first_error);

        if let Some(e) = first_error {
            return Err(e);
        }

        let chunk_files = *shared.next_chunk.lock().unwrap_or_else(PoisonError::into_inner);
        log::info!(
            "Split into {chunk_files} sorted chunk files in {:.1}s",
            start.elapsed().as_secs_f64()
        );
        Ok(ChunkOutcome::Chunked {
            input_bytes,
            chunk_files,
        })
    }

    /// Returns the input size, or `None` when existing chunks are reused.
    fn prepare_chunk_dir(&self) -> Result<Option<u64>> {
        let chunk_dir = &self.paths.chunk_dir;
        if self.config.reuse_chunks && chunk_dir.is_dir() {
            return Ok(None);
        }

        let input_bytes = input_size(&self.paths.input);
        if input_bytes == 0 {
            return Err(SortError::MissingInput {
                path: self.paths.input.clone(),
            });
        }

        if chunk_dir.exists() {
            fs::remove_dir_all(chunk_dir)?;
        }
        fs::create_dir_all(chunk_dir)?;
        Ok(Some(input_bytes))
    }
}

pub(crate) fn input_size(path: &Path) -> u64 {
    fs::metadata(path).map_or(0, |m| if m.is_file() { m.len() } else { 0 })
}

fn spawn_workers<F, W>(count: usize, shared: &Arc<Shared>, mut make: F) -> Vec<thread::JoinHandle<Result<()>>>
where
    F: FnMut(Arc<Shared>) -> W,
    W: FnOnce() -> Result<()> + Send + 'static,
{
    (0..count)
        .map(|_| {
            let shared = Arc::clone(shared);
            let work = make(Arc::clone(&shared));
            thread::spawn(move || {
                let result = work();
                if result.is_err() {
                    shared.abort();
                }
                result
            })
        })
        .collect()
}

fn join_stage(handles: Vec<thread::JoinHandle<Result<()>>>, stage: &'static str, first_error: &mut Option<SortError>) {
    for handle in handles {
        let result = handle.join().unwrap_or(Err(SortError::WorkerPanicked(stage)));
        if let Err(e) = result {
            log::error!("{stage} worker exited with: {e}");
            first_error.get_or_insert(e);
        }
    }
}

fn run_reader(
    mut input: File,
    input_bytes: u64,
    base_run_size: usize,
    governor: &MemoryGovernor,
    shared: &Shared,
    unsorted_tx: Sender<RawBuffer>,
) -> Result<()> {
    let span = tracing::info_span!("read_input");
    let _guard = span.enter();

    let mut buffer = RawBuffer::new(base_run_size);
    let mut consumed = 0;
    loop {
        if shared.is_aborted() {
            return Ok(());
        }

        let read = buffer.fill_from(&mut input)?;
        consumed += read as u64;
        shared.progress.add_read(read as u64);
        let end = buffer.start_offset + read;

        let next = if end < buffer.capacity() || consumed >= input_bytes {
            // End of input, the last line may lack its newline.
            buffer.filled_len = end;
            None
        } else {
            let last_newline = buffer.last_newline(end).ok_or(SortError::LineTooLong {
                length: end,
                capacity: buffer.capacity(),
            })?;
            buffer.filled_len = last_newline + 1;

            governor.wait_for_headroom(|| shared.has_pending() && !shared.is_aborted());
            let mut next = RawBuffer::new(base_run_size);
            buffer.carry_into(buffer.filled_len, end, &mut next);
            Some(next)
        };

        if buffer.filled_len > 0 {
            shared.start_pending();
            if unsorted_tx.send(buffer).is_err() {
                // Every sorter is gone; one of them failed.
                return Ok(());
            }
        }
        match next {
            Some(next) => buffer = next,
            None => return Ok(()),
        }
    }
}

fn run_sorter(shared: &Shared, unsorted_rx: Receiver<RawBuffer>, sorted_tx: Sender<Run>) -> Result<()> {
    let base_rank = shared.table.base_rank();
    while let Ok(buffer) = unsorted_rx.recv() {
        let span = tracing::info_span!("sort_run");
        let run = span.in_scope(|| Run::sort_buffer(buffer, base_rank))?;
        log::trace!("Sorted a run of {} lines", run.len());
        if sorted_tx.send(run).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

fn run_rank_merger(shared: &Shared, sorted_rx: Receiver<Run>, flush_tx: Sender<FlushPair>) -> Result<()> {
    while let Ok(run) = sorted_rx.recv() {
        match shared.table.settle(run) {
            Some(pair) => {
                if flush_tx.send(pair).is_err() {
                    return Ok(());
                }
            }
            None => shared.finish_pending(),
        }
    }
    Ok(())
}

fn run_flusher(shared: &Shared, flush_rx: Receiver<FlushPair>) -> Result<()> {
    while let Ok(pair) = flush_rx.recv() {
        flush_runs(shared, pair)?;
        shared.finish_pending();
    }
    Ok(())
}

fn flush_runs(shared: &Shared, (first, second): FlushPair) -> Result<()> {
    let span = tracing::info_span!("flush_runs");
    let _guard = span.enter();

    let path = shared.next_chunk_path();
    let mut writer = BufWriter::with_capacity(shared.buffer_size, File::create(&path)?);
    let written = match &second {
        // Streaming the merge avoids holding a merged copy of the record arrays.
        Some(second) => first.merge_to(second, &mut writer)?,
        None => first.write_to(&mut writer)?,
    };
    writer.flush()?;

    shared.progress.add_written(written);
    shared.progress.add_chunk();
    log::debug!("Wrote sorted chunk file {} ({written} bytes)", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::ScriptedProbe;
    use tempfile::tempdir;

    fn small_config() -> Config {
        Config {
            base_run_size: 16,
            max_run_size: 128,
            queue_length: 2,
            sort_workers: 2,
            merge_workers: 2,
            flush_workers: 1,
            buffer_size: 64,
            memory_budget: 1 << 20,
            ..Config::default()
        }
    }

    fn chunker(dir: &Path, config: Config) -> Chunker {
        Chunker::new(
            config,
            SortPaths::in_dir(dir, "input.txt", "sorted.txt"),
            Arc::new(Progress::default()),
            Box::new(ScriptedProbe::new(vec![0])),
        )
    }

    fn read_chunks(dir: &Path) -> Vec<(String, String)> {
        let mut chunks: Vec<_> = fs::read_dir(dir.join("chunks"))
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                (
                    entry.file_name().into_string().unwrap(),
                    fs::read_to_string(entry.path()).unwrap(),
                )
            })
            .collect();
        chunks.sort();
        chunks
    }

    #[test]
    fn every_chunk_file_is_sorted_and_nothing_is_lost() {
        let dir = tempdir().unwrap();
        let lines: Vec<String> = (0..300).map(|i| format!("{}. word{}", i, (i * 37) % 101)).collect();
        fs::write(dir.path().join("input.txt"), lines.join("\n") + "\n").unwrap();

        let outcome = chunker(dir.path(), small_config()).run().unwrap();
        let ChunkOutcome::Chunked { chunk_files, .. } = outcome else {
            panic!("expected chunking, got {outcome:?}");
        };
        let chunks = read_chunks(dir.path());
        assert_eq!(chunks.len(), chunk_files);
        assert_eq!(chunks[0].0, "chunk_00000.txt");

        let mut all = Vec::new();
        for (_, text) in &chunks {
            let chunk: Vec<&str> = text.lines().collect();
            let mut sorted = chunk.clone();
            sorted.sort_by_key(|line| {
                let (number, key) = line.split_once(". ").unwrap();
                (key.to_string(), number.parse::<u32>().unwrap())
            });
            assert_eq!(chunk, sorted);
            all.extend(chunk.into_iter().map(str::to_string));
        }
        all.sort();
        let mut expected = lines;
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn lines_longer_than_a_buffer_are_fatal() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("input.txt"), "1. this line is far too long\n").unwrap();
        let err = chunker(dir.path(), small_config()).run().unwrap_err();
        assert!(matches!(err, SortError::LineTooLong { capacity: 16, .. }), "{err}");
    }

    #[test]
    fn unterminated_last_line_may_fill_the_whole_buffer() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("input.txt"), "2. zz\n1. abcdefghijklm").unwrap();

        chunker(dir.path(), small_config()).run().unwrap();

        let chunks = read_chunks(dir.path());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].1, "1. abcdefghijklm\n2. zz\n");
    }

    #[test]
    fn single_unterminated_line_of_buffer_size_is_accepted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("input.txt"), "1. abcdefghijklm").unwrap();

        let outcome = chunker(dir.path(), small_config()).run().unwrap();

        assert_eq!(
            outcome,
            ChunkOutcome::Chunked {
                input_bytes: 16,
                chunk_files: 1
            }
        );
        assert_eq!(read_chunks(dir.path())[0].1, "1. abcdefghijklm\n");
    }

    #[test]
    fn malformed_line_is_fatal() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("input.txt"), "1. a\n2. b\nbad line\n3. c\n").unwrap();
        let err = chunker(dir.path(), small_config()).run().unwrap_err();
        assert!(matches!(err, SortError::Parse { ref line, .. } if line == "bad line"), "{err}");
    }

    #[test]
    fn missing_input_without_chunks_is_fatal() {
        let dir = tempdir().unwrap();
        let err = chunker(dir.path(), small_config()).run().unwrap_err();
        assert!(matches!(err, SortError::MissingInput { .. }));
    }

    #[test]
    fn reuse_leaves_existing_chunks_untouched() {
        let dir = tempdir().unwrap();
        let input: String = (0..50).map(|i| format!("{i}. item {}\n", 50 - i)).collect();
        fs::write(dir.path().join("input.txt"), input).unwrap();

        let first = chunker(dir.path(), small_config()).run().unwrap();
        assert!(matches!(first, ChunkOutcome::Chunked { .. }));
        let before = read_chunks(dir.path());

        let config = Config {
            reuse_chunks: true,
            ..small_config()
        };
        assert_eq!(chunker(dir.path(), config).run().unwrap(), ChunkOutcome::Reused);
        assert_eq!(read_chunks(dir.path()), before);
    }

    #[test]
    fn without_reuse_old_chunks_are_replaced() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("chunks")).unwrap();
        fs::write(dir.path().join("chunks/stale.txt"), "9. stale\n").unwrap();
        fs::write(dir.path().join("input.txt"), "1. fresh\n").unwrap();

        chunker(dir.path(), small_config()).run().unwrap();
        let chunks = read_chunks(dir.path());
        assert_eq!(chunks, [("chunk_00000.txt".to_string(), "1. fresh\n".to_string())]);
    }

    #[test]
    fn reader_consults_the_governor_for_every_follow_up_buffer() {
        let dir = tempdir().unwrap();
        let input: String = (0..20).map(|i| format!("{i}. x\n")).collect();
        fs::write(dir.path().join("input.txt"), &input).unwrap();

        let config = Config {
            memory_backoff: std::time::Duration::from_millis(1),
            ..small_config()
        };
        let probe = Arc::new(ScriptedProbe::new(vec![0]));
        let chunker = Chunker::new(
            config,
            SortPaths::in_dir(dir.path(), "input.txt", "sorted.txt"),
            Arc::new(Progress::default()),
            Box::new(CountingProbe(Arc::clone(&probe))),
        );
        chunker.run().unwrap();
        // 110 bytes through 16-byte buffers take 8 follow-up buffers.
        assert!(probe.calls() >= 8, "{} probes", probe.calls());
    }

    #[test]
    fn permanently_over_budget_still_finishes() {
        let dir = tempdir().unwrap();
        let lines: Vec<String> = (0..200).map(|i| format!("{i}. v{}", (i * 7) % 13)).collect();
        fs::write(dir.path().join("input.txt"), lines.join("\n") + "\n").unwrap();

        let config = Config {
            memory_backoff: std::time::Duration::from_millis(1),
            ..small_config()
        };
        let chunker = Chunker::new(
            config,
            SortPaths::in_dir(dir.path(), "input.txt", "sorted.txt"),
            Arc::new(Progress::default()),
            Box::new(ScriptedProbe::new(vec![u64::MAX])),
        );
        chunker.run().unwrap();

        let mut written: Vec<String> = read_chunks(dir.path())
            .iter()
            .flat_map(|(_, text)| text.lines().map(str::to_string).collect::<Vec<_>>())
            .collect();
        written.sort();
        let mut expected = lines;
        expected.sort();
        assert_eq!(written, expected);
    }

    struct CountingProbe(Arc<ScriptedProbe>);

    impl MemoryProbe for CountingProbe {
        fn usage(&self) -> u64 {
            self.0.usage()
        }
    }
}
