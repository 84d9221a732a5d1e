//! Two-stage k-way merge of sorted chunk files into the final output.
//!
//! Stage 1 runs one group merger per disjoint subset of chunk files; each streams its merged lines in pooled batches
//! through its own bounded channel. Stage 2 merges the group streams into the output file. The final fan-in is the group
//! count instead of the file count, and cross-thread hand-offs happen once per batch instead of once per line.

use crate::config::Config;
use crate::disk::FreeSpace;
use crate::error::{Result, SortError};
use crate::progress::Progress;
use crate::record::{encode_prefix, parse_fields, SortKey};

use crossbeam_channel::{bounded, Receiver, Sender};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

// Progress counters are bumped once per this many lines.
const PROGRESS_STRIDE: u64 = 1 << 16;

/// One line read back from a chunk file.
#[derive(Clone, Debug, Default)]
pub struct MergeItem {
    line: Vec<u8>,
    prefix: u64,
    key_start: u32,
    key_len: u32,
    number: u32,
}

impl MergeItem {
    /// Takes ownership of a line without its `\n`.
    pub fn parse(line: Vec<u8>) -> Result<Self> {
        let fields = parse_fields(&line).map_err(|reason| SortError::Parse {
            line: String::from_utf8_lossy(&line[..line.len().min(80)]).into_owned(),
            reason,
        })?;
        let key = &line[fields.key_start..fields.key_start + fields.key_len];
        Ok(Self {
            prefix: encode_prefix(key),
            key_start: fields.key_start as u32,
            key_len: fields.key_len as u32,
            number: fields.number,
            line,
        })
    }

    pub fn line(&self) -> &[u8] {
        &self.line
    }

    pub fn sort_key(&self) -> SortKey<'_> {
        let start = self.key_start as usize;
        SortKey {
            prefix: self.prefix,
            key: &self.line[start..start + self.key_len as usize],
            number: self.number,
        }
    }
}

/// Min-heap entry: the smallest line pops first, ties go to the lower source.
struct HeapEntry {
    item: MergeItem,
    source: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .item
            .sort_key()
            .cmp(&self.item.sort_key())
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Sequential reader over one sorted chunk file.
struct ChunkFileReader {
    reader: BufReader<File>,
    bytes_read: u64,
}

impl ChunkFileReader {
    fn open(path: &Path, buffer_size: usize) -> io::Result<Self> {
        Ok(Self {
            reader: BufReader::with_capacity(buffer_size, File::open(path)?),
            bytes_read: 0,
        })
    }

    /// The next non-empty line, or `None` at end of file.
    fn next_item(&mut self) -> Result<Option<MergeItem>> {
        loop {
            let mut line = Vec::new();
            let n = self.reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                return Ok(None);
            }
            self.bytes_read += n as u64;
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if !line.is_empty() {
                return MergeItem::parse(line).map(Some);
            }
        }
    }
}

/// A fixed-capacity run of merged lines plus a read cursor.
#[derive(Debug)]
pub struct MergeBatch {
    items: Vec<MergeItem>,
    cursor: usize,
}

impl MergeBatch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push(&mut self, item: MergeItem) {
        self.items.push(item);
    }

    /// Moves the next unread item out of the batch.
    fn next_item(&mut self) -> Option<MergeItem> {
        let item = self.items.get_mut(self.cursor).map(std::mem::take)?;
        self.cursor += 1;
        Some(item)
    }

    pub fn is_drained(&self) -> bool {
        self.cursor == self.items.len()
    }
}

/// Recycles batch storage between the group mergers and the final merger.
///
/// A batch is rented by a group merger, travels through its channel, and is given back by the final merger once its
/// cursor has passed every item.
pub struct BatchPool {
    free: Mutex<Vec<Vec<MergeItem>>>,
    batch_size: usize,
    rented: AtomicUsize,
    returned: AtomicUsize,
}

impl BatchPool {
    pub fn new(batch_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            batch_size,
            rented: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn rent(&self) -> MergeBatch {
        self.rented.fetch_add(1, AtomicOrdering::Relaxed);
        let items = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.batch_size));
        MergeBatch { items, cursor: 0 }
    }

    /// Takes back a fully read batch.
    ///
    /// # Panics
    ///
    /// If the batch still has unread items.
    pub fn give_back(&self, batch: MergeBatch) {
        assert!(
            batch.is_drained(),
            "batch returned with {} unread items",
            batch.len() - batch.cursor
        );
        let mut items = batch.items;
        items.clear();
        self.returned.fetch_add(1, AtomicOrdering::Relaxed);
        self.free.lock().unwrap_or_else(PoisonError::into_inner).push(items);
    }

    /// Batches rented and not yet given back.
    pub fn outstanding(&self) -> usize {
        self.rented.load(AtomicOrdering::Relaxed) - self.returned.load(AtomicOrdering::Relaxed)
    }
}

/// Number of stage 1 group mergers for `files` chunk files on `cpus` cores.
pub fn group_count(files: usize, cpus: usize) -> usize {
    if files == 2 || files == 3 {
        return 2;
    }
    ((files as f64).sqrt().floor() as usize)
        .min(cpus.saturating_sub(1))
        .max(1)
}

/// Capacity of each group's batch channel, derived from the memory budget.
pub fn channel_capacity(memory_budget: u64, batch_size: usize, groups: usize) -> usize {
    // Rough bytes held per queued line across all groups.
    const BYTES_PER_QUEUED_LINE: u64 = 600;
    let capacity = memory_budget / batch_size.max(1) as u64 / groups.max(1) as u64 / BYTES_PER_QUEUED_LINE;
    capacity.clamp(1, 100) as usize
}

/// Sorted list of the regular files in `dir` with their sizes.
pub fn chunk_files(dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
    if !dir.is_dir() {
        return Err(SortError::MissingChunks { dir: dir.to_owned() });
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            files.push((entry.path(), metadata.len()));
        }
    }
    if files.is_empty() {
        return Err(SortError::MissingChunks { dir: dir.to_owned() });
    }
    files.sort();
    Ok(files)
}

/// Result of [`merge_chunk_files`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub chunk_files: usize,
    pub groups: usize,
    pub bytes_written: u64,
}

/// Merges every chunk file in `chunk_dir` into `output`.
pub fn merge_chunk_files(
    config: &Config,
    chunk_dir: &Path,
    output: &Path,
    progress: &Arc<Progress>,
    free_space: &dyn FreeSpace,
) -> Result<MergeOutcome> {
    let files = chunk_files(chunk_dir)?;
    let required: u64 = files.iter().map(|(_, len)| len).sum();
    if let Some(available) = free_space.available(output) {
        if available < required {
            return Err(SortError::InsufficientDisk {
                path: output.to_owned(),
                required,
                available,
            });
        }
    }

    let start = Instant::now();
    let cpus = thread::available_parallelism().map_or(2, |n| n.get());
    let groups = group_count(files.len(), cpus);
    let capacity = channel_capacity(config.memory_budget, config.batch_size, groups);
    log::info!(
        "Merging {} chunk files into {}: {groups} group mergers, {capacity} batches of {} lines queued per group",
        files.len(),
        output.display(),
        config.batch_size
    );

    let pool = Arc::new(BatchPool::new(config.batch_size));
    let mut receivers = Vec::with_capacity(groups);
    let mut handles = Vec::with_capacity(groups);
    for group in 0..groups {
        let group_files: Vec<PathBuf> = files
            .iter()
            .skip(group)
            .step_by(groups)
            .map(|(path, _)| path.clone())
            .collect();
        let (batch_tx, batch_rx) = bounded(capacity);
        receivers.push(batch_rx);

        let pool = Arc::clone(&pool);
        let progress = Arc::clone(progress);
        let buffer_size = config.buffer_size;
        handles.push(thread::spawn(move || {
            merge_group(group, &group_files, buffer_size, &pool, batch_tx, &progress)
        }));
    }

    let merged = merge_groups(receivers, output, config.buffer_size, &pool, progress);

    // A failed group closes its channel early, which looks like a short stream to stage 2, so its error wins.
    let mut first_error = None;
    for handle in handles {
        let result = handle
            .join()
            .unwrap_or(Err(SortError::WorkerPanicked("group merge")));
        if let Err(e) = result {
            log::error!("Group merger exited with: {e}");
            first_error.get_or_insert(e);
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    let bytes_written = merged?;
    debug_assert_eq!(pool.outstanding(), 0);

    log::info!(
        "Merged {} chunk files ({bytes_written} bytes) in {:.1}s",
        files.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(MergeOutcome {
        chunk_files: files.len(),
        groups,
        bytes_written,
    })
}

/// Stage 1: k-way merge of `files`, emitted as full batches on `batch_tx`.
fn merge_group(
    group: usize,
    files: &[PathBuf],
    buffer_size: usize,
    pool: &BatchPool,
    batch_tx: Sender<MergeBatch>,
    progress: &Progress,
) -> Result<()> {
    let span = tracing::info_span!("merge_group", group);
    let _guard = span.enter();
    log::debug!("Group merger #{group} is merging {} files", files.len());

    let mut readers = files
        .iter()
        .map(|path| ChunkFileReader::open(path, buffer_size))
        .collect::<io::Result<Vec<_>>>()?;

    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (source, reader) in readers.iter_mut().enumerate() {
        if let Some(item) = reader.next_item()? {
            heap.push(HeapEntry { item, source });
        }
    }

    let mut batch = pool.rent();
    while let Some(HeapEntry { item, source }) = heap.pop() {
        if batch.len() == pool.batch_size() {
            if batch_tx.send(batch).is_err() {
                // The final merger is gone and will report why.
                return Ok(());
            }
            batch = pool.rent();
        }
        batch.push(item);

        if let Some(next) = readers[source].next_item()? {
            heap.push(HeapEntry { item: next, source });
        }
    }

    if batch.is_empty() {
        pool.give_back(batch);
    } else {
        let _ = batch_tx.send(batch);
    }

    progress.add_read(readers.iter().map(|r| r.bytes_read).sum());
    Ok(())
}

/// Stage 2: k-way merge across the group streams into `output`.
fn merge_groups(
    receivers: Vec<Receiver<MergeBatch>>,
    output: &Path,
    buffer_size: usize,
    pool: &BatchPool,
    progress: &Progress,
) -> Result<u64> {
    let span = tracing::info_span!("merge_groups");
    let _guard = span.enter();

    let mut writer = BufWriter::with_capacity(buffer_size, File::create(output)?);
    let mut heap = BinaryHeap::with_capacity(receivers.len());
    let mut batches: Vec<Option<MergeBatch>> = Vec::with_capacity(receivers.len());
    for (source, batch_rx) in receivers.iter().enumerate() {
        let mut batch = batch_rx.recv().ok();
        if let Some(item) = batch.as_mut().and_then(MergeBatch::next_item) {
            heap.push(HeapEntry { item, source });
        }
        batches.push(batch);
    }

    let mut bytes_written = 0;
    let mut lines_written = 0;
    let mut pending = (0u64, 0u64);
    while let Some(HeapEntry { item, source }) = heap.pop() {
        let line = item.line();
        writer.write_all(line)?;
        writer.write_all(b"\n")?;
        bytes_written += line.len() as u64 + 1;
        lines_written += 1;
        pending.0 += line.len() as u64 + 1;
        pending.1 += 1;
        if pending.1 == PROGRESS_STRIDE {
            progress.add_written(pending.0);
            progress.add_lines(pending.1);
            pending = (0, 0);
        }

        let slot = &mut batches[source];
        if slot.as_ref().map_or(false, MergeBatch::is_drained) {
            if let Some(drained) = slot.take() {
                pool.give_back(drained);
            }
            *slot = receivers[source].recv().ok();
        }
        if let Some(next) = slot.as_mut().and_then(MergeBatch::next_item) {
            heap.push(HeapEntry { item: next, source });
        }
    }
    writer.flush()?;
    progress.add_written(pending.0);
    progress.add_lines(pending.1);

    debug_assert!(batches.iter().flatten().all(MergeBatch::is_drained));
    log::debug!("Final merge wrote {lines_written} lines");
    Ok(bytes_written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FixedSpace(Option<u64>);

    impl FreeSpace for FixedSpace {
        fn available(&self, _path: &Path) -> Option<u64> {
            self.0
        }
    }

    fn config(batch_size: usize) -> Config {
        Config {
            batch_size,
            buffer_size: 64,
            memory_budget: 1 << 20,
            ..Config::default()
        }
    }

    fn write_chunks(dir: &Path, chunks: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            fs::write(dir.join(format!("chunk_{i:05}.txt")), chunk).unwrap();
        }
    }

    #[test]
    fn group_count_follows_square_root() {
        assert_eq!(group_count(1, 8), 1);
        assert_eq!(group_count(2, 8), 2);
        assert_eq!(group_count(3, 8), 2);
        assert_eq!(group_count(4, 8), 2);
        assert_eq!(group_count(100, 8), 7);
        assert_eq!(group_count(100, 1), 1);
    }

    #[test]
    fn channel_capacity_is_clamped() {
        assert_eq!(channel_capacity(1 << 20, 100_000, 4), 1);
        assert_eq!(channel_capacity(16 << 30, 100_000, 4), 71);
        assert_eq!(channel_capacity(u64::MAX, 1, 1), 100);
    }

    #[test]
    fn heap_pops_smallest_key_then_number() {
        let mut heap = BinaryHeap::new();
        for (source, line) in ["5. b", "3. a", "1. b", "2. a"].into_iter().enumerate() {
            heap.push(HeapEntry {
                item: MergeItem::parse(line.as_bytes().to_vec()).unwrap(),
                source,
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|e| String::from_utf8(e.item.line).unwrap())
            .collect();
        assert_eq!(order, ["2. a", "3. a", "1. b", "5. b"]);
    }

    #[test]
    fn merges_many_files_across_groups() {
        let dir = tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        let chunks: Vec<String> = (0..9)
            .map(|c| (0..20).map(|i| format!("{}. key{:03}\n", c * 100 + i, i * 9 + c)).collect())
            .collect();
        let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        write_chunks(&chunk_dir, &chunk_refs);

        let output = dir.path().join("sorted.txt");
        let progress = Arc::new(Progress::default());
        let outcome = merge_chunk_files(&config(7), &chunk_dir, &output, &progress, &FixedSpace(None)).unwrap();

        let text = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 180);
        assert_eq!(outcome.bytes_written, text.len() as u64);
        assert_eq!(progress.snapshot().lines_written, 180);
        let keys: Vec<&str> = lines.iter().map(|l| l.split_once(". ").unwrap().1).collect();
        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn single_file_passes_through_unchanged() {
        let dir = tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        let content = "4. alpha\n1.beta\n2. beta\n3. gamma\r\n";
        write_chunks(&chunk_dir, &[content]);

        let output = dir.path().join("sorted.txt");
        let outcome = merge_chunk_files(
            &config(2),
            &chunk_dir,
            &output,
            &Arc::new(Progress::default()),
            &FixedSpace(None),
        )
        .unwrap();
        assert_eq!(outcome.groups, 1);
        assert_eq!(fs::read_to_string(&output).unwrap(), content);
    }

    #[test]
    fn existing_output_is_overwritten() {
        let dir = tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        write_chunks(&chunk_dir, &["1. a\n"]);
        let output = dir.path().join("sorted.txt");
        fs::write(&output, "old content that is longer\n").unwrap();

        merge_chunk_files(&config(2), &chunk_dir, &output, &Arc::new(Progress::default()), &FixedSpace(None)).unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "1. a\n");
    }

    #[test]
    fn missing_or_empty_chunk_dir_is_fatal() {
        let dir = tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        let output = dir.path().join("sorted.txt");
        let progress = Arc::new(Progress::default());

        let err = merge_chunk_files(&config(2), &chunk_dir, &output, &progress, &FixedSpace(None)).unwrap_err();
        assert!(matches!(err, SortError::MissingChunks { .. }));

        fs::create_dir(&chunk_dir).unwrap();
        let err = merge_chunk_files(&config(2), &chunk_dir, &output, &progress, &FixedSpace(None)).unwrap_err();
        assert!(matches!(err, SortError::MissingChunks { .. }));
    }

    #[test]
    fn insufficient_space_fails_before_writing() {
        let dir = tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        write_chunks(&chunk_dir, &["1. a\n", "2. b\n"]);
        let output = dir.path().join("sorted.txt");

        let err = merge_chunk_files(
            &config(2),
            &chunk_dir,
            &output,
            &Arc::new(Progress::default()),
            &FixedSpace(Some(3)),
        )
        .unwrap_err();
        assert!(matches!(err, SortError::InsufficientDisk { required: 10, available: 3, .. }));
        assert!(!output.exists());
    }

    #[test]
    fn malformed_chunk_line_is_fatal() {
        let dir = tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        write_chunks(&chunk_dir, &["1. a\n", "oops\n"]);
        let err = merge_chunk_files(
            &config(2),
            &chunk_dir,
            &dir.path().join("sorted.txt"),
            &Arc::new(Progress::default()),
            &FixedSpace(None),
        )
        .unwrap_err();
        assert!(matches!(err, SortError::Parse { .. }));
    }

    #[test]
    fn every_rented_batch_comes_back() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, (0..25).map(|i| format!("{i}. a{i:02}\n")).collect::<String>()).unwrap();
        fs::write(&b, (0..13).map(|i| format!("{i}. b{i:02}\n")).collect::<String>()).unwrap();

        let pool = Arc::new(BatchPool::new(4));
        let progress = Progress::default();
        let (tx_a, rx_a) = bounded(2);
        let (tx_b, rx_b) = bounded(2);
        let handles = [(a, tx_a), (b, tx_b)].map(|(path, tx)| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || merge_group(0, &[path], 16, &pool, tx, &Progress::default()))
        });

        let output = dir.path().join("out.txt");
        let written = merge_groups(vec![rx_a, rx_b], &output, 16, &pool, &progress).unwrap();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(written, fs::metadata(&output).unwrap().len());
        assert_eq!(progress.snapshot().lines_written, 38);
    }

    #[test]
    #[should_panic(expected = "unread items")]
    fn returning_an_unread_batch_panics() {
        let pool = BatchPool::new(2);
        let mut batch = pool.rent();
        batch.push(MergeItem::parse(b"1. a".to_vec()).unwrap());
        pool.give_back(batch);
    }
}
