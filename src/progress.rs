use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Advisory counters shared by every stage. Updates are relaxed; readers may see slightly stale values.
#[derive(Debug, Default)]
pub struct Progress {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub lines_written: AtomicU64,
    pub chunks_written: AtomicU64,
}

/// Point-in-time copy of [`Progress`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub lines_written: u64,
    pub chunks_written: u64,
}

impl Progress {
    pub fn add_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_lines(&self, lines: u64) {
        self.lines_written.fetch_add(lines, Ordering::Relaxed);
    }

    pub fn add_chunk(&self) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            lines_written: self.lines_written.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
        }
    }

    /// Logs a status line every `interval` until the returned handle is dropped.
    pub fn spawn_reporter(self: &Arc<Self>, label: &'static str, interval: Duration) -> Reporter {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let progress = Arc::clone(self);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let mut last = progress.snapshot();
            let mut last_at = start;
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let now = Instant::now();
                let current = progress.snapshot();
                let secs = now.duration_since(last_at).as_secs_f64().max(f64::EPSILON);
                log::info!(
                    "{label}: read {} MiB ({:.1} MiB/s), written {} MiB ({:.1} MiB/s), {} lines, {} chunk files, {:.1}s elapsed",
                    current.bytes_read >> 20,
                    (current.bytes_read - last.bytes_read) as f64 / secs / (1 << 20) as f64,
                    current.bytes_written >> 20,
                    (current.bytes_written - last.bytes_written) as f64 / secs / (1 << 20) as f64,
                    current.lines_written,
                    current.chunks_written,
                    now.duration_since(start).as_secs_f64(),
                );
                last = current;
                last_at = now;
            }
        });
        Reporter {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

/// Stops its reporter thread when dropped.
pub struct Reporter {
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for Reporter {
    fn drop(&mut self) {
        // Disconnecting wakes the reporter immediately.
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
