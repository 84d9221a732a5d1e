use bytesize::ByteSize;
use clap::{ArgGroup, Parser};
use line_rank_sort::{remove_leftovers, Config, FileSorter, InputGenerator, Progress, SortPaths, SystemDisks};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(group(ArgGroup::new("action").required(true).multiple(true).args(&["generate", "sort", "delete"])))]
struct Args {
    /// Write a random input file first.
    #[clap(long)]
    generate: bool,
    #[clap(long)]
    sort: bool,
    /// Finally delete the input, the output and the chunks.
    #[clap(long)]
    delete: bool,

    /// Working directory holding the input, the output and the `chunks` directory.
    #[clap(short = 'd', long, default_value = ".")]
    dir: PathBuf,
    #[clap(short = 'i', long, default_value = "input.txt")]
    input: String,
    #[clap(short = 'o', long, default_value = "sorted.txt")]
    output: String,
    #[clap(long)]
    chunk_dir: Option<PathBuf>,

    #[clap(long)]
    base_run_size: Option<ByteSize>,
    #[clap(long)]
    max_run_size: Option<ByteSize>,
    #[clap(long)]
    queue_length: Option<usize>,
    #[clap(long)]
    sort_workers: Option<usize>,
    #[clap(long)]
    merge_workers: Option<usize>,
    #[clap(long)]
    flush_workers: Option<usize>,
    #[clap(long)]
    buffer_size: Option<ByteSize>,
    #[clap(long)]
    memory_budget: Option<ByteSize>,
    /// Fraction of the memory budget above which reading pauses.
    #[clap(long)]
    memory_threshold: Option<f64>,
    #[clap(long)]
    memory_backoff_ms: Option<u64>,
    #[clap(long)]
    batch_size: Option<usize>,

    /// Merge the chunks left by an earlier run instead of chunking again.
    #[clap(long)]
    reuse_chunks: bool,
    #[clap(long)]
    remove_chunks: bool,
    /// Size of the generated input.
    #[clap(long, default_value = "1GiB")]
    size: ByteSize,
    /// Keep an existing input that is at least `--size` large instead of generating it.
    #[clap(long)]
    reuse_unsorted: bool,
    #[clap(long)]
    seed: Option<u64>,

    /// Seconds between progress log lines; 0 disables them.
    #[clap(long, default_value = "10")]
    progress_secs: u64,
}

impl Args {
    fn config(&self) -> Config {
        let defaults = Config::default();
        Config {
            base_run_size: self.base_run_size.map_or(defaults.base_run_size, |s| s.as_u64()),
            max_run_size: self.max_run_size.map_or(defaults.max_run_size, |s| s.as_u64()),
            queue_length: self.queue_length.unwrap_or(defaults.queue_length),
            sort_workers: self.sort_workers.unwrap_or(defaults.sort_workers),
            merge_workers: self.merge_workers.unwrap_or(defaults.merge_workers),
            flush_workers: self.flush_workers.unwrap_or(defaults.flush_workers),
            buffer_size: self
                .buffer_size
                .map_or(defaults.buffer_size, |s| s.as_u64() as usize),
            memory_budget: self.memory_budget.map_or(defaults.memory_budget, |s| s.as_u64()),
            memory_threshold: self.memory_threshold.unwrap_or(defaults.memory_threshold),
            memory_backoff: self
                .memory_backoff_ms
                .map_or(defaults.memory_backoff, Duration::from_millis),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            reuse_chunks: self.reuse_chunks,
            keep_chunks: !self.remove_chunks,
        }
    }

    fn paths(&self) -> SortPaths {
        let mut paths = SortPaths::in_dir(&self.dir, &self.input, &self.output);
        if let Some(chunk_dir) = &self.chunk_dir {
            paths.chunk_dir = chunk_dir.clone();
        }
        paths
    }
}

fn main() {
    let args = Args::parse();

    env_logger::init();

    if let Err(err) = run(&args) {
        log::error!("{err}");
        process::exit(1);
    }
}

fn run(args: &Args) -> line_rank_sort::Result<()> {
    let paths = args.paths();

    if args.generate {
        let mut generator = InputGenerator::new(args.size.as_u64()).reuse_existing(args.reuse_unsorted);
        if let Some(seed) = args.seed {
            generator = generator.with_seed(seed);
        }
        let outcome = generator.generate(&paths.input, &Progress::default(), &SystemDisks)?;
        log::info!("{outcome:?}");
    }

    if args.sort {
        let config = args.config();
        log::debug!("{config:?}");

        let mut sorter = FileSorter::new(config, paths.clone());
        if args.progress_secs > 0 {
            sorter = sorter.with_progress_reports(Duration::from_secs(args.progress_secs));
        }
        let report = sorter.sort()?;
        log::info!("Done! {report:?}");
    }

    if args.delete {
        remove_leftovers(&paths, true)?;
    }
    Ok(())
}
