//! The rank-bucket table: a binary counter of sorted runs.
//!
//! A run's rank is the number of times it may still be doubled in memory. Fresh runs enter at `max_rank`; merging two
//! runs yields `min(rank_a, rank_b) - 1`. Two runs meeting at rank 0 are too big to merge in memory and are handed to the
//! flusher as a pair, which streams their merge to disk. Like carry propagation in a binary counter, this keeps at most
//! one run per rank resident, `max_rank + 1` in total, however large the input is.

use crate::run::Run;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Highest rank for the given sizes: `floor(log2((max_run_size / 2) / base_run_size))`, never below zero.
pub fn max_rank(max_run_size: u64, base_run_size: u64) -> i32 {
    let half = max_run_size / 2;
    if base_run_size == 0 || half < base_run_size {
        return 0;
    }
    (half / base_run_size).ilog2() as i32
}

/// One optional run per rank, behind a single lock that is only held to check-and-swap a slot.
pub struct RankTable {
    slots: Mutex<Vec<Option<Run>>>,
    max_rank: i32,
}

/// What has to be written to disk: a run, possibly paired with a second run to merge on the way out.
pub type FlushPair = (Run, Option<Run>);

impl RankTable {
    pub fn new(max_rank: i32) -> Self {
        assert!(max_rank >= 0);
        Self {
            slots: Mutex::new((0..=max_rank).map(|_| None).collect()),
            max_rank,
        }
    }

    /// The rank fresh runs are created with.
    pub fn base_rank(&self) -> i32 {
        self.max_rank
    }

    pub fn occupied(&self) -> usize {
        self.lock().iter().filter(|slot| slot.is_some()).count()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<Run>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Carries `run` through the table.
    ///
    /// Returns the pair that collided at rank 0, if any; that pair must be flushed by the caller.
    pub fn settle(&self, mut run: Run) -> Option<FlushPair> {
        loop {
            debug_assert!((0..=self.max_rank).contains(&run.rank));
            let occupant = {
                let mut slots = self.lock();
                let slot = &mut slots[run.rank as usize];
                match slot.take() {
                    Some(occupant) => occupant,
                    None => {
                        *slot = Some(run);
                        return None;
                    }
                }
            };

            if run.rank == 0 {
                return Some((run, Some(occupant)));
            }
            run = Run::merge(run, occupant);
        }
    }

    /// Empties the table at end of input.
    ///
    /// Ranks `max_rank..=1` are folded high-to-low into one accumulator, which is then paired with the rank 0 occupant.
    /// Must only be called once no other thread is settling runs.
    pub fn drain(&self) -> Option<FlushPair> {
        let mut taken: Vec<Option<Run>> = {
            let mut slots = self.lock();
            slots.iter_mut().map(Option::take).collect()
        };

        let last = taken[0].take();
        let accumulator = taken
            .into_iter()
            .skip(1)
            .rev()
            .flatten()
            .reduce(|accumulator, run| Run::merge(run, accumulator));

        match (last, accumulator) {
            (Some(last), accumulator) => Some((last, accumulator)),
            (None, Some(accumulator)) => Some((accumulator, None)),
            (None, None) => None,
        }
    }
}
