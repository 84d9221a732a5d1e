use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

/// Reports how many bytes the process currently uses.
pub trait MemoryProbe: Send + Sync {
    fn usage(&self) -> u64;
}

/// Resident set size of the current process, as seen by the OS.
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing().with_memory()),
        );
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            log::warn!("Cannot determine own process id; memory budget will not be enforced");
        }
        Self {
            system: Mutex::new(system),
            pid,
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn usage(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let Ok(mut system) = self.system.lock() else {
            return 0;
        };
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map_or(0, |process| process.memory())
    }
}

/// Holds the input reader back while memory use is above a fraction of the budget.
pub struct MemoryGovernor {
    probe: Box<dyn MemoryProbe>,
    limit: u64,
    backoff: Duration,
}

impl MemoryGovernor {
    pub fn new(probe: Box<dyn MemoryProbe>, budget: u64, threshold: f64, backoff: Duration) -> Self {
        Self {
            probe,
            limit: (budget as f64 * threshold) as u64,
            backoff,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Blocks until usage drops to the limit. Returns how many times it had to back off.
    ///
    /// Waiting only helps while some in-flight work can still release memory, which `can_release` reports. Once it
    /// returns `false` the caller goes ahead even above the limit, since nothing else would ever lower usage.
    pub fn wait_for_headroom(&self, can_release: impl Fn() -> bool) -> u32 {
        let mut waits = 0;
        loop {
            let used = self.probe.usage();
            if used <= self.limit {
                return waits;
            }
            if !can_release() {
                log::debug!(
                    "Memory use ({used} bytes) is above {} bytes with nothing in flight to release it; reading on",
                    self.limit
                );
                return waits;
            }
            if waits == 0 {
                log::warn!(
                    "Approaching memory budget ({used} of {} bytes), holding back the next read buffer",
                    self.limit
                );
            }
            waits += 1;
            thread::sleep(self.backoff);
        }
    }
}
