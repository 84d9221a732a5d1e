use std::path::{Path, PathBuf};

use sysinfo::Disks;

/// Answers how many bytes can still be written at a path.
pub trait FreeSpace: Send + Sync {
    /// `None` when the volume holding `path` cannot be identified.
    fn available(&self, path: &Path) -> Option<u64>;
}

/// Free space as reported by the OS for the mounted disk holding the path.
#[derive(Default)]
pub struct SystemDisks;

impl FreeSpace for SystemDisks {
    fn available(&self, path: &Path) -> Option<u64> {
        let path = existing_ancestor(path)?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// The deepest existing directory on the way to `path`, canonicalized.
fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let absolute = std::path::absolute(path).ok()?;
    absolute
        .ancestors()
        .find_map(|ancestor| ancestor.canonicalize().ok())
}
