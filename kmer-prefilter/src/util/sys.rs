use std::path::Path;

use sysinfo::{Disks, System};

/// Total physical memory in bytes, `None` when the platform does not report it.
pub fn total_memory() -> Option<u64> {
    let mut sys = System::new();
    sys.refresh_memory();
    match sys.total_memory() {
        0 => None,
        n => Some(n),
    }
}

/// Free bytes on the disk holding `dir` (longest matching mount point).
pub fn free_space(dir: &Path) -> Option<u64> {
    let dir = std::fs::canonicalize(dir).ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Worker threads: `0` means every logical core.
pub fn resolve_threads(threads: usize) -> usize {
    if threads == 0 {
        num_cpus::get().max(1)
    } else {
        threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_thread_count_is_kept() {
        assert_eq!(resolve_threads(3), 3);
        assert!(resolve_threads(0) >= 1);
    }
}
