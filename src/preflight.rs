use std::path::Path;
use sysinfo::{DiskExt, System, SystemExt};
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// Fails with `PreconditionError` when the filesystem holding `path` has
/// less than `min_free_mb` available.
pub fn check_disk_space(path: &Path, min_free_mb: u64) -> Result<u64> {
    let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    let mut system = System::new();
    system.refresh_disks_list();
    system.refresh_disks();

    // Longest mount point that contains the target
    let disk = system
        .disks()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    let Some(disk) = disk else {
        warn!(path = %target.display(), "No mounted filesystem found for path, skipping disk check");
        return Ok(0);
    };

    let available_mb = disk.available_space() / (1024 * 1024);
    debug!(
        path = %target.display(),
        mount = %disk.mount_point().display(),
        available_mb,
        min_free_mb,
        "Disk space checked"
    );

    if available_mb < min_free_mb {
        return Err(AppError::PreconditionError(format!(
            "only {} MB free on {} (need {} MB)",
            available_mb,
            disk.mount_point().display(),
            min_free_mb
        )));
    }
    Ok(available_mb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_threshold_always_passes() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(check_disk_space(dir.path(), 0).is_ok());
    }

    #[test]
    fn test_impossible_threshold_is_precondition_error() {
        let dir = tempfile::TempDir::new().unwrap();
        match check_disk_space(dir.path(), u64::MAX) {
            Err(AppError::PreconditionError(_)) => {}
            // Sandboxes without a visible mount table report nothing
            Ok(0) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
