/// Startup orphan sweep.
///
/// A crashed worker can leave job cgroups, tmpfs mounts and scaffold
/// directories behind. Before accepting jobs the coordinator kills whatever
/// still runs in leftover cgroups, removes them, detaches every mount under
/// the jobs and runtime roots and deletes what is left. Each step records
/// failures and moves on, so one stuck resource does not block the rest.
use crate::config::settings::SandboxSettings;
use crate::kernel::cgroup::{CgroupV2, JobCgroup};
use crate::kernel::mount::{list_mounts_under, unmount_lazy};
use crate::safety::safe_cleanup::remove_tree_secure;
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// What the sweep found and removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cgroups_removed: usize,
    pub mounts_detached: usize,
    pub dirs_removed: usize,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn found_anything(&self) -> bool {
        self.cgroups_removed + self.mounts_detached + self.dirs_removed > 0
    }
}

/// Remove leftovers from a previous run.
pub fn sweep_orphans(settings: &SandboxSettings) -> SweepReport {
    let mut report = SweepReport::default();

    sweep_cgroups(&CgroupV2::new(&settings.cgroup_root, false), &mut report);
    for root in [&settings.jobs_root, &settings.runtime_root] {
        sweep_mounts(root, &mut report);
    }
    for root in [&settings.jobs_root, &settings.runtime_root] {
        sweep_dirs(root, &mut report);
    }

    if report.found_anything() {
        info!(
            "Orphan sweep: {} cgroups, {} mounts, {} directories removed",
            report.cgroups_removed, report.mounts_detached, report.dirs_removed
        );
    }
    for err in &report.errors {
        warn!("Orphan sweep: {}", err);
    }
    report
}

fn sweep_cgroups(cgroups: &CgroupV2, report: &mut SweepReport) {
    let children = match cgroups.list_children() {
        Ok(children) => children,
        Err(e) => {
            report.errors.push(format!("listing {}: {}", cgroups.root().display(), e));
            return;
        }
    };
    for path in children {
        let mut cgroup = JobCgroup::adopt(&path);
        match cgroup.release() {
            Ok(()) => report.cgroups_removed += 1,
            Err(e) => report.errors.push(format!("cgroup {}: {}", path.display(), e)),
        }
    }
}

fn sweep_mounts(root: &Path, report: &mut SweepReport) {
    if !root.exists() {
        return;
    }
    let mounts = match list_mounts_under(root) {
        Ok(mounts) => mounts,
        Err(e) => {
            report.errors.push(format!("mountinfo for {}: {}", root.display(), e));
            return;
        }
    };
    // Deepest first, so nested binds go before their parents.
    for mount in mounts {
        match unmount_lazy(&mount) {
            Ok(()) => report.mounts_detached += 1,
            Err(e) => report.errors.push(format!("unmount {}: {}", mount.display(), e)),
        }
    }
}

fn sweep_dirs(root: &Path, report: &mut SweepReport) {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            report.errors.push(format!("reading {}: {}", root.display(), e));
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match remove_tree_secure(&path) {
            Ok(()) => report.dirs_removed += 1,
            Err(e) => report.errors.push(format!("removing {}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_in(base: &Path) -> SandboxSettings {
        SandboxSettings {
            cgroup_root: base.join("cgroup"),
            jobs_root: base.join("jobs"),
            runtime_root: base.join("roots"),
            ..SandboxSettings::default()
        }
    }

    #[test]
    fn empty_layout_is_clean() {
        let base = tempfile::tempdir().unwrap();
        let report = sweep_orphans(&settings_in(base.path()));
        assert!(report.is_clean());
        assert!(!report.found_anything());
    }

    #[test]
    fn leftover_workdirs_are_removed() {
        let base = tempfile::tempdir().unwrap();
        let settings = settings_in(base.path());
        fs::create_dir_all(settings.jobs_root.join("old-job/sub")).unwrap();
        fs::write(settings.jobs_root.join("old-job/sub/out.txt"), b"stale").unwrap();
        fs::create_dir_all(settings.runtime_root.join("old-job")).unwrap();

        let report = sweep_orphans(&settings);
        assert_eq!(report.dirs_removed, 2);
        assert!(fs::read_dir(&settings.jobs_root).unwrap().next().is_none());
        assert!(fs::read_dir(&settings.runtime_root).unwrap().next().is_none());
    }

    #[test]
    fn leftover_cgroup_directories_are_removed() {
        let base = tempfile::tempdir().unwrap();
        let settings = settings_in(base.path());
        // A plain directory tree stands in for cgroupfs here.
        fs::create_dir_all(settings.cgroup_root.join("job-a")).unwrap();

        let report = sweep_orphans(&settings);
        assert_eq!(report.cgroups_removed, 1);
        assert!(!settings.cgroup_root.join("job-a").exists());
    }
}
