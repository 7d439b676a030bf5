//! Host-side tmpfs mounts and mount table inspection.

use crate::config::types::{Result, SandboxError};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::{Path, PathBuf};

/// Options for a size-capped tmpfs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmpfsOptions {
    pub size_bytes: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl TmpfsOptions {
    pub fn data(&self) -> String {
        format!(
            "size={},mode={:o},uid={},gid={}",
            self.size_bytes, self.mode, self.uid, self.gid
        )
    }
}

/// Mount a nosuid/nodev tmpfs at `target`. The directory must exist.
pub fn mount_tmpfs(target: &Path, options: &TmpfsOptions) -> Result<()> {
    let data = options.data();
    mount(
        Some("sandrun"),
        target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(data.as_str()),
    )
    .map_err(|e| {
        SandboxError::Mount(format!(
            "Failed to mount tmpfs at {} ({}): {}",
            target.display(),
            data,
            e
        ))
    })?;
    log::debug!("mounted tmpfs at {} ({})", target.display(), data);
    Ok(())
}

/// Lazy unmount; EINVAL (not a mount point) and ENOENT count as done.
pub fn unmount_lazy(target: &Path) -> Result<()> {
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(SandboxError::Mount(format!(
            "Failed to unmount {}: {}",
            target.display(),
            e
        ))),
    }
}

/// One line of /proc/self/mountinfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Undo the octal escapes mountinfo uses for whitespace and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|octal| u8::from_str_radix(octal, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let (left, right) = line.split_once(" - ")?;
            let mount_point = left.split_whitespace().nth(4)?;
            let mut right = right.split_whitespace();
            let fs_type = right.next()?.to_string();
            let source = right.next().unwrap_or_default().to_string();
            Some(MountEntry {
                mount_point: PathBuf::from(unescape(mount_point)),
                fs_type,
                source,
            })
        })
        .collect()
}

pub fn read_mountinfo() -> Result<Vec<MountEntry>> {
    let content = std::fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| SandboxError::Mount(format!("Failed to read mountinfo: {}", e)))?;
    Ok(parse_mountinfo(&content))
}

/// Mount points strictly below `prefix`, deepest first so they can be
/// unmounted in order.
pub fn mounts_under(entries: &[MountEntry], prefix: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = entries
        .iter()
        .filter(|e| e.mount_point != prefix && e.mount_point.starts_with(prefix))
        .map(|e| e.mount_point.clone())
        .collect();
    found.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    found.dedup();
    found
}

pub fn list_mounts_under(prefix: &Path) -> Result<Vec<PathBuf>> {
    Ok(mounts_under(&read_mountinfo()?, prefix))
}

pub fn is_mounted(path: &Path) -> bool {
    read_mountinfo()
        .map(|entries| entries.iter().any(|e| e.mount_point == path))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
40 22 0:35 / /run/sandrun/jobs/a1 rw,nosuid,nodev shared:20 - tmpfs sandrun rw,size=102400k
41 22 0:36 / /run/sandrun/jobs/a1/nested rw shared:21 - tmpfs sandrun rw
42 22 0:37 / /run/sandrun/jobs\\040old rw shared:22 - tmpfs sandrun rw
43 22 0:38 / /run/sandrun/roots/b2 rw shared:23 - tmpfs sandrun-root rw
";

    #[test]
    fn parses_mount_points_and_types() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[1].mount_point, PathBuf::from("/run/sandrun/jobs/a1"));
        assert_eq!(entries[1].fs_type, "tmpfs");
        assert_eq!(entries[1].source, "sandrun");
        assert_eq!(entries[3].mount_point, PathBuf::from("/run/sandrun/jobs old"));
    }

    #[test]
    fn mounts_under_is_deepest_first_and_component_aware() {
        let entries = parse_mountinfo(SAMPLE);
        let found = mounts_under(&entries, Path::new("/run/sandrun/jobs"));
        assert_eq!(
            found,
            vec![
                PathBuf::from("/run/sandrun/jobs/a1/nested"),
                PathBuf::from("/run/sandrun/jobs/a1"),
            ]
        );
        assert!(mounts_under(&entries, Path::new("/nowhere")).is_empty());
    }

    #[test]
    fn tmpfs_options_render_octal_mode() {
        let opts = TmpfsOptions {
            size_bytes: 1024,
            mode: 0o755,
            uid: 65534,
            gid: 65534,
        };
        assert_eq!(opts.data(), "size=1024,mode=755,uid=65534,gid=65534");
    }

    #[test]
    fn unmounting_a_plain_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        // EINVAL for a non-mount point, EPERM without privileges.
        let result = unmount_lazy(dir.path());
        if nix::unistd::geteuid().is_root() {
            assert!(result.is_ok());
        }
    }
}
