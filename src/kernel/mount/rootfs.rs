/// Private root filesystem for the sandbox.
///
/// Built inside the proxy's mount namespace after propagation has been made
/// private: a small tmpfs scaffold, read-only binds of the base system, the
/// job's working directory read-write at `/work`, a minimal `/dev` and a
/// fresh `/proc`. `pivot_root` then discards every other host path.
///
/// Runs between clone and exec, so nothing here logs.
use crate::config::types::{Result, SandboxError};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::pivot_root;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Working directory as seen by the payload
pub const SANDBOX_WORKDIR: &str = "/work";
const OLD_ROOT: &str = ".oldroot";
const BASE_DEVICES: &[&str] = &["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"];

/// What to put into the new root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootfsPlan {
    /// Empty host directory the scaffold is mounted on
    pub root: PathBuf,
    /// Host paths bound read-only at the same location; missing ones are skipped
    pub ro_binds: Vec<PathBuf>,
    /// Host directory bound read-write at `/work`
    pub workdir: PathBuf,
    /// Extra device nodes (GPU) bound into `/dev`
    pub devices: Vec<PathBuf>,
}

fn mount_err(what: &str, target: &Path, err: nix::errno::Errno) -> SandboxError {
    SandboxError::Mount(format!("{} at {} failed: {}", what, target.display(), err))
}

/// Path of `host` re-rooted under `root`.
pub fn inside(root: &Path, host: &Path) -> PathBuf {
    root.join(host.strip_prefix("/").unwrap_or(host))
}

fn bind(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err("bind", target, e))?;

    // Bind flags only take effect on a remount.
    let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_NOSUID;
    if read_only {
        flags |= MsFlags::MS_RDONLY | MsFlags::MS_NODEV;
    }
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>)
        .map_err(|e| mount_err("remount bind", target, e))
}

/// Create the mount target for `source`: a directory or an empty file.
fn prepare_target(source: &Path, target: &Path) -> Result<()> {
    if source.is_dir() {
        fs::create_dir_all(target)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(target)?;
    }
    Ok(())
}

impl RootfsPlan {
    /// Mount everything under `root`, pivot into it and drop the host tree.
    pub fn build(&self) -> Result<()> {
        let root = &self.root;
        mount(
            Some("sandrun-root"),
            root,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("size=1m,mode=755"),
        )
        .map_err(|e| mount_err("tmpfs root", root, e))?;

        for source in &self.ro_binds {
            if !source.exists() {
                continue;
            }
            let target = inside(root, source);
            prepare_target(source, &target)?;
            bind(source, &target, true)?;
        }

        let work = inside(root, Path::new(SANDBOX_WORKDIR));
        fs::create_dir_all(&work)?;
        bind(&self.workdir, &work, false)?;

        self.mount_dev()?;

        let proc_dir = root.join("proc");
        fs::create_dir_all(&proc_dir)?;
        mount(
            Some("proc"),
            &proc_dir,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .map_err(|e| mount_err("proc", &proc_dir, e))?;

        self.pivot()
    }

    fn mount_dev(&self) -> Result<()> {
        let dev = self.root.join("dev");
        fs::create_dir_all(&dev)?;
        mount(
            Some("sandrun-dev"),
            &dev,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("size=64k,mode=755"),
        )
        .map_err(|e| mount_err("tmpfs /dev", &dev, e))?;

        let nodes = BASE_DEVICES.iter().map(Path::new).chain(self.devices.iter().map(PathBuf::as_path));
        for node in nodes {
            if !node.exists() {
                continue;
            }
            let target = inside(&self.root, node);
            prepare_target(node, &target)?;
            mount(
                Some(node),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| mount_err("device bind", &target, e))?;
        }
        Ok(())
    }

    fn pivot(&self) -> Result<()> {
        let old_root = self.root.join(OLD_ROOT);
        fs::create_dir_all(&old_root)?;
        pivot_root(&self.root, &old_root)
            .map_err(|e| mount_err("pivot_root", &self.root, e))?;
        std::env::set_current_dir("/")?;

        let old_root = Path::new("/").join(OLD_ROOT);
        umount2(&old_root, MntFlags::MNT_DETACH)
            .map_err(|e| mount_err("detach old root", &old_root, e))?;
        fs::remove_dir(&old_root)?;

        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|e| mount_err("read-only remount", Path::new("/"), e))
    }
}
