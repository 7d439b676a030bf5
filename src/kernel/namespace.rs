/// Namespace isolation for the sandbox proxy.
///
/// Namespaces are created by `clone()` in the supervisor; the functions here
/// run inside the child and finish configuring the new namespaces.
use crate::config::types::{Result, SandboxError};

use nix::sched::CloneFlags;
use nix::unistd::sethostname;
use serde::{Deserialize, Serialize};

pub const SANDBOX_HOSTNAME: &str = "sandrun";

/// Which namespaces a sandbox gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSet {
    pub pid: bool,
    pub mount: bool,
    pub network: bool,
    pub ipc: bool,
    pub uts: bool,
}

impl Default for NamespaceSet {
    /// PID, mount, network, IPC and UTS; user namespaces are not used.
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            network: true,
            ipc: true,
            uts: true,
        }
    }
}

impl NamespaceSet {
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    pub fn enabled(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for (on, name) in [
            (self.pid, "pid"),
            (self.mount, "mnt"),
            (self.network, "net"),
            (self.ipc, "ipc"),
            (self.uts, "uts"),
        ] {
            if on {
                names.push(name);
            }
        }
        names
    }

    /// Check if namespace isolation is supported on this system
    pub fn is_supported() -> bool {
        std::fs::read_dir("/proc/self/ns").is_ok()
    }
}

/// Inode identifying the namespace of `kind` for `pid` ("self" allowed).
pub fn namespace_inode(pid: &str, kind: &str) -> Option<u64> {
    let link = std::fs::read_link(format!("/proc/{}/ns/{}", pid, kind)).ok()?;
    // Format: "pid:[4026531836]"
    let text = link.to_string_lossy();
    let start = text.find('[')? + 1;
    let end = text.find(']')?;
    text.get(start..end)?.parse().ok()
}

/// Confirm the child really is in fresh namespaces and name its UTS.
///
/// Runs in the cloned proxy; must not log.
pub fn configure_inside(set: &NamespaceSet) -> Result<()> {
    if set.pid && std::process::id() != 1 {
        return Err(SandboxError::Namespace(format!(
            "expected to be PID 1 in new pid namespace, got {}",
            std::process::id()
        )));
    }
    if set.uts {
        sethostname(SANDBOX_HOSTNAME)
            .map_err(|e| SandboxError::Namespace(format!("sethostname failed: {}", e)))?;
    }
    Ok(())
}

/// Make every mount under / private so nothing done in the sandbox
/// propagates back to the host.
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        SandboxError::Namespace(format!(
            "failed to set MS_PRIVATE|MS_REC on /: {}; sandbox mounts could propagate to host",
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_covers_five_namespaces() {
        let flags = NamespaceSet::default().clone_flags();
        for f in [
            CloneFlags::CLONE_NEWPID,
            CloneFlags::CLONE_NEWNS,
            CloneFlags::CLONE_NEWNET,
            CloneFlags::CLONE_NEWIPC,
            CloneFlags::CLONE_NEWUTS,
        ] {
            assert!(flags.contains(f));
        }
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
        assert_eq!(NamespaceSet::default().enabled().len(), 5);
    }

    #[test]
    fn own_namespace_inode_is_readable() {
        if !NamespaceSet::is_supported() {
            return;
        }
        assert!(namespace_inode("self", "pid").is_some());
        assert_eq!(namespace_inode("self", "no-such-ns"), None);
    }
}
