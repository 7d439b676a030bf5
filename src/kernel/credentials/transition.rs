//! Safe UID/GID transition to the sandbox user.

use super::validate_ids;
use crate::config::types::{Result, SandboxError};

/// validate -> clear groups -> setresgid -> setresuid -> verify.
pub fn transition_to_unprivileged(uid: u32, gid: u32) -> Result<()> {
    validate_ids(uid, gid)?;

    nix::unistd::setgroups(&[]).map_err(|e| {
        SandboxError::Privilege(format!("Failed to clear supplementary groups: {}", e))
    })?;

    // SAFETY: setresgid/setresuid take plain integers; ids validated non-root.
    if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
        return Err(SandboxError::Privilege(format!(
            "Failed to setresgid({}): {}",
            gid,
            std::io::Error::last_os_error()
        )));
    }
    if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
        return Err(SandboxError::Privilege(format!(
            "Failed to setresuid({}): {}",
            uid,
            std::io::Error::last_os_error()
        )));
    }

    verify_transition(uid, gid)
}

fn verify_transition(expected_uid: u32, expected_gid: u32) -> Result<()> {
    use nix::unistd::{getegid, geteuid, getgid, getuid};

    let (ruid, euid) = (getuid().as_raw(), geteuid().as_raw());
    let (rgid, egid) = (getgid().as_raw(), getegid().as_raw());

    if ruid != expected_uid || euid != expected_uid {
        return Err(SandboxError::Privilege(format!(
            "UID verification failed: expected {}, got real={}, effective={}",
            expected_uid, ruid, euid
        )));
    }
    if rgid != expected_gid || egid != expected_gid {
        return Err(SandboxError::Privilege(format!(
            "GID verification failed: expected {}, got real={}, effective={}",
            expected_gid, rgid, egid
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_rejects_root_targets() {
        assert!(transition_to_unprivileged(0, 1000).is_err());
        assert!(transition_to_unprivileged(1000, 0).is_err());
    }
}
