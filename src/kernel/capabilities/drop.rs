//! Capability removal. Every step is idempotent.
use super::{
    CapabilityNumber, LINUX_CAPABILITY_VERSION_3, PR_CAPBSET_DROP, PR_CAP_AMBIENT,
    PR_CAP_AMBIENT_CLEAR_ALL, PR_SET_NO_NEW_PRIVS,
};
use crate::config::types::{Result, SandboxError};

/// Empty the bounding and ambient sets.
///
/// Must run before the uid change: PR_CAPBSET_DROP needs CAP_SETPCAP.
pub fn drop_bounding_and_ambient() -> Result<()> {
    for cap in 0..=CapabilityNumber::MAX_CAP {
        // SAFETY: prctl(PR_CAPBSET_DROP) with any cap number is safe; EINVAL
        // for numbers the kernel does not know is ignored.
        let rc = unsafe { libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(SandboxError::Privilege(format!(
                    "PR_CAPBSET_DROP({}) failed: {}",
                    cap, err
                )));
            }
        }
    }

    // SAFETY: PR_CAP_AMBIENT_CLEAR_ALL takes no pointers. Kernels without
    // ambient support return EINVAL, which leaves nothing to clear.
    let rc = unsafe { libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) {
            return Err(SandboxError::Privilege(format!(
                "clearing ambient capabilities failed: {}",
                err
            )));
        }
    }
    Ok(())
}

/// Zero effective, permitted and inheritable sets via capset(2).
pub fn clear_process_capabilities() -> Result<()> {
    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: i32,
    }

    #[repr(C)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // Version 3 takes two entries: caps 0-31 and caps 32-63.
    let data = [
        CapUserData { effective: 0, permitted: 0, inheritable: 0 },
        CapUserData { effective: 0, permitted: 0, inheritable: 0 },
    ];

    // SAFETY: valid header and two zeroed data entries that outlive the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // After setresuid to a non-root uid the sets are already empty and
        // capset may refuse with EPERM.
        if err.raw_os_error() != Some(libc::EPERM) {
            return Err(SandboxError::Privilege(format!("capset failed: {}", err)));
        }
    }
    Ok(())
}

/// Prevent privilege escalation via execve (setuid, file capabilities).
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1) is safe and idempotent.
    let rc = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(SandboxError::Privilege(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
