//! UID/GID transitions for the payload.
//!
//! setresgid MUST be called BEFORE setresuid.

mod transition;

pub use transition::transition_to_unprivileged;

use crate::config::types::{Result, SandboxError};

/// Reject root UIDs/GIDs.
pub fn validate_ids(uid: u32, gid: u32) -> Result<()> {
    if uid == 0 || gid == 0 {
        return Err(SandboxError::Privilege(format!(
            "Cannot transition to root UID/GID (uid={}, gid={})",
            uid, gid
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_ids_are_rejected() {
        assert!(validate_ids(0, 1000).is_err());
        assert!(validate_ids(1000, 0).is_err());
        assert!(validate_ids(65534, 65534).is_ok());
    }
}
