//! Linux capability management for privilege minimization.
//!
//! Everything here runs in the payload child between fork and exec, so
//! nothing logs; problems come back as errors or status values.

mod drop;
mod query;

pub use drop::{clear_process_capabilities, drop_bounding_and_ambient, set_no_new_privs};
pub use query::{check_no_new_privs, get_capability_status, parse_capability_status, CapabilityStatus};

/// Capability number newtype for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CapabilityNumber(u32);

impl CapabilityNumber {
    pub const MAX_CAP: u32 = 40;

    pub fn new(cap: u32) -> Option<Self> {
        if cap <= Self::MAX_CAP {
            Some(Self(cap))
        } else {
            None
        }
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

pub(crate) const PR_CAPBSET_DROP: libc::c_int = 24;
pub(crate) const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
pub(crate) const PR_GET_NO_NEW_PRIVS: libc::c_int = 39;
pub(crate) const PR_CAP_AMBIENT: libc::c_int = 47;
pub(crate) const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_int = 4;
pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;
