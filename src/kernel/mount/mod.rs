//! Filesystem isolation.
//!
//! - [`rootfs`]: the private root assembled inside the sandbox
//! - [`tmpfs`]: host-side tmpfs mounts and mountinfo inspection

pub mod rootfs;
pub mod tmpfs;

pub use rootfs::{RootfsPlan, SANDBOX_WORKDIR};
pub use tmpfs::{list_mounts_under, mount_tmpfs, unmount_lazy, TmpfsOptions};
