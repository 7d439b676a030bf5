//! Symlink-safe tree removal.
//!
//! Walks with openat/fstatat/unlinkat relative to directory descriptors, so a
//! payload that swapped a directory for a symlink cannot redirect deletion
//! outside the tree. Refuses to descend into a different filesystem.

use crate::config::types::{Result, SandboxError};
use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const DIR_FLAGS: libc::c_int = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW;

fn fs_err(what: &str, detail: impl std::fmt::Display) -> SandboxError {
    SandboxError::Filesystem(format!("{}: {}", what, detail))
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| fs_err("path contains NUL byte", path.display()))
}

fn open_dir_at(parent: RawFd, name: &CStr) -> Result<OwnedFd> {
    // SAFETY: name is NUL-terminated; the result is checked before use.
    let fd = unsafe { libc::openat(parent, name.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        return Err(fs_err(
            &format!("openat {:?}", name),
            std::io::Error::last_os_error(),
        ));
    }
    // SAFETY: fresh descriptor owned by nothing else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn stat_at(parent: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    // SAFETY: st has room for one stat struct.
    let rc = unsafe {
        libc::fstatat(parent, name.as_ptr(), st.as_mut_ptr(), libc::AT_SYMLINK_NOFOLLOW)
    };
    if rc != 0 {
        return Err(fs_err(
            &format!("fstatat {:?}", name),
            std::io::Error::last_os_error(),
        ));
    }
    // SAFETY: fstatat succeeded and initialised the struct.
    Ok(unsafe { st.assume_init() })
}

fn unlink_at(parent: RawFd, name: &CStr, flags: libc::c_int) -> Result<()> {
    // SAFETY: name is NUL-terminated.
    if unsafe { libc::unlinkat(parent, name.as_ptr(), flags) } != 0 {
        return Err(fs_err(
            &format!("unlinkat {:?}", name),
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Entry names of the directory behind `dir`, without `.` and `..`.
fn entry_names(dir: &OwnedFd) -> Result<Vec<CString>> {
    // fdopendir takes ownership of the descriptor it is given.
    // SAFETY: dup returns a new descriptor or -1.
    let iter_fd = unsafe { libc::dup(dir.as_raw_fd()) };
    if iter_fd < 0 {
        return Err(fs_err("dup", std::io::Error::last_os_error()));
    }
    // SAFETY: iter_fd is a valid directory descriptor.
    let stream = unsafe { libc::fdopendir(iter_fd) };
    if stream.is_null() {
        // SAFETY: fdopendir failed, so iter_fd is still ours to close.
        unsafe { libc::close(iter_fd) };
        return Err(fs_err("fdopendir", std::io::Error::last_os_error()));
    }

    let mut names = Vec::new();
    let outcome = loop {
        // SAFETY: errno is thread-local; reset to tell end-of-stream from error.
        unsafe { *libc::__errno_location() = 0 };
        // SAFETY: stream is a live DIR*.
        let entry = unsafe { libc::readdir(stream) };
        if entry.is_null() {
            // SAFETY: reads the thread-local errno.
            let errno = unsafe { *libc::__errno_location() };
            break if errno == 0 {
                Ok(())
            } else {
                Err(fs_err("readdir", std::io::Error::from_raw_os_error(errno)))
            };
        }
        // SAFETY: d_name is NUL-terminated inside the returned entry.
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        if name.to_bytes() != b"." && name.to_bytes() != b".." {
            names.push(name.to_owned());
        }
    };
    // SAFETY: closes the stream and iter_fd with it.
    unsafe { libc::closedir(stream) };
    outcome.map(|()| names)
}

fn remove_contents(dir: &OwnedFd, root_dev: libc::dev_t) -> Result<()> {
    for name in entry_names(dir)? {
        let st = stat_at(dir.as_raw_fd(), &name)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != root_dev {
                return Err(fs_err(
                    "refusing to cross filesystem boundary at",
                    format!("{:?}", name),
                ));
            }
            let child = open_dir_at(dir.as_raw_fd(), &name)?;
            remove_contents(&child, root_dev)?;
            unlink_at(dir.as_raw_fd(), &name, libc::AT_REMOVEDIR)?;
        } else {
            unlink_at(dir.as_raw_fd(), &name, 0)?;
        }
    }
    Ok(())
}

/// Remove `path` and everything below it without following symlinks.
/// A missing path is not an error.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_err() {
        return Ok(());
    }
    let parent = path
        .parent()
        .ok_or_else(|| fs_err("cannot remove path without parent", path.display()))?;
    let name = path
        .file_name()
        .ok_or_else(|| fs_err("cannot remove path without file name", path.display()))?;
    let name = CString::new(name.as_bytes())
        .map_err(|_| fs_err("path contains NUL byte", path.display()))?;

    let parent_c = c_path(parent)?;
    // SAFETY: parent_c is NUL-terminated.
    let parent_fd = unsafe { libc::open(parent_c.as_ptr(), DIR_FLAGS) };
    if parent_fd < 0 {
        return Err(fs_err(
            &format!("open {}", parent.display()),
            std::io::Error::last_os_error(),
        ));
    }
    // SAFETY: fresh descriptor owned by nothing else.
    let parent_fd = unsafe { OwnedFd::from_raw_fd(parent_fd) };

    let st = stat_at(parent_fd.as_raw_fd(), &name)?;
    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        let dir = open_dir_at(parent_fd.as_raw_fd(), &name)?;
        remove_contents(&dir, st.st_dev)?;
        unlink_at(parent_fd.as_raw_fd(), &name, libc::AT_REMOVEDIR)
    } else {
        unlink_at(parent_fd.as_raw_fd(), &name, 0)
    }
}
