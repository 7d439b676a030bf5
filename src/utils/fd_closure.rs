/// File descriptor closure for the sandbox child.
///
/// Prefers close_range(2) over the gaps between the descriptors to keep and
/// falls back to walking /proc/self/fd. Runs after clone, so no logging.
use crate::config::types::{Result, SandboxError};
use std::os::unix::io::RawFd;

/// Ranges `[first, last]` above stderr that contain none of `keep`.
pub fn closable_ranges(keep: &[RawFd]) -> Vec<(u32, u32)> {
    let mut kept: Vec<u32> = keep
        .iter()
        .filter(|&&fd| fd > 2)
        .map(|&fd| fd as u32)
        .collect();
    kept.sort_unstable();
    kept.dedup();

    let mut ranges = Vec::with_capacity(kept.len() + 1);
    let mut next = 3u32;
    for fd in kept {
        if fd > next {
            ranges.push((next, fd - 1));
        }
        next = fd + 1;
    }
    ranges.push((next, u32::MAX));
    ranges
}

/// Close every descriptor above stderr except those in `keep`.
pub fn close_inherited_fds(keep: &[RawFd]) -> Result<()> {
    let ranges = closable_ranges(keep);
    let mut supported = true;
    for &(first, last) in &ranges {
        // SAFETY: close_range only closes descriptors; none in the range
        // are referenced afterwards.
        let rc = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0u32) };
        if rc != 0 {
            supported = false;
            break;
        }
    }
    if supported {
        return Ok(());
    }
    close_fds_via_proc(keep)
}

fn close_fds_via_proc(keep: &[RawFd]) -> Result<()> {
    // Collect first; closing while iterating would close the dir fd itself.
    let fds: Vec<RawFd> = open_fds()?;
    for fd in fds {
        if fd > 2 && !keep.contains(&fd) {
            match nix::unistd::close(fd) {
                Ok(()) | Err(nix::errno::Errno::EBADF) => {}
                Err(e) => {
                    return Err(SandboxError::Process(format!("close({}) failed: {}", fd, e)))
                }
            }
        }
    }
    Ok(())
}

/// Currently open descriptors, ascending
pub fn open_fds() -> Result<Vec<RawFd>> {
    let entries = std::fs::read_dir("/proc/self/fd")
        .map_err(|e| SandboxError::Process(format!("Failed to read /proc/self/fd: {}", e)))?;
    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_skip_kept_descriptors() {
        assert_eq!(closable_ranges(&[]), vec![(3, u32::MAX)]);
        assert_eq!(closable_ranges(&[1, 2]), vec![(3, u32::MAX)]);
        assert_eq!(
            closable_ranges(&[7, 3, 9, 7]),
            vec![(4, 6), (8, 8), (10, u32::MAX)]
        );
        assert_eq!(closable_ranges(&[4]), vec![(3, 3), (5, u32::MAX)]);
    }

    #[test]
    fn standard_streams_are_listed() {
        let fds = open_fds().unwrap();
        assert!(fds.contains(&0) || fds.contains(&1) || fds.contains(&2));
    }
}
