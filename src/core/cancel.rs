/// Cancellation for a running sandbox.
///
/// A flag plus an eventfd, so a supervisor blocked in poll() wakes up as soon
/// as the token fires.
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    eventfd: Option<OwnedFd>,
}

/// Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        // SAFETY: eventfd returns a fresh descriptor or -1.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        let eventfd = if fd >= 0 {
            // SAFETY: fd was just created and is owned by nothing else.
            Some(unsafe { OwnedFd::from_raw_fd(fd) })
        } else {
            None
        };
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                eventfd,
            }),
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(fd) = &self.inner.eventfd {
            let one: u64 = 1;
            // SAFETY: writes 8 bytes from a live u64 to an eventfd we own.
            unsafe {
                libc::write(
                    fd.as_raw_fd(),
                    &one as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Descriptor that becomes readable once cancelled
    pub fn wake_fd(&self) -> Option<RawFd> {
        self.inner.eventfd.as_ref().map(AsRawFd::as_raw_fd)
    }
}
