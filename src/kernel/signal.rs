/// Async-signal-safe shutdown flag for the worker binary.
///
/// The handler only stores atomics; the main loop polls the flag and runs
/// the orderly coordinator shutdown itself.
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

const WAIT_SLICE: Duration = Duration::from_millis(100);

extern "C" fn on_signal(signal: libc::c_int) {
    SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installed SIGINT/SIGTERM handler
pub struct ShutdownSignal;

impl ShutdownSignal {
    /// Install handlers. Call from main before spawning threads.
    pub fn install() -> Result<Self, String> {
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only touches atomics.
            unsafe { signal::sigaction(sig, &action) }
                .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
        }
        log::debug!("shutdown handlers installed (SIGINT, SIGTERM)");
        Ok(Self)
    }

    pub fn requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal number received, 0 if none
    pub fn signal(&self) -> i32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    /// Sleep until a signal arrives or `timeout` passes; true on signal.
    pub fn wait(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.requested() {
                return true;
            }
            std::thread::sleep(WAIT_SLICE.min(timeout.saturating_sub(start.elapsed())));
        }
        self.requested()
    }
}
