//! Forward coordinator termination signals to the worker group.
//!
//! Workers live in their own process group, so a terminal's Ctrl-C only
//! reaches the coordinator. While a [`SignalGuard`] is alive, SIGINT and
//! SIGTERM are relayed to the whole group as SIGTERM and the coordinator
//! keeps running long enough to reap and report its workers.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::OnceLock;

static GROUP_ID: AtomicI32 = AtomicI32::new(0);
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub struct SignalGuard;

impl Drop for SignalGuard {
    fn drop(&mut self) {
        GROUP_ID.store(0, Ordering::SeqCst);
    }
}

pub fn install(group_id: i32) -> io::Result<SignalGuard> {
    GROUP_ID.store(group_id, Ordering::SeqCst);
    setup_unix_signal_handlers()?;
    Ok(SignalGuard)
}

/// Whether SIGINT or SIGTERM has been received since start.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

fn setup_unix_signal_handlers() -> io::Result<()> {
    static INIT: OnceLock<Result<(), i32>> = OnceLock::new();

    let result = *INIT.get_or_init(|| unsafe { setup_signal_handlers_safe() });
    result.map_err(io::Error::from_raw_os_error)
}

/// Safe signal handling setup function
/// Encapsulates unsafe code to ensure all safety checks are completed within the function
unsafe fn setup_signal_handlers_safe() -> Result<(), i32> {
    extern "C" fn handler(signum: libc::c_int) {
        handle_unix_signal(signum);
    }

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();

        // Set SA_RESTART flag so the wait on the workers resumes
        action.sa_flags = libc::SA_RESTART;
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask as *mut libc::sigset_t);

        for signum in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EINVAL));
            }
        }
    }

    Ok(())
}

/// Async-signal-safe: atomics and `killpg` only.
fn handle_unix_signal(signum: libc::c_int) {
    match signum {
        libc::SIGINT | libc::SIGTERM => {
            SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
            let pgid = GROUP_ID.load(Ordering::SeqCst);
            if pgid > 0 {
                unsafe {
                    libc::killpg(pgid, libc::SIGTERM);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_clears_group() {
        {
            let _guard = install(i32::MAX).unwrap();
            assert_eq!(GROUP_ID.load(Ordering::SeqCst), i32::MAX);
        }
        assert_eq!(GROUP_ID.load(Ordering::SeqCst), 0);
    }
}
