//! Termination and flush signal flags.
//!
//! SIGINT and SIGTERM request shutdown; SIGUSR1 requests a state snapshot
//! without exiting. The handlers only store to atomics; the serve loop
//! polls them.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static FLUSH: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn on_flush(_signal: libc::c_int) {
    FLUSH.store(true, Ordering::SeqCst);
}

/// Install the signal handlers.
pub fn install() -> std::io::Result<()> {
    let terminate = on_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
    let flush = on_flush as extern "C" fn(libc::c_int) as libc::sighandler_t;

    for (signal, handler) in [
        (libc::SIGINT, terminate),
        (libc::SIGTERM, terminate),
        (libc::SIGUSR1, flush),
    ] {
        let previous = unsafe { libc::signal(signal, handler) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Whether shutdown has been requested.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Consume a pending flush request.
pub fn take_flush_request() -> bool {
    FLUSH.swap(false, Ordering::SeqCst)
}
