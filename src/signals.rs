//! Graceful shutdown via a process-wide quit flag.
//!
//! `SIGTERM`, `SIGINT`, and `SIGQUIT` all set the same flag rather than
//! acting directly; reactor workers and the flush thread poll it between
//! blocking calls and unwind on their own, so no signal handler runs on a
//! foreign stack while holding a lock.

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::flag;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Installs handlers for `SIGTERM`/`SIGINT`/`SIGQUIT` that set `flag` to
/// `true`. Returns the same `Arc` for convenience at the call site.
pub fn install(flag_ref: Arc<AtomicBool>) -> io::Result<Arc<AtomicBool>> {
    flag::register(SIGTERM, Arc::clone(&flag_ref))?;
    flag::register(SIGINT, Arc::clone(&flag_ref))?;
    flag::register(SIGQUIT, Arc::clone(&flag_ref))?;
    Ok(flag_ref)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn install_returns_unset_flag() {
        let quit = Arc::new(AtomicBool::new(false));
        let quit = install(quit).unwrap();
        assert!(!quit.load(Ordering::Relaxed));
    }
}
