use std::{
    io,
    sync::{Weak, mpsc},
    time::Duration,
};

use log::debug;

use crate::io::task::Task;

use super::PoolInner;

/// Starts the idle monitor of a pool.
///
/// The loop wakes once per `interval` and sweeps the buckets. It ends when the
/// pool drops its end of `signal` or the task is stopped.
pub(super) fn spawn(
    pool: Weak<PoolInner>,
    interval: Duration,
    signal: mpsc::Receiver<()>,
) -> io::Result<Task<()>> {
    Task::spawn("wirebuf-pool-monitor", move |stop| {
        let mut seen = Vec::new();

        loop {
            match signal.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if stop.is_stopped() {
                break;
            }

            // Not upgradable while the pool is still being constructed.
            let Some(inner) = pool.upgrade() else {
                continue;
            };

            let released = inner.sweep(&mut seen);
            if released > 0 {
                debug!(
                    "idle cleanup released {released} bytes, {} retained",
                    inner.retained_bytes()
                );
            }
        }
    })
}
