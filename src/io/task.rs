use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use log::{debug, warn};

/// Stop signal shared between a [`Task`] and the loop it runs.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A named background thread with an explicit stop signal.
///
/// The loop body receives the [`StopFlag`] and is expected to check it between
/// blocking operations. Joining returns whatever the loop produced, which lets
/// pipelines hand ownership of their source or sink back to the caller.
#[derive(Debug)]
pub struct Task<T> {
    name: String,
    stop: StopFlag,
    handle: Option<thread::JoinHandle<T>>,
}

impl<T: Send + 'static> Task<T> {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> io::Result<Self>
    where
        F: FnOnce(StopFlag) -> T + Send + 'static,
    {
        let name = name.into();
        let stop = StopFlag::default();
        let flag = stop.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || f(flag))?;
        debug!("task {name} started");

        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Signals the task and waits for it to finish.
    pub fn join(self) -> io::Result<T> {
        self.stop.stop();
        self.wait()
    }

    /// Waits for the loop to finish on its own, without raising the stop flag.
    pub fn wait(mut self) -> io::Result<T> {
        let handle = self.handle.take().ok_or_else(|| {
            io::Error::other(format!("task {} already joined", self.name))
        })?;

        match handle.join() {
            Ok(out) => {
                debug!("task {} finished", self.name);
                Ok(out)
            }
            Err(_) => {
                warn!("task {} panicked", self.name);
                Err(io::Error::other(format!("task {} panicked", self.name)))
            }
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop.stop();
            debug!("task {} detached", self.name);
        }
    }
}
