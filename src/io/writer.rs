use std::{
    io::{self, Write},
    mem,
    sync::mpsc::{self, Receiver, SyncSender, TrySendError},
};

use log::warn;

use crate::pool::BufferPool;

use super::{ErrorSlot, PipelineConfig, task::Task};

enum Chunk {
    Data(Vec<u8>),
    Flush,
}

/// Write side of the pipeline: the caller fills pooled buffers while a background
/// thread performs the blocking writes on the sink.
///
/// A write error on the sink stops the drain thread; the caller sees it on its next
/// `write`, `flush` or [`ZWriter::close`].
///
/// # Example
/// ```rust
/// use std::io::Write;
///
/// use wirebuf::{io::{PipelineConfig, ZWriter}, pool::BufferPool};
///
/// let pool = BufferPool::default();
/// let mut writer = ZWriter::new(Vec::new(), &pool, PipelineConfig::new(4, 2)).unwrap();
///
/// writer.write_all(b"hello world").unwrap();
/// assert_eq!(writer.finish().unwrap(), b"hello world");
/// ```
pub struct ZWriter<W: Write + Send + 'static> {
    pool: BufferPool,
    buffer_size: usize,
    channel_size: usize,
    current: Vec<u8>,
    pending: Option<SyncSender<Chunk>>,
    empty_tx: SyncSender<Vec<u8>>,
    empty: Receiver<Vec<u8>>,
    error: ErrorSlot,
    task: Option<Task<W>>,
}

impl<W: Write + Send + 'static> ZWriter<W> {
    pub fn new(sink: W, pool: &BufferPool, config: PipelineConfig) -> io::Result<Self> {
        let channel_size = config.channel_size();
        let buffer_size = config.buffer_size();
        let (empty_tx, empty) = mpsc::sync_channel(channel_size);

        for _ in 1..channel_size {
            if let Err(TrySendError::Full(buf) | TrySendError::Disconnected(buf)) =
                empty_tx.try_send(pool.get(0, buffer_size))
            {
                pool.put(buf);
            }
        }

        let mut writer = Self {
            pool: pool.clone(),
            buffer_size,
            channel_size,
            current: pool.get(0, buffer_size),
            pending: None,
            empty_tx,
            empty,
            error: ErrorSlot::default(),
            task: None,
        };
        writer.start(sink)?;
        Ok(writer)
    }

    /// Pushes any partially filled buffer to the drain thread and asks it to flush the
    /// sink, then waits until everything queued so far has been written and flushed.
    ///
    /// The drain thread is restarted afterwards, so this acts as a barrier at message
    /// boundaries.
    pub fn hard_flush(&mut self) -> io::Result<()> {
        self.push_current()?;
        let sink = self.stop_task()?;
        self.start(sink)
    }

    /// Flushes, stops the drain thread and returns the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.push_current()?;
        let mut sink = self.stop_task()?;
        sink.flush()?;
        Ok(sink)
    }

    /// Flushes, stops the drain thread and drops (closes) the sink, reporting any error
    /// recorded by the drain thread.
    pub fn close(self) -> io::Result<()> {
        self.finish().map(drop)
    }

    fn start(&mut self, sink: W) -> io::Result<()> {
        let (pending, rx) = mpsc::sync_channel(self.channel_size);
        let empty = self.empty_tx.clone();
        let pool = self.pool.clone();
        let error = self.error.clone();

        let task = Task::spawn("wirebuf-zwriter", move |_| drain(sink, rx, empty, &pool, &error))?;
        self.pending = Some(pending);
        self.task = Some(task);
        Ok(())
    }

    /// Closes the queue, waits for the drain thread and takes the sink back.
    fn stop_task(&mut self) -> io::Result<W> {
        self.pending = None;
        let sink = match self.task.take() {
            Some(task) => Some(task.wait()?),
            None => None,
        };
        if let Some(err) = self.error.get() {
            return Err(err);
        }
        sink.ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "zwriter sink is gone"))
    }

    fn check(&self) -> io::Result<()> {
        match self.error.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn send(&mut self, chunk: Chunk) -> io::Result<()> {
        let Some(pending) = &self.pending else {
            return Err(self.error.get().unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "zwriter is closed")
            }));
        };

        if let Err(mpsc::SendError(chunk)) = pending.send(chunk) {
            if let Chunk::Data(buf) = chunk {
                self.pool.put(buf);
            }
            self.pending = None;
            return Err(self.error.get().unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "zwriter drain thread stopped")
            }));
        }
        Ok(())
    }

    /// Queues the active buffer if it holds anything and takes a fresh one.
    fn push_current(&mut self) -> io::Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let next = match self.empty.try_recv() {
            Ok(buf) => buf,
            Err(_) => self.pool.get(0, self.buffer_size),
        };
        let full = mem::replace(&mut self.current, next);
        self.send(Chunk::Data(full))
    }
}

fn drain<W: Write>(
    mut sink: W,
    pending: Receiver<Chunk>,
    empty: SyncSender<Vec<u8>>,
    pool: &BufferPool,
    error: &ErrorSlot,
) -> W {
    for chunk in pending {
        let result = match chunk {
            Chunk::Data(mut buf) => {
                let result = sink.write_all(&buf);
                buf.clear();
                if let Err(TrySendError::Full(buf) | TrySendError::Disconnected(buf)) =
                    empty.try_send(buf)
                {
                    pool.put(buf);
                }
                result
            }
            Chunk::Flush => sink.flush(),
        };

        if let Err(e) = result {
            warn!("zwriter sink failed: {e}");
            error.set(e);
            return sink;
        }
    }

    if let Err(e) = sink.flush() {
        warn!("zwriter sink flush failed: {e}");
        error.set(e);
    }
    sink
}

impl<W: Write + Send + 'static> Write for ZWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;

        let mut written = 0;
        while written < buf.len() {
            if self.current.len() >= self.buffer_size {
                self.push_current()?;
            }
            let room = self.buffer_size - self.current.len();
            let n = room.min(buf.len() - written);
            self.current.extend_from_slice(&buf[written..written + n]);
            written += n;
        }
        Ok(written)
    }

    /// Pushes the partially filled buffer and asks the drain thread to flush the sink.
    /// Does not wait for the bytes to reach the sink; see [`ZWriter::hard_flush`].
    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.push_current()?;
        self.send(Chunk::Flush)
    }
}

impl<W: Write + Send + 'static> Drop for ZWriter<W> {
    fn drop(&mut self) {
        // Like `BufWriter`, pending bytes are written before the sink is dropped.
        if self.task.is_some() && self.push_current().is_ok() {
            let _ = self.stop_task();
        }
        let current = mem::take(&mut self.current);
        self.pool.put(current);
        while let Ok(buf) = self.empty.try_recv() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{self, File},
        sync::{Arc, Mutex},
        thread,
        time::Duration,
    };

    use tempdir::TempDir;

    use super::*;

    /// Sink recording writes and flushes, optionally failing after `fail_after` bytes.
    #[derive(Clone, Default)]
    struct Recorder {
        data: Arc<Mutex<Vec<u8>>>,
        flushes: Arc<Mutex<usize>>,
        fail_after: Option<usize>,
        delay: Option<Duration>,
    }

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            let mut data = self.data.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if data.len() + buf.len() > limit {
                    return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "peer gone"));
                }
            }
            data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn writes_in_order_across_buffers() {
        let pool = BufferPool::default();
        let mut writer = ZWriter::new(Vec::new(), &pool, PipelineConfig::new(7, 2)).unwrap();

        let data: Vec<u8> = (0..5000).map(|i| (i % 253) as u8).collect();
        for chunk in data.chunks(13) {
            writer.write_all(chunk).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), data);
    }

    #[test]
    fn hard_flush_is_a_barrier() {
        let pool = BufferPool::default();
        let sink = Recorder {
            delay: Some(Duration::from_millis(5)),
            ..Recorder::default()
        };
        let data = Arc::clone(&sink.data);
        let mut writer = ZWriter::new(sink, &pool, PipelineConfig::new(4, 3)).unwrap();

        writer.write_all(b"message one;").unwrap();
        writer.hard_flush().unwrap();
        assert_eq!(&*data.lock().unwrap(), b"message one;");

        writer.write_all(b"two").unwrap();
        writer.hard_flush().unwrap();
        assert_eq!(&*data.lock().unwrap(), b"message one;two");
        writer.close().unwrap();
    }

    #[test]
    fn soft_flush_reaches_sink() {
        let pool = BufferPool::default();
        let sink = Recorder::default();
        let flushes = Arc::clone(&sink.flushes);
        let mut writer = ZWriter::new(sink, &pool, PipelineConfig::new(16, 2)).unwrap();

        writer.write_all(b"abc").unwrap();
        writer.flush().unwrap();
        let sink = writer.finish().unwrap();

        assert_eq!(&*sink.data.lock().unwrap(), b"abc");
        assert!(*flushes.lock().unwrap() >= 1);
    }

    #[test]
    fn sink_error_surfaces() {
        let pool = BufferPool::default();
        let sink = Recorder {
            fail_after: Some(8),
            ..Recorder::default()
        };
        let mut writer = ZWriter::new(sink, &pool, PipelineConfig::new(4, 1)).unwrap();

        writer.write_all(b"12345678").unwrap();
        let err = writer
            .write_all(b"9abcdef")
            .and_then(|_| writer.hard_flush())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(
            writer.close().unwrap_err().kind(),
            io::ErrorKind::ConnectionAborted
        );
    }

    #[test]
    fn drop_after_failure_returns_buffers() {
        let pool = BufferPool::default();
        let sink = Recorder {
            fail_after: Some(0),
            ..Recorder::default()
        };
        let mut writer = ZWriter::new(sink, &pool, PipelineConfig::new(4, 1)).unwrap();

        writer.write_all(b"ab").unwrap();
        assert!(writer.hard_flush().is_err());
        assert_eq!(pool.retained_bytes(), 0);

        // The active buffer and the one recycled by the drain thread.
        drop(writer);
        assert_eq!(pool.retained_bytes(), 8);
    }

    #[test]
    fn drop_writes_pending_bytes() {
        let temp = TempDir::new("zwriter").unwrap();
        let path = temp.path().join("out.bin");
        let pool = BufferPool::default();

        let mut writer = ZWriter::new(
            File::create(&path).unwrap(),
            &pool,
            PipelineConfig::new(8, 2),
        )
        .unwrap();
        writer.write_all(b"persisted through drop").unwrap();
        drop(writer);

        assert_eq!(fs::read(&path).unwrap(), b"persisted through drop");
    }
}
