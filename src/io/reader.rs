use std::{
    io::{self, Read},
    mem,
    sync::mpsc::{self, Receiver, SyncSender, TrySendError},
};

use log::{debug, warn};

use crate::pool::BufferPool;

use super::{
    ByteSource, ErrorSlot, MAX_VARINT_LEN, PipelineConfig, decode_uvarint, read_uvarint_bytewise,
    task::{StopFlag, Task},
};

/// Read side of the pipeline: a background thread refills pooled buffers from the
/// source while the caller drains them.
///
/// The fill thread issues exactly one `read` per buffer and forwards whatever it got,
/// short reads included. On end-of-stream or error it stops and closes the ready queue,
/// so the caller first drains the buffers already in flight and then observes the
/// recorded error (or a clean EOF).
///
/// # Example
/// ```rust
/// use std::io::Read;
///
/// use wirebuf::{io::{PipelineConfig, ZReader}, pool::BufferPool};
///
/// let pool = BufferPool::default();
/// let mut reader = ZReader::new(&b"hello world"[..], &pool, PipelineConfig::new(4, 2)).unwrap();
///
/// let mut out = String::new();
/// reader.read_to_string(&mut out).unwrap();
/// assert_eq!(out, "hello world");
/// ```
pub struct ZReader {
    pool: BufferPool,
    buffer_size: usize,
    current: Vec<u8>,
    pos: usize,
    empty: Option<SyncSender<Vec<u8>>>,
    ready: Option<Receiver<Vec<u8>>>,
    error: ErrorSlot,
    task: Option<Task<()>>,
}

impl ZReader {
    /// Starts the fill thread over `source`.
    ///
    /// The source is owned by the fill thread and dropped (closing it) when the thread
    /// ends.
    pub fn new<R>(source: R, pool: &BufferPool, config: PipelineConfig) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let channel_size = config.channel_size();
        let buffer_size = config.buffer_size();
        let (empty_tx, empty_rx) = mpsc::sync_channel(channel_size);
        let (ready_tx, ready_rx) = mpsc::sync_channel(channel_size);

        for _ in 0..channel_size {
            if let Err(TrySendError::Full(buf) | TrySendError::Disconnected(buf)) =
                empty_tx.try_send(pool.get(0, buffer_size))
            {
                pool.put(buf);
            }
        }

        let error = ErrorSlot::default();
        let task = {
            let pool = pool.clone();
            let error = error.clone();
            Task::spawn("wirebuf-zreader", move |stop| {
                fill(source, empty_rx, ready_tx, buffer_size, &pool, &error, &stop)
            })?
        };

        Ok(Self {
            pool: pool.clone(),
            buffer_size,
            current: Vec::new(),
            pos: 0,
            empty: Some(empty_tx),
            ready: Some(ready_rx),
            error,
            task: Some(task),
        })
    }

    /// Unread bytes of the active buffer.
    pub fn buffered(&self) -> &[u8] {
        &self.current[self.pos..]
    }

    /// Fills `buf` completely. A stream ending early is `UnexpectedEof`.
    pub fn read_full(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.ensure_current()? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {filled} of {} bytes", buf.len()),
                ));
            }
            filled += self.copy_out(&mut buf[filled..]);
        }
        Ok(())
    }

    /// Hands the unread part of the active buffer to the caller without copying it
    /// into another buffer. Returns `None` at end-of-stream.
    ///
    /// The caller owns the returned buffer and may give it back with
    /// [`BufferPool::put`]. A fresh pooled buffer takes its place in the ring.
    pub fn read_next_buffer(&mut self) -> io::Result<Option<Vec<u8>>> {
        if !self.ensure_current()? {
            return Ok(None);
        }

        let mut buf = mem::take(&mut self.current);
        self.give_empty(self.pool.get(0, self.buffer_size));
        if self.pos > 0 {
            let len = buf.len();
            buf.copy_within(self.pos.., 0);
            buf.truncate(len - self.pos);
        }
        self.pos = 0;
        Ok(Some(buf))
    }

    /// Moves the cursor of the active buffer back by `n` bytes.
    pub fn unread_current_buffer(&mut self, n: usize) -> io::Result<()> {
        if n > self.pos {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot unread {n} bytes, only {} consumed", self.pos),
            ));
        }
        self.pos -= n;
        Ok(())
    }

    /// Places `pre` in front of the unread part of the active buffer, so the next reads
    /// return `pre` followed by the bytes that were pending.
    pub fn prepend_current_buffer(&mut self, pre: &[u8]) {
        if pre.is_empty() {
            return;
        }

        // Enough consumed space before the cursor.
        if self.pos >= pre.len() {
            self.pos -= pre.len();
            self.current[self.pos..self.pos + pre.len()].copy_from_slice(pre);
            return;
        }

        // Shift the unread bytes to the tail of the buffer to make room.
        let len = self.current.len();
        let unread = len - self.pos;
        let capacity = self.current.capacity();
        if capacity >= unread + pre.len() {
            self.current.resize(capacity, 0);
            let start = capacity - unread;
            self.current.copy_within(self.pos..len, start);
            self.pos = start - pre.len();
            self.current[self.pos..start].copy_from_slice(pre);
            return;
        }

        let mut buf = self.pool.get(0, pre.len() + unread);
        buf.extend_from_slice(pre);
        buf.extend_from_slice(&self.current[self.pos..]);
        let old = mem::replace(&mut self.current, buf);
        self.pos = 0;
        self.pool.put(old);
    }

    /// Stops the fill thread, waits for it and returns all buffers to the pool.
    ///
    /// A fill thread blocked inside the source's `read` is only joined once that read
    /// returns; shut the underlying socket down first when that can hang.
    pub fn close(mut self) -> io::Result<()> {
        self.shutdown();
        if let Some(task) = self.task.take() {
            task.join()?;
        }
        self.drain_ready();
        self.ready = None;
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(task) = &self.task {
            task.stop();
        }
        self.empty = None;
        self.drain_ready();
        let current = mem::take(&mut self.current);
        self.pos = 0;
        self.pool.put(current);
    }

    fn drain_ready(&mut self) {
        if let Some(ready) = &self.ready {
            while let Ok(buf) = ready.try_recv() {
                self.pool.put(buf);
            }
        }
    }

    /// Makes sure the active buffer has unread bytes. `false` means clean EOF.
    fn ensure_current(&mut self) -> io::Result<bool> {
        if self.pos < self.current.len() {
            return Ok(true);
        }
        self.recycle_current();

        let next = match &self.ready {
            Some(ready) => ready.recv().ok(),
            None => None,
        };
        match next {
            Some(buf) => {
                self.current = buf;
                self.pos = 0;
                Ok(true)
            }
            None => {
                self.ready = None;
                match self.error.get() {
                    Some(err) => Err(err),
                    None => Ok(false),
                }
            }
        }
    }

    fn recycle_current(&mut self) {
        let buf = mem::take(&mut self.current);
        self.pos = 0;
        if buf.capacity() == 0 {
            return;
        }
        self.give_empty(buf);
    }

    /// Hands a drained buffer back to the fill thread, or to the pool once the ring is
    /// closed or full.
    fn give_empty(&self, buf: Vec<u8>) {
        match &self.empty {
            Some(empty) => {
                if let Err(TrySendError::Full(buf) | TrySendError::Disconnected(buf)) =
                    empty.try_send(buf)
                {
                    self.pool.put(buf);
                }
            }
            None => self.pool.put(buf),
        }
    }

    fn copy_out(&mut self, buf: &mut [u8]) -> usize {
        let available = &self.current[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        n
    }
}

fn fill<R: Read>(
    mut source: R,
    empty: Receiver<Vec<u8>>,
    ready: SyncSender<Vec<u8>>,
    buffer_size: usize,
    pool: &BufferPool,
    error: &ErrorSlot,
    stop: &StopFlag,
) {
    while let Ok(mut buf) = empty.recv() {
        if stop.is_stopped() {
            pool.put(buf);
            break;
        }
        buf.resize(buffer_size, 0);

        let n = loop {
            match source.read(&mut buf) {
                Ok(n) => break Some(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("zreader source failed: {e}");
                    error.set(e);
                    break None;
                }
            }
        };

        match n {
            Some(0) => {
                debug!("zreader source reached end of stream");
                pool.put(buf);
                break;
            }
            Some(n) => {
                buf.truncate(n);
                if let Err(mpsc::SendError(buf)) = ready.send(buf) {
                    pool.put(buf);
                    break;
                }
            }
            None => {
                pool.put(buf);
                break;
            }
        }
    }

    drop(ready);
    while let Ok(buf) = empty.try_recv() {
        pool.put(buf);
    }
}

impl Read for ZReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || !self.ensure_current()? {
            return Ok(0);
        }
        Ok(self.copy_out(buf))
    }
}

impl ByteSource for ZReader {
    fn read_byte(&mut self) -> io::Result<u8> {
        if !self.ensure_current()? {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let byte = self.current[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn read_uvarint(&mut self) -> io::Result<u64> {
        if self.current.len() - self.pos >= MAX_VARINT_LEN {
            if let Some((value, n)) = decode_uvarint(&self.current[self.pos..])? {
                self.pos += n;
                return Ok(value);
            }
        }
        read_uvarint_bytewise(self)
    }
}

impl Drop for ZReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}
