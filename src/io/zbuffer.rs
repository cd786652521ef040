use std::{
    io::{self, Read, Write},
    mem,
    sync::mpsc::{self, Receiver, SyncSender, TrySendError},
};

use log::trace;

use crate::pool::BufferPool;

use super::{ByteSource, MAX_VARINT_LEN, PipelineConfig, decode_uvarint, read_uvarint_bytewise};

/// Creates an in-memory pipe of fixed-size pooled buffers.
///
/// Full buffers travel from the writer to the reader over the *ready* queue; drained
/// buffers travel back over the *waste* queue, which is filled up front so the steady
/// state allocates nothing. Both sides block when their queue runs dry, bounding the
/// memory in flight to `channel_size` buffers.
///
/// Dropping or closing the writer is end-of-stream for the reader once it has drained
/// what was sent. Dropping the reader makes further writes fail with `BrokenPipe`.
///
/// # Example
/// ```rust
/// use std::{io::{Read, Write}, thread};
///
/// use wirebuf::{io::{PipelineConfig, zbuffer}, pool::BufferPool};
///
/// let pool = BufferPool::default();
/// let (mut writer, mut reader) = zbuffer(&pool, PipelineConfig::new(8, 2));
///
/// let producer = thread::spawn(move || {
///     writer.write_all(b"formatted while being read").unwrap();
///     writer.close().unwrap();
/// });
///
/// let mut out = String::new();
/// reader.read_to_string(&mut out).unwrap();
/// producer.join().unwrap();
/// assert_eq!(out, "formatted while being read");
/// ```
pub fn zbuffer(pool: &BufferPool, config: PipelineConfig) -> (ZBufferWriter, ZBufferReader) {
    let channel_size = config.channel_size();
    let buffer_size = config.buffer_size();
    let (ready_tx, ready_rx) = mpsc::sync_channel(channel_size);
    let (waste_tx, waste_rx) = mpsc::sync_channel(channel_size + 1);

    for _ in 0..channel_size {
        if let Err(TrySendError::Full(buf) | TrySendError::Disconnected(buf)) =
            waste_tx.try_send(pool.get(0, buffer_size))
        {
            pool.put(buf);
        }
    }

    let writer = ZBufferWriter {
        pool: pool.clone(),
        buffer_size,
        current: Vec::new(),
        ready: Some(ready_tx),
        waste: waste_rx,
    };
    let reader = ZBufferReader {
        pool: pool.clone(),
        current: Vec::new(),
        pos: 0,
        ready: ready_rx,
        waste: Some(waste_tx),
    };
    (writer, reader)
}

/// Producing half of a [`zbuffer`].
pub struct ZBufferWriter {
    pool: BufferPool,
    buffer_size: usize,
    current: Vec<u8>,
    ready: Option<SyncSender<Vec<u8>>>,
    waste: Receiver<Vec<u8>>,
}

impl ZBufferWriter {
    /// Flushes pending bytes and marks the stream closed. Buffers still held by the
    /// writer go back to the pool.
    pub fn close(mut self) -> io::Result<()> {
        let result = self.send_current();
        self.release();
        result
    }

    fn release(&mut self) {
        self.ready = None;
        let current = mem::take(&mut self.current);
        self.pool.put(current);
        while let Ok(buf) = self.waste.try_recv() {
            self.pool.put(buf);
        }
    }

    /// Takes an empty buffer from the waste queue, blocking until the reader returns one.
    fn take_empty(&mut self) -> io::Result<()> {
        if self.current.capacity() > 0 {
            return Ok(());
        }
        match self.waste.recv() {
            Ok(mut buf) => {
                buf.clear();
                self.current = buf;
                Ok(())
            }
            Err(_) => Err(broken_pipe()),
        }
    }

    fn send_current(&mut self) -> io::Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let Some(ready) = &self.ready else {
            return Err(broken_pipe());
        };

        let buf = mem::take(&mut self.current);
        if let Err(mpsc::SendError(buf)) = ready.send(buf) {
            self.pool.put(buf);
            self.ready = None;
            return Err(broken_pipe());
        }
        Ok(())
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "zbuffer reader is gone")
}

impl Write for ZBufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.ready.is_none() {
            return Err(broken_pipe());
        }

        let mut written = 0;
        while written < buf.len() {
            self.take_empty()?;
            let room = self.buffer_size.saturating_sub(self.current.len());
            let n = room.min(buf.len() - written);
            self.current.extend_from_slice(&buf[written..written + n]);
            written += n;
            if self.current.len() >= self.buffer_size {
                self.send_current()?;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_current()
    }
}

impl Drop for ZBufferWriter {
    fn drop(&mut self) {
        if self.send_current().is_err() {
            trace!("zbuffer reader gone, dropping pending bytes");
        }
        self.release();
    }
}

/// Consuming half of a [`zbuffer`].
pub struct ZBufferReader {
    pool: BufferPool,
    current: Vec<u8>,
    pos: usize,
    ready: Receiver<Vec<u8>>,
    waste: Option<SyncSender<Vec<u8>>>,
}

impl ZBufferReader {
    /// Stops reading and hands every buffer still in the pipe back to the pool.
    pub fn close(self) {
        drop(self);
    }

    fn ensure_current(&mut self) -> bool {
        if self.pos < self.current.len() {
            return true;
        }

        let drained = mem::take(&mut self.current);
        self.pos = 0;
        if drained.capacity() > 0 {
            match &self.waste {
                Some(waste) => {
                    if let Err(TrySendError::Full(buf) | TrySendError::Disconnected(buf)) =
                        waste.try_send(drained)
                    {
                        self.pool.put(buf);
                    }
                }
                None => self.pool.put(drained),
            }
        }

        match self.ready.recv() {
            Ok(buf) => {
                self.current = buf;
                true
            }
            Err(_) => false,
        }
    }
}

impl Read for ZBufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || !self.ensure_current() {
            return Ok(0);
        }
        let available = &self.current[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl ByteSource for ZBufferReader {
    fn read_byte(&mut self) -> io::Result<u8> {
        if !self.ensure_current() {
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

impl Drop for ZBufferReader {
    fn drop(&mut self) {
        self.waste = None;
        let current = mem::take(&mut self.current);
        self.pool.put(current);
        while let Ok(buf) = self.ready.try_recv() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::io::{ZReader, ZWriter};

    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn concurrent_producer_and_consumer() {
        let pool = BufferPool::default();
        let (mut writer, mut reader) = zbuffer(&pool, PipelineConfig::new(16, 2));
        let data = payload(50_000);

        let expected = data.clone();
        let producer = thread::spawn(move || {
            for chunk in expected.chunks(37) {
                writer.write_all(chunk).unwrap();
            }
            writer.close().unwrap();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        producer.join().unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn zwriter_into_zreader_preserves_order() {
        let pool = BufferPool::default();
        let (sink, source) = zbuffer(&pool, PipelineConfig::new(64, 2));
        let mut writer = ZWriter::new(sink, &pool, PipelineConfig::new(50, 3)).unwrap();
        let mut reader = ZReader::new(source, &pool, PipelineConfig::new(33, 2)).unwrap();
        let data = payload(20_000);

        let expected = data.clone();
        let producer = thread::spawn(move || {
            for chunk in expected.chunks(101) {
                writer.write_all(chunk).unwrap();
            }
            writer.close().unwrap();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        producer.join().unwrap();
        assert_eq!(out, data);
        reader.close().unwrap();
    }

    #[test]
    fn flush_delivers_partial_buffer() {
        let pool = BufferPool::default();
        let (mut writer, mut reader) = zbuffer(&pool, PipelineConfig::new(64, 2));

        writer.write_all(b"\x02hi").unwrap();
        writer.flush().unwrap();

        assert_eq!(reader.read_uvarint().unwrap(), 2);
        let mut buf = [0; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn dropped_reader_breaks_pipe() {
        let pool = BufferPool::default();
        let (mut writer, reader) = zbuffer(&pool, PipelineConfig::new(4, 1));
        reader.close();

        let err = writer.write_all(b"more than one buffer").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn eof_after_writer_drop() {
        let pool = BufferPool::default();
        let (mut writer, mut reader) = zbuffer(&pool, PipelineConfig::new(4, 2));
        writer.write_all(b"ab").unwrap();
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ab");
        assert_eq!(
            reader.read_byte().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn buffers_return_to_pool() {
        let pool = BufferPool::default();
        let (mut writer, mut reader) = zbuffer(&pool, PipelineConfig::new(32, 2));
        writer.write_all(&payload(40)).unwrap();
        writer.close().unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        reader.close();
        assert_eq!(pool.retained_bytes(), 2 * 32);
    }
}
