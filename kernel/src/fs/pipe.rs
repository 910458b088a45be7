//! Kernel pipes.
//!
//! A unidirectional bounded byte stream between a writer and a reader,
//! surfaced to user programs through the `pipe` system call. Reads on an
//! empty pipe and writes on a full one yield until the peer makes
//! progress; a read on an empty pipe whose writer is gone returns EOF.

use alloc::{collections::VecDeque, sync::Arc};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::sched;

/// Default pipe capacity in bytes.
pub const PIPE_CAPACITY: usize = 16 * 1024;

struct PipeInner {
    buffer: VecDeque<u8>,
    capacity: usize,
    write_closed: bool,
    read_closed: bool,
}

type PipeState = Arc<Mutex<PipeInner>>;

/// The read end of a pipe.
pub struct PipeReader {
    inner: PipeState,
}

/// The write end of a pipe.
pub struct PipeWriter {
    inner: PipeState,
}

/// Create a connected `(reader, writer)` pair.
pub fn create_pipe() -> (Arc<PipeReader>, Arc<PipeWriter>) {
    let inner = Arc::new(Mutex::new(PipeInner {
        buffer: VecDeque::new(),
        capacity: PIPE_CAPACITY,
        write_closed: false,
        read_closed: false,
    }));
    (
        Arc::new(PipeReader {
            inner: inner.clone(),
        }),
        Arc::new(PipeWriter { inner }),
    )
}

impl PipeReader {
    /// Read up to `buf.len()` bytes, blocking while the pipe is empty and
    /// the writer still open. Returns 0 at EOF.
    pub fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut pipe = self.inner.lock();
                if !pipe.buffer.is_empty() {
                    let n = buf.len().min(pipe.buffer.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = pipe.buffer.pop_front().expect("length checked");
                    }
                    return Ok(n);
                }
                if pipe.write_closed {
                    return Ok(0);
                }
            }
            sched::relax();
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.inner.lock().read_closed = true;
    }
}

impl PipeWriter {
    /// Write all of `buf`, blocking while the pipe is full. Fails once the
    /// read end is closed.
    pub fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let mut written = 0;
        while written < buf.len() {
            {
                let mut pipe = self.inner.lock();
                if pipe.read_closed {
                    return Err(KernelError::BrokenPipe);
                }
                while written < buf.len() && pipe.buffer.len() < pipe.capacity {
                    pipe.buffer.push_back(buf[written]);
                    written += 1;
                }
                if written == buf.len() {
                    return Ok(written);
                }
            }
            sched::relax();
        }
        Ok(written)
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.inner.lock().write_closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_flow_in_order() {
        let (reader, writer) = create_pipe();
        writer.write(b"hello").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(reader.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn closed_writer_means_eof_after_drain() {
        let (reader, writer) = create_pipe();
        writer.write(b"xy").unwrap();
        drop(writer);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn closed_reader_breaks_writes() {
        let (reader, writer) = create_pipe();
        drop(reader);
        assert_eq!(writer.write(b"z"), Err(KernelError::BrokenPipe));
    }
}
