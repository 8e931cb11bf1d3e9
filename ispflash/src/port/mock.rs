//! Scripted in-memory port for protocol tests.

use {
    crate::{error::Result, port::Port},
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        time::Duration,
    },
};

/// Replays queued replies and records every write.
///
/// Each queued reply behaves like one USB packet: a single `read` never
/// crosses into the next reply, while `read_exact_bytes` keeps reading
/// across replies like a serial stream. An empty queue times out.
#[derive(Debug, Default)]
pub struct MockPort {
    replies: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    timeout: Duration,
    baud_rate: u32,
    closed: bool,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_millis(10),
            baud_rate: 115200,
            ..Default::default()
        }
    }

    /// Queue a reply.
    #[must_use]
    pub fn reply(mut self, bytes: &[u8]) -> Self {
        self.replies
            .push_back(bytes.to_vec());
        self
    }

    /// Queue `count` copies of a reply.
    #[must_use]
    pub fn reply_n(mut self, bytes: &[u8], count: usize) -> Self {
        for _ in 0..count {
            self.replies
                .push_back(bytes.to_vec());
        }
        self
    }

    /// Every buffer passed to `write`, in order.
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// All written bytes concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.writes
            .concat()
    }

    pub fn remaining_replies(&self) -> usize {
        self.replies
            .len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        Ok(self
            .replies
            .front()
            .map_or(0, Vec::len))
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(front) = self
            .replies
            .front_mut()
        else {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no scripted reply"));
        };
        let n = buf
            .len()
            .min(front.len());
        buf[..n].copy_from_slice(&front[..n]);
        front.drain(..n);
        if front.is_empty() {
            self.replies
                .pop_front();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        self.writes
            .push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
