//! Point-to-point byte streams between host and device.
//!
//! Reads never block: "nothing yet" is `Ok(0)`, and a peer that has gone away
//! is reported as [`io::ErrorKind::UnexpectedEof`] once its data is drained.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

pub trait ByteLink: Send {
    /// Bytes that can be read right now without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Read whatever is available, up to `buf.len()`. Returns `Ok(0)` when
    /// nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write and flush the whole buffer.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<T: ByteLink + ?Sized> ByteLink for Box<T> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        (**self).bytes_available()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_available(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }
}

impl<T: ByteLink + ?Sized> ByteLink for &mut T {
    fn bytes_available(&mut self) -> io::Result<usize> {
        (**self).bytes_available()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_available(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }
}

// ============================================================================
// Serial port
// ============================================================================

#[cfg(feature = "serial")]
pub use serial::{SerialConfig, SerialLink};

#[cfg(feature = "serial")]
mod serial {
    use super::ByteLink;
    use serialport::SerialPort;
    use std::io::{self, Read, Write};
    use std::time::Duration;
    use tracing::info;

    #[derive(Debug, Clone)]
    pub struct SerialConfig {
        pub path: String,
        pub baud_rate: u32,
        pub timeout: Duration,
    }

    impl Default for SerialConfig {
        fn default() -> Self {
            Self {
                path: "/dev/ttyACM0".to_string(),
                baud_rate: crate::protocol::DEFAULT_BAUD,
                timeout: Duration::from_secs(1),
            }
        }
    }

    pub struct SerialLink {
        port: Box<dyn SerialPort>,
    }

    impl SerialLink {
        pub fn open(config: &SerialConfig) -> io::Result<Self> {
            let port = serialport::new(&config.path, config.baud_rate)
                .timeout(config.timeout)
                .open()?;
            info!(path = %config.path, baud = config.baud_rate, "Serial port opened");
            Ok(Self { port })
        }
    }

    impl ByteLink for SerialLink {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.port.bytes_to_read()? as usize)
        }

        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let available = self.bytes_available()?.min(buf.len());
            if available == 0 {
                return Ok(0);
            }
            match self.port.read(&mut buf[..available]) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(e),
            }
        }

        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            Write::write_all(&mut self.port, bytes)?;
            Write::flush(&mut self.port)
        }
    }
}

// ============================================================================
// In-memory duplex link
// ============================================================================

#[derive(Default)]
struct Pipe {
    data: Mutex<VecDeque<u8>>,
    writer_gone: AtomicBool,
    reader_gone: AtomicBool,
}

impl Pipe {
    fn data(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One end of an in-process duplex byte stream. Dropping an end closes it.
pub struct MemoryLink {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
}

impl MemoryLink {
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        (
            MemoryLink {
                rx: Arc::clone(&b_to_a),
                tx: Arc::clone(&a_to_b),
            },
            MemoryLink {
                rx: a_to_b,
                tx: b_to_a,
            },
        )
    }
}

impl ByteLink for MemoryLink {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let data = self.rx.data();
        if data.is_empty() && self.rx.writer_gone.load(Ordering::Acquire) {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(data.len())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut data = self.rx.data();
        if data.is_empty() {
            if self.rx.writer_gone.load(Ordering::Acquire) {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            return Ok(0);
        }
        let n = data.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.tx.reader_gone.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.tx.data().extend(bytes);
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.tx.writer_gone.store(true, Ordering::Release);
        self.rx.reader_gone.store(true, Ordering::Release);
    }
}

// ============================================================================
// Line reassembly
// ============================================================================

/// Reassembles newline-terminated text lines from a polled byte stream.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next line without its terminator, or `None` once the link has been
    /// quiet for `timeout` or has closed.
    pub fn read_line<L: ByteLink + ?Sized>(
        &mut self,
        link: &mut L,
        timeout: Duration,
        poll_interval: Duration,
    ) -> io::Result<Option<String>> {
        let mut deadline = Instant::now() + timeout;
        let mut temp = [0u8; 256];
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let line = self.pending.drain(..=pos).collect::<Vec<u8>>();
                return Ok(Some(decode_line(&line)));
            }

            match link.read_available(&mut temp) {
                Ok(0) => {
                    if Instant::now() >= deadline {
                        return Ok(self.take_partial());
                    }
                    thread::sleep(poll_interval);
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&temp[..n]);
                    deadline = Instant::now() + timeout;
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(self.take_partial());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn take_partial(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(decode_line(&line))
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}
