//! Chunked stream copy
//!
//! Moves bytes from one stream to another in chunks, checking the control
//! handle and accounting progress between chunks.

use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::control::TransferControl;
use super::progress::OperationProgress;
use crate::error::TransferError;

/// Starting chunk size (256 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Per-I/O timeout. A read or write stalling longer than this fails the file
/// instead of leaving a zombie transfer.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(300);

/// Adjusts the chunk size to measured throughput.
///
/// Slow links get small chunks so cancellation and progress stay
/// responsive; fast links get large ones.
#[derive(Debug)]
pub struct AdaptiveChunkSizer {
    current: usize,
    adaptive: bool,
    window_bytes: u64,
    window_start: Instant,
}

impl AdaptiveChunkSizer {
    /// Smallest adaptive chunk (64 KB)
    pub const MIN_CHUNK: usize = 64 * 1024;
    /// Largest chunk (2 MB)
    pub const MAX_CHUNK: usize = 2 * 1024 * 1024;
    const ADAPT_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(initial: usize) -> Self {
        Self {
            current: initial.clamp(Self::MIN_CHUNK, Self::MAX_CHUNK),
            adaptive: true,
            window_bytes: 0,
            window_start: Instant::now(),
        }
    }

    /// Never adapts. Any size ≥ 1 is accepted.
    pub fn fixed(size: usize) -> Self {
        Self {
            current: size.clamp(1, Self::MAX_CHUNK),
            adaptive: false,
            window_bytes: 0,
            window_start: Instant::now(),
        }
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.current
    }

    /// Record `bytes` transferred; recalculates once per window.
    pub fn record(&mut self, bytes: usize) {
        if !self.adaptive {
            return;
        }
        self.window_bytes += bytes as u64;

        let elapsed = self.window_start.elapsed();
        if elapsed >= Self::ADAPT_INTERVAL {
            let throughput = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.current = Self::throughput_to_chunk(throughput as u64);
            self.window_bytes = 0;
            self.window_start = Instant::now();
        }
    }

    #[inline]
    fn throughput_to_chunk(bytes_per_sec: u64) -> usize {
        match bytes_per_sec {
            0..=262_144 => Self::MIN_CHUNK,       // < 256 KB/s
            262_145..=1_048_576 => 128 * 1024,    // 256 KB/s – 1 MB/s
            1_048_577..=10_485_760 => 256 * 1024, // 1 – 10 MB/s
            10_485_761..=52_428_800 => 1_048_576, // 10 – 50 MB/s
            _ => Self::MAX_CHUNK,
        }
    }
}

/// How a copy loop chunks and times out its I/O
#[derive(Debug, Clone, Copy)]
pub struct ChunkSettings {
    pub initial_chunk_size: usize,
    pub adaptive: bool,
    pub io_timeout: Duration,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            initial_chunk_size: DEFAULT_CHUNK_SIZE,
            adaptive: true,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

impl ChunkSettings {
    fn sizer(&self) -> AdaptiveChunkSizer {
        if self.adaptive {
            AdaptiveChunkSizer::new(self.initial_chunk_size)
        } else {
            AdaptiveChunkSizer::fixed(self.initial_chunk_size)
        }
    }
}

/// Map an I/O error coming off a remote stream.
pub fn remote_io_error(err: io::Error, path: &str) -> TransferError {
    match err.kind() {
        io::ErrorKind::TimedOut => TransferError::Timeout(format!("{}: {}", path, err)),
        io::ErrorKind::ConnectionReset => {
            TransferError::ConnectionReset(format!("{}: {}", path, err))
        }
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => {
            TransferError::ConnectionLost(format!("{}: {}", path, err))
        }
        io::ErrorKind::NotFound => TransferError::NotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => TransferError::PermissionDenied(path.to_string()),
        _ => TransferError::Io(err),
    }
}

/// Copy `reader` into `writer` until EOF.
///
/// Returns the bytes copied. Checks for pause/cancel before every chunk and
/// fails with `Cancelled` as soon as the batch is cancelled.
pub async fn copy_chunks<R, W, ER, EW>(
    reader: &mut R,
    writer: &mut W,
    settings: &ChunkSettings,
    control: &TransferControl,
    progress: &mut OperationProgress,
    map_read_err: ER,
    map_write_err: EW,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    ER: Fn(io::Error) -> TransferError,
    EW: Fn(io::Error) -> TransferError,
{
    let mut sizer = settings.sizer();
    let mut buf = vec![0u8; AdaptiveChunkSizer::MAX_CHUNK.min(sizer.chunk_size().max(1) * 8)];
    let mut copied: u64 = 0;
    let io_timeout = settings.io_timeout;

    loop {
        if !control.wait_while_paused().await {
            return Err(TransferError::Cancelled);
        }

        let size = sizer.chunk_size();
        if buf.len() < size {
            buf.resize(size, 0);
        }

        let n = match timeout(io_timeout, reader.read(&mut buf[..size])).await {
            Err(_) => {
                return Err(TransferError::Timeout(format!(
                    "read stalled for {:?}",
                    io_timeout
                )))
            }
            Ok(Err(e)) => return Err(map_read_err(e)),
            Ok(Ok(n)) => n,
        };
        if n == 0 {
            break;
        }

        match timeout(io_timeout, writer.write_all(&buf[..n])).await {
            Err(_) => {
                return Err(TransferError::Timeout(format!(
                    "write stalled for {:?}",
                    io_timeout
                )))
            }
            Ok(Err(e)) => return Err(map_write_err(e)),
            Ok(Ok(())) => {}
        }

        copied += n as u64;
        sizer.record(n);
        progress.add_bytes(n as u64);
    }

    match timeout(io_timeout, writer.shutdown()).await {
        Err(_) => Err(TransferError::Timeout(format!(
            "flush stalled for {:?}",
            io_timeout
        ))),
        Ok(Err(e)) => Err(map_write_err(e)),
        Ok(Ok(())) => Ok(copied),
    }
}
