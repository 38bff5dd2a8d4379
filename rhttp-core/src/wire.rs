//! Framing: big-endian integers and length-prefixed byte strings over a
//! full-duplex pipe, one command/reply exchange at a time.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Ceiling on any single payload crossing the pipe.
pub const MAX_CHUNK: usize = 4096 * 8;

/// Errors surfaced by pipe reads and writes. Oversize frames are protocol
/// violations, negative lengths are out-of-range, and a short read is
/// end-of-stream; callers decide which of those are fatal.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the chunk ceiling")]
    FrameTooLarge(i64),
    #[error("negative length {0} on the wire")]
    NegativeLength(i64),
    #[error("peer closed the pipe mid-exchange")]
    UnexpectedEof,
    #[error("pipe I/O: {0}")]
    Io(io::Error),
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            WireError::UnexpectedEof
        } else {
            WireError::Io(err)
        }
    }
}

/// One end of the command pipe. The halves are boxed so in-memory duplex
/// streams, remote-shell child stdio, and the process's own stdio all fit
/// the same type.
pub struct Pipe {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// A pipe shared by the connection handlers. The mutex must be held for the
/// span of one whole command/reply exchange, never just one read or write.
pub type SharedPipe = Arc<Mutex<Pipe>>;

impl Pipe {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Pipe over the process's own stdin/stdout, for the remote role.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn into_shared(self) -> SharedPipe {
        Arc::new(Mutex::new(self))
    }

    /// Read exactly `n` bytes; `n` must be within the chunk ceiling.
    pub async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, WireError> {
        if n > MAX_CHUNK {
            return Err(WireError::FrameTooLarge(n as i64));
        }
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Read an 8-byte big-endian length, then that many bytes.
    pub async fn read_var_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_i64().await?;
        if len < 0 {
            return Err(WireError::NegativeLength(len));
        }
        if len as usize > MAX_CHUNK {
            return Err(WireError::FrameTooLarge(len));
        }
        self.read_bytes(len as usize).await
    }

    pub async fn read_i64(&mut self) -> Result<i64, WireError> {
        let mut buf = [0u8; 8];
        self.reader.read_exact(&mut buf).await?;
        Ok(i64::from_be_bytes(buf))
    }

    pub async fn read_i32(&mut self) -> Result<i32, WireError> {
        let mut buf = [0u8; 4];
        self.reader.read_exact(&mut buf).await?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Write until every byte is transmitted. Unbounded: the bootstrap ships
    /// the whole program image through here.
    pub async fn write_bytes(&mut self, s: &[u8]) -> Result<(), WireError> {
        self.writer.write_all(s).await?;
        Ok(())
    }

    /// Write a big-endian int64 length, then the bytes.
    pub async fn write_var_bytes(&mut self, s: &[u8]) -> Result<(), WireError> {
        if s.len() > MAX_CHUNK {
            return Err(WireError::FrameTooLarge(s.len() as i64));
        }
        self.write_i64(s.len() as i64).await?;
        self.write_bytes(s).await
    }

    pub async fn write_i64(&mut self, i: i64) -> Result<(), WireError> {
        self.writer.write_all(&i.to_be_bytes()).await?;
        Ok(())
    }

    pub async fn write_i32(&mut self, i: i32) -> Result<(), WireError> {
        self.writer.write_all(&i.to_be_bytes()).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), WireError> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// A connected pair of pipes over two in-memory byte streams, for the
/// single-process deployment.
pub fn pipe_pair() -> (Pipe, Pipe) {
    let (a, b) = tokio::io::duplex(MAX_CHUNK + 64);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (Pipe::new(a_read, a_write), Pipe::new(b_read, b_write))
}
