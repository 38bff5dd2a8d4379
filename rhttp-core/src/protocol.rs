//! Source command protocol: tag bytes, reply sentinels, and the client side
//! of each exchange.
//!
//! All three commands share one shape on the wire: a single ASCII tag byte,
//! the operands, then a reply whose first int64 is either a payload length
//! or a negative sentinel. Any unknown tag ends the source loop cleanly, so
//! closing the pipe is the only shutdown signal a client ever needs.

use crate::wire::{Pipe, WireError, MAX_CHUNK};

/// Read a bounded byte range of a file.
pub const TAG_GET_CHUNK: u8 = b'a';
/// Stat a path for its size (or directory-ness).
pub const TAG_GET_FILE_SIZE: u8 = b'b';
/// Render a directory index page.
pub const TAG_LIST_DIR: u8 = b'c';

/// Not found, denied, escaped the root, or any other I/O failure.
pub const REPLY_ERR: i64 = -1;
/// The path resolves to a directory.
pub const REPLY_IS_DIR: i64 = -2;

/// Reply to a file-size query with the negative sentinels lifted out. The
/// wire format is unchanged; only the API boundary is typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSizeReply {
    Size(u64),
    Directory,
    Error,
}

/// Ask the source for the size of `path`. The caller must hold the pipe
/// lock for the duration of the call.
pub async fn query_file_size(pipe: &mut Pipe, path: &[u8]) -> Result<FileSizeReply, WireError> {
    pipe.write_bytes(&[TAG_GET_FILE_SIZE]).await?;
    pipe.write_var_bytes(path).await?;
    pipe.flush().await?;
    Ok(match pipe.read_i64().await? {
        REPLY_IS_DIR => FileSizeReply::Directory,
        size if size < 0 => FileSizeReply::Error,
        size => FileSizeReply::Size(size as u64),
    })
}

/// Ask the source for up to `len` bytes of `path` starting at `offset`.
/// `None` is the source's error sentinel. A short (even empty) payload is
/// returned as-is; interpreting it is the caller's business. The caller
/// must hold the pipe lock.
pub async fn query_chunk(
    pipe: &mut Pipe,
    path: &[u8],
    offset: u64,
    len: usize,
) -> Result<Option<Vec<u8>>, WireError> {
    pipe.write_bytes(&[TAG_GET_CHUNK]).await?;
    pipe.write_var_bytes(path).await?;
    pipe.write_i64(offset as i64).await?;
    pipe.write_i64(len as i64).await?;
    pipe.flush().await?;
    read_payload_reply(pipe).await
}

/// Ask the source for the rendered index of directory `path`. `None` is the
/// error sentinel. The caller must hold the pipe lock.
pub async fn query_dir_index(pipe: &mut Pipe, path: &[u8]) -> Result<Option<Vec<u8>>, WireError> {
    pipe.write_bytes(&[TAG_LIST_DIR]).await?;
    pipe.write_var_bytes(path).await?;
    pipe.flush().await?;
    read_payload_reply(pipe).await
}

async fn read_payload_reply(pipe: &mut Pipe) -> Result<Option<Vec<u8>>, WireError> {
    let n = pipe.read_i64().await?;
    if n < 0 {
        return Ok(None);
    }
    if n as usize > MAX_CHUNK {
        return Err(WireError::FrameTooLarge(n));
    }
    Ok(Some(pipe.read_bytes(n as usize).await?))
}
