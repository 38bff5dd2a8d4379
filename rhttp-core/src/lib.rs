//! rhttp protocol core: the framed command pipe shared by the HTTP side and
//! the file side, and the root-confined source worker that answers it.
//!
//! The crate does no HTTP and owns no sockets. The host (the `rhttp`
//! binary) decides where the two pipe ends live — the same process over
//! in-memory streams, or across a remote-shell child — and drives the
//! exchanges defined in [`protocol`] while holding the pipe lock.

pub mod escape;
pub mod protocol;
pub mod source;
pub mod wire;

pub use protocol::{query_chunk, query_dir_index, query_file_size, FileSizeReply};
pub use source::run_source;
pub use wire::{pipe_pair, Pipe, SharedPipe, WireError, MAX_CHUNK};
