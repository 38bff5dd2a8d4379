//! Source worker: executes file-size, chunk-read, and directory-listing
//! commands under a root-confined view of the filesystem.

use std::ffi::OsStr;
use std::io::SeekFrom;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::escape;
use crate::protocol::{REPLY_ERR, REPLY_IS_DIR, TAG_GET_CHUNK, TAG_GET_FILE_SIZE, TAG_LIST_DIR};
use crate::wire::{Pipe, WireError, MAX_CHUNK};

/// Run the source loop until the pipe closes or an unknown tag arrives.
/// `root` must already be canonicalised (the caller validates it at
/// start-up). Filesystem failures and confinement rejections become the
/// error sentinel on the wire; only protocol violations end the loop with
/// an error.
pub async fn run_source(mut pipe: Pipe, root: PathBuf) -> Result<(), WireError> {
    loop {
        let tag = match pipe.read_bytes(1).await {
            Ok(tag) => tag[0],
            Err(WireError::UnexpectedEof) => {
                debug!("pipe closed, source leaving");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        match tag {
            TAG_GET_CHUNK => get_chunk(&mut pipe, &root).await?,
            TAG_GET_FILE_SIZE => get_file_size(&mut pipe, &root).await?,
            TAG_LIST_DIR => list_dir(&mut pipe, &root).await?,
            other => {
                debug!(tag = other, "unknown command tag, source leaving");
                return Ok(());
            }
        }
        pipe.flush().await?;
    }
}

/// Percent-decode a wire path and resolve it under `root`. `None` when the
/// path does not exist or, after symlink resolution, escapes the root.
async fn resolve(root: &Path, raw: &[u8]) -> Option<PathBuf> {
    let decoded = escape::percent_decode(raw);
    let rel = Path::new(OsStr::from_bytes(&decoded));
    let rel = rel.strip_prefix("/").unwrap_or(rel);
    let resolved = fs::canonicalize(root.join(rel)).await.ok()?;
    resolved.starts_with(root).then_some(resolved)
}

async fn get_file_size(pipe: &mut Pipe, root: &Path) -> Result<(), WireError> {
    let raw = pipe.read_var_bytes().await?;
    let reply = match resolve(root, &raw).await {
        None => REPLY_ERR,
        Some(path) => match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => REPLY_IS_DIR,
            Ok(meta) => meta.len() as i64,
            Err(_) => REPLY_ERR,
        },
    };
    pipe.write_i64(reply).await
}

async fn get_chunk(pipe: &mut Pipe, root: &Path) -> Result<(), WireError> {
    let raw = pipe.read_var_bytes().await?;
    let offset = pipe.read_i64().await?;
    let size = pipe.read_i64().await?;
    if size < 0 {
        return Err(WireError::NegativeLength(size));
    }
    if size as usize > MAX_CHUNK {
        return Err(WireError::FrameTooLarge(size));
    }
    let data = if offset < 0 {
        None
    } else {
        match resolve(root, &raw).await {
            None => None,
            Some(path) => read_chunk(&path, offset as u64, size as usize).await.ok(),
        }
    };
    match data {
        Some(buf) => pipe.write_var_bytes(&buf).await,
        None => pipe.write_i64(REPLY_ERR).await,
    }
}

/// A single read; returning fewer than `size` bytes is fine.
async fn read_chunk(path: &Path, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; size];
    let n = file.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

async fn list_dir(pipe: &mut Pipe, root: &Path) -> Result<(), WireError> {
    let raw = pipe.read_var_bytes().await?;
    let page = match resolve(root, &raw).await {
        None => None,
        Some(path) => render_index(&path).await.ok(),
    };
    match page {
        Some(html) if html.len() <= MAX_CHUNK => pipe.write_var_bytes(&html).await,
        _ => pipe.write_i64(REPLY_ERR).await,
    }
}

/// Render the index page for a directory: entries in raw byte order,
/// subdirectory names slash-terminated, hrefs percent-encoded and link text
/// HTML-escaped. Fails on non-directories.
async fn render_index(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut entries: Vec<(Vec<u8>, bool)> = Vec::new();
    let mut dir = fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().as_bytes().to_vec();
        let is_dir = entry
            .file_type()
            .await
            .map(|kind| kind.is_dir())
            .unwrap_or(false);
        entries.push((name, is_dir));
    }
    entries.sort();

    let title = escape::percent_encode(path.as_os_str().as_bytes());
    let mut page = String::new();
    page.push_str("<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>");
    page.push_str(&title);
    page.push_str("</title></head>\n<body>\n<h1>");
    page.push_str(&title);
    page.push_str("</h1>\n");
    for (mut name, is_dir) in entries {
        if is_dir {
            name.push(b'/');
        }
        page.push_str("<p><a href=\"");
        page.push_str(&escape::percent_encode(&name));
        page.push_str("\">");
        page.push_str(&escape::html_escape(&name));
        page.push_str("</a></p>\n");
    }
    page.push_str("</body>\n</html>\n");
    Ok(page.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, FileSizeReply};
    use crate::wire::pipe_pair;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    fn fixture_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let bytes: Vec<u8> = (0..=255u8).collect();
        std::fs::write(dir.path().join("sub").join("b.bin"), &bytes).unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        dir
    }

    fn start_source(root: &TempDir) -> (Pipe, JoinHandle<Result<(), WireError>>) {
        let canon = root.path().canonicalize().unwrap();
        let (client, source) = pipe_pair();
        let worker = tokio::spawn(run_source(source, canon));
        (client, worker)
    }

    #[tokio::test]
    async fn file_size_of_regular_file() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        let reply = protocol::query_file_size(&mut pipe, b"a.txt").await.unwrap();
        assert_eq!(reply, FileSizeReply::Size(6));
    }

    #[tokio::test]
    async fn file_size_of_directory() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        let reply = protocol::query_file_size(&mut pipe, b"sub").await.unwrap();
        assert_eq!(reply, FileSizeReply::Directory);
        let reply = protocol::query_file_size(&mut pipe, b"").await.unwrap();
        assert_eq!(reply, FileSizeReply::Directory);
    }

    #[tokio::test]
    async fn file_size_of_missing_path() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        let reply = protocol::query_file_size(&mut pipe, b"nope.txt").await.unwrap();
        assert_eq!(reply, FileSizeReply::Error);
    }

    #[tokio::test]
    async fn traversal_is_confined() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        for path in [
            &b"../etc/passwd"[..],
            b"%2e%2e/etc/passwd",
            b"sub/../../etc/passwd",
            b"..",
        ] {
            let reply = protocol::query_file_size(&mut pipe, path).await.unwrap();
            assert_eq!(reply, FileSizeReply::Error, "path {:?}", path);
        }
    }

    #[tokio::test]
    async fn symlink_out_of_root_is_confined() {
        let root = fixture_root();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), root.path().join("link"))
            .unwrap();
        let (mut pipe, _worker) = start_source(&root);
        let reply = protocol::query_file_size(&mut pipe, b"link").await.unwrap();
        assert_eq!(reply, FileSizeReply::Error);
    }

    #[tokio::test]
    async fn symlink_inside_root_is_allowed() {
        let root = fixture_root();
        std::os::unix::fs::symlink(root.path().join("a.txt"), root.path().join("alias")).unwrap();
        let (mut pipe, _worker) = start_source(&root);
        let reply = protocol::query_file_size(&mut pipe, b"alias").await.unwrap();
        assert_eq!(reply, FileSizeReply::Size(6));
    }

    #[tokio::test]
    async fn percent_encoded_path_decodes_on_this_side() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        let reply = protocol::query_file_size(&mut pipe, b"a%2Etxt").await.unwrap();
        assert_eq!(reply, FileSizeReply::Size(6));
    }

    #[tokio::test]
    async fn chunk_reads_the_requested_range() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        let chunk = protocol::query_chunk(&mut pipe, b"sub/b.bin", 10, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk, (10..20u8).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn chunk_read_is_short_at_end_of_file() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        let chunk = protocol::query_chunk(&mut pipe, b"sub/b.bin", 250, 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk, (250..=255u8).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn chunk_of_missing_file_is_error() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        let chunk = protocol::query_chunk(&mut pipe, b"nope", 0, 10).await.unwrap();
        assert_eq!(chunk, None);
    }

    #[tokio::test]
    async fn oversize_chunk_request_fails_the_loop() {
        let root = fixture_root();
        let (mut pipe, worker) = start_source(&root);
        pipe.write_bytes(&[TAG_GET_CHUNK]).await.unwrap();
        pipe.write_var_bytes(b"a.txt").await.unwrap();
        pipe.write_i64(0).await.unwrap();
        pipe.write_i64((MAX_CHUNK + 1) as i64).await.unwrap();
        pipe.flush().await.unwrap();
        let result = worker.await.unwrap();
        assert!(matches!(result, Err(WireError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn unknown_tag_ends_the_loop_cleanly() {
        let root = fixture_root();
        let (mut pipe, worker) = start_source(&root);
        pipe.write_bytes(b"q").await.unwrap();
        pipe.flush().await.unwrap();
        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn closing_the_pipe_ends_the_loop_cleanly() {
        let root = fixture_root();
        let (pipe, worker) = start_source(&root);
        drop(pipe);
        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn index_lists_entries_in_byte_order() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        let html = protocol::query_dir_index(&mut pipe, b"").await.unwrap().unwrap();
        let html = String::from_utf8(html).unwrap();
        assert_eq!(html.matches("<a href=\"a.txt\">a.txt</a>").count(), 1);
        assert_eq!(html.matches("<a href=\"sub/\">sub/</a>").count(), 1);
        let a = html.find("a.txt").unwrap();
        let empty = html.find("empty/").unwrap();
        let sub = html.find("sub/").unwrap();
        assert!(a < empty && empty < sub);
    }

    #[tokio::test]
    async fn index_escapes_hostile_names() {
        let root = fixture_root();
        std::fs::write(root.path().join("a<b&c.txt"), b"x").unwrap();
        let (mut pipe, _worker) = start_source(&root);
        let html = protocol::query_dir_index(&mut pipe, b"").await.unwrap().unwrap();
        let html = String::from_utf8(html).unwrap();
        assert!(html.contains("<a href=\"a%3Cb%26c.txt\">a&lt;b&amp;c.txt</a>"));
    }

    #[tokio::test]
    async fn empty_directory_index_has_no_entries() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        let html = protocol::query_dir_index(&mut pipe, b"empty").await.unwrap().unwrap();
        let html = String::from_utf8(html).unwrap();
        assert!(html.contains("<title>"));
        assert_eq!(html.matches("<p>").count(), 0);
    }

    #[tokio::test]
    async fn index_of_a_file_is_error() {
        let root = fixture_root();
        let (mut pipe, _worker) = start_source(&root);
        let reply = protocol::query_dir_index(&mut pipe, b"a.txt").await.unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn oversize_index_is_error() {
        let root = fixture_root();
        for i in 0..200 {
            let name = format!("{:03}-{}.txt", i, "x".repeat(180));
            std::fs::write(root.path().join(name), b"").unwrap();
        }
        let (mut pipe, _worker) = start_source(&root);
        let reply = protocol::query_dir_index(&mut pipe, b"").await.unwrap();
        assert_eq!(reply, None);
    }
}
