//! Per-connection HTTP handler: parses requests, bridges them to the source
//! protocol, and streams response bodies back over the socket.

use std::sync::Arc;

use anyhow::bail;
use rhttp_core::escape;
use rhttp_core::protocol::{self, FileSizeReply};
use rhttp_core::wire::{SharedPipe, MAX_CHUNK};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::Settings;
use crate::mime;

/// Ceiling on one request's header block.
pub const MAX_HEADER: usize = 4096;

const MAX_HEADERS: usize = 64;

/// Output batching seam: corked while a response is being assembled,
/// uncorked once it is complete.
pub trait Cork {
    fn set_corked(&self, _on: bool) {}
}

impl Cork for TcpStream {
    fn set_corked(&self, on: bool) {
        let _ = self.set_nodelay(!on);
    }
}

struct Request {
    method: Vec<u8>,
    target: Vec<u8>,
    /// True only for `HTTP/1.0`; anything else replies as HTTP/1.1.
    http10: bool,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v.as_slice())
    }

    fn wants_close(&self) -> bool {
        self.http10
            || self
                .header("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case(b"close"))
    }
}

/// Serve one TCP connection until it closes or a request asks us to.
pub async fn handle_connection<S>(
    mut stream: S,
    pipe: SharedPipe,
    settings: Arc<Settings>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Cork + Unpin,
{
    let mut buf = vec![0u8; MAX_HEADER];
    let mut filled = 0usize;
    loop {
        let head_len = loop {
            if let Some(end) = find_head_end(&buf[..filled]) {
                break end;
            }
            if filled == buf.len() {
                write_response(&mut stream, false, 500, b"", Some(0), None).await?;
                return Ok(());
            }
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled > 0 {
                    write_response(&mut stream, false, 400, b"", Some(0), None).await?;
                }
                return Ok(());
            }
            filled += n;
        };

        let Some(req) = parse_head(&buf[..head_len]) else {
            write_response(&mut stream, false, 400, b"", Some(0), None).await?;
            return Ok(());
        };
        if settings.verbose {
            debug!(
                "{} {}",
                String::from_utf8_lossy(&req.method),
                String::from_utf8_lossy(&req.target)
            );
            for (name, value) in &req.headers {
                debug!(
                    "  {}: {}",
                    String::from_utf8_lossy(name),
                    String::from_utf8_lossy(value)
                );
            }
        }

        stream.set_corked(true);
        let close = if req.method != b"GET" {
            write_response(&mut stream, req.http10, 501, b"", Some(0), None).await?;
            true
        } else {
            handle_get(&mut stream, &req, &pipe, &settings).await?;
            req.wants_close()
        };
        stream.flush().await?;
        stream.set_corked(false);

        if close {
            return Ok(());
        }
        // HTTP/1.1 pipelining: keep whatever followed the header block.
        buf.copy_within(head_len..filled, 0);
        filled -= head_len;
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse the header block (terminator included). The request line must be
/// exactly three space-separated tokens; the header lines go through
/// httparse and are kept raw.
fn parse_head(head: &[u8]) -> Option<Request> {
    let line_end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = &head[..line_end];
    let tokens: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
    let &[method, target, version] = tokens.as_slice() else {
        return None;
    };
    if method.is_empty() || target.is_empty() {
        return None;
    }
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let headers = match httparse::parse_headers(&head[line_end + 2..], &mut storage) {
        Ok(httparse::Status::Complete((_, parsed))) => parsed
            .iter()
            .map(|h| (h.name.as_bytes().to_vec(), h.value.to_vec()))
            .collect(),
        _ => return None,
    };
    Some(Request {
        method: method.to_vec(),
        target: target.to_vec(),
        http10: version == b"HTTP/1.0",
        headers,
    })
}

/// What the source said the request target is, fetched under one pipe guard.
enum Resource {
    NotFound,
    /// Directory hit without a trailing slash on the target.
    RedirectDir,
    /// Directory hit with the rendered index (or its error sentinel).
    Index(Option<Vec<u8>>),
    File(u64),
}

async fn handle_get<S>(
    stream: &mut S,
    req: &Request,
    pipe: &SharedPipe,
    settings: &Settings,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path: &[u8] = req
        .target
        .splitn(2, |&b| b == b'?')
        .next()
        .unwrap_or(&req.target);
    let prefix: &[u8] = &settings.server_prefix;

    let mut with_slash = path.to_vec();
    with_slash.push(b'/');
    if with_slash == prefix {
        return write_redirect(stream, req.http10, 302, prefix).await;
    }
    if !path.starts_with(prefix) {
        return write_response(stream, req.http10, 404, b"", Some(0), None).await.map_err(Into::into);
    }
    let rel = &path[prefix.len()..];

    // One guard covers the size query and, for a directory hit, the
    // follow-up listing; the two exchanges must not interleave with other
    // handlers.
    let resource = {
        let mut guard = pipe.lock().await;
        match protocol::query_file_size(&mut guard, rel).await? {
            FileSizeReply::Error => Resource::NotFound,
            FileSizeReply::Size(size) => Resource::File(size),
            FileSizeReply::Directory if !path.ends_with(b"/") => Resource::RedirectDir,
            FileSizeReply::Directory => {
                Resource::Index(protocol::query_dir_index(&mut guard, rel).await?)
            }
        }
    };

    match resource {
        Resource::NotFound | Resource::Index(None) => {
            write_response(stream, req.http10, 404, b"", Some(0), None).await?;
            Ok(())
        }
        Resource::RedirectDir => {
            let mut location = path.to_vec();
            location.push(b'/');
            write_redirect(stream, req.http10, 307, &location).await
        }
        Resource::Index(Some(html)) => {
            write_response(
                stream,
                req.http10,
                200,
                b"Content-Type: text/html\r\n",
                Some(html.len() as u64),
                Some(&html),
            )
            .await?;
            Ok(())
        }
        Resource::File(size) => serve_file(stream, req, pipe, rel, size).await,
    }
}

async fn serve_file<S>(
    stream: &mut S,
    req: &Request,
    pipe: &SharedPipe,
    rel: &[u8],
    size: u64,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (status, start, stop) = match plan_range(req.header("Range"), size) {
        RangePlan::Full => (200, 0, size),
        RangePlan::Partial { start, stop } => (206, start, stop),
        RangePlan::Unsatisfiable => {
            return write_response(stream, req.http10, 416, b"", Some(0), None)
                .await
                .map_err(Into::into);
        }
    };

    let mut extra = format!("Content-Type: {}\r\n", mime::guess(&escape::percent_decode(rel)))
        .into_bytes();
    if status == 206 {
        extra.extend_from_slice(
            format!("Content-Range: bytes {}-{}/{}\r\n", start, stop - 1, size).as_bytes(),
        );
    }
    write_response(stream, req.http10, status, &extra, Some(stop - start), None).await?;

    let mut pos = start;
    while pos < stop {
        let want = MAX_CHUNK.min((stop - pos) as usize);
        let chunk = {
            let mut guard = pipe.lock().await;
            protocol::query_chunk(&mut guard, rel, pos, want).await?
        };
        let Some(chunk) = chunk else {
            bail!(
                "source failed mid-stream at offset {pos} of {}",
                String::from_utf8_lossy(rel)
            );
        };
        if chunk.is_empty() || chunk.len() > want {
            bail!(
                "unexpected chunk of {} bytes at offset {pos} (asked for at most {want})",
                chunk.len()
            );
        }
        stream.write_all(&chunk).await?;
        pos += chunk.len() as u64;
    }
    Ok(())
}

/// How to serve a file given its `Range` header, if any.
#[derive(Debug, PartialEq, Eq)]
enum RangePlan {
    Full,
    Partial { start: u64, stop: u64 },
    Unsatisfiable,
}

/// Only the simple `bytes=START-END` form is honoured, both sides optional
/// but not both empty and no comma. Anything else serves the whole file;
/// a form that parses but breaks `0 <= start < stop <= size` is
/// unsatisfiable.
fn plan_range(header: Option<&[u8]>, size: u64) -> RangePlan {
    let Some(value) = header else {
        return RangePlan::Full;
    };
    let Ok(value) = std::str::from_utf8(value) else {
        return RangePlan::Full;
    };
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return RangePlan::Full;
    };
    if spec.contains(',') {
        return RangePlan::Full;
    }
    let Some((low, high)) = spec.split_once('-') else {
        return RangePlan::Full;
    };
    if low.is_empty() && high.is_empty() {
        return RangePlan::Full;
    }
    let start = if low.is_empty() {
        0
    } else {
        match low.parse::<u64>() {
            Ok(v) => v,
            Err(_) => return RangePlan::Full,
        }
    };
    let stop = if high.is_empty() {
        size
    } else {
        match high.parse::<u64>() {
            Ok(v) => v.saturating_add(1),
            Err(_) => return RangePlan::Full,
        }
    };
    if start < stop && stop <= size {
        RangePlan::Partial { start, stop }
    } else {
        RangePlan::Unsatisfiable
    }
}

async fn write_redirect<S>(
    stream: &mut S,
    http10: bool,
    status: u16,
    location: &[u8],
) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut extra = b"Location: ".to_vec();
    extra.extend_from_slice(location);
    extra.extend_from_slice(b"\r\n");
    write_response(stream, http10, status, &extra, Some(0), None).await?;
    Ok(())
}

/// Write status line, the fixed `Accept-Ranges`, caller-supplied header
/// lines (each already `\r\n`-terminated), `Content-Length` when known, the
/// blank line, and the body if any.
async fn write_response<S>(
    stream: &mut S,
    http10: bool,
    status: u16,
    extra_headers: &[u8],
    content_length: Option<u64>,
    body: Option<&[u8]>,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let version = if http10 { "HTTP/1.0" } else { "HTTP/1.1" };
    let mut head = format!("{} {} {}\r\nAccept-Ranges: bytes\r\n", version, status, reason(status))
        .into_bytes();
    head.extend_from_slice(extra_headers);
    if let Some(len) = content_length {
        head.extend_from_slice(format!("Content-Length: {len}\r\n").as_bytes());
    }
    head.extend_from_slice(b"\r\n");
    stream.write_all(&head).await?;
    if let Some(body) = body {
        stream.write_all(body).await?;
    }
    Ok(())
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        302 => "Found",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "",
    }
}
