//! Content-type guessing by file extension.

const OCTET_STREAM: &str = "application/octet-stream";

/// Guess a content type from the decoded path; unknown extensions fall back
/// to `application/octet-stream`.
pub fn guess(path: &[u8]) -> &'static str {
    let name = path.rsplit(|&b| b == b'/').next().unwrap_or(path);
    let Some(dot) = name.iter().rposition(|&b| b == b'.') else {
        return OCTET_STREAM;
    };
    let ext = name[dot + 1..].to_ascii_lowercase();
    match ext.as_slice() {
        b"txt" | b"text" | b"log" | b"md" => "text/plain",
        b"html" | b"htm" => "text/html",
        b"css" => "text/css",
        b"js" | b"mjs" => "text/javascript",
        b"json" => "application/json",
        b"xml" => "application/xml",
        b"png" => "image/png",
        b"jpg" | b"jpeg" => "image/jpeg",
        b"gif" => "image/gif",
        b"svg" => "image/svg+xml",
        b"ico" => "image/x-icon",
        b"pdf" => "application/pdf",
        b"zip" => "application/zip",
        b"gz" => "application/gzip",
        b"tar" => "application/x-tar",
        b"wasm" => "application/wasm",
        b"mp3" => "audio/mpeg",
        b"mp4" => "video/mp4",
        _ => OCTET_STREAM,
    }
}
