//! Bootstrap: wires the two roles together — in one process over in-memory
//! pipes, or across a remote-shell child after an image-digest identity
//! check.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use rhttp_core::source::run_source;
use rhttp_core::wire::{pipe_pair, Pipe};
use sha1::{Digest, Sha1};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{Deployment, Invocation, Settings};
use crate::server::run_server;

/// Length of the identity magic: a SHA-1 digest of the program image.
pub const MAGIC_LEN: usize = 20;

/// Hidden first argument selecting the re-executed stage on the peer.
pub const STAGE2_FLAG: &str = "__remote-stage2";

/// The role a peer plays on its end of the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Server,
}

impl Role {
    fn arg(self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Server => "server",
        }
    }
}

pub fn parse_role(s: &str) -> Option<Role> {
    match s {
        "source" => Some(Role::Source),
        "server" => Some(Role::Server),
        _ => None,
    }
}

/// Launch the deployment described by `inv` and run until the pipe closes,
/// a role fails, or the process is interrupted.
pub async fn run(inv: Invocation) -> anyhow::Result<()> {
    match &inv.deployment {
        Deployment::Local => run_local(inv.settings).await,
        Deployment::RemoteSource { host } => {
            let host = host.clone();
            run_remote(&host, Role::Source, inv).await
        }
        Deployment::RemoteServer { host } => {
            let host = host.clone();
            run_remote(&host, Role::Server, inv).await
        }
    }
}

/// Both roles in this process, joined by an in-memory pipe pair.
async fn run_local(settings: Settings) -> anyhow::Result<()> {
    let root = validate_root(&settings.source_root).await?;
    let (source_pipe, server_pipe) = pipe_pair();
    let source = tokio::spawn(run_source(source_pipe, root));
    let server = run_server(Arc::new(settings), server_pipe.into_shared());
    tokio::select! {
        res = source => {
            res.context("source worker panicked")?
                .context("source worker failed")?;
            info!("pipe closed, shutting down");
            Ok(())
        }
        res = server => res,
        res = shutdown_signal() => {
            info!("interrupted");
            res
        }
    }
}

/// Spawn the remote role through the remote-shell command, prove the peer
/// runs our byte-identical image, then run the opposite role locally over
/// the child's stdio.
async fn run_remote(host: &str, remote_role: Role, inv: Invocation) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("locating program image")?;
    let image = tokio::fs::read(&exe).await.context("reading program image")?;
    let magic: [u8; MAGIC_LEN] = Sha1::digest(&image).into();
    let shim = shim_command(&magic, image.len(), remote_role);

    let mut words = inv.ssh_command.iter();
    let program = words.next().context("empty remote-shell command")?;
    let mut child = Command::new(program)
        .args(words)
        .arg(host)
        .arg(&shim)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning '{}'", inv.ssh_command.join(" ")))?;
    debug!("bootstrap: spawned {} on {host}", remote_role.arg());

    let stdin = child.stdin.take().context("remote-shell child stdin")?;
    let stdout = child.stdout.take().context("remote-shell child stdout")?;
    let mut pipe = Pipe::new(stdout, stdin);

    let payload = bincode::serialize(&inv.settings).context("encoding settings")?;
    pipe.write_bytes(&magic).await?;
    pipe.write_bytes(&image).await?;
    pipe.write_var_bytes(&payload).await?;
    pipe.flush().await?;
    drop(image);
    debug!("bootstrap: identity sent");

    let echo = pipe.read_bytes(MAGIC_LEN).await.context("reading identity echo")?;
    if echo != magic {
        bail!("remote identity check failed: the peer is not running the transported image");
    }
    debug!("bootstrap: identity verified, running");

    let settings = Arc::new(inv.settings);
    let local_role = async {
        match remote_role {
            // The peer owns the files; this side serves HTTP.
            Role::Source => run_server(settings.clone(), pipe.into_shared()).await,
            // The peer serves HTTP; this side owns the files.
            Role::Server => {
                let root = validate_root(&settings.source_root).await?;
                run_source(pipe, root).await.context("source worker failed")
            }
        }
    };
    tokio::select! {
        res = local_role => res,
        status = child.wait() => {
            let status = status.context("waiting for remote-shell child")?;
            bail!("remote peer exited: {status}");
        }
        res = shutdown_signal() => {
            info!("interrupted, terminating remote peer");
            res
        }
    }
}

/// Entry point for the re-executed image on the peer. Stdio is the pipe, so
/// nothing but protocol bytes may touch stdout.
pub async fn run_stage2(role: Role) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("locating own image")?;
    let image = tokio::fs::read(&exe).await.context("reading own image")?;
    let magic: [u8; MAGIC_LEN] = Sha1::digest(&image).into();
    drop(image);

    let mut pipe = Pipe::stdio();
    let payload = pipe.read_var_bytes().await.context("reading settings payload")?;
    let settings: Settings = bincode::deserialize(&payload).context("decoding settings")?;
    crate::init_logging(settings.verbose);
    pipe.write_bytes(&magic).await?;
    pipe.flush().await?;
    // The shim left the image in a mktemp file; it is loaded now.
    let _ = tokio::fs::remove_file(&exe).await;
    debug!("stage 2: identity echoed, running {}", role.arg());

    match role {
        Role::Source => {
            let root = validate_root(&settings.source_root).await?;
            run_source(pipe, root).await.context("source worker failed")
        }
        Role::Server => run_server(Arc::new(settings), pipe.into_shared()).await,
    }
}

/// The remote-shell command line: a POSIX-sh shim that proves the digest
/// prefix, lands the image in a temp file, and execs it in stage-2 mode.
/// Needs nothing beyond sh, dd, od, tr, head, mktemp and chmod on the peer.
fn shim_command(magic: &[u8; MAGIC_LEN], image_len: usize, role: Role) -> String {
    format!(
        "sh -c 't=$(mktemp); \
         h=$(dd bs=1 count={MAGIC_LEN} 2>/dev/null | od -An -v -tx1 | tr -d \" \\n\"); \
         if [ \"$h\" != \"{hex}\" ]; then exit 40; fi; \
         head -c {image_len} > \"$t\"; chmod +x \"$t\"; \
         exec \"$t\" {STAGE2_FLAG} {role}'",
        hex = hex_string(magic),
        role = role.arg(),
    )
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The configured root must canonicalise to an existing directory before
/// either role starts.
async fn validate_root(raw: &[u8]) -> anyhow::Result<PathBuf> {
    let path = Path::new(OsStr::from_bytes(raw));
    let root = tokio::fs::canonicalize(path)
        .await
        .with_context(|| format!("source root '{}'", path.display()))?;
    let meta = tokio::fs::metadata(&root)
        .await
        .with_context(|| format!("source root '{}'", root.display()))?;
    if !meta.is_dir() {
        bail!("source root '{}' is not a directory", root.display());
    }
    Ok(root)
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shim_embeds_digest_length_and_role() {
        let magic = [0xabu8; MAGIC_LEN];
        let shim = shim_command(&magic, 123456, Role::Source);
        assert!(shim.starts_with("sh -c '"));
        assert!(shim.contains(&"ab".repeat(MAGIC_LEN)));
        assert!(shim.contains("head -c 123456"));
        assert!(shim.contains("dd bs=1 count=20"));
        assert!(shim.ends_with(&format!("{STAGE2_FLAG} source'")));
        // No double quotes may leak out of the single-quoted payload.
        assert_eq!(shim.matches('\'').count(), 2);
    }

    #[test]
    fn shim_role_follows_deployment() {
        let magic = [0u8; MAGIC_LEN];
        assert!(shim_command(&magic, 1, Role::Server).contains("__remote-stage2 server"));
        assert!(shim_command(&magic, 1, Role::Source).contains("__remote-stage2 source"));
    }

    #[test]
    fn hex_is_lowercase_and_stable() {
        assert_eq!(hex_string(&[0x00, 0x0f, 0xa5, 0xff]), "000fa5ff");
    }

    #[test]
    fn roles_parse_from_stage2_arguments() {
        assert_eq!(parse_role("source"), Some(Role::Source));
        assert_eq!(parse_role("server"), Some(Role::Server));
        assert_eq!(parse_role("gopher"), None);
    }

    #[tokio::test]
    async fn root_validation_rejects_files_and_missing_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let ok = validate_root(dir.path().as_os_str().as_bytes()).await;
        assert!(ok.is_ok());
        let file = dir.path().join("f");
        assert!(validate_root(file.as_os_str().as_bytes()).await.is_err());
        let missing = dir.path().join("nope");
        assert!(validate_root(missing.as_os_str().as_bytes()).await.is_err());
    }

    #[tokio::test]
    async fn local_pipe_pair_serves_both_roles() {
        use rhttp_core::protocol::{self, FileSizeReply};

        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), b"12345").unwrap();
        let mut raw = dir.path().as_os_str().as_bytes().to_vec();
        raw.push(b'/');
        let root = validate_root(&raw).await.unwrap();
        let (source_pipe, mut client) = pipe_pair();
        let _worker = tokio::spawn(run_source(source_pipe, root));
        let reply = protocol::query_file_size(&mut client, b"f.txt").await.unwrap();
        assert_eq!(reply, FileSizeReply::Size(5));
    }
}
