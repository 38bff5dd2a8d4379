//! Settings and invocation parsing: CLI endpoint specs layered over an
//! optional config file and environment overrides.

use std::path::PathBuf;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Immutable run settings, fixed after start-up. This struct crosses the
/// bootstrap pipe as the settings payload, so it stays bincode-friendly and
/// carries paths as raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub http_host: String,
    pub http_port: u16,
    /// Source directory, always slash-terminated.
    pub source_root: Vec<u8>,
    /// URL prefix the tree is mounted under; leading and trailing slash.
    pub server_prefix: Vec<u8>,
    /// Echo request headers to the diagnostic stream.
    pub verbose: bool,
}

/// Which role runs away from this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deployment {
    Local,
    RemoteSource { host: String },
    RemoteServer { host: String },
}

/// Everything main needs to launch: the settings plus the bootstrap shape.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub settings: Settings,
    pub deployment: Deployment,
    /// Remote-shell command, already split into words.
    pub ssh_command: Vec<String>,
}

/// Defaults from file and environment. File: ~/.config/rhttp/config.toml or
/// /etc/rhttp/config.toml. Env overrides: RHTTP_HTTP_HOST, RHTTP_HTTP_PORT,
/// RHTTP_SSH_COMMAND. CLI options win over both.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default = "default_host")]
    pub http_host: String,
    #[serde(default = "default_port")]
    pub http_port: u16,
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_ssh_command() -> String {
    "ssh".to_string()
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            http_host: default_host(),
            http_port: default_port(),
            ssh_command: default_ssh_command(),
        }
    }
}

/// Load defaults: file (if present), then env vars on top.
pub fn load_defaults() -> FileConfig {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("RHTTP_HTTP_HOST") {
        c.http_host = s;
    }
    if let Ok(s) = std::env::var("RHTTP_HTTP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.http_port = p;
        }
    }
    if let Ok(s) = std::env::var("RHTTP_SSH_COMMAND") {
        c.ssh_command = s;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/rhttp/config.toml"));
    }
    out.push(PathBuf::from("/etc/rhttp/config.toml"));
    out
}

fn load_file() -> Option<FileConfig> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<FileConfig>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

/// Split `[[user@]host:]path` into an optional remote host and the path.
pub fn split_endpoint(spec: &str) -> (Option<String>, String) {
    match spec.split_once(':') {
        Some((host, path)) if !host.is_empty() => (Some(host.to_string()), path.to_string()),
        Some((_, path)) => (None, path.to_string()),
        None => (None, spec.to_string()),
    }
}

/// Ensure a leading and a trailing slash.
pub fn normalize_prefix(prefix: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 2);
    if !prefix.starts_with('/') {
        out.push(b'/');
    }
    out.extend_from_slice(prefix.as_bytes());
    if !out.ends_with(b"/") {
        out.push(b'/');
    }
    out
}

/// Ensure a trailing slash.
fn normalize_root(path: &str) -> Vec<u8> {
    let mut out = path.as_bytes().to_vec();
    if !out.ends_with(b"/") {
        out.push(b'/');
    }
    out
}

/// Assemble the invocation from parsed CLI pieces over the loaded defaults.
pub fn build_invocation(
    defaults: &FileConfig,
    host: Option<String>,
    port: Option<u16>,
    ssh_command: Option<String>,
    verbose: bool,
    source_spec: &str,
    server_spec: Option<&str>,
) -> anyhow::Result<Invocation> {
    let (source_host, source_path) = split_endpoint(source_spec);
    if source_path.is_empty() {
        bail!("missing source directory in '{source_spec}'");
    }
    let (server_host, prefix) = match server_spec {
        None => (None, String::new()),
        Some(spec) => split_endpoint(spec),
    };

    let deployment = if let Some(h) = source_host {
        if server_host.is_some() {
            bail!("at most one of the source and the HTTP listener may be remote");
        }
        Deployment::RemoteSource { host: h }
    } else if let Some(h) = server_host {
        Deployment::RemoteServer { host: h }
    } else {
        Deployment::Local
    };

    let ssh_raw = ssh_command.unwrap_or_else(|| defaults.ssh_command.clone());
    let ssh_parts: Vec<String> = ssh_raw.split_whitespace().map(str::to_string).collect();
    if ssh_parts.is_empty() {
        bail!("--ssh-command must not be empty");
    }

    let settings = Settings {
        http_host: host.unwrap_or_else(|| defaults.http_host.clone()),
        http_port: port.unwrap_or(defaults.http_port),
        source_root: normalize_root(&source_path),
        server_prefix: normalize_prefix(&prefix),
        verbose,
    };
    Ok(Invocation {
        settings,
        deployment,
        ssh_command: ssh_parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_specs_split_on_the_first_colon() {
        assert_eq!(split_endpoint("/srv/files"), (None, "/srv/files".into()));
        assert_eq!(
            split_endpoint("box:/srv/files"),
            (Some("box".into()), "/srv/files".into())
        );
        assert_eq!(
            split_endpoint("me@box:/srv/files"),
            (Some("me@box".into()), "/srv/files".into())
        );
        assert_eq!(split_endpoint(":/pre/"), (None, "/pre/".into()));
    }

    #[test]
    fn prefixes_are_slash_delimited() {
        assert_eq!(normalize_prefix(""), b"/");
        assert_eq!(normalize_prefix("files"), b"/files/");
        assert_eq!(normalize_prefix("/files/"), b"/files/");
        assert_eq!(normalize_prefix("/a/b"), b"/a/b/");
    }

    #[test]
    fn local_invocation_gets_defaults() {
        let inv = build_invocation(
            &FileConfig::default(),
            None,
            None,
            None,
            false,
            "/srv/files",
            None,
        )
        .unwrap();
        assert_eq!(inv.deployment, Deployment::Local);
        assert_eq!(inv.settings.http_host, "localhost");
        assert_eq!(inv.settings.http_port, 8000);
        assert_eq!(inv.settings.source_root, b"/srv/files/");
        assert_eq!(inv.settings.server_prefix, b"/");
        assert_eq!(inv.ssh_command, vec!["ssh"]);
    }

    #[test]
    fn remote_source_from_host_colon_path() {
        let inv = build_invocation(
            &FileConfig::default(),
            None,
            None,
            None,
            false,
            "me@box:/data",
            Some("/pub/"),
        )
        .unwrap();
        assert_eq!(
            inv.deployment,
            Deployment::RemoteSource {
                host: "me@box".into()
            }
        );
        assert_eq!(inv.settings.server_prefix, b"/pub/");
    }

    #[test]
    fn remote_server_from_second_argument() {
        let inv = build_invocation(
            &FileConfig::default(),
            Some("0.0.0.0".into()),
            Some(8080),
            None,
            true,
            "/data",
            Some("web:files"),
        )
        .unwrap();
        assert_eq!(
            inv.deployment,
            Deployment::RemoteServer { host: "web".into() }
        );
        assert_eq!(inv.settings.server_prefix, b"/files/");
        assert_eq!(inv.settings.http_host, "0.0.0.0");
        assert_eq!(inv.settings.http_port, 8080);
        assert!(inv.settings.verbose);
    }

    #[test]
    fn both_endpoints_remote_is_refused() {
        let err = build_invocation(
            &FileConfig::default(),
            None,
            None,
            None,
            false,
            "a:/data",
            Some("b:/pre/"),
        );
        assert!(err.is_err());
    }

    #[test]
    fn empty_source_path_is_refused() {
        assert!(
            build_invocation(&FileConfig::default(), None, None, None, false, "box:", None)
                .is_err()
        );
    }

    #[test]
    fn ssh_command_splits_into_words() {
        let inv = build_invocation(
            &FileConfig::default(),
            None,
            None,
            Some("ssh -p 2222 -o BatchMode=yes".into()),
            false,
            "/data",
            None,
        )
        .unwrap();
        assert_eq!(inv.ssh_command, vec!["ssh", "-p", "2222", "-o", "BatchMode=yes"]);
    }

    #[test]
    fn settings_survive_the_wire_encoding() {
        let settings = Settings {
            http_host: "localhost".into(),
            http_port: 8000,
            source_root: b"/srv/files/".to_vec(),
            server_prefix: b"/pub/".to_vec(),
            verbose: true,
        };
        let bytes = bincode::serialize(&settings).unwrap();
        let back: Settings = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.http_host, settings.http_host);
        assert_eq!(back.http_port, settings.http_port);
        assert_eq!(back.source_root, settings.source_root);
        assert_eq!(back.server_prefix, settings.server_prefix);
        assert_eq!(back.verbose, settings.verbose);
    }
}
