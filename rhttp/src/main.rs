// rhttp: serve a directory tree over HTTP, with the tree on this host or on
// a remote one reached through a remote-shell pipe.

mod bootstrap;
mod config;
mod handler;
mod mime;
mod server;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("rhttp {} — serve a directory tree over HTTP", VERSION);
    println!();
    println!("USAGE:");
    println!("    rhttp [OPTIONS] [[USER1@]HOST1:]SOURCE [[[USER2@]HOST2]:[URL_PREFIX]]");
    println!();
    println!("ARGUMENTS:");
    println!("    SOURCE        Directory to serve, local or HOST:PATH on a remote host");
    println!("    URL_PREFIX    URL path the tree is mounted under (default /); an");
    println!("                  optional HOST2: puts the HTTP listener on that host");
    println!();
    println!("    At most one of the source and the listener may be remote. The");
    println!("    remote side is bootstrapped over the remote shell with a copy of");
    println!("    this program; no prior installation is needed there.");
    println!();
    println!("OPTIONS:");
    println!("    --host=H           HTTP listen host (default: localhost)");
    println!("    --port=N           HTTP listen port (default: 8000)");
    println!("    --ssh-command=CMD  Remote-shell command, split on whitespace (default: ssh)");
    println!("    --verbose          Echo request headers to stderr");
    println!("    -h, --help         Print this help message and exit");
    println!("    -V, --version      Print version and exit");
    println!();
    println!("EXAMPLES:");
    println!("    rhttp /srv/files");
    println!("    rhttp me@box:/data /pub/");
    println!("    rhttp --port=8080 /data web:");
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Stage-2 sentinel: this process was just re-executed on the peer by the
    // bootstrap shim, with the pipe on stdio.
    if args.first().map(String::as_str) == Some(bootstrap::STAGE2_FLAG) {
        let role = args
            .get(1)
            .and_then(|s| bootstrap::parse_role(s))
            .context("bad stage-2 role argument")?;
        let rt = tokio::runtime::Runtime::new()?;
        return rt.block_on(bootstrap::run_stage2(role));
    }

    let mut host = None;
    let mut port = None;
    let mut ssh_command = None;
    let mut verbose = false;
    let mut positionals: Vec<String> = Vec::new();
    for arg in &args {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("rhttp {}", VERSION);
                return Ok(());
            }
            "--verbose" => verbose = true,
            other => {
                if let Some(v) = other.strip_prefix("--host=") {
                    host = Some(v.to_string());
                } else if let Some(v) = other.strip_prefix("--port=") {
                    port = Some(v.parse::<u16>().with_context(|| format!("bad port '{v}'"))?);
                } else if let Some(v) = other.strip_prefix("--ssh-command=") {
                    ssh_command = Some(v.to_string());
                } else if other.starts_with('-') {
                    eprintln!("rhttp: unknown option '{other}'\n");
                    print_help();
                    std::process::exit(2);
                } else {
                    positionals.push(other.to_string());
                }
            }
        }
    }
    if positionals.is_empty() || positionals.len() > 2 {
        eprintln!("rhttp: expected one or two positional arguments\n");
        print_help();
        std::process::exit(2);
    }

    init_logging(verbose);
    let defaults = config::load_defaults();
    let invocation = config::build_invocation(
        &defaults,
        host,
        port,
        ssh_command,
        verbose,
        &positionals[0],
        positionals.get(1).map(String::as_str),
    )?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(bootstrap::run(invocation))
}

/// Logs go to stderr only: stdout is the pipe when this process runs the
/// remote role.
pub(crate) fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
