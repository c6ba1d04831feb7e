//! klnk - command-line front end for the cluster IPC control channel.
//!
//! Encodes and decodes request paths, issues single requests against a
//! control mount or socket, runs migration decisions, and can host a
//! fixed-answer control server for testing deployments.
//!
//! Results go to stdout; logs go to stderr.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use klnk::{
    ControlBackend, ControlChannel, ControlServer, ExecCandidate, ExecContext, KlnkClient,
    KlnkError, MountChannel, MountTable, Operation, RequestPath, ResourceClass, ResourceRequest,
    SocketChannel,
};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "klnk")]
#[command(about = "Client for the cluster IPC control channel")]
struct Args {
    /// Mount table file (defaults to <config dir>/klnk/mounts.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Per-subsystem log level, e.g. `channel=debug` (repeatable)
    #[arg(long = "log", global = true, value_name = "SUBSYSTEM=LEVEL")]
    log: Vec<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
    /// Resource class: msg, sem, shm or tsk
    #[arg(long)]
    cls: String,

    /// Operation name, e.g. msgsnd or probe
    #[arg(long)]
    op: String,

    #[arg(long, default_value = "0", allow_hyphen_values = true, value_parser = parse_int)]
    key: i32,

    #[arg(long, default_value = "0", allow_hyphen_values = true, value_parser = parse_int)]
    id: i32,

    #[arg(long, default_value = "0", allow_hyphen_values = true, value_parser = parse_int)]
    val1: i32,

    #[arg(long, default_value = "0", allow_hyphen_values = true, value_parser = parse_int)]
    val2: i32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the control path a request encodes to
    Encode(RequestArgs),

    /// Print the fields of an encoded control path as JSON
    Decode { path: String },

    /// Issue one request and report the backend's answer
    Request {
        #[command(flatten)]
        request: RequestArgs,

        /// Use a control server instead of the control mount
        #[arg(long)]
        socket: Option<SocketAddr>,
    },

    /// Ask the backend whether an executable open should migrate
    Migrate {
        #[arg(long, allow_hyphen_values = true, value_parser = parse_int)]
        gpid: i32,

        #[arg(long)]
        socket: Option<SocketAddr>,

        path: String,
    },

    /// Report whether a directory may enter the cluster scope
    CanEnter {
        /// Directory to check (defaults to the current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Run a control server that answers every request with one code
    Serve {
        #[arg(long, default_value = "127.0.0.1:0")]
        addr: String,

        /// Code to answer with; 0 means the open succeeds
        #[arg(long, default_value = "900", value_parser = parse_int)]
        answer: i32,
    },
}

/// Decimal or `0x`-prefixed hex, with an optional leading minus.
fn parse_int(s: &str) -> std::result::Result<i32, String> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|e| format!("{}: {}", s, e))?;
    let value = if negative { -value } else { value };
    // Hex literals may name the bit pattern of a negative value.
    i32::try_from(value)
        .or_else(|_| u32::try_from(value).map(|v| v as i32))
        .map_err(|_| format!("{} does not fit in 32 bits", s))
}

fn init_logging(debug: bool, overrides: &[String]) -> Result<()> {
    let default = if debug { "debug" } else { "warn" };
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    for item in overrides {
        let (subsystem, level) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("expected SUBSYSTEM=LEVEL, got {}", item))?;
        let directive = format!("klnk::{}={}", subsystem, level)
            .parse()
            .with_context(|| format!("invalid log directive {}", item))?;
        filter = filter.add_directive(directive);
    }

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_ids(false)
        .compact()
        .init();
    Ok(())
}

fn load_mounts(config: Option<&PathBuf>) -> Result<MountTable> {
    let table = match config {
        Some(path) => MountTable::load(path)?,
        None => MountTable::load_default()?,
    };
    Ok(table)
}

async fn open_channel(socket: Option<SocketAddr>) -> Result<Arc<dyn ControlChannel>> {
    Ok(match socket {
        Some(addr) => Arc::new(SocketChannel::connect(addr).await?),
        None => Arc::new(MountChannel::new()),
    })
}

fn build_request(args: &RequestArgs) -> Result<ResourceRequest<'static>> {
    let cls = ResourceClass::from_str(&args.cls)
        .ok_or_else(|| anyhow!("unknown resource class {}", args.cls))?;
    let op = Operation::from_str(&args.op).ok_or_else(|| anyhow!("unknown operation {}", args.op))?;
    Ok(ResourceRequest::new(cls, args.key, op, args.id).values(args.val1, args.val2))
}

/// Answers every request with the same code.
struct FixedBackend(i32);

#[async_trait::async_trait]
impl ControlBackend for FixedBackend {
    async fn open(&self, _path: &str) -> i32 {
        self.0
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.debug, &args.log)?;
    let mounts = load_mounts(args.config.as_ref())?;
    debug!("mount table: {:?}", mounts);

    match args.command {
        Command::Encode(request) => {
            let path = build_request(&request)?
                .to_path()?
                .render(&mounts.control_root)?;
            println!("{}", path);
        }

        Command::Decode { path } => {
            let fields = RequestPath::parse(&mounts.control_root, &path)?;
            let decoded = json!({
                "class": fields.class().map(|c| c.as_str()),
                "operation": fields.operation().map(|o| o.as_str()),
                "key": fields.key(),
                "id": fields.id(),
                "val1": fields.val1(),
                "val2": fields.val2(),
                "addr": fields.addr,
                "inlen": fields.inlen,
                "outlen": fields.outlen,
            });
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }

        Command::Request { request, socket } => {
            let request = build_request(&request)?;
            let client = KlnkClient::new(open_channel(socket).await?, mounts);
            match client.transact(&request).await {
                Ok(()) => println!("ok"),
                Err(
                    e @ (KlnkError::ChannelLost { .. }
                    | KlnkError::VersionMismatch { .. }
                    | KlnkError::Io { .. }
                    | KlnkError::Json { .. }),
                ) => return Err(e.into()),
                Err(e) => {
                    // The backend answered; report its code.
                    println!("errno={}", e.errno());
                    eprintln!("{}", e);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }

        Command::Migrate { gpid, socket, path } => {
            let client = KlnkClient::new(open_channel(socket).await?, mounts);
            let ctx = ExecContext::current()?.with_global_id(gpid);
            let mut candidate = ExecCandidate::new(path);
            let decision = match client.migrate(&ctx, &mut candidate).await {
                Ok(never) => match never {},
                Err(e) => e,
            };
            let report = json!({
                "errno": decision.errno(),
                "decision": decision.to_string(),
                "path": candidate.path(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::CanEnter { cwd } => {
            let ctx = match cwd {
                Some(dir) => ExecContext::new(dir),
                None => ExecContext::current()?,
            };
            println!("{}", ctx.can_enter(&mounts));
        }

        Command::Serve { addr, answer } => {
            let handle = ControlServer::bind(&addr, Arc::new(FixedBackend(answer))).await?;

            // Parsed by scripts and tests to find the server
            println!("CONTROL_PORT={}", handle.addr().port());
            info!("control server running on {}", handle.addr());

            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received, exiting");
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_forms() {
        assert_eq!(parse_int("42"), Ok(42));
        assert_eq!(parse_int("0x2a"), Ok(42));
        assert_eq!(parse_int("-1"), Ok(-1));
        assert_eq!(parse_int("0xffffffff"), Ok(-1));
        assert!(parse_int("0x1ffffffff").is_err());
        assert!(parse_int("nope").is_err());
    }

    #[test]
    fn test_build_request_rejects_unknown_names() {
        let mut args = RequestArgs {
            cls: "sem".to_string(),
            op: "semctl".to_string(),
            key: 0x1234,
            id: 42,
            val1: 3,
            val2: -1,
        };
        let request = build_request(&args).unwrap();
        assert_eq!(request.op, Operation::SemCtl);

        args.cls = "pipe".to_string();
        assert!(build_request(&args).is_err());
        args.cls = "sem".to_string();
        args.op = "fork".to_string();
        assert!(build_request(&args).is_err());
    }
}
