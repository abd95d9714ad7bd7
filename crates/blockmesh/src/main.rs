use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libblockmesh::{NodePaths, Session, SessionOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// Directory for config.json, node_state.json and metadata.json.
    /// Defaults to the platform configuration directory.
    #[arg(long = "config-dir", env = "BLOCKMESH_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory where block files are stored.
    /// Defaults to ~/espacioCompartido.
    #[arg(long = "blocks-dir", env = "BLOCKMESH_BLOCKS_DIR")]
    blocks_dir: Option<PathBuf>,

    /// Overrides the configured TCP listen port (UDP rides one above it).
    #[arg(long = "listen-port", env = "BLOCKMESH_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// A peer to join on startup.
    #[arg(long = "connect", env = "BLOCKMESH_CONNECT")]
    connect: Option<String>,
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let opts = Opts::parse();

    let mut paths = NodePaths::default_dirs().context("cannot resolve default directories")?;
    if let Some(config_dir) = opts.config_dir {
        paths.config_dir = config_dir;
    }
    if let Some(blocks_dir) = opts.blocks_dir {
        paths.blocks_dir = blocks_dir;
    }

    let session = Session::with_opts(
        paths,
        SessionOptions {
            listen_port: opts.listen_port,
            capacity_mb: None,
        },
    )
    .await
    .context("error starting node")?;

    if let Some(ip) = opts.connect {
        match session.connect(&ip).await {
            Ok(()) => info!(ip, "joined group"),
            Err(e) => eprintln!("connect {ip}: {e}"),
        }
    }

    println!(
        "node {} listening on tcp {} / udp {} — type `help` for commands",
        session.node_id(),
        session.tcp_port(),
        session.udp_port()
    );
    console_loop(&session).await;

    session.stop();
    Ok(())
}

async fn console_loop(session: &Arc<Session>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // EOF or a broken stdin both mean we are done.
            _ => return,
        };
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(c) => c,
            None => continue,
        };
        let args: Vec<&str> = parts.collect();

        match (command, args.as_slice()) {
            ("help", _) => print_help(),
            ("quit", _) | ("exit", _) => return,
            ("connect", [ip]) => report(session.connect(ip).await),
            ("upload", [path]) => report(session.upload(path).await),
            ("download", [name, dir]) => report(session.download(name, dir).await),
            ("delete", [name]) => report(session.delete(name).await),
            ("capacity", [mb]) => match mb.parse() {
                Ok(mb) => report(session.set_capacity(mb).await),
                Err(_) => eprintln!("capacity wants a number of MiB"),
            },
            ("nodes", _) => {
                for entry in session.list_nodes() {
                    println!(
                        "node {:>3}  {}:{}  {:?}  {}/{} MiB free",
                        entry.info.node_id,
                        entry.info.ip,
                        entry.info.tcp_port,
                        entry.status,
                        entry.info.free_space_mb,
                        entry.info.capacity_mb,
                    );
                }
            }
            ("files", _) => {
                let files = session.list_files();
                if files.is_empty() {
                    println!("no files");
                }
                for (name, record) in files {
                    println!(
                        "{name}  {} bytes  {} blocks",
                        record.size, record.num_blocks
                    );
                }
            }
            ("blocks", _) => {
                for slot in session.list_blocks() {
                    println!(
                        "block {:>5}  {:?}  owner={:?}  file={:?}[{:?}]",
                        slot.block_id, slot.status, slot.owner, slot.file_name, slot.file_block_index,
                    );
                }
            }
            ("status", _) => {
                println!(
                    "node {}  group {}  connected: {}  used {}/{} MiB",
                    session.node_id(),
                    session
                        .group_id()
                        .map(|g| g.to_string())
                        .unwrap_or_else(|| "<none>".to_owned()),
                    session.is_connected(),
                    session.used_space_mb().await,
                    session.used_space_mb().await + session.free_space_mb().await,
                );
            }
            _ => eprintln!("unknown command, try `help`"),
        }
    }
}

fn report(result: libblockmesh::Result<()>) {
    match result {
        Ok(()) => println!("ok"),
        Err(e) => eprintln!("error: {e}"),
    }
}

fn print_help() {
    println!(
        "commands:\n  \
         connect <ip>             join the group a peer belongs to\n  \
         upload <path>            split, place and replicate a file\n  \
         download <name> <dir>    rebuild a file from the mesh\n  \
         delete <name>            drop a file everywhere\n  \
         capacity <mb>            change capacity (50-100, disconnected only)\n  \
         nodes | files | blocks   print the replicated state\n  \
         status                   this node's identity and usage\n  \
         quit"
    );
}
