mod console;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use beam_crypto::{generate_key, DEFAULT_KEY_LEN};
use beam_protocol::discovery::{SenderRequest, TRANSFER_PORT};
use beam_transfer::{
    discovery, send_path, Receiver, ReceiverConfig, TransferError, TransferOptions,
};

use crate::console::{BarProgress, ConsoleAuthorizer};

#[derive(Parser)]
#[command(
    name = "beam",
    version,
    about = "Fast, key-authenticated file transfer for local networks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a file or directory to a receiver on the LAN
    Send {
        /// File or directory to send
        path: PathBuf,
        /// Transfer key (auto-generated if not provided)
        #[arg(short, long)]
        key: Option<String>,
        /// Parallel TCP streams for large files (1..=4)
        #[arg(long, default_value_t = 1)]
        streams: u16,
        /// Plaintext chunk size in bytes
        #[arg(long)]
        chunk_size: Option<u32>,
        /// zlib-compress chunks in flight
        #[arg(short, long)]
        compress: bool,
        /// Compression level (0..=9; 0 disables compression)
        #[arg(long, default_value_t = 6)]
        level: u8,
    },
    /// Wait for incoming transfers
    Receive {
        /// Download directory
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beam_cli=info,beam_transfer=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Send {
            path,
            key,
            streams,
            chunk_size,
            compress,
            level,
        } => run_send(path, key, streams, chunk_size, compress, level).await,
        Command::Receive { directory } => run_receive(directory).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run_send(
    path: PathBuf,
    key: Option<String>,
    streams: u16,
    chunk_size: Option<u32>,
    compress: bool,
    level: u8,
) -> anyhow::Result<ExitCode> {
    let meta = match std::fs::metadata(&path) {
        Ok(meta) => meta,
        Err(_) => bail!("'{}' not found", path.display()),
    };
    let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("'{}' has no usable name", path.display());
    };

    let key = key
        .map(|k| k.trim().to_uppercase())
        .unwrap_or_else(|| generate_key(DEFAULT_KEY_LEN));

    let mut options = TransferOptions {
        parallel_streams: streams,
        compress,
        compression_level: level,
        ..Default::default()
    };
    if let Some(chunk_size) = chunk_size {
        options.chunk_size = chunk_size;
    }

    // The operator reads this to the receiving side.
    println!("Transfer key: {key}");

    info!("searching for receivers on the network");
    let request = SenderRequest {
        filename: filename.to_owned(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        key: key.clone(),
    };
    let ip = match discovery::find_receiver(&request).await {
        Ok(ip) => ip,
        Err(TransferError::NoReceiverFound) => {
            error!("no receivers found; is `beam receive` running on the other machine?");
            return Ok(ExitCode::from(1));
        }
        Err(err) => return Err(err.into()),
    };
    info!(receiver = %ip, "found receiver");

    let peer = SocketAddr::new(ip, TRANSFER_PORT);
    match send_path(&path, peer, &key, &options, Arc::new(BarProgress::new())).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(TransferError::Declined) => {
            error!("receiver declined the transfer");
            Ok(ExitCode::from(1))
        }
        Err(err) => {
            error!("transfer failed: {err}");
            Ok(ExitCode::from(1))
        }
    }
}

async fn run_receive(directory: PathBuf) -> anyhow::Result<ExitCode> {
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("cannot create '{}'", directory.display()))?;

    let listener = TcpListener::bind(("0.0.0.0", TRANSFER_PORT))
        .await
        .with_context(|| format!("cannot bind TCP port {TRANSFER_PORT}"))?;

    let receiver = Receiver::new(ReceiverConfig {
        download_dir: directory.clone(),
        authorizer: Arc::new(ConsoleAuthorizer),
        progress: Arc::new(BarProgress::new()),
    });

    tokio::spawn(async {
        if let Err(err) = discovery::respond_to_discovery().await {
            error!(error = %err, "discovery responder stopped");
        }
    });
    let serve = tokio::spawn(receiver.run(listener));

    info!(dir = %directory.display(), "ready; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    serve.abort();
    info!("shutting down");
    Ok(ExitCode::SUCCESS)
}
