use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chunkup_transfer::{FileSource, FingerprintStrategy, LocalFile, fingerprint_with};
use chunkup_uploader::{
    EventChannel, TransferEvent, TransferManager, UploaderConfig, scan_paths,
};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chunkup", version, about = "Resumable chunked file uploads")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files or directories
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// TOML configuration file
        #[arg(short, long, env = "CHUNKUP_CONFIG")]
        config: Option<PathBuf>,
        /// Server base URL
        #[arg(short, long, env = "CHUNKUP_SERVER")]
        server: Option<String>,
        /// Server-side destination folder
        #[arg(short, long)]
        folder: Option<String>,
        /// Chunk size in bytes
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Chunk requests in flight
        #[arg(long)]
        concurrency: Option<usize>,
        /// Files uploading at once
        #[arg(long)]
        files: Option<usize>,
        /// Automatic re-attempts per failed chunk
        #[arg(long)]
        retries: Option<u32>,
    },
    /// Print the content fingerprint of a file
    Fingerprint {
        file: PathBuf,
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Hash the whole file instead of head and body
        #[arg(long)]
        full: bool,
    },
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Overrides {
    server: Option<String>,
    folder: Option<String>,
    chunk_size: Option<u64>,
    concurrency: Option<usize>,
    files: Option<usize>,
    retries: Option<u32>,
}

impl Overrides {
    fn apply(self, config: &mut UploaderConfig) {
        if let Some(server) = self.server {
            config.endpoint.base_url = server;
        }
        if let Some(folder) = self.folder {
            config.endpoint.upload_folder_path = folder;
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if let Some(n) = self.concurrency {
            config.max_concurrent_chunks = n;
        }
        if let Some(n) = self.files {
            config.max_active_files = n;
        }
        if let Some(n) = self.retries {
            config.max_chunk_retries = n;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Upload {
            paths,
            config,
            server,
            folder,
            chunk_size,
            concurrency,
            files,
            retries,
        } => {
            let overrides = Overrides {
                server,
                folder,
                chunk_size,
                concurrency,
                files,
                retries,
            };
            let config = load_config(config.as_deref(), overrides)?;
            upload(&paths, config).await
        }
        Commands::Fingerprint {
            file,
            chunk_size,
            full,
        } => {
            let source = LocalFile::open(&file)
                .await
                .with_context(|| format!("cannot open {}", file.display()))?;
            let strategy = if full {
                FingerprintStrategy::Full
            } else {
                FingerprintStrategy::HeadTail
            };
            let chunk_size = chunk_size.unwrap_or(chunkup_transfer::DEFAULT_CHUNK_SIZE);
            let fp = fingerprint_with(&source, chunk_size, strategy).await?;
            println!("{fp}  {}", file.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>, overrides: Overrides) -> anyhow::Result<UploaderConfig> {
    let mut config = match path {
        Some(path) => UploaderConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => UploaderConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn upload(paths: &[PathBuf], config: UploaderConfig) -> anyhow::Result<ExitCode> {
    let scanned = scan_paths(paths)?;
    if scanned.is_empty() {
        warn!("nothing to upload");
        return Ok(ExitCode::SUCCESS);
    }

    let manager = TransferManager::with_http(config)?;
    let (channel, rx) = EventChannel::new(1024);
    manager.add_listener(channel);
    let printer = tokio::spawn(print_events(rx));

    let mut sources: Vec<Arc<dyn FileSource>> = Vec::with_capacity(scanned.len());
    let mut rejected = 0usize;
    for file in &scanned {
        match file.open().await {
            Ok(source) => sources.push(Arc::new(source)),
            Err(e) => {
                eprintln!("{}: {e}", file.path.display());
                rejected += 1;
            }
        }
    }
    info!(files = sources.len(), "starting upload");
    rejected += manager
        .add_files(sources)
        .await
        .iter()
        .filter(|r| r.is_err())
        .count();
    manager.start_all();

    tokio::select! {
        _ = manager.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling uploads");
            for info in manager.sessions() {
                if let Some(fp) = info.fingerprint
                    && let Err(e) = manager.cancel(&fp).await
                {
                    warn!("failed to cancel {}: {e}", info.name);
                }
            }
        }
    }

    let failed = manager.failed().len();
    drop(manager);
    // Uploads still finishing a request keep the channel open for a moment.
    match tokio::time::timeout(Duration::from_secs(5), printer).await {
        Ok(Err(e)) => warn!("event printer stopped: {e}"),
        Ok(Ok(())) | Err(_) => {}
    }

    if rejected + failed > 0 {
        eprintln!("{} file(s) failed", rejected + failed);
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn print_events(mut rx: mpsc::Receiver<TransferEvent>) {
    while let Some(event) = rx.recv().await {
        match &event {
            TransferEvent::Added { info } => println!("queued    {} ({} bytes)", info.name, info.size),
            TransferEvent::Progress { info } => println!(
                "{:>3}%      {} {}",
                info.progress,
                info.name,
                format_rate(info.speed, info.time_remaining)
            ),
            TransferEvent::Succeeded { info } => println!("done      {}", info.name),
            TransferEvent::Failed { info, error } => eprintln!("failed    {}: {error}", info.name),
            TransferEvent::Duplicate { info } => println!("duplicate {}", info.name),
            TransferEvent::Cancelled { info } => println!("cancelled {}", info.name),
        }
    }
}

/// Renders speed (bytes per millisecond) and time remaining (seconds).
fn format_rate(speed: Option<u64>, remaining: Option<u64>) -> String {
    let Some(speed) = speed else {
        return String::new();
    };
    let per_sec = speed as f64 * 1000.0;
    let rate = if per_sec >= 1024.0 * 1024.0 {
        format!("{:.1} MiB/s", per_sec / (1024.0 * 1024.0))
    } else {
        format!("{:.1} KiB/s", per_sec / 1024.0)
    };
    match remaining {
        Some(secs) => format!("{rate}, {secs}s left"),
        None => rate,
    }
}
