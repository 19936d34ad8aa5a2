// soma_chroma - color harmonization daemon
// Serves the chroma service over a Unix Domain Socket

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use soma_chroma::selector::RegistrySelector;
use soma_chroma::service::{ChromaService, Response, Service, Stimulus};
use soma_chroma::strategies::{MoodTintStrategy, VibrantAccentStrategy};
use soma_chroma::{ColorEngine, ConflictPolicy, EngineConfig};

/// Frames larger than this are rejected
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "soma_chroma", version, about = "SOMA Chroma Daemon - Color Harmonization Service")]
struct Args {
    /// Unix socket path for UDS server
    #[arg(long, default_value = "/tmp/soma_chroma.sock")]
    socket_path: String,

    /// JSON engine config; unset fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run up to three strategies per context
    #[arg(long)]
    multi_strategy: bool,

    /// How overlapping strategy outputs combine: override, merge or average
    #[arg(long)]
    conflict_policy: Option<ConflictPolicy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    info!("🎨 Starting SOMA Chroma Daemon");
    info!("   Socket: {}", args.socket_path);

    let start_time = std::time::Instant::now();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if args.multi_strategy {
        config.multi_strategy = true;
    }
    if let Some(policy) = args.conflict_policy {
        config.conflict_policy = policy;
    }

    let selector = RegistrySelector::new()
        .with_strategy(Arc::new(VibrantAccentStrategy))
        .with_strategy(Arc::new(MoodTintStrategy::default()));
    info!("   ✓ Strategies: {}", selector.names().join(", "));

    let engine = ColorEngine::builder()
        .config(config)
        .selector(Arc::new(selector))
        .build()
        .context("Failed to build color engine")?;
    engine.init().context("Failed to initialize color engine")?;

    let service = Arc::new(ChromaService::new(engine.clone()));
    info!("   ✓ Color engine initialized");

    let socket_path = PathBuf::from(&args.socket_path);
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove old socket")?;
    }

    let listener = UnixListener::bind(&socket_path).context("Failed to bind Unix socket")?;
    info!("   ✓ Listening on {}", args.socket_path);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service, start_time).await {
                            error!("Connection error: {:#}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    engine.dispose().await;
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove socket")?;
    }
    Ok(())
}

/// Handle a single UDS connection
async fn handle_connection(
    mut stream: UnixStream,
    service: Arc<ChromaService>,
    start_time: std::time::Instant,
) -> Result<()> {
    let mut buffer = vec![0u8; 65536];

    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            anyhow::bail!("Frame of {} bytes exceeds limit", len);
        }
        if len > buffer.len() {
            buffer.resize(len, 0);
        }

        stream.read_exact(&mut buffer[..len]).await?;

        let stimulus: Stimulus = serde_json::from_slice(&buffer[..len]).context("Failed to parse stimulus")?;

        debug!("Received: op={}", stimulus.op);

        let response = if stimulus.op == "health" || stimulus.op == "health.check" {
            Response {
                ok: true,
                output: serde_json::json!({
                    "status": "healthy",
                    "service": "soma_chroma",
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptime_ms": start_time.elapsed().as_millis() as u64,
                    "state": service.engine().state().await,
                }),
                latency_ms: 0,
                cost: None,
            }
        } else {
            match service.stimulate(stimulus).await {
                Ok(resp) => resp,
                Err(e) => {
                    error!("Stimulate error: {}", e);
                    Response {
                        ok: false,
                        output: serde_json::json!({ "error": e.to_string() }),
                        latency_ms: 0,
                        cost: None,
                    }
                }
            }
        };

        let response_bytes = serde_json::to_vec(&response).context("Failed to serialize response")?;

        let len_bytes = (response_bytes.len() as u32).to_be_bytes();
        stream.write_all(&len_bytes).await?;
        stream.write_all(&response_bytes).await?;
        stream.flush().await?;

        debug!("Sent: ok={}, latency={}ms", response.ok, response.latency_ms);
    }
}
