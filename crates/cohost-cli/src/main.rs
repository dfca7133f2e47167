//! cohost CLI: AI co-host server and control client.
//!
//! ```text
//! cohost serve [--config cohost.toml] [--port 2004] [--host 127.0.0.1] [--voice af_heart]
//! cohost chat <username> "message" [--tag Kappa] [--server http://localhost:2004]
//! cohost mute / status / health / context / clear-context / clear-caches / devices [--server ...]
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cohost_lib::{Orchestrator, Result, config, server};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVER: &str = "http://localhost:2004";

/// cohost: AI co-host that answers chat out loud
#[derive(Parser)]
#[command(name = "cohost", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the co-host pipeline and its control API
    Serve {
        /// TOML config file
        #[arg(long, env = "COHOST_CONFIG")]
        config: Option<PathBuf>,
        /// Listen port
        #[arg(long, default_value_t = server::DEFAULT_PORT)]
        port: u16,
        /// Listen host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Reasoning backend base URL (OpenAI-compatible)
        #[arg(long)]
        reasoning_url: Option<String>,
        /// Reasoning model name
        #[arg(long)]
        model: Option<String>,
        /// Voice backend base URL
        #[arg(long)]
        voice_url: Option<String>,
        /// Voice id
        #[arg(long)]
        voice: Option<String>,
        /// Playback speed
        #[arg(long)]
        speed: Option<f32>,
        /// Output device index (see `cohost devices`)
        #[arg(long)]
        device: Option<usize>,
        /// Directory for the persistent audio cache
        #[arg(long)]
        audio_cache_dir: Option<PathBuf>,
    },
    /// Send a chat message to the running server
    Chat {
        /// Chat username
        username: String,
        /// Message text
        text: String,
        /// Emote or tag attached to the message (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Stop the current utterance and drop the pending request
    Mute {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Get pipeline status
    Status {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Probe backends and the output device
    Health {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Show the context window and chat statistics
    Context {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Forget the conversation history
    ClearContext {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Empty the response and audio caches
    ClearCaches {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// List output devices
    Devices {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cohost=info,cohost_lib=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config: path,
            port,
            host,
            reasoning_url,
            model,
            voice_url,
            voice,
            speed,
            device,
            audio_cache_dir,
        } => {
            let mut config = config::load(path.as_deref())?;
            if let Some(url) = reasoning_url {
                config.reasoning.base_url = url;
            }
            if let Some(model) = model {
                config.reasoning.model = model;
            }
            if let Some(url) = voice_url {
                config.voice.base_url = url;
            }
            if let Some(voice) = voice {
                config.voice.voice = voice;
            }
            if let Some(speed) = speed {
                config.voice.speed = speed;
            }
            if device.is_some() {
                config.audio.device_index = device;
            }
            if audio_cache_dir.is_some() {
                config.cache.audio_dir = audio_cache_dir;
            }

            let orchestrator = Orchestrator::from_config(config)?;
            let app = server::router(orchestrator.clone());

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "cohost listening");

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            orchestrator.shutdown();
            info!("cohost stopped");
        }

        Command::Chat {
            username,
            text,
            tags,
            server,
        } => {
            let body = serde_json::json!({ "username": username, "text": text, "tags": tags });
            let resp = reqwest::Client::new()
                .post(format!("{server}/chat"))
                .json(&body)
                .send()
                .await?;
            println!("{}", resp.text().await.unwrap_or_default());
        }

        Command::Mute { server } => send(reqwest::Method::POST, &server, "mute").await?,
        Command::Status { server } => send(reqwest::Method::GET, &server, "status").await?,
        Command::Health { server } => send(reqwest::Method::GET, &server, "health").await?,
        Command::Context { server } => send(reqwest::Method::GET, &server, "context").await?,
        Command::ClearContext { server } => {
            send(reqwest::Method::DELETE, &server, "context").await?
        }
        Command::ClearCaches { server } => send(reqwest::Method::DELETE, &server, "cache").await?,
        Command::Devices { server } => send(reqwest::Method::GET, &server, "devices").await?,
    }

    Ok(())
}

async fn send(method: reqwest::Method, server: &str, endpoint: &str) -> Result<()> {
    let resp = reqwest::Client::new()
        .request(method, format!("{server}/{endpoint}"))
        .send()
        .await?;
    println!("{}", resp.text().await.unwrap_or_default());
    Ok(())
}
