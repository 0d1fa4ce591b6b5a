use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use denote_server::{crypto::KeyScheme, limiter::UnidentifiedSource, ServerConfig};
use reqwest::{Client, StatusCode};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "denote", about = "denote: self-destructing secret notes", version)]
struct Cli {
    /// denote server base URL for client commands ($DENOTE_SERVER)
    #[arg(
        long,
        global = true,
        env = "DENOTE_SERVER",
        default_value = "http://127.0.0.1:8000/"
    )]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the denote HTTP server. Unset flags fall back to DENOTE_* variables.
    Serve {
        /// Host to bind (default: $DENOTE_HOST or 127.0.0.1)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (default: $DENOTE_PORT or 8000)
        #[arg(long)]
        port: Option<u16>,
        /// Public base URL used in capability links (default: $DENOTE_URL)
        #[arg(long)]
        url: Option<String>,
        /// Directory holding denote.db (default: $DENOTE_DATA_DIR or platform dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Writes and deletions per source and window; 0 disables
        #[arg(long)]
        ip_limit: Option<i64>,
        /// Rate limit window, e.g. 1h or 24h
        #[arg(long, value_parser = humantime::parse_duration)]
        ip_limit_window: Option<Duration>,
        /// Trust X-Forwarded-For / X-Real-IP from a reverse proxy
        #[arg(long)]
        trust_proxy: bool,
        /// deny, allow or shared
        #[arg(long)]
        unidentified_source: Option<UnidentifiedSource>,
        /// raw or argon2
        #[arg(long)]
        key_scheme: Option<KeyScheme>,
        /// Interval between expiry sweeps, e.g. 5m
        #[arg(long, value_parser = humantime::parse_duration)]
        sweep_interval: Option<Duration>,
    },
    /// Store a secret and print its redeem and delete URLs
    Push {
        /// Secret value; read from stdin when omitted
        value: Option<String>,
        /// Lifetime, e.g. 30m, 2h, 7d (clamped server-side to 1m..7d)
        #[arg(long)]
        ttl: Option<String>,
        /// Number of reads before the secret self-destructs
        #[arg(long)]
        views: Option<u32>,
    },
    /// Redeem a secret URL and print the plaintext
    Get {
        /// URL printed by `push` (…?q=…)
        url: String,
    },
    /// Destroy a secret through its deletion URL
    Delete {
        /// Deletion URL printed by `push` (…?rm=…)
        url: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DENOTE_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            host,
            port,
            url,
            data_dir,
            ip_limit,
            ip_limit_window,
            trust_proxy,
            unidentified_source,
            key_scheme,
            sweep_interval,
        } => {
            let mut cfg = ServerConfig::default();
            if let Some(host) = host {
                cfg.host = host;
            }
            if let Some(port) = port {
                cfg.port = port;
            }
            if url.is_some() {
                cfg.public_url = url;
            }
            if data_dir.is_some() {
                cfg.data_dir = data_dir;
            }
            if let Some(limit) = ip_limit {
                cfg.ip_limit = limit;
            }
            if let Some(window) = ip_limit_window {
                cfg.ip_limit_window = window;
            }
            cfg.trust_proxy |= trust_proxy;
            if let Some(policy) = unidentified_source {
                cfg.unidentified_source = policy;
            }
            if let Some(scheme) = key_scheme {
                cfg.key_scheme = scheme;
            }
            if let Some(interval) = sweep_interval {
                cfg.sweep_interval = interval;
            }
            denote_server::run(cfg).await
        }

        Commands::Push { value, ttl, views } => {
            cmd_push(&cli.server, value, ttl.as_deref(), views).await
        }

        Commands::Get { url } => cmd_get(&url).await,

        Commands::Delete { url } => cmd_delete(&url).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_push(
    server: &str,
    value: Option<String>,
    ttl: Option<&str>,
    views: Option<u32>,
) -> Result<()> {
    let value = match value {
        Some(v) => v,
        None => read_stdin()?,
    };
    if value.is_empty() {
        bail!("refusing to store an empty secret");
    }

    let mut form = vec![("value", value)];
    if let Some(ttl) = ttl {
        let d = humantime::parse_duration(ttl).with_context(|| format!("invalid --ttl '{ttl}'"))?;
        form.push(("duration_limit", humantime::format_duration(d).to_string()));
    }
    if let Some(views) = views {
        if views == 0 {
            bail!("--views must be at least 1");
        }
        form.push(("view_limit", views.to_string()));
    }

    let resp = Client::new()
        .post(server)
        .form(&form)
        .send()
        .await
        .with_context(|| format!("POST {server}"))?;
    if resp.status() != StatusCode::OK {
        bail!(
            "server refused the secret ({}); it may be rate limited or too large",
            resp.status()
        );
    }
    let body = resp.text().await.context("read response")?;
    let (redeem, delete) = body
        .split_once('\n')
        .context("unexpected response from server")?;
    println!("{redeem}");
    eprintln!("delete: {delete}");
    Ok(())
}

async fn cmd_get(url: &str) -> Result<()> {
    let resp = Client::new()
        .get(url)
        .send()
        .await
        .context("GET secret URL")?;
    if resp.status() != StatusCode::OK {
        bail!("secret not found or no longer available");
    }
    let bytes = resp.bytes().await.context("read secret")?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes)?;
    if !bytes.ends_with(b"\n") {
        stdout.write_all(b"\n")?;
    }
    Ok(())
}

async fn cmd_delete(url: &str) -> Result<()> {
    let resp = Client::new()
        .get(url)
        .send()
        .await
        .context("GET deletion URL")?;
    if resp.status() != StatusCode::OK {
        bail!("secret not found or already gone");
    }
    println!("✓ deleted");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read secret from stdin")?;
    let trimmed = buf.trim_end_matches(['\r', '\n']).len();
    buf.truncate(trimmed);
    Ok(buf)
}
