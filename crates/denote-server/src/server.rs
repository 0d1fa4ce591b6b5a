use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::Uri,
    middleware,
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    crypto::KeyScheme,
    handlers::{create, health, not_found, redeem},
    janitor::Janitor,
    limiter::{IpLimiter, UnidentifiedSource},
    security::{deadline, security_headers},
    store::{SecretPolicy, Store},
    AppState, Settings,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL capability links point at (`$DENOTE_URL`). Defaults to
    /// `http://{host}:{port}/`.
    pub public_url: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Requests per source and window on the write and delete paths.
    /// Zero or below disables limiting.
    pub ip_limit: i64,
    pub ip_limit_window: Duration,
    pub trust_proxy: bool,
    pub unidentified_source: UnidentifiedSource,
    pub sweep_interval: Duration,
    pub handler_timeout: Duration,
    pub max_body_bytes: usize,
    pub key_scheme: KeyScheme,
    pub policy: SecretPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: env_var("DENOTE_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: env_parse("DENOTE_PORT").unwrap_or(8000),
            public_url: env_var("DENOTE_URL"),
            data_dir: env_var("DENOTE_DATA_DIR").map(PathBuf::from),
            ip_limit: env_parse("DENOTE_IP_LIMIT").unwrap_or(0),
            ip_limit_window: env_duration("DENOTE_IP_LIMIT_WINDOW")
                .unwrap_or(Duration::from_secs(24 * 3600)),
            trust_proxy: env_var("DENOTE_TRUST_PROXY")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            unidentified_source: env_parse("DENOTE_UNIDENTIFIED_SOURCE").unwrap_or_default(),
            sweep_interval: env_duration("DENOTE_SWEEP_INTERVAL")
                .unwrap_or(Duration::from_secs(300)),
            handler_timeout: env_duration("DENOTE_HANDLER_TIMEOUT")
                .unwrap_or(Duration::from_secs(32)),
            max_body_bytes: env_parse("DENOTE_MAX_BODY_BYTES").unwrap_or(4096),
            key_scheme: env_parse("DENOTE_KEY_SCHEME").unwrap_or_default(),
            policy: SecretPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// The validated public base URL, always ending in `/`.
    pub fn public_url(&self) -> Result<String> {
        match &self.public_url {
            Some(url) => normalize_public_url(url),
            None => normalize_public_url(&format!("http://{}:{}/", self.host, self.port)),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn env_duration(name: &str) -> Option<Duration> {
    let raw = env_var(name)?;
    match humantime::parse_duration(raw.trim()) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "ignoring unparsable duration");
            None
        }
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Check that `raw` is an absolute http(s) URL with a host and no query,
/// and give it a trailing `/`.
pub fn normalize_public_url(raw: &str) -> Result<String> {
    let uri: Uri = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid public URL '{raw}'"))?;
    let scheme = uri.scheme_str().context("public URL needs a scheme")?;
    if scheme != "http" && scheme != "https" {
        bail!("public URL scheme must be http or https, got '{scheme}'");
    }
    let authority = uri.authority().context("public URL needs a host")?;
    if authority.host().is_empty() {
        bail!("public URL needs a host");
    }
    if uri.query().is_some() {
        bail!("public URL must not carry a query string");
    }
    let mut path = uri.path().to_owned();
    if !path.ends_with('/') {
        path.push('/');
    }
    Ok(format!("{scheme}://{authority}{path}"))
}

/// Create `data_dir` if given, otherwise fall back to the platform data dir.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d)
                .with_context(|| format!("create data dir {}", d.display()))?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Assemble handler state around an opened store.
pub fn build_state(cfg: &ServerConfig, store: Store) -> Result<AppState> {
    let create_limiter = IpLimiter::new(cfg.ip_limit, cfg.ip_limit_window, cfg.unidentified_source)
        .context("create limiter")?;
    let delete_limiter = IpLimiter::new(cfg.ip_limit, cfg.ip_limit_window, cfg.unidentified_source)
        .context("delete limiter")?;

    Ok(AppState {
        store,
        create_limiter: Arc::new(create_limiter),
        delete_limiter: Arc::new(delete_limiter),
        settings: Arc::new(Settings {
            public_url: cfg.public_url()?,
            policy: cfg.policy.clone(),
            key_scheme: cfg.key_scheme,
            trust_proxy: cfg.trust_proxy,
            handler_timeout: cfg.handler_timeout,
            max_body_bytes: cfg.max_body_bytes,
        }),
    })
}

/// The HTTP surface: the secret endpoint at the public URL's path plus
/// `/health`. Anything else is a 404.
pub fn router(state: AppState) -> Router {
    let settings = Arc::clone(&state.settings);
    let uri = settings.public_url.parse::<Uri>().ok();
    let mount = uri
        .as_ref()
        .map(|u| u.path().to_owned())
        .filter(|p| p.starts_with('/'))
        .unwrap_or_else(|| "/".to_owned());
    let https = uri.as_ref().and_then(|u| u.scheme_str()) == Some("https");

    let body_limit = match settings.max_body_bytes {
        0 => DefaultBodyLimit::disable(),
        n => DefaultBodyLimit::max(n),
    };

    Router::new()
        .route(&mount, get(redeem).post(create).fallback(not_found))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
        .layer(body_limit)
        .layer(middleware::from_fn_with_state(
            settings.handler_timeout,
            deadline,
        ))
        .layer(middleware::from_fn_with_state(https, security_headers))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    if cfg.sweep_interval.is_zero() {
        bail!("sweep interval must be greater than zero");
    }

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let store = Store::open(&data_dir.join("denote.db")).context("open store")?;
    let state = build_state(&cfg, store.clone())?;

    let mut janitors = vec![Janitor::spawn("store", cfg.sweep_interval, store)];
    if state.create_limiter.is_active() {
        janitors.push(Janitor::spawn(
            "create-limiter",
            cfg.sweep_interval,
            Arc::clone(&state.create_limiter),
        ));
    }
    if state.delete_limiter.is_active() {
        janitors.push(Janitor::spawn(
            "delete-limiter",
            cfg.sweep_interval,
            Arc::clone(&state.delete_limiter),
        ));
    }

    info!(
        public_url = %state.settings.public_url,
        ip_limit = cfg.ip_limit,
        key_scheme = ?cfg.key_scheme,
        "denote configured"
    );
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((cfg.host.as_str(), cfg.port))
        .await
        .with_context(|| format!("bind {}:{}", cfg.host, cfg.port))?;
    info!(addr = %listener.local_addr()?, "denote server listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    for janitor in janitors {
        janitor.shutdown().await;
    }
    served.context("server error")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
