use std::net::SocketAddr;

use axum::{
    extract::{
        rejection::{FormRejection, QueryRejection},
        ConnectInfo, Form, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tokio::task::spawn_blocking;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::{
    capability::{self, Capability},
    crypto::{self, KEY_LEN},
    error::{Error, Result},
    limiter::client_ip,
    store::GetResult,
    AppState,
};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Response {
    let store = state.store.clone();
    match spawn_blocking(move || store.ping()).await {
        Ok(Ok(())) => Json(json!({"status": "ok"})).into_response(),
        Ok(Err(e)) => unavailable(&e),
        Err(e) => unavailable(&e),
    }
}

fn unavailable(e: &dyn std::fmt::Display) -> Response {
    warn!(error = %e, "health check failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"status": "unavailable"})),
    )
        .into_response()
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateForm {
    #[serde(default)]
    pub value: String,
    pub view_limit: Option<String>,
    pub duration_limit: Option<String>,
}

/// `POST` form → `"{redeem URL}\n{delete URL}"`.
pub async fn create(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    form: Result<Form<CreateForm>, FormRejection>,
) -> Result<Response> {
    let settings = &state.settings;
    let source = client_ip(&headers, peer.ip(), settings.trust_proxy);
    if !state.create_limiter.allow(source) {
        return Err(Error::RateLimited);
    }

    let Form(CreateForm {
        value,
        view_limit,
        duration_limit,
    }) = form.map_err(|e| {
        debug!(error = %e, "form rejected");
        Error::MalformedInput("unreadable form")
    })?;
    let value = zeroize::Zeroizing::new(value.into_bytes());
    if value.is_empty() {
        return Err(Error::MalformedInput("empty value"));
    }

    let view_limit = settings.policy.view_limit(view_limit.as_deref());
    let lifetime = settings.policy.lifetime(duration_limit.as_deref());
    let key: [u8; KEY_LEN] = crypto::random_bytes()?;
    let material = settings.key_scheme.material(key);

    let store = state.store.clone();
    let (cancel, _abandon) = abandon_on_drop();
    let inserted = spawn_blocking(move || {
        let ciphertext = crypto::encrypt(&material, &value)?;
        store.insert_cancellable(&ciphertext, view_limit, lifetime, &cancel)
    })
    .await??;

    info!(view_limit, expires_at = %inserted.expires_at, "secret created");

    let cap = Capability {
        access_key: inserted.access_key,
        key,
    };
    let body = format!(
        "{}\n{}",
        capability::redeem_url(&settings.public_url, &cap),
        capability::delete_url(&settings.public_url, &inserted.deletion_key),
    );
    Ok(([(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response())
}

// ── Redeem / delete ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RedeemParams {
    pub q: Option<String>,
    pub rm: Option<String>,
}

/// `GET ?q=` returns the plaintext; `GET ?rm=` deletes and answers `OK`.
/// A present `rm` wins over `q`.
pub async fn redeem(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    params: Result<Query<RedeemParams>, QueryRejection>,
) -> Result<Response> {
    let Query(params) = params.map_err(|_| Error::MalformedInput("unreadable query"))?;
    if let Some(rm) = params.rm {
        return delete(&state, peer, &headers, &rm).await;
    }
    let q = params.q.filter(|q| !q.is_empty()).ok_or(Error::NotFound)?;

    let cap = Capability::decode(&q)?;
    let material = state.settings.key_scheme.material(cap.key);
    let access_key = cap.access_key;
    let store = state.store.clone();
    let (cancel, _abandon) = abandon_on_drop();
    let mut plaintext = spawn_blocking(move || {
        let ciphertext = match store.get_cancellable(&access_key, &cancel)? {
            GetResult::Value(data) => data,
            GetResult::Burned(data) => {
                debug!("final view served");
                data
            }
            GetResult::NotFound => return Err(Error::NotFound),
        };
        crypto::decrypt(&material, &ciphertext)
    })
    .await??;

    Ok(([(header::CONTENT_TYPE, TEXT_PLAIN)], std::mem::take(&mut *plaintext)).into_response())
}

async fn delete(state: &AppState, peer: SocketAddr, headers: &HeaderMap, rm: &str) -> Result<Response> {
    let source = client_ip(headers, peer.ip(), state.settings.trust_proxy);
    if !state.delete_limiter.allow(source) {
        return Err(Error::RateLimited);
    }
    let deletion_key = capability::parse_deletion_key(rm)?;

    let store = state.store.clone();
    let (cancel, _abandon) = abandon_on_drop();
    if !spawn_blocking(move || store.delete_cancellable(&deletion_key, &cancel)).await?? {
        return Err(Error::NotFound);
    }
    info!("secret deleted");
    Ok(([(header::CONTENT_TYPE, TEXT_PLAIN)], "OK").into_response())
}

/// A token for blocking store work plus a guard that cancels it when the
/// handler future is dropped, e.g. by the request deadline.
fn abandon_on_drop() -> (CancellationToken, DropGuard) {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    (cancel, guard)
}

/// Unknown paths and methods look exactly like a missing secret.
pub async fn not_found() -> Error {
    Error::NotFound
}
