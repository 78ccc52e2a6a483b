#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use courtside_provider::SecretString;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::auth::{AuthClaims, mint_hmac_token};

/// Issues signed access tokens to callers holding the admin secret.
#[derive(Clone)]
pub struct TokenMinter {
	pub admin_secret: SecretString,
	pub hmac_secret: SecretString,
	pub token_ttl: Duration,
}

/// Shared admin endpoint state (readiness + optional token minting).
#[derive(Clone)]
pub struct AdminState {
	ready: Arc<AtomicBool>,
	minter: Option<TokenMinter>,
}

impl AdminState {
	pub fn new(minter: Option<TokenMinter>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			minter,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_admin_server(bind: SocketAddr, state: AdminState) {
	tokio::spawn(async move {
		if let Err(err) = run_admin_server(bind, state).await {
			warn!(error = %err, "admin server stopped");
		}
	});
}

async fn run_admin_server(bind: SocketAddr, state: AdminState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_admin(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "admin connection error");
			}
		});
	}
}

async fn handle_admin(req: Request<Incoming>, state: AdminState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let path = req.uri().path().to_string();

	match (req.method().clone(), path.as_str()) {
		(Method::GET, "/healthz") => Ok(plain(StatusCode::OK, "ok")),
		(Method::GET, "/readyz") => {
			if state.is_ready() {
				Ok(plain(StatusCode::OK, "ready"))
			} else {
				Ok(plain(StatusCode::SERVICE_UNAVAILABLE, "not-ready"))
			}
		}
		(Method::POST, "/v1/token") => handle_mint(req, state).await,
		(Method::GET, _) => Ok(plain(StatusCode::NOT_FOUND, "")),
		_ => Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "")),
	}
}

#[derive(Debug, Default, Deserialize)]
struct MintRequest {
	#[serde(default)]
	identity: Option<String>,
	#[serde(default)]
	role: Option<String>,
	#[serde(default)]
	ttl_secs: Option<u64>,
}

async fn handle_mint(req: Request<Incoming>, state: AdminState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let Some(minter) = state.minter.clone() else {
		return Ok(plain(StatusCode::NOT_FOUND, ""));
	};

	let authorized = req
		.headers()
		.get("authorization")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.map(|provided| provided == minter.admin_secret.expose())
		.unwrap_or(false);

	if !authorized {
		return Ok(json_response(
			StatusCode::UNAUTHORIZED,
			&json!({ "error": "missing/invalid admin secret" }),
		));
	}

	let body = req.into_body().collect().await?.to_bytes();
	let mint: MintRequest = if body.is_empty() {
		MintRequest::default()
	} else {
		match serde_json::from_slice(&body) {
			Ok(m) => m,
			Err(e) => {
				return Ok(json_response(
					StatusCode::BAD_REQUEST,
					&json!({ "error": format!("invalid request body: {e}") }),
				));
			}
		}
	};

	let ttl = mint.ttl_secs.map(Duration::from_secs).unwrap_or(minter.token_ttl);
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	let exp = now.saturating_add(ttl.as_secs());

	let claims = AuthClaims {
		sub: mint.identity.filter(|s| !s.trim().is_empty()),
		role: mint
			.role
			.filter(|s| !s.trim().is_empty())
			.or_else(|| Some("player".to_string())),
		exp,
	};

	match mint_hmac_token(&claims, minter.hmac_secret.expose()) {
		Ok(token) => {
			info!(identity = %claims.identity(), ttl_secs = ttl.as_secs(), "minted access token");
			Ok(json_response(StatusCode::OK, &json!({ "token": token, "expires_at": exp })))
		}
		Err(e) => {
			warn!(error = %e, "token minting failed");
			Ok(json_response(
				StatusCode::INTERNAL_SERVER_ERROR,
				&json!({ "error": "token minting failed" }),
			))
		}
	}
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body.as_bytes())))
		.unwrap()
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header("content-type", "application/json")
		.body(Full::new(Bytes::from(value.to_string())))
		.unwrap()
}
