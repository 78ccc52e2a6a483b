#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use courtside_provider::{CommentaryGenerator, OpenAiConfig, OpenAiGenerator, SimulatedGenerator};
use courtside_util::endpoint::WsEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::admin::{AdminState, TokenMinter, spawn_admin_server};
use crate::server::admission::{AdmissionController, AdmissionSettings, QuotaPolicy};
use crate::server::commentary::{SchedulerSettings, spawn_coach_loop, spawn_commentary_loop};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::registry::SessionRegistry;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courtside_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: ws://127.0.0.1:8790)\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "ws://127.0.0.1:8790".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courtside_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("courtside_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let Some(hmac_secret) = server_cfg.auth.hmac_secret.clone() else {
		return Err(anyhow::anyhow!(
			"no auth hmac_secret configured; refusing to accept unauthenticated clients"
		));
	};

	let minter = server_cfg.admin_secret.clone().map(|admin_secret| TokenMinter {
		admin_secret,
		hmac_secret: hmac_secret.clone(),
		token_ttl: server_cfg.auth.token_ttl,
	});
	let admin_state = AdminState::new(minter);
	if let Some(bind) = server_cfg.server.admin_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_admin_server(addr, admin_state.clone());
				info!(%addr, "admin server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid admin bind address (expected host:port)"),
		}
	}

	let admission_settings = AdmissionSettings {
		state_ingest: QuotaPolicy {
			points: server_cfg.admission.state_points,
			window: server_cfg.admission.state_window,
		},
		commentary_call: QuotaPolicy {
			points: server_cfg.admission.commentary_points,
			window: server_cfg.admission.commentary_window,
		},
	};

	let admission = match server_cfg.admission.database_url.as_deref() {
		Some(database_url) => {
			info!("admission counters backed by shared store");
			Arc::new(
				AdmissionController::connect(database_url, admission_settings)
					.await
					.context("connect admission store")?,
			)
		}
		None => {
			warn!("no admission database_url configured; counters are per-instance only");
			Arc::new(AdmissionController::in_memory(admission_settings))
		}
	};

	let generator: Arc<dyn CommentaryGenerator> = match (server_cfg.provider.api_key.clone(), server_cfg.provider.disabled)
	{
		(Some(api_key), false) => {
			let mut provider_cfg = OpenAiConfig::new(api_key);
			provider_cfg.base_url = server_cfg.provider.base_url.clone();
			provider_cfg.model = server_cfg.provider.model.clone();
			info!(model = %provider_cfg.model, "external text-generation provider enabled (streaming)");
			Arc::new(OpenAiGenerator::new(provider_cfg)?)
		}
		_ => {
			info!("provider credential absent or disabled; using simulated commentary");
			Arc::new(SimulatedGenerator::new())
		}
	};

	let registry = Arc::new(SessionRegistry::new());

	let scheduler_settings = SchedulerSettings {
		commentary_interval: server_cfg.scheduler.commentary_interval,
		coach_interval: server_cfg.scheduler.coach_interval,
		max_tokens: server_cfg.provider.max_tokens,
		temperature: server_cfg.provider.temperature,
	};

	spawn_commentary_loop(
		Arc::clone(&registry),
		Arc::clone(&admission),
		Arc::clone(&generator),
		scheduler_settings.clone(),
	);
	spawn_coach_loop(
		Arc::clone(&registry),
		Arc::clone(&admission),
		Arc::clone(&generator),
		scheduler_settings,
	);

	let conn_settings = ConnectionSettings {
		auth_hmac_secret: hmac_secret,
	};

	let listener = tokio::net::TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(bind = %bind_addr, "courtside_server: websocket endpoint ready");

	admin_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("courtside_server_connections_total").increment(1);
		info!(conn_id, remote = %remote, "accepted connection");

		let registry = Arc::clone(&registry);
		let admission = Arc::clone(&admission);
		let conn_settings = conn_settings.clone();

		tokio::spawn(async move {
			if let Err(e) = handle_connection(conn_id, stream, registry, admission, conn_settings).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}
