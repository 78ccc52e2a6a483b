#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use courtside_provider::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Floor for the commentary tick interval.
pub const MIN_COMMENTARY_INTERVAL: Duration = Duration::from_millis(300);

/// Default config path: `~/.courtside/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".courtside").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	clamp_intervals(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	/// Shared administrative secret gating the token-mint endpoint.
	pub admin_secret: Option<SecretString>,
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub provider: ProviderSettings,
	pub scheduler: SchedulerFileSettings,
	pub admission: AdmissionFileSettings,
}

/// Bind points for the auxiliary HTTP surfaces.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional admin/health HTTP bind address (host:port).
	pub admin_bind: Option<String>,
}

/// Credential verification settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HMAC secret for stateless access tokens. Required to accept clients.
	pub hmac_secret: Option<SecretString>,
	/// Default lifetime for minted tokens.
	pub token_ttl: Duration,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			hmac_secret: None,
			token_ttl: Duration::from_secs(3600),
		}
	}
}

/// Text-generation provider settings.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
	/// Provider credential; absence switches to the simulated generator.
	pub api_key: Option<SecretString>,
	/// Force the simulated generator even when a credential exists.
	pub disabled: bool,
	pub base_url: String,
	pub model: String,
	pub max_tokens: u32,
	pub temperature: f32,
}

impl Default for ProviderSettings {
	fn default() -> Self {
		Self {
			api_key: None,
			disabled: false,
			base_url: courtside_provider::openai::DEFAULT_BASE_URL.to_string(),
			model: courtside_provider::openai::DEFAULT_MODEL.to_string(),
			max_tokens: 96,
			temperature: 0.8,
		}
	}
}

/// Scheduler intervals.
#[derive(Debug, Clone)]
pub struct SchedulerFileSettings {
	pub commentary_interval: Duration,
	pub coach_interval: Duration,
}

impl Default for SchedulerFileSettings {
	fn default() -> Self {
		Self {
			commentary_interval: Duration::from_millis(1200),
			coach_interval: Duration::from_millis(10_000),
		}
	}
}

/// Admission quotas and the shared counter store.
#[derive(Debug, Clone)]
pub struct AdmissionFileSettings {
	/// Counter store URL (sqlite: or postgres:); absence keeps counters
	/// in-process.
	pub database_url: Option<String>,
	pub state_points: u32,
	pub state_window: Duration,
	pub commentary_points: u32,
	pub commentary_window: Duration,
}

impl Default for AdmissionFileSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			state_points: 5,
			state_window: Duration::from_secs(1),
			commentary_points: 40,
			commentary_window: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	admin_secret: Option<String>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	provider: FileProviderSettings,

	#[serde(default)]
	scheduler: FileSchedulerSettings,

	#[serde(default)]
	admission: FileAdmissionSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	admin_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	hmac_secret: Option<String>,
	token_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileProviderSettings {
	api_key: Option<String>,
	disabled: Option<bool>,
	base_url: Option<String>,
	model: Option<String>,
	max_tokens: Option<u32>,
	temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSchedulerSettings {
	commentary_interval_ms: Option<u64>,
	coach_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAdmissionSettings {
	database_url: Option<String>,
	state_points: Option<u32>,
	state_window_secs: Option<u64>,
	commentary_points: Option<u32>,
	commentary_window_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults_auth = AuthSettings::default();
		let defaults_provider = ProviderSettings::default();
		let defaults_scheduler = SchedulerFileSettings::default();
		let defaults_admission = AdmissionFileSettings::default();

		Self {
			admin_secret: file.admin_secret.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				admin_bind: file.server.admin_bind.filter(|s| !s.trim().is_empty()),
			},
			auth: AuthSettings {
				hmac_secret: file.auth.hmac_secret.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				token_ttl: file
					.auth
					.token_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults_auth.token_ttl),
			},
			provider: ProviderSettings {
				api_key: file.provider.api_key.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				disabled: file.provider.disabled.unwrap_or(false),
				base_url: file
					.provider
					.base_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults_provider.base_url),
				model: file
					.provider
					.model
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults_provider.model),
				max_tokens: file.provider.max_tokens.unwrap_or(defaults_provider.max_tokens),
				temperature: file.provider.temperature.unwrap_or(defaults_provider.temperature),
			},
			scheduler: SchedulerFileSettings {
				commentary_interval: file
					.scheduler
					.commentary_interval_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults_scheduler.commentary_interval),
				coach_interval: file
					.scheduler
					.coach_interval_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults_scheduler.coach_interval),
			},
			admission: AdmissionFileSettings {
				database_url: file.admission.database_url.filter(|s| !s.trim().is_empty()),
				state_points: file.admission.state_points.unwrap_or(defaults_admission.state_points),
				state_window: file
					.admission
					.state_window_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults_admission.state_window),
				commentary_points: file
					.admission
					.commentary_points
					.unwrap_or(defaults_admission.commentary_points),
				commentary_window: file
					.admission
					.commentary_window_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults_admission.commentary_window),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("COURTSIDE_ADMIN_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.admin_secret = Some(SecretString::new(v));
			info!("server auth: admin_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURTSIDE_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.hmac_secret = Some(SecretString::new(v));
			info!("server auth: hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURTSIDE_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.auth.token_ttl = Duration::from_secs(secs);
		info!(secs, "server auth: token_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("COURTSIDE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURTSIDE_ADMIN_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.admin_bind = Some(v);
			info!("server config: admin_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURTSIDE_PROVIDER_API_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.provider.api_key = Some(SecretString::new(v));
			info!("provider config: api_key overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURTSIDE_PROVIDER_DISABLED")
		&& let Some(disabled) = parse_env_bool(&v)
	{
		cfg.provider.disabled = disabled;
		info!(disabled, "provider config: disabled overridden by env");
	}

	if let Ok(v) = std::env::var("COURTSIDE_PROVIDER_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.provider.base_url = v;
			info!("provider config: base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURTSIDE_PROVIDER_MODEL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.provider.model = v;
			info!("provider config: model overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURTSIDE_PROVIDER_MAX_TOKENS")
		&& let Ok(max_tokens) = v.trim().parse::<u32>()
	{
		cfg.provider.max_tokens = max_tokens;
		info!(max_tokens, "provider config: max_tokens overridden by env");
	}

	if let Ok(v) = std::env::var("COURTSIDE_PROVIDER_TEMPERATURE")
		&& let Ok(temperature) = v.trim().parse::<f32>()
	{
		cfg.provider.temperature = temperature;
		info!(temperature, "provider config: temperature overridden by env");
	}

	if let Ok(v) = std::env::var("COURTSIDE_COMMENTARY_INTERVAL_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.scheduler.commentary_interval = Duration::from_millis(ms);
		info!(ms, "scheduler config: commentary_interval overridden by env");
	}

	if let Ok(v) = std::env::var("COURTSIDE_COACH_INTERVAL_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.scheduler.coach_interval = Duration::from_millis(ms);
		info!(ms, "scheduler config: coach_interval overridden by env");
	}

	if let Ok(v) = std::env::var("COURTSIDE_ADMISSION_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.admission.database_url = Some(v);
			info!("admission config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURTSIDE_STATE_QUOTA_POINTS")
		&& let Ok(points) = v.trim().parse::<u32>()
	{
		cfg.admission.state_points = points;
		info!(points, "admission config: state_points overridden by env");
	}

	if let Ok(v) = std::env::var("COURTSIDE_STATE_QUOTA_WINDOW_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.admission.state_window = Duration::from_secs(secs);
		info!(secs, "admission config: state_window overridden by env");
	}

	if let Ok(v) = std::env::var("COURTSIDE_COMMENTARY_QUOTA_POINTS")
		&& let Ok(points) = v.trim().parse::<u32>()
	{
		cfg.admission.commentary_points = points;
		info!(points, "admission config: commentary_points overridden by env");
	}

	if let Ok(v) = std::env::var("COURTSIDE_COMMENTARY_QUOTA_WINDOW_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.admission.commentary_window = Duration::from_secs(secs);
		info!(secs, "admission config: commentary_window overridden by env");
	}
}

fn clamp_intervals(cfg: &mut ServerConfig) {
	if cfg.scheduler.commentary_interval < MIN_COMMENTARY_INTERVAL {
		warn!(
			requested_ms = cfg.scheduler.commentary_interval.as_millis(),
			floor_ms = MIN_COMMENTARY_INTERVAL.as_millis(),
			"commentary interval below floor; clamping"
		);
		cfg.scheduler.commentary_interval = MIN_COMMENTARY_INTERVAL;
	}

	if cfg.scheduler.coach_interval < cfg.scheduler.commentary_interval {
		warn!(
			coach_ms = cfg.scheduler.coach_interval.as_millis(),
			commentary_ms = cfg.scheduler.commentary_interval.as_millis(),
			"coach interval shorter than commentary interval; clamping"
		);
		cfg.scheduler.coach_interval = cfg.scheduler.commentary_interval;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn from_toml(s: &str) -> ServerConfig {
		let file: FileConfig = toml::from_str(s).expect("parse test TOML");
		let mut cfg = ServerConfig::from_file(file);
		clamp_intervals(&mut cfg);
		cfg
	}

	#[test]
	fn empty_config_uses_defaults() {
		let cfg = from_toml("");

		assert!(cfg.auth.hmac_secret.is_none());
		assert!(cfg.provider.api_key.is_none());
		assert_eq!(cfg.scheduler.commentary_interval, Duration::from_millis(1200));
		assert_eq!(cfg.scheduler.coach_interval, Duration::from_millis(10_000));
		assert_eq!(cfg.admission.state_points, 5);
		assert_eq!(cfg.admission.state_window, Duration::from_secs(1));
		assert_eq!(cfg.admission.commentary_points, 40);
		assert_eq!(cfg.admission.commentary_window, Duration::from_secs(60));
	}

	#[test]
	fn file_values_are_honored() {
		let cfg = from_toml(
			r#"
admin_secret = "admin"

[auth]
hmac_secret = "signing"
token_ttl_secs = 120

[provider]
api_key = "sk-test"
model = "local-test"

[scheduler]
commentary_interval_ms = 2000
coach_interval_ms = 15000

[admission]
database_url = "sqlite::memory:"
state_points = 9
commentary_points = 12
commentary_window_secs = 30
"#,
		);

		assert!(cfg.admin_secret.is_some());
		assert!(cfg.auth.hmac_secret.is_some());
		assert_eq!(cfg.auth.token_ttl, Duration::from_secs(120));
		assert_eq!(cfg.provider.model, "local-test");
		assert_eq!(cfg.scheduler.commentary_interval, Duration::from_millis(2000));
		assert_eq!(cfg.scheduler.coach_interval, Duration::from_millis(15_000));
		assert_eq!(cfg.admission.database_url.as_deref(), Some("sqlite::memory:"));
		assert_eq!(cfg.admission.state_points, 9);
		assert_eq!(cfg.admission.commentary_points, 12);
		assert_eq!(cfg.admission.commentary_window, Duration::from_secs(30));
	}

	#[test]
	fn commentary_interval_is_clamped_to_floor() {
		let cfg = from_toml("[scheduler]\ncommentary_interval_ms = 50\n");
		assert_eq!(cfg.scheduler.commentary_interval, MIN_COMMENTARY_INTERVAL);
	}

	#[test]
	fn blank_secrets_read_as_absent() {
		let cfg = from_toml("admin_secret = \"  \"\n\n[auth]\nhmac_secret = \"\"\n");
		assert!(cfg.admin_secret.is_none());
		assert!(cfg.auth.hmac_secret.is_none());
	}
}
