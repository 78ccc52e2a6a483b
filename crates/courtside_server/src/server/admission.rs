#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, anyhow};
use courtside_domain::{QuotaCategory, UserId};
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome of a single-shot consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
	Admitted,
	Rejected,
}

/// Point budget over a fixed window.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
	pub points: u32,
	pub window: Duration,
}

/// Per-category admission policies.
#[derive(Debug, Clone)]
pub struct AdmissionSettings {
	pub state_ingest: QuotaPolicy,
	pub commentary_call: QuotaPolicy,
}

impl Default for AdmissionSettings {
	fn default() -> Self {
		Self {
			state_ingest: QuotaPolicy {
				points: 5,
				window: Duration::from_secs(1),
			},
			commentary_call: QuotaPolicy {
				points: 40,
				window: Duration::from_secs(60),
			},
		}
	}
}

#[derive(Debug, Default)]
struct WindowCounter {
	window_start_ms: i64,
	points: u32,
}

/// Per-user, per-category admission control.
///
/// The sqlite/postgres backends hold the counters in a shared store so that
/// every process instance enforces one global budget per identity. The
/// in-memory backend covers single-node runs and tests. Consume is
/// single-shot: no retry or backoff lives here, callers decide whether a
/// rejection drops the frame or produces a placeholder event.
pub struct AdmissionController {
	backend: AdmissionBackend,
	settings: AdmissionSettings,
}

enum AdmissionBackend {
	InMemory(Mutex<HashMap<(QuotaCategory, String), WindowCounter>>),
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl AdmissionController {
	pub fn in_memory(settings: AdmissionSettings) -> Self {
		Self {
			backend: AdmissionBackend::InMemory(Mutex::new(HashMap::new())),
			settings,
		}
	}

	pub async fn connect(database_url: &str, settings: AdmissionSettings) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: AdmissionBackend::Sqlite(pool),
				settings,
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: AdmissionBackend::Postgres(pool),
				settings,
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	fn policy(&self, category: QuotaCategory) -> &QuotaPolicy {
		match category {
			QuotaCategory::StateIngest => &self.settings.state_ingest,
			QuotaCategory::CommentaryCall => &self.settings.commentary_call,
		}
	}

	/// Attempt to consume one point under `(category, identity)`.
	pub async fn try_consume(&self, category: QuotaCategory, identity: &UserId) -> anyhow::Result<Admission> {
		let policy = self.policy(category);
		let now_ms = crate::util::time::unix_ms_now();
		let window_ms = policy.window.as_millis() as i64;

		let admission = match &self.backend {
			AdmissionBackend::InMemory(counters) => {
				let mut counters = counters.lock().await;
				let counter = counters.entry((category, identity.as_str().to_string())).or_default();
				consume_in_window(counter, now_ms, window_ms, policy.points)
			}
			AdmissionBackend::Sqlite(pool) => {
				consume_sqlite(pool, category, identity, now_ms, window_ms, policy.points).await?
			}
			AdmissionBackend::Postgres(pool) => {
				consume_postgres(pool, category, identity, now_ms, window_ms, policy.points).await?
			}
		};

		if admission == Admission::Rejected {
			metrics::counter!("courtside_server_admission_rejected_total").increment(1);
			debug!(category = %category, identity = %identity, "consume rejected");
		}

		Ok(admission)
	}
}

/// Fixed-window consume. A rejected attempt leaves the counter untouched.
fn consume_in_window(counter: &mut WindowCounter, now_ms: i64, window_ms: i64, budget: u32) -> Admission {
	if budget == 0 {
		return Admission::Rejected;
	}

	if now_ms.saturating_sub(counter.window_start_ms) >= window_ms {
		counter.window_start_ms = now_ms;
		counter.points = 1;
		return Admission::Admitted;
	}

	if counter.points < budget {
		counter.points += 1;
		return Admission::Admitted;
	}

	Admission::Rejected
}

async fn consume_sqlite(
	pool: &sqlx::SqlitePool,
	category: QuotaCategory,
	identity: &UserId,
	now_ms: i64,
	window_ms: i64,
	budget: u32,
) -> anyhow::Result<Admission> {
	if budget == 0 {
		return Ok(Admission::Rejected);
	}

	let mut tx = pool.begin().await.context("begin sqlite tx")?;

	let row: Option<(i64, i64)> =
		sqlx::query_as("SELECT window_start_ms, points FROM admission_counters WHERE category = ? AND identity = ?")
			.bind(category.as_str())
			.bind(identity.as_str())
			.fetch_optional(&mut *tx)
			.await
			.context("select admission counter (sqlite)")?;

	let (window_start_ms, points) = match row {
		Some((start, points)) if now_ms.saturating_sub(start) < window_ms => (start, points as u32),
		_ => (now_ms, 0),
	};

	if points >= budget {
		tx.commit().await.context("commit sqlite tx")?;
		return Ok(Admission::Rejected);
	}

	sqlx::query(
		"INSERT INTO admission_counters (category, identity, window_start_ms, points) VALUES (?, ?, ?, ?) \
		ON CONFLICT(category, identity) DO UPDATE SET \
		window_start_ms = excluded.window_start_ms, points = excluded.points",
	)
	.bind(category.as_str())
	.bind(identity.as_str())
	.bind(window_start_ms)
	.bind(i64::from(points + 1))
	.execute(&mut *tx)
	.await
	.context("upsert admission counter (sqlite)")?;

	tx.commit().await.context("commit sqlite tx")?;
	Ok(Admission::Admitted)
}

async fn consume_postgres(
	pool: &sqlx::PgPool,
	category: QuotaCategory,
	identity: &UserId,
	now_ms: i64,
	window_ms: i64,
	budget: u32,
) -> anyhow::Result<Admission> {
	if budget == 0 {
		return Ok(Admission::Rejected);
	}

	let mut tx = pool.begin().await.context("begin postgres tx")?;

	let row: Option<(i64, i64)> = sqlx::query_as(
		"SELECT window_start_ms, points FROM admission_counters WHERE category = $1 AND identity = $2 FOR UPDATE",
	)
	.bind(category.as_str())
	.bind(identity.as_str())
	.fetch_optional(&mut *tx)
	.await
	.context("select admission counter (postgres)")?;

	let (window_start_ms, points) = match row {
		Some((start, points)) if now_ms.saturating_sub(start) < window_ms => (start, points as u32),
		_ => (now_ms, 0),
	};

	if points >= budget {
		tx.commit().await.context("commit postgres tx")?;
		return Ok(Admission::Rejected);
	}

	sqlx::query(
		"INSERT INTO admission_counters (category, identity, window_start_ms, points) VALUES ($1, $2, $3, $4) \
		ON CONFLICT (category, identity) DO UPDATE SET \
		window_start_ms = excluded.window_start_ms, points = excluded.points",
	)
	.bind(category.as_str())
	.bind(identity.as_str())
	.bind(window_start_ms)
	.bind(i64::from(points + 1))
	.execute(&mut *tx)
	.await
	.context("upsert admission counter (postgres)")?;

	tx.commit().await.context("commit postgres tx")?;
	Ok(Admission::Admitted)
}
