#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use courtside_domain::{QuotaCategory, StateSnapshot};
use courtside_protocol::{ServerEvent, parse_directive};
use courtside_provider::{CommentaryGenerator, GenerationOutput, GenerationRequest};
use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::server::admission::{Admission, AdmissionController};
use crate::server::registry::{DueSession, SessionRegistry};
use crate::util::time::unix_ms_now;

/// Placeholder sent when the commentary budget rejects a call.
pub const COMMENTARY_RATE_LIMITED_TEXT: &str = "[commentary rate-limited]";

/// Terminal placeholder for a failed commentary invocation.
pub const COMMENTARY_ERROR_TEXT: &str = "[commentary error]";

/// Terminal placeholder for a failed coaching invocation.
pub const COACH_ERROR_TEXT: &str = "[coach error]";

const COMMENTARY_SYSTEM_PROMPT: &str = "You are Courtside, the excitable play-by-play commentator for a fast \
	pong match. React to the latest table state in one or two short sentences. If, and only if, you decide \
	the AI paddle should change speed, reply with exactly \
	{\"type\":\"ai_speed_adjustment\",\"speed\":<multiplier>} and nothing else.";

const COACH_SYSTEM_PROMPT: &str = "You are a pragmatic pong coach watching the human player on the left \
	paddle. Offer one concrete, encouraging tip based on the latest table state. Keep it to a single sentence.";

/// Scheduler timing and generation parameters.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
	pub commentary_interval: Duration,
	pub coach_interval: Duration,
	pub max_tokens: u32,
	pub temperature: f32,
}

impl Default for SchedulerSettings {
	fn default() -> Self {
		Self {
			commentary_interval: Duration::from_millis(1200),
			coach_interval: Duration::from_millis(10_000),
			max_tokens: 96,
			temperature: 0.8,
		}
	}
}

/// Spawn the commentary loop: every tick, fan out one generation task per
/// due session so a slow provider call never blocks the tick or the other
/// sessions.
pub fn spawn_commentary_loop(
	registry: Arc<SessionRegistry>,
	admission: Arc<AdmissionController>,
	generator: Arc<dyn CommentaryGenerator>,
	settings: SchedulerSettings,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(settings.commentary_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			ticker.tick().await;

			let interval_ms = settings.commentary_interval.as_millis() as i64;
			let due = registry.due_for_commentary(unix_ms_now(), interval_ms).await;
			if due.is_empty() {
				continue;
			}

			debug!(sessions = due.len(), "commentary tick");
			for session in due {
				let admission = Arc::clone(&admission);
				let generator = Arc::clone(&generator);
				let settings = settings.clone();

				tokio::spawn(async move {
					commentate_session(session, admission, generator, settings).await;
				});
			}
		}
	})
}

/// Spawn the coach loop. Structurally the commentary loop with a longer
/// interval, the per-session opt-in gate, and non-streaming generation; it
/// draws on the same commentary-call budget.
pub fn spawn_coach_loop(
	registry: Arc<SessionRegistry>,
	admission: Arc<AdmissionController>,
	generator: Arc<dyn CommentaryGenerator>,
	settings: SchedulerSettings,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(settings.coach_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			ticker.tick().await;

			let interval_ms = settings.coach_interval.as_millis() as i64;
			let due = registry.due_for_coach(unix_ms_now(), interval_ms).await;
			if due.is_empty() {
				continue;
			}

			debug!(sessions = due.len(), "coach tick");
			for session in due {
				let admission = Arc::clone(&admission);
				let generator = Arc::clone(&generator);
				let settings = settings.clone();

				tokio::spawn(async move {
					coach_session(session, admission, generator, settings).await;
				});
			}
		}
	})
}

/// One commentary invocation for one session. Chunks are forwarded the
/// moment they arrive; the concatenation is kept for the directive check.
pub(crate) async fn commentate_session(
	session: DueSession,
	admission: Arc<AdmissionController>,
	generator: Arc<dyn CommentaryGenerator>,
	settings: SchedulerSettings,
) {
	match admission.try_consume(QuotaCategory::CommentaryCall, &session.identity).await {
		Ok(Admission::Admitted) => {}
		Ok(Admission::Rejected) => {
			metrics::counter!("courtside_server_commentary_rate_limited_total").increment(1);
			session.sender.send_event(&ServerEvent::Commentary {
				text: COMMENTARY_RATE_LIMITED_TEXT.to_string(),
			});
			return;
		}
		Err(e) => {
			// Commentary fails closed on store errors.
			warn!(conn_id = session.conn_id, error = %e, "admission store error; skipping commentary call");
			return;
		}
	}

	metrics::counter!("courtside_server_commentary_calls_total").increment(1);

	let (system_prompt, user_prompt) = commentary_prompts(&session.snapshot);
	let request = GenerationRequest {
		system_prompt,
		user_prompt,
		streaming: true,
		max_tokens: settings.max_tokens,
		temperature: settings.temperature,
	};

	let full_text = match generator.generate(request).await {
		Ok(GenerationOutput::Complete(text)) => text,
		Ok(GenerationOutput::Stream(mut chunks)) => {
			let mut full = String::new();
			loop {
				match chunks.next().await {
					Some(Ok(chunk)) => {
						session.sender.send_event(&ServerEvent::CommentaryChunk { text: chunk.clone() });
						full.push_str(&chunk);
					}
					Some(Err(e)) => {
						metrics::counter!("courtside_server_commentary_failures_total").increment(1);
						warn!(conn_id = session.conn_id, error = %e, "commentary stream failed");
						session.sender.send_event(&ServerEvent::Commentary {
							text: COMMENTARY_ERROR_TEXT.to_string(),
						});
						return;
					}
					None => break,
				}
			}
			full
		}
		Err(e) => {
			metrics::counter!("courtside_server_commentary_failures_total").increment(1);
			warn!(
				conn_id = session.conn_id,
				generator = generator.name(),
				error = %e,
				"commentary generation failed"
			);
			session.sender.send_event(&ServerEvent::Commentary {
				text: COMMENTARY_ERROR_TEXT.to_string(),
			});
			return;
		}
	};

	match parse_directive(&full_text) {
		Some(directive) => {
			// Control first, confirmation second; same channel keeps them ordered.
			session.sender.send_event(&ServerEvent::Control { directive });
			session.sender.send_event(&ServerEvent::Commentary {
				text: directive.confirmation(),
			});
		}
		None => {
			session.sender.send_event(&ServerEvent::Commentary { text: full_text });
		}
	}
}

/// One coaching invocation for one session. Always non-streaming; a stream
/// handed back anyway is drained without chunk events.
pub(crate) async fn coach_session(
	session: DueSession,
	admission: Arc<AdmissionController>,
	generator: Arc<dyn CommentaryGenerator>,
	settings: SchedulerSettings,
) {
	match admission.try_consume(QuotaCategory::CommentaryCall, &session.identity).await {
		Ok(Admission::Admitted) => {}
		Ok(Admission::Rejected) => {
			metrics::counter!("courtside_server_coach_rate_limited_total").increment(1);
			session.sender.send_event(&ServerEvent::Coach {
				text: COMMENTARY_RATE_LIMITED_TEXT.to_string(),
			});
			return;
		}
		Err(e) => {
			warn!(conn_id = session.conn_id, error = %e, "admission store error; skipping coach call");
			return;
		}
	}

	metrics::counter!("courtside_server_coach_calls_total").increment(1);

	let (system_prompt, user_prompt) = coach_prompts(&session.snapshot);
	let request = GenerationRequest {
		system_prompt,
		user_prompt,
		streaming: false,
		max_tokens: settings.max_tokens,
		temperature: settings.temperature,
	};

	let full_text = match generator.generate(request).await {
		Ok(GenerationOutput::Complete(text)) => text,
		Ok(GenerationOutput::Stream(mut chunks)) => {
			let mut full = String::new();
			loop {
				match chunks.next().await {
					Some(Ok(chunk)) => full.push_str(&chunk),
					Some(Err(e)) => {
						metrics::counter!("courtside_server_coach_failures_total").increment(1);
						warn!(conn_id = session.conn_id, error = %e, "coach stream failed");
						session.sender.send_event(&ServerEvent::Coach {
							text: COACH_ERROR_TEXT.to_string(),
						});
						return;
					}
					None => break,
				}
			}
			full
		}
		Err(e) => {
			metrics::counter!("courtside_server_coach_failures_total").increment(1);
			warn!(
				conn_id = session.conn_id,
				generator = generator.name(),
				error = %e,
				"coach generation failed"
			);
			session.sender.send_event(&ServerEvent::Coach {
				text: COACH_ERROR_TEXT.to_string(),
			});
			return;
		}
	};

	match parse_directive(&full_text) {
		Some(directive) => {
			session.sender.send_event(&ServerEvent::Control { directive });
			session.sender.send_event(&ServerEvent::Coach {
				text: directive.confirmation(),
			});
		}
		None => {
			session.sender.send_event(&ServerEvent::Coach { text: full_text });
		}
	}
}

fn commentary_prompts(snapshot: &StateSnapshot) -> (String, String) {
	(COMMENTARY_SYSTEM_PROMPT.to_string(), describe_state(snapshot))
}

fn coach_prompts(snapshot: &StateSnapshot) -> (String, String) {
	(COACH_SYSTEM_PROMPT.to_string(), describe_state(snapshot))
}

/// Render the snapshot into prompt facts, skipping unreadable fields.
pub(crate) fn describe_state(snapshot: &StateSnapshot) -> String {
	let mut facts = Vec::new();

	if let (Some(x), Some(y)) = (snapshot.ball_x(), snapshot.ball_y()) {
		facts.push(format!("ball at ({x:.2}, {y:.2})"));
	}
	if let (Some(vx), Some(vy)) = (snapshot.ball_vx(), snapshot.ball_vy()) {
		facts.push(format!("ball velocity ({vx:.3}, {vy:.3})"));
	}
	if let Some(y) = snapshot.left_paddle_y() {
		facts.push(format!("left paddle at {y:.2}"));
	}
	if let Some(y) = snapshot.right_paddle_y() {
		facts.push(format!("right paddle at {y:.2}"));
	}
	if let Some(speed) = snapshot.right_paddle_speed() {
		facts.push(format!("AI paddle speed {speed:.2}x"));
	}
	if let (Some(left), Some(right)) = snapshot.scores() {
		facts.push(format!("score {left}-{right}"));
	}
	if snapshot.running() == Some(false) {
		facts.push("the match is paused".to_string());
	}

	if facts.is_empty() {
		return "No readable table state was reported.".to_string();
	}

	format!("Latest table state: {}.", facts.join(", "))
}
