#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courtside_domain::{StateSnapshot, UserId};
use courtside_protocol::{ControlDirective, ServerEvent};
use courtside_provider::{CommentaryGenerator, GenerationOutput, GenerationRequest};
use futures::stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::server::admission::{AdmissionController, AdmissionSettings, QuotaPolicy};
use crate::server::commentary::{
	COACH_ERROR_TEXT, COMMENTARY_ERROR_TEXT, COMMENTARY_RATE_LIMITED_TEXT, SchedulerSettings, coach_session,
	commentate_session, describe_state,
};
use crate::server::registry::{DueSession, SessionSender};

/// Generator that replays a fixed chunk script.
struct ScriptedGenerator {
	chunks: Vec<Result<&'static str, &'static str>>,
}

#[async_trait]
impl CommentaryGenerator for ScriptedGenerator {
	async fn generate(&self, _request: GenerationRequest) -> anyhow::Result<GenerationOutput> {
		let items = self
			.chunks
			.clone()
			.into_iter()
			.map(|chunk| chunk.map(str::to_string).map_err(|e| anyhow::anyhow!(e)))
			.collect::<Vec<_>>();
		Ok(GenerationOutput::Stream(Box::pin(stream::iter(items))))
	}

	fn name(&self) -> &'static str {
		"scripted"
	}
}

/// Generator that always returns one completed text.
struct CompleteGenerator {
	text: &'static str,
}

#[async_trait]
impl CommentaryGenerator for CompleteGenerator {
	async fn generate(&self, _request: GenerationRequest) -> anyhow::Result<GenerationOutput> {
		Ok(GenerationOutput::Complete(self.text.to_string()))
	}

	fn name(&self) -> &'static str {
		"complete"
	}
}

/// Generator whose invocation fails outright.
struct FailingGenerator;

#[async_trait]
impl CommentaryGenerator for FailingGenerator {
	async fn generate(&self, _request: GenerationRequest) -> anyhow::Result<GenerationOutput> {
		Err(anyhow::anyhow!("provider unreachable"))
	}

	fn name(&self) -> &'static str {
		"failing"
	}
}

fn admission(commentary_points: u32) -> Arc<AdmissionController> {
	Arc::new(AdmissionController::in_memory(AdmissionSettings {
		state_ingest: QuotaPolicy {
			points: 5,
			window: Duration::from_secs(1),
		},
		commentary_call: QuotaPolicy {
			points: commentary_points,
			window: Duration::from_secs(60),
		},
	}))
}

fn due_session() -> (DueSession, mpsc::UnboundedReceiver<Message>) {
	let (tx, rx) = mpsc::unbounded_channel();
	let due = DueSession {
		conn_id: 1,
		identity: UserId::new("player-1").expect("valid UserId"),
		snapshot: StateSnapshot::new(json!({
			"ballX": 0.42,
			"ballY": 0.5,
			"leftScore": 3,
			"rightScore": 5,
			"running": true,
		})),
		sender: SessionSender::new(tx),
	};
	(due, rx)
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerEvent> {
	let mut events = Vec::new();
	while let Ok(message) = rx.try_recv() {
		let Message::Text(text) = message else {
			panic!("outbound frames are always textual, got: {message:?}");
		};
		events.push(serde_json::from_str(text.as_str()).expect("well-formed event frame"));
	}
	events
}

#[tokio::test]
async fn streaming_chunks_arrive_in_order_before_one_final_commentary() {
	let (due, mut rx) = due_session();
	let generator = Arc::new(ScriptedGenerator {
		chunks: vec![Ok("Nice"), Ok(" shot"), Ok("!")],
	});

	commentate_session(due, admission(40), generator, SchedulerSettings::default()).await;

	let events = drain_events(&mut rx);
	assert_eq!(
		events,
		vec![
			ServerEvent::CommentaryChunk {
				text: "Nice".to_string()
			},
			ServerEvent::CommentaryChunk {
				text: " shot".to_string()
			},
			ServerEvent::CommentaryChunk { text: "!".to_string() },
			ServerEvent::Commentary {
				text: "Nice shot!".to_string()
			},
		]
	);
}

#[tokio::test]
async fn directive_text_emits_control_then_confirmation() {
	let (due, mut rx) = due_session();
	let generator = Arc::new(CompleteGenerator {
		text: r#"{"type":"ai_speed_adjustment","speed":1.5}"#,
	});

	commentate_session(due, admission(40), generator, SchedulerSettings::default()).await;

	let events = drain_events(&mut rx);
	assert_eq!(events.len(), 2);
	assert_eq!(
		events[0],
		ServerEvent::Control {
			directive: ControlDirective::AiSpeedAdjustment { speed: 1.5 }
		}
	);
	match &events[1] {
		ServerEvent::Commentary { text } => assert!(text.contains("1.50")),
		other => panic!("expected confirmation commentary, got: {other:?}"),
	}
}

#[tokio::test]
async fn prose_text_emits_zero_control_events() {
	let (due, mut rx) = due_session();
	let generator = Arc::new(CompleteGenerator {
		text: "The AI paddle speeds up to 1.5x!",
	});

	commentate_session(due, admission(40), generator, SchedulerSettings::default()).await;

	let events = drain_events(&mut rx);
	assert_eq!(events.len(), 1);
	assert!(matches!(events[0], ServerEvent::Commentary { .. }));
}

#[tokio::test]
async fn failed_invocation_yields_one_terminal_placeholder() {
	let (due, mut rx) = due_session();

	commentate_session(due, admission(40), Arc::new(FailingGenerator), SchedulerSettings::default()).await;

	let events = drain_events(&mut rx);
	assert_eq!(
		events,
		vec![ServerEvent::Commentary {
			text: COMMENTARY_ERROR_TEXT.to_string()
		}]
	);
}

#[tokio::test]
async fn mid_stream_failure_ends_with_the_placeholder() {
	let (due, mut rx) = due_session();
	let generator = Arc::new(ScriptedGenerator {
		chunks: vec![Ok("Nice"), Err("connection reset")],
	});

	commentate_session(due, admission(40), generator, SchedulerSettings::default()).await;

	let events = drain_events(&mut rx);
	assert_eq!(
		events,
		vec![
			ServerEvent::CommentaryChunk {
				text: "Nice".to_string()
			},
			ServerEvent::Commentary {
				text: COMMENTARY_ERROR_TEXT.to_string()
			},
		]
	);
}

#[tokio::test]
async fn rejected_budget_sends_the_rate_limited_placeholder() {
	let (due, mut rx) = due_session();
	let generator = Arc::new(ScriptedGenerator {
		chunks: vec![Ok("never sent")],
	});

	commentate_session(due, admission(0), generator, SchedulerSettings::default()).await;

	let events = drain_events(&mut rx);
	assert_eq!(
		events,
		vec![ServerEvent::Commentary {
			text: COMMENTARY_RATE_LIMITED_TEXT.to_string()
		}]
	);
}

#[tokio::test]
async fn coach_returns_a_single_tip_event() {
	let (due, mut rx) = due_session();
	let generator = Arc::new(CompleteGenerator {
		text: "Hold the center line and react late.",
	});

	coach_session(due, admission(40), generator, SchedulerSettings::default()).await;

	let events = drain_events(&mut rx);
	assert_eq!(
		events,
		vec![ServerEvent::Coach {
			text: "Hold the center line and react late.".to_string()
		}]
	);
}

#[tokio::test]
async fn coach_drains_streams_without_chunk_events() {
	let (due, mut rx) = due_session();
	let generator = Arc::new(ScriptedGenerator {
		chunks: vec![Ok("Watch"), Ok(" the angles.")],
	});

	coach_session(due, admission(40), generator, SchedulerSettings::default()).await;

	let events = drain_events(&mut rx);
	assert_eq!(
		events,
		vec![ServerEvent::Coach {
			text: "Watch the angles.".to_string()
		}]
	);
}

#[tokio::test]
async fn coach_failure_uses_the_coach_placeholder() {
	let (due, mut rx) = due_session();

	coach_session(due, admission(40), Arc::new(FailingGenerator), SchedulerSettings::default()).await;

	let events = drain_events(&mut rx);
	assert_eq!(
		events,
		vec![ServerEvent::Coach {
			text: COACH_ERROR_TEXT.to_string()
		}]
	);
}

#[test]
fn describe_state_reports_readable_fields() {
	let snapshot = StateSnapshot::new(json!({
		"ballX": 0.42,
		"ballY": 0.5,
		"ballVX": -0.01,
		"ballVY": 0.02,
		"leftPaddleY": 0.4,
		"rightPaddleY": 0.6,
		"rightPaddleSpeed": 1.25,
		"leftScore": 3,
		"rightScore": 5,
		"running": false,
	}));

	let described = describe_state(&snapshot);
	assert!(described.contains("ball at (0.42, 0.50)"));
	assert!(described.contains("score 3-5"));
	assert!(described.contains("paused"));
}

#[test]
fn describe_state_degrades_gracefully() {
	let described = describe_state(&StateSnapshot::new(json!({ "ballX": "fast" })));
	assert_eq!(described, "No readable table state was reported.");
}
