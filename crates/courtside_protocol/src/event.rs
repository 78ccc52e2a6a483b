#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::directive::ControlDirective;

/// Outbound events; always the textual encoding, one JSON object per frame.
///
/// Events are transient: pushed once, never persisted, best-effort delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	/// Sent once after a successful handshake.
	Welcome {
		identity: String,
		server_time_unix_ms: i64,
	},

	/// Per-message failure report; the session itself is unaffected.
	Error {
		message: String,
	},

	/// Completed commentary line (also the terminal event after a stream).
	Commentary {
		text: String,
	},

	/// Streaming partial; zero or more precede the final `commentary`.
	CommentaryChunk {
		text: String,
	},

	/// Completed coaching tip.
	Coach {
		text: String,
	},

	/// Acknowledges a `coach_enable` toggle.
	CoachStatus {
		enabled: bool,
	},

	/// Structured directive extracted from generated text.
	Control {
		directive: ControlDirective,
	},

	/// Reply to an application-level `ping`.
	Pong,
}

/// Encode an event as one JSON object for a text frame.
pub fn encode_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
	serde_json::to_string(event)
}
