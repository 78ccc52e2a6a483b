#![forbid(unsafe_code)]

use courtside_domain::StateSnapshot;
use serde_json::Value;
use thiserror::Error;

/// Commands decoded from inbound client frames.
///
/// Both wire encodings funnel into this one enum; the per-connection handler
/// never sees which encoding carried a command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
	/// Full game-state snapshot (latest-wins, never queued).
	State(StateSnapshot),
	/// Toggle coaching output for this session.
	CoachEnable(bool),
	/// Application-level liveness probe.
	Ping,
	/// Well-formed frame that matches no known command shape.
	Unrecognized,
}

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("empty frame")]
	Empty,

	#[error("binary frame decode error: {0}")]
	Binary(#[from] rmp_serde::decode::Error),

	#[error("text frame decode error: {0}")]
	Text(#[from] serde_json::Error),
}

/// Decode a binary compact frame: a MessagePack array whose first element is
/// the command tag and whose second element is the payload.
///
/// Malformed MessagePack is an error; well-formed input of any other shape
/// decodes to [`ClientCommand::Unrecognized`].
pub fn decode_binary(bytes: &[u8]) -> Result<ClientCommand, CodecError> {
	if bytes.is_empty() {
		return Err(CodecError::Empty);
	}

	let value: Value = rmp_serde::from_slice(bytes)?;
	Ok(command_from_compact(value))
}

/// Decode a textual structured frame: a JSON object with a `type` field and
/// a `state`/`enable` payload field.
///
/// Invalid JSON is an error; valid JSON of any other shape decodes to
/// [`ClientCommand::Unrecognized`].
pub fn decode_text(text: &str) -> Result<ClientCommand, CodecError> {
	if text.trim().is_empty() {
		return Err(CodecError::Empty);
	}

	let value: Value = serde_json::from_str(text)?;
	Ok(command_from_tagged(&value))
}

fn command_from_compact(value: Value) -> ClientCommand {
	let Value::Array(mut items) = value else {
		return ClientCommand::Unrecognized;
	};

	let Some(tag) = items.first().and_then(Value::as_str).map(str::to_owned) else {
		return ClientCommand::Unrecognized;
	};

	match tag.as_str() {
		"state" if items.len() == 2 && items[1].is_object() => {
			ClientCommand::State(StateSnapshot::new(items.swap_remove(1)))
		}
		_ => ClientCommand::Unrecognized,
	}
}

fn command_from_tagged(value: &Value) -> ClientCommand {
	let Some(kind) = value.get("type").and_then(Value::as_str) else {
		return ClientCommand::Unrecognized;
	};

	match kind {
		"state" => match value.get("state") {
			Some(state) if state.is_object() => ClientCommand::State(StateSnapshot::new(state.clone())),
			_ => ClientCommand::Unrecognized,
		},
		"coach_enable" => match value.get("enable").and_then(Value::as_bool) {
			Some(enable) => ClientCommand::CoachEnable(enable),
			None => ClientCommand::Unrecognized,
		},
		"ping" => ClientCommand::Ping,
		_ => ClientCommand::Unrecognized,
	}
}
