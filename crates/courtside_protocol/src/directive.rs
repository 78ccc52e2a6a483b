#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Structured instruction embedded in otherwise free-text generated output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlDirective {
	/// Adjust the AI paddle's speed multiplier.
	AiSpeedAdjustment {
		speed: f64,
	},
}

impl ControlDirective {
	/// Human-readable confirmation line emitted alongside the directive.
	pub fn confirmation(&self) -> String {
		match self {
			ControlDirective::AiSpeedAdjustment { speed } => {
				format!("AI paddle speed adjusted to {speed:.2}x.")
			}
		}
	}
}

/// Strict wire shape for the directive check; internal tagging cannot carry
/// `deny_unknown_fields`, so parsing goes through this struct.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DirectiveWire {
	#[serde(rename = "type")]
	kind: String,
	speed: f64,
}

/// Attempt to interpret generated text as a single directive object.
///
/// Almost all generated text is prose, so a failed parse means
/// "no directive", never an error.
pub fn parse_directive(text: &str) -> Option<ControlDirective> {
	let wire: DirectiveWire = serde_json::from_str(text.trim()).ok()?;
	if wire.kind != "ai_speed_adjustment" || !wire.speed.is_finite() {
		return None;
	}
	Some(ControlDirective::AiSpeedAdjustment { speed: wire.speed })
}
