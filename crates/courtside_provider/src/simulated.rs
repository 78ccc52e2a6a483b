#![forbid(unsafe_code)]

use async_trait::async_trait;
use courtside_protocol::ControlDirective;
use futures_util::stream;
use rand::Rng;
use tracing::debug;

use crate::{CommentaryGenerator, GenerationOutput, GenerationRequest};

/// Commentary lines the simulated variant draws from.
const PHRASES: &[&str] = &[
	"What a rally, neither side is giving an inch!",
	"The ball is absolutely flying out there.",
	"Great positioning on the right, textbook defense.",
	"That return came off the paddle like a rocket.",
	"The left side is creeping up the table, bold strategy.",
	"Back and forth we go, this crowd loves it.",
	"A razor-thin save off the bottom edge!",
	"The pace is picking up, someone has to blink first.",
	"Clinical angles from both paddles this point.",
	"You can feel the momentum shifting down the stretch.",
];

/// Stand-in generator used when the external provider is unavailable or
/// disabled.
///
/// Same input and output shape as the provider-backed variant; content is
/// pseudo-random, and a small fraction of outputs is a structured directive
/// so the downstream directive-parsing path stays exercised.
pub struct SimulatedGenerator {
	directive_probability: f64,
}

impl SimulatedGenerator {
	pub fn new() -> Self {
		Self {
			directive_probability: 0.05,
		}
	}

	/// Override the directive emission probability (useful for tests).
	pub fn with_directive_probability(mut self, probability: f64) -> Self {
		self.directive_probability = probability.clamp(0.0, 1.0);
		self
	}

	fn pick_text(&self) -> String {
		let mut rng = rand::rng();

		if rng.random::<f64>() < self.directive_probability {
			let speed = f64::from(rng.random_range(5..=20u32)) / 10.0;
			let directive = ControlDirective::AiSpeedAdjustment { speed };
			if let Ok(json) = serde_json::to_string(&directive) {
				return json;
			}
		}

		PHRASES[rng.random_range(0..PHRASES.len())].to_string()
	}
}

impl Default for SimulatedGenerator {
	fn default() -> Self {
		Self::new()
	}
}

/// Split a phrase into word-group chunks whose concatenation is the input.
fn chunk_text(text: &str) -> Vec<String> {
	let mut chunks = Vec::new();
	let mut current = String::new();
	let mut words = 0usize;

	for piece in text.split_inclusive(' ') {
		current.push_str(piece);
		words += 1;
		if words == 2 {
			chunks.push(std::mem::take(&mut current));
			words = 0;
		}
	}

	if !current.is_empty() {
		chunks.push(current);
	}

	chunks
}

#[async_trait]
impl CommentaryGenerator for SimulatedGenerator {
	async fn generate(&self, request: GenerationRequest) -> anyhow::Result<GenerationOutput> {
		let text = self.pick_text();
		debug!(streaming = request.streaming, len = text.len(), "simulated generation");

		if request.streaming {
			let chunks = chunk_text(&text);
			return Ok(GenerationOutput::Stream(Box::pin(stream::iter(
				chunks.into_iter().map(Ok),
			))));
		}

		Ok(GenerationOutput::Complete(text))
	}

	fn name(&self) -> &'static str {
		"simulated"
	}
}
