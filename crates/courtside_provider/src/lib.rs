#![forbid(unsafe_code)]

pub mod openai;
pub mod simulated;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

pub use openai::{OpenAiConfig, OpenAiGenerator};
pub use simulated::SimulatedGenerator;

/// A finite, non-restartable sequence of generated text chunks.
pub type TextChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// One prompt pair handed to a generator.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
	pub system_prompt: String,
	pub user_prompt: String,

	/// Request chunked output. Every variant honors the flag, so callers
	/// stay unaware of which variant is live.
	pub streaming: bool,

	pub max_tokens: u32,
	pub temperature: f32,
}

/// Result of a single generation call.
pub enum GenerationOutput {
	/// Single completed text.
	Complete(String),

	/// Chunks forwarded as they become available; the caller owns the
	/// concatenation for any post-hoc processing.
	Stream(TextChunkStream),
}

/// Text-generation capability consumed by the schedulers.
///
/// A variant is selected once at startup. A failed invocation affects only
/// that call; the error value is the whole story.
#[async_trait]
pub trait CommentaryGenerator: Send + Sync {
	async fn generate(&self, request: GenerationRequest) -> anyhow::Result<GenerationOutput>;

	/// Stable name for logs.
	fn name(&self) -> &'static str;
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}
