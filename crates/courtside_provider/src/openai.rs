#![forbid(unsafe_code)]

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{CommentaryGenerator, GenerationOutput, GenerationRequest, SecretString};

/// Default OpenAI-compatible API base.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default completion model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Provider-backed generator configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
	pub api_key: SecretString,
	pub base_url: String,
	pub model: String,
}

impl OpenAiConfig {
	pub fn new(api_key: SecretString) -> Self {
		Self {
			api_key,
			base_url: DEFAULT_BASE_URL.to_string(),
			model: DEFAULT_MODEL.to_string(),
		}
	}
}

/// Generator backed by an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiGenerator {
	client: reqwest::Client,
	cfg: OpenAiConfig,
}

impl OpenAiGenerator {
	pub fn new(cfg: OpenAiConfig) -> anyhow::Result<Self> {
		// Connect timeout only; the completion itself is not time-boxed here.
		let client = reqwest::Client::builder()
			.connect_timeout(Duration::from_secs(10))
			.build()
			.context("build provider http client")?;

		Ok(Self { client, cfg })
	}

	fn completions_url(&self) -> String {
		format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'))
	}
}

#[derive(Serialize)]
struct ApiRequest<'a> {
	model: &'a str,
	messages: Vec<ApiMessage<'a>>,
	max_tokens: u32,
	temperature: f32,
	stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
	role: &'a str,
	content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
	choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
	message: ApiChoiceMessage,
}

#[derive(Deserialize)]
struct ApiChoiceMessage {
	content: Option<String>,
}

#[derive(Deserialize)]
struct SseChunk {
	choices: Vec<SseChoice>,
}

#[derive(Deserialize)]
struct SseChoice {
	#[serde(default)]
	delta: SseDelta,
}

#[derive(Deserialize, Default)]
struct SseDelta {
	content: Option<String>,
}

enum ParsedChunk {
	Text(String),
	Done,
}

/// Incremental SSE line buffer over the provider's byte stream.
struct SseTextStream {
	inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
	buffer: String,
	done: bool,
}

impl SseTextStream {
	fn new(stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static) -> Self {
		Self {
			inner: Box::pin(stream),
			buffer: String::new(),
			done: false,
		}
	}

	fn parse_next_chunk(&mut self) -> Option<ParsedChunk> {
		while let Some(pos) = self.buffer.find('\n') {
			let line = self.buffer[..pos].to_string();
			self.buffer.drain(..=pos);

			let Some(data) = line.strip_prefix("data: ") else {
				continue;
			};

			let data = data.trim();
			if data == "[DONE]" {
				return Some(ParsedChunk::Done);
			}

			if let Ok(chunk) = serde_json::from_str::<SseChunk>(data)
				&& let Some(choice) = chunk.choices.first()
				&& let Some(content) = choice.delta.content.as_ref()
				&& !content.is_empty()
			{
				return Some(ParsedChunk::Text(content.clone()));
			}
		}

		None
	}
}

impl Stream for SseTextStream {
	type Item = anyhow::Result<String>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
		loop {
			if self.done {
				return Poll::Ready(None);
			}

			if let Some(parsed) = self.parse_next_chunk() {
				match parsed {
					ParsedChunk::Text(text) => return Poll::Ready(Some(Ok(text))),
					ParsedChunk::Done => {
						self.done = true;
						return Poll::Ready(None);
					}
				}
			}

			match self.inner.as_mut().poll_next(cx) {
				Poll::Ready(Some(Ok(bytes))) => {
					if let Ok(text) = std::str::from_utf8(&bytes) {
						self.buffer.push_str(text);
					}
				}
				Poll::Ready(Some(Err(e))) => {
					self.done = true;
					return Poll::Ready(Some(Err(anyhow!(e).context("provider stream read"))));
				}
				Poll::Ready(None) => return Poll::Ready(None),
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

#[async_trait]
impl CommentaryGenerator for OpenAiGenerator {
	async fn generate(&self, request: GenerationRequest) -> anyhow::Result<GenerationOutput> {
		let request_id = Uuid::new_v4();

		let body = ApiRequest {
			model: &self.cfg.model,
			messages: vec![
				ApiMessage {
					role: "system",
					content: &request.system_prompt,
				},
				ApiMessage {
					role: "user",
					content: &request.user_prompt,
				},
			],
			max_tokens: request.max_tokens,
			temperature: request.temperature,
			stream: request.streaming,
		};

		debug!(
			%request_id,
			model = %self.cfg.model,
			streaming = request.streaming,
			"sending completion request"
		);

		let response = self
			.client
			.post(self.completions_url())
			.bearer_auth(self.cfg.api_key.expose())
			.json(&body)
			.send()
			.await
			.context("send completion request")?;

		if !response.status().is_success() {
			let status = response.status();
			let detail = response.text().await.unwrap_or_default();
			return Err(anyhow!("provider returned {status}: {detail}"));
		}

		if request.streaming {
			return Ok(GenerationOutput::Stream(Box::pin(SseTextStream::new(
				response.bytes_stream(),
			))));
		}

		let parsed: ApiResponse = response.json().await.context("parse completion response")?;
		let text = parsed
			.choices
			.into_iter()
			.next()
			.and_then(|c| c.message.content)
			.ok_or_else(|| anyhow!("completion response carried no content"))?;

		Ok(GenerationOutput::Complete(text))
	}

	fn name(&self) -> &'static str {
		"openai"
	}
}
