#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identity key used when a verified credential carries no subject claim.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown quota category: {0}")]
	UnknownCategory(String),
}

/// Stable per-user identity key derived from a verified credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Constant key shared by all sessions whose credential has no subject.
	pub fn anonymous() -> Self {
		Self(ANONYMOUS_USER.to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Named admission budget buckets, enforced per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaCategory {
	StateIngest,
	CommentaryCall,
}

impl QuotaCategory {
	/// Stable string identifier, also used as the store key prefix.
	pub const fn as_str(self) -> &'static str {
		match self {
			QuotaCategory::StateIngest => "state_ingest",
			QuotaCategory::CommentaryCall => "commentary_call",
		}
	}
}

impl fmt::Display for QuotaCategory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for QuotaCategory {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"state_ingest" => Ok(QuotaCategory::StateIngest),
			"commentary_call" => Ok(QuotaCategory::CommentaryCall),
			other => Err(ParseIdError::UnknownCategory(other.to_string())),
		}
	}
}

/// Most recent game-state snapshot reported by a client.
///
/// The payload is opaque to the server beyond the named numeric fields read
/// for prompt construction. Readers are defensive: a missing, mistyped or
/// non-finite field reads as `None` and degrades the prompt, nothing else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot(Value);

impl StateSnapshot {
	pub fn new(value: Value) -> Self {
		Self(value)
	}

	pub fn as_value(&self) -> &Value {
		&self.0
	}

	fn num(&self, key: &str) -> Option<f64> {
		let n = self.0.get(key)?.as_f64()?;
		n.is_finite().then_some(n)
	}

	fn int(&self, key: &str) -> Option<i64> {
		let v = self.0.get(key)?;
		v.as_i64().or_else(|| v.as_f64().filter(|n| n.is_finite()).map(|n| n as i64))
	}

	pub fn ball_x(&self) -> Option<f64> {
		self.num("ballX")
	}

	pub fn ball_y(&self) -> Option<f64> {
		self.num("ballY")
	}

	pub fn ball_vx(&self) -> Option<f64> {
		self.num("ballVX")
	}

	pub fn ball_vy(&self) -> Option<f64> {
		self.num("ballVY")
	}

	pub fn left_paddle_y(&self) -> Option<f64> {
		self.num("leftPaddleY")
	}

	pub fn right_paddle_y(&self) -> Option<f64> {
		self.num("rightPaddleY")
	}

	pub fn right_paddle_speed(&self) -> Option<f64> {
		self.num("rightPaddleSpeed")
	}

	/// Score pair `(left, right)`; either side may be unknown.
	pub fn scores(&self) -> (Option<i64>, Option<i64>) {
		(self.int("leftScore"), self.int("rightScore"))
	}

	pub fn running(&self) -> Option<bool> {
		self.0.get("running")?.as_bool()
	}
}
