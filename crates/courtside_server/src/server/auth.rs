#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courtside_domain::UserId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Claims carried by a `v1` access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sub: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	pub exp: u64,
}

impl AuthClaims {
	/// Stable identity key; tokens without a subject share the anonymous key.
	pub fn identity(&self) -> UserId {
		self.sub
			.as_deref()
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.and_then(|s| UserId::new(s.to_string()).ok())
			.unwrap_or_else(UserId::anonymous)
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Issue a signed `v1` token for the given claims.
pub fn mint_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("serialize token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
	Ok(format!("v1.{payload_b64}.{sig_b64}"))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use courtside_domain::ANONYMOUS_USER;

	use super::*;

	fn future_exp() -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 600
	}

	#[test]
	fn mint_verify_roundtrip() {
		let claims = AuthClaims {
			sub: Some("player-1".to_string()),
			role: Some("player".to_string()),
			exp: future_exp(),
		};

		let token = mint_hmac_token(&claims, "s3cret").expect("mint");
		let verified = verify_hmac_token(&token, "s3cret").expect("verify");

		assert_eq!(verified.sub.as_deref(), Some("player-1"));
		assert_eq!(verified.role.as_deref(), Some("player"));
		assert_eq!(verified.identity().as_str(), "player-1");
	}

	#[test]
	fn missing_subject_falls_back_to_anonymous() {
		let claims = AuthClaims {
			sub: None,
			role: None,
			exp: future_exp(),
		};

		let token = mint_hmac_token(&claims, "s3cret").expect("mint");
		let verified = verify_hmac_token(&token, "s3cret").expect("verify");
		assert_eq!(verified.identity().as_str(), ANONYMOUS_USER);

		let blank = AuthClaims {
			sub: Some("   ".to_string()),
			role: None,
			exp: future_exp(),
		};
		assert_eq!(blank.identity().as_str(), ANONYMOUS_USER);
	}

	#[test]
	fn expired_token_is_rejected() {
		let claims = AuthClaims {
			sub: Some("player-1".to_string()),
			role: None,
			exp: 1,
		};

		let token = mint_hmac_token(&claims, "s3cret").expect("mint");
		let err = verify_hmac_token(&token, "s3cret").unwrap_err();
		assert!(err.to_string().contains("expired"));
	}

	#[test]
	fn wrong_secret_is_rejected() {
		let claims = AuthClaims {
			sub: Some("player-1".to_string()),
			role: None,
			exp: future_exp(),
		};

		let token = mint_hmac_token(&claims, "s3cret").expect("mint");
		assert!(verify_hmac_token(&token, "other").is_err());
	}

	#[test]
	fn tampered_payload_is_rejected() {
		let claims = AuthClaims {
			sub: Some("player-1".to_string()),
			role: None,
			exp: future_exp(),
		};

		let token = mint_hmac_token(&claims, "s3cret").expect("mint");
		let mut parts = token.split('.').map(str::to_string).collect::<Vec<_>>();
		let forged = AuthClaims {
			sub: Some("admin".to_string()),
			role: Some("admin".to_string()),
			exp: future_exp(),
		};
		parts[1] = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());

		assert!(verify_hmac_token(&parts.join("."), "s3cret").is_err());
	}

	#[test]
	fn garbage_tokens_are_rejected() {
		assert!(verify_hmac_token("", "s3cret").is_err());
		assert!(verify_hmac_token("v1.only-two-parts", "s3cret").is_err());
		assert!(verify_hmac_token("v2.a.b", "s3cret").is_err());
		assert!(verify_hmac_token("v1.!!!.???", "s3cret").is_err());
	}
}
